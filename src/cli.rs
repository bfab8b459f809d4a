use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "hostconf",
    about = "Declarative host state reconciliation engine",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub global: GlobalOpts,
}

#[derive(Parser, Debug, Clone)]
pub struct GlobalOpts {
    /// Target host connection string (local, docker:[user[:group]@]container)
    #[arg(long, global = true, default_value = "local")]
    pub host: String,

    /// Maximum concurrent host operations (defaults to available parallelism)
    #[arg(long, global = true)]
    pub limit: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reconcile the host against resource documents
    Apply(ApplyOpts),
    /// Inspect a host and emit its declarative description
    Discover(DiscoverOpts),
    /// Validate resource documents without touching any host
    Validate(ValidateOpts),
    /// Print version information
    Version,
}

#[derive(Parser, Debug, Clone)]
pub struct ApplyOpts {
    /// Store root on the target host
    #[arg(long, default_value = "/var/lib/hostconf")]
    pub store: PathBuf,

    /// Resource files or directories
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct DiscoverOpts {
    /// Directory receiving the emitted YAML documents
    #[arg(long, default_value = ".")]
    pub output: PathBuf,

    /// Walk root on the target host
    #[arg(long, default_value = "/")]
    pub root: PathBuf,

    /// Ignore globs applied to walked paths (repeatable, ** supported)
    #[arg(long)]
    pub ignore: Vec<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ValidateOpts {
    /// Resource files or directories
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_apply_with_store_and_paths() {
        let cli = Cli::parse_from(["hostconf", "apply", "--store", "/var/lib/hc", "site.yaml"]);
        let Command::Apply(opts) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(opts.store, PathBuf::from("/var/lib/hc"));
        assert_eq!(opts.paths, vec![PathBuf::from("site.yaml")]);
    }

    #[test]
    fn parse_apply_requires_paths() {
        assert!(Cli::try_parse_from(["hostconf", "apply"]).is_err());
    }

    #[test]
    fn parse_host_connection_string() {
        let cli = Cli::parse_from([
            "hostconf",
            "--host",
            "docker:deploy@web",
            "apply",
            "site.yaml",
        ]);
        assert_eq!(cli.global.host, "docker:deploy@web");
    }

    #[test]
    fn host_defaults_to_local() {
        let cli = Cli::parse_from(["hostconf", "version"]);
        assert_eq!(cli.global.host, "local");
    }

    #[test]
    fn parse_limit() {
        let cli = Cli::parse_from(["hostconf", "--limit", "8", "version"]);
        assert_eq!(cli.global.limit, Some(8));
    }

    #[test]
    fn parse_discover_with_ignores() {
        let cli = Cli::parse_from([
            "hostconf",
            "discover",
            "--output",
            "out",
            "--ignore",
            "/proc/**",
            "--ignore",
            "/sys/**",
        ]);
        let Command::Discover(opts) = cli.command else {
            panic!("expected discover");
        };
        assert_eq!(opts.output, PathBuf::from("out"));
        assert_eq!(opts.ignore, vec!["/proc/**", "/sys/**"]);
        assert_eq!(opts.root, PathBuf::from("/"));
    }

    #[test]
    fn parse_validate() {
        let cli = Cli::parse_from(["hostconf", "validate", "a.yaml", "b.yaml"]);
        let Command::Validate(opts) = cli.command else {
            panic!("expected validate");
        };
        assert_eq!(opts.paths.len(), 2);
    }

    #[test]
    fn parse_verbose() {
        let cli = Cli::parse_from(["hostconf", "-v", "version"]);
        assert!(cli.verbose);
    }
}
