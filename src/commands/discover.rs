use anyhow::{Context as _, Result};

use crate::cli::{DiscoverOpts, GlobalOpts};
use crate::concurrency::CancelToken;
use crate::discovery::{self, DiscoverOptions};
use crate::host;

/// Run the discover command.
///
/// # Errors
///
/// Returns an error when the host cannot be inspected or the documents
/// cannot be written to the output directory.
pub fn run(global: &GlobalOpts, opts: &DiscoverOpts, cancel: &CancelToken) -> Result<()> {
    let host = host::connect(&global.host)
        .with_context(|| format!("connecting to '{}'", global.host))?;
    let ctx = super::run_context(global, cancel);

    let options = DiscoverOptions {
        root: opts.root.clone(),
        ignore: opts.ignore.clone(),
    };
    let documents = discovery::discover(host.as_ref(), &ctx, &options)?;

    std::fs::create_dir_all(&opts.output)
        .with_context(|| format!("creating {}", opts.output.display()))?;
    for (name, yaml) in &documents {
        let path = opts.output.join(name);
        std::fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(file = %path.display(), "wrote");
    }
    tracing::info!(documents = documents.len(), "discovery complete");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unknown_transport_fails_with_context() {
        let global = GlobalOpts {
            host: "teleport:somewhere".to_string(),
            limit: None,
        };
        let opts = DiscoverOpts {
            output: std::env::temp_dir(),
            root: std::path::PathBuf::from("/"),
            ignore: Vec::new(),
        };
        let err = run(&global, &opts, &CancelToken::new()).unwrap_err();
        assert!(
            format!("{err:#}").contains("teleport:somewhere"),
            "got: {err:#}"
        );
    }
}
