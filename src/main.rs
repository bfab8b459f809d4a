//! Host reconciliation engine binary entry point.
use clap::Parser;
use hostconf_cli::concurrency::CancelToken;
use hostconf_cli::error::EngineError;
use hostconf_cli::{cli, commands, logging};

// The binary entry point is the one place that talks to the terminal
// directly: the version line on stdout, the fatal error line on stderr.
#[allow(clippy::print_stdout, clippy::print_stderr)]
fn main() {
    let args = cli::Cli::parse();
    logging::init_subscriber(args.verbose);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).ok(); // best-effort
    }

    let result = match args.command {
        cli::Command::Apply(opts) => commands::apply::run(&args.global, &opts, &cancel),
        cli::Command::Discover(opts) => commands::discover::run(&args.global, &opts, &cancel),
        cli::Command::Validate(opts) => commands::validate::run(&opts),
        cli::Command::Version => {
            let version = option_env!("HOSTCONF_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
            println!("hostconf {version}");
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("\x1b[31mError: {e:#}\x1b[0m");
        // Interruption and drift keep distinct exit codes so automation
        // can react to each.
        let code = e
            .downcast_ref::<EngineError>()
            .map_or(1, EngineError::exit_code);
        std::process::exit(code);
    }
}
