use anyhow::{Context as _, Result};

use crate::cli::{ApplyOpts, GlobalOpts};
use crate::concurrency::CancelToken;
use crate::engine;
use crate::host;
use crate::loader;
use crate::store::Store;

/// Run the apply command.
///
/// # Errors
///
/// Returns an error when loading, host connection, or the engine run
/// fails; engine aborts keep their typed cause so `main` can map them to
/// distinct exit codes.
pub fn run(global: &GlobalOpts, opts: &ApplyOpts, cancel: &CancelToken) -> Result<()> {
    let target = loader::load_paths(&opts.paths)?;
    tracing::info!(resources = target.len(), "target loaded");

    let host = host::connect(&global.host)
        .with_context(|| format!("connecting to '{}'", global.host))?;
    let ctx = super::run_context(global, cancel);

    let store = Store::open(host.as_ref(), &opts.store)?;
    engine::apply(host.as_ref(), &ctx, &store, &target)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn opts(paths: Vec<PathBuf>) -> (GlobalOpts, ApplyOpts) {
        (
            GlobalOpts {
                host: "local".to_string(),
                limit: Some(2),
            },
            ApplyOpts {
                store: PathBuf::from("/tmp/never-used"),
                paths,
            },
        )
    }

    #[test]
    fn load_failure_surfaces_before_any_connection() {
        let (global, apply_opts) = opts(vec![PathBuf::from("/missing/site.yaml")]);
        let err = run(&global, &apply_opts, &CancelToken::new()).unwrap_err();
        assert!(
            format!("{err:#}").contains("site.yaml"),
            "got: {err:#}"
        );
    }

    #[test]
    fn invalid_document_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.yaml");
        std::fs::write(&file, "- File:\n    path: relative/path\n").unwrap();

        let (global, apply_opts) = opts(vec![file]);
        let err = run(&global, &apply_opts, &CancelToken::new()).unwrap_err();
        assert!(format!("{err:#}").contains("absolute"), "got: {err:#}");
    }
}
