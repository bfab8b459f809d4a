//! Host discovery: inspect a live host, attribute its files to packages,
//! and emit a declarative description the apply engine accepts back.
//!
//! Data flow: the filesystem walk and the package database build run in
//! parallel against the host; the ownership resolver joins their outputs;
//! `compile_resources` renders deterministic YAML documents.

pub mod owners;
pub mod pkgdb;
pub mod walker;

pub use owners::{ORPHAN_FILE, Ownership};
pub use pkgdb::{Package, PackageDb};
pub use walker::PathNode;

use std::path::PathBuf;

use anyhow::{Context as _, Result};

use crate::concurrency::RunContext;
use crate::host::Host;

/// Options for one discovery run.
#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    /// Walk root (`/` for a whole host).
    pub root: PathBuf,
    /// Ignore globs applied to walked paths (`**` supported).
    pub ignore: Vec<String>,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            ignore: Vec::new(),
        }
    }
}

/// Run discovery, returning `(file name, YAML text)` documents.
///
/// # Errors
///
/// Walk, package database, or resource loading failures; walker and
/// database errors are both surfaced when the parallel phase fails twice.
pub fn discover(
    host: &dyn Host,
    ctx: &RunContext,
    options: &DiscoverOptions,
) -> Result<Vec<(String, String)>> {
    tracing::info!(root = %options.root.display(), "discovering host state");

    // The walk and the database build touch disjoint host surfaces; run
    // them side by side.
    let (tree, db) = std::thread::scope(|scope| {
        let db_task = scope.spawn(|| PackageDb::load(host, ctx));
        let tree = walker::walk(host, ctx, &options.root, &options.ignore);
        let db = db_task
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        match (tree, db) {
            (Ok(tree), Ok(db)) => Ok((tree, db)),
            (Err(walk_err), Err(db_err)) => {
                Err(walk_err.context(format!("package database also failed: {db_err:#}")))
            }
            (Err(e), _) => Err(e),
            (_, Err(e)) => Err(e),
        }
    })?;
    tracing::info!(packages = db.len(), "host inspected");

    let ownership = owners::resolve(host, &db, &tree)?;
    tracing::info!(
        to_install = ownership.to_install.len(),
        orphans = ownership.orphans.len(),
        broken = ownership.broken_symlinks.len(),
        "ownership resolved"
    );

    let documents = owners::compile_resources(host, &db, &ownership)?;
    documents
        .into_iter()
        .map(|(name, resources)| {
            let yaml = serde_yaml::to_string(&resources)
                .with_context(|| format!("encoding {name}"))?;
            Ok((name, yaml))
        })
        .collect()
}
