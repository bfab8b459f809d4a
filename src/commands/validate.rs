use anyhow::Result;

use crate::cli::ValidateOpts;
use crate::graph::Graph;
use crate::loader;
use crate::resources::Resource;

/// Run the validate command: load, structurally validate, and build the
/// dependency graph (duplicates, conflict globs, and cycles all surface)
/// without touching any host.
///
/// # Errors
///
/// Returns the first validation, conflict, or cycle error.
pub fn run(opts: &ValidateOpts) -> Result<()> {
    let state = loader::load_paths(&opts.paths)?;
    let resources: Vec<Resource> = state.iter().cloned().collect();
    let graph = Graph::build(&resources)?;
    let _order = graph.sorted()?;
    tracing::info!(
        resources = state.len(),
        nodes = graph.len(),
        "documents are valid"
    );
    Ok(())
}
