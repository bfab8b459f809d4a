//! The apply state machine: drives one run from target state to committed
//! store, or to a safe abort.
//!
//! Run phases, in order:
//!
//! 1. refuse when an interrupted run left a *planned* snapshot behind;
//! 2. verify the live host still satisfies *committed* (drift detection);
//! 3. capture *original* state for every newly managed id;
//! 4. persist the *planned* state (target plus restores for ids the target
//!    dropped);
//! 5. apply the planned state through the dependency graph;
//! 6. commit (*planned* → *committed*, one rename);
//! 7. compact *original* down to the ids the target still manages.
//!
//! Any failure aborts the run and leaves the store at the last completed
//! transition; the slot combination always stays legal, so the next run
//! can tell exactly how far this one got.

use anyhow::Result;

use crate::concurrency::RunContext;
use crate::error::EngineError;
use crate::host::Host;
use crate::state::State;
use crate::store::{Slot, Store};

/// Check that the live host still satisfies the committed state, naming
/// the first drifted resource. Host failures while loading stay host
/// errors; only genuine dissatisfaction is drift.
fn verify_committed(host: &dyn Host, ctx: &RunContext, committed: &State) -> Result<()> {
    let current = committed.load(host, ctx)?;
    for wanted in committed.iter() {
        let satisfied = current
            .get(wanted.kind(), &wanted.id())
            .map_or(Ok(false), |mine| mine.satisfies(host, wanted))?;
        if !satisfied {
            return Err(EngineError::Drift(wanted.qualified_id()).into());
        }
    }
    Ok(())
}

/// Expand *original* with host state for every target id it does not cover
/// yet; persists only when something was added.
fn prepare_original(
    host: &dyn Host,
    ctx: &RunContext,
    store: &Store<'_>,
    target: &State,
) -> Result<State> {
    let mut original = store.get(Slot::Original)?.unwrap_or_default();

    let mut missing = State::new();
    for resource in target.iter() {
        if !original.contains(resource.kind(), &resource.id()) {
            missing.append(resource.clone())?;
        }
    }
    if missing.is_empty() {
        return Ok(original);
    }

    let loaded = missing.load(host, ctx)?;
    for resource in loaded.iter() {
        original.append(resource.clone())?;
    }
    store.put(Slot::Original, &original)?;
    Ok(original)
}

/// Build the planned state: the target, plus the original state of every
/// id the target no longer manages (those get restored).
fn plan(target: &State, original: &State) -> Result<State> {
    let mut planned = State::new();
    for resource in target.iter() {
        planned.append(resource.clone())?;
    }
    for resource in original.iter() {
        if !target.contains(resource.kind(), &resource.id()) {
            planned.append(resource.clone())?;
        }
    }
    Ok(planned)
}

/// Drop from *original* every id the target no longer manages.
fn compact_original(store: &Store<'_>, target: &State, original: &State) -> Result<()> {
    let mut compacted = State::new();
    for resource in original.iter() {
        if target.contains(resource.kind(), &resource.id()) {
            compacted.append(resource.clone())?;
        }
    }
    if &compacted != original {
        store.put(Slot::Original, &compacted)?;
    }
    Ok(())
}

/// Run the state machine for `target` against one host and store.
///
/// # Errors
///
/// - [`EngineError::Interrupted`] when a planned snapshot is present;
/// - [`EngineError::Drift`] when the committed state is no longer
///   satisfied (checked before any mutation);
/// - any validation, graph, store, or host failure from the later phases.
///   A failure during the apply phase leaves *planned* populated as
///   evidence of the interruption.
pub fn apply(
    host: &dyn Host,
    ctx: &RunContext,
    store: &Store<'_>,
    target: &State,
) -> Result<()> {
    target.validate().map_err(EngineError::Validation)?;

    let mut log = store.open_log("apply")?;
    log.write_line(&format!(
        "apply start: {} resources against {}",
        target.len(),
        host.id()
    ));

    if store.get(Slot::Planned)?.is_some() {
        log.write_line("abort: planned snapshot present");
        return Err(EngineError::Interrupted.into());
    }

    if let Some(committed) = store.get(Slot::Committed)? {
        tracing::info!(resources = committed.len(), "verifying committed state");
        verify_committed(host, ctx, &committed)?;
        log.write_line("committed state verified");
    }

    tracing::info!("capturing original state");
    let original = prepare_original(host, ctx, store, target)?;
    log.write_line(&format!("original covers {} ids", original.len()));

    let planned = plan(target, &original)?;
    store.put(Slot::Planned, &planned)?;
    log.write_line(&format!("planned {} resources", planned.len()));

    tracing::info!(resources = planned.len(), "applying");
    planned.apply(host, ctx).inspect_err(|e| {
        log.write_line(&format!("apply failed: {e:#}"));
    })?;

    store.commit_planned()?;
    log.write_line("committed");

    compact_original(store, target, &original)?;
    log.write_line("original compacted");

    tracing::info!("apply complete");
    log.close()?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;
    use crate::resources::{File, Resource};

    fn ctx() -> RunContext {
        RunContext::new()
    }

    fn file_target(path: &str, content: &str) -> State {
        let mut state = State::new();
        state
            .append(Resource::File(File {
                regular_file: Some(content.to_string()),
                ..File::at(path)
            }))
            .unwrap();
        state
    }

    fn new_host() -> MemoryHost {
        let host = MemoryHost::new();
        host.add_dir("/etc");
        host
    }

    // -----------------------------------------------------------------------
    // plan
    // -----------------------------------------------------------------------

    #[test]
    fn plan_unions_target_with_dropped_originals() {
        let target = file_target("/etc/a", "new\n");
        let mut original = State::new();
        original
            .append(Resource::File(File {
                regular_file: Some("orig-a\n".to_string()),
                ..File::at("/etc/a")
            }))
            .unwrap();
        original
            .append(Resource::File(File {
                regular_file: Some("orig-b\n".to_string()),
                ..File::at("/etc/b")
            }))
            .unwrap();

        let planned = plan(&target, &original).unwrap();
        assert_eq!(planned.len(), 2);

        // The managed id keeps the target's content...
        let Some(Resource::File(a)) = planned.get(crate::resources::Kind::File, "/etc/a")
        else {
            panic!("missing /etc/a");
        };
        assert_eq!(a.regular_file.as_deref(), Some("new\n"));

        // ...and the dropped id restores its original.
        let Some(Resource::File(b)) = planned.get(crate::resources::Kind::File, "/etc/b")
        else {
            panic!("missing /etc/b");
        };
        assert_eq!(b.regular_file.as_deref(), Some("orig-b\n"));
    }

    // -----------------------------------------------------------------------
    // Refuse-if-planned (S6)
    // -----------------------------------------------------------------------

    #[test]
    fn planned_slot_aborts_before_any_host_io() {
        let host = new_host();
        let store = Store::open(&host, "/store").unwrap();
        store.put(Slot::Original, &file_target("/etc/a", "orig\n")).unwrap();
        store.put(Slot::Planned, &file_target("/etc/a", "half\n")).unwrap();
        host.clear_operations();

        let err = apply(&host, &ctx(), &store, &file_target("/etc/a", "new\n")).unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().expect("typed error");
        assert!(matches!(engine_err, EngineError::Interrupted));
        assert_eq!(engine_err.exit_code(), 2);

        // Only store reads and the run log happened; nothing inspected or
        // mutated the managed portion of the host.
        for op in host.operations() {
            assert!(
                op.contains("/store/"),
                "unexpected host I/O before abort: {op}"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Drift detection
    // -----------------------------------------------------------------------

    #[test]
    fn committed_drift_aborts_before_mutation() {
        let host = new_host();
        let store = Store::open(&host, "/store").unwrap();
        host.add_file("/etc/a", "managed\n");

        store
            .put(Slot::Original, &file_target("/etc/a", "pristine\n"))
            .unwrap();
        store
            .put(Slot::Committed, &file_target("/etc/a", "managed\n"))
            .unwrap();

        // Someone edited the managed file behind the engine's back.
        host.add_file("/etc/a", "tampered\n");
        host.clear_operations();

        let err = apply(&host, &ctx(), &store, &file_target("/etc/a", "next\n")).unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().expect("typed error");
        assert!(matches!(engine_err, EngineError::Drift(_)));
        assert_eq!(engine_err.exit_code(), 3);
        assert!(
            err.to_string().contains("File:/etc/a"),
            "drift names the resource: {err}"
        );

        assert!(
            !host.operations().iter().any(|op| op.starts_with("write_file /etc")),
            "no mutation after drift: {:?}",
            host.operations()
        );
        // Planned must not have been created.
        assert_eq!(store.get(Slot::Planned).unwrap(), None);
    }

    // -----------------------------------------------------------------------
    // Fresh apply (S1-shaped, file flavour)
    // -----------------------------------------------------------------------

    #[test]
    fn fresh_apply_captures_original_and_commits() {
        let host = new_host();
        host.add_file("/etc/a", "before\n");
        let store = Store::open(&host, "/store").unwrap();
        let target = file_target("/etc/a", "after\n");

        apply(&host, &ctx(), &store, &target).unwrap();

        // Original holds the pre-apply content.
        let original = store.get(Slot::Original).unwrap().expect("original");
        let Some(Resource::File(a)) = original.get(crate::resources::Kind::File, "/etc/a")
        else {
            panic!("original missing /etc/a");
        };
        assert_eq!(a.regular_file.as_deref(), Some("before\n"));

        // Committed equals the target; planned is empty.
        assert_eq!(store.get(Slot::Committed).unwrap(), Some(target));
        assert_eq!(store.get(Slot::Planned).unwrap(), None);

        // And the host converged.
        let loaded = File::at("/etc/a").load(&host).unwrap();
        assert_eq!(loaded.regular_file.as_deref(), Some("after\n"));
    }

    #[test]
    fn apply_twice_is_idempotent() {
        let host = new_host();
        host.add_file("/etc/a", "before\n");
        let store = Store::open(&host, "/store").unwrap();
        let target = file_target("/etc/a", "after\n");

        apply(&host, &ctx(), &store, &target).unwrap();
        let original_after_first = store.get(Slot::Original).unwrap();
        let committed_after_first = store.get(Slot::Committed).unwrap();

        apply(&host, &ctx(), &store, &target).unwrap();

        assert_eq!(store.get(Slot::Original).unwrap(), original_after_first);
        assert_eq!(store.get(Slot::Committed).unwrap(), committed_after_first);
        assert_eq!(store.get(Slot::Planned).unwrap(), None);
    }

    // -----------------------------------------------------------------------
    // Dropped ids are restored, then compacted out of original
    // -----------------------------------------------------------------------

    #[test]
    fn dropping_an_id_restores_original_state() {
        let host = new_host();
        host.add_file("/etc/a", "pristine-a\n");
        host.add_file("/etc/b", "pristine-b\n");
        let store = Store::open(&host, "/store").unwrap();

        // First run manages both files.
        let mut both = State::new();
        both.append(Resource::File(File {
            regular_file: Some("managed-a\n".to_string()),
            ..File::at("/etc/a")
        }))
        .unwrap();
        both.append(Resource::File(File {
            regular_file: Some("managed-b\n".to_string()),
            ..File::at("/etc/b")
        }))
        .unwrap();
        apply(&host, &ctx(), &store, &both).unwrap();

        // Second run drops /etc/b: it must be restored to pristine content
        // and leave original covering only /etc/a.
        let only_a = file_target("/etc/a", "managed-a\n");
        apply(&host, &ctx(), &store, &only_a).unwrap();

        let restored = File::at("/etc/b").load(&host).unwrap();
        assert_eq!(restored.regular_file.as_deref(), Some("pristine-b\n"));

        let original = store.get(Slot::Original).unwrap().expect("original");
        assert_eq!(original.len(), 1);
        assert!(original.contains(crate::resources::Kind::File, "/etc/a"));
        // Committed keeps the full planned state (restores included).
        let committed = store.get(Slot::Committed).unwrap().expect("committed");
        assert!(committed.contains(crate::resources::Kind::File, "/etc/b"));
    }

    // -----------------------------------------------------------------------
    // Partial apply leaves planned populated
    // -----------------------------------------------------------------------

    #[test]
    fn apply_failure_leaves_planned_as_evidence() {
        let host = new_host();
        host.add_file("/etc/a", "before\n");
        let store = Store::open(&host, "/store").unwrap();
        host.fail_when("write_file /etc/a");

        let target = file_target("/etc/a", "after\n");
        let err = apply(&host, &ctx(), &store, &target).unwrap_err();
        assert!(err.to_string().contains("injected fault"), "got: {err}");

        // planned stays for the next run to detect...
        assert_eq!(store.get(Slot::Planned).unwrap(), Some(target.clone()));
        // ...which then refuses to proceed.
        let err = apply(&host, &ctx(), &store, &target).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Interrupted)
        ));
    }

    // -----------------------------------------------------------------------
    // Store slot legality after simulated crashes (P7)
    // -----------------------------------------------------------------------

    /// Whether `(original, planned, committed)` presence is one of the five
    /// legal combinations.
    fn legal_combination(store: &Store<'_>) -> bool {
        let o = store.get(Slot::Original).unwrap().is_some();
        let p = store.get(Slot::Planned).unwrap().is_some();
        let c = store.get(Slot::Committed).unwrap().is_some();
        matches!(
            (o, p, c),
            (false, false, false)
                | (true, false, false)
                | (true, true, false)
                | (true, false, true)
                | (true, true, true)
        )
    }

    #[test]
    fn crash_at_every_store_transition_leaves_legal_slots() {
        // Each fault matcher simulates a kill at one engine step on a
        // store that already has a committed run behind it.
        let faults = [
            "write_file /store/state/v1/.original.yaml.tmp",
            "rename /store/state/v1/.original.yaml.tmp",
            "write_file /store/state/v1/.planned.yaml.tmp",
            "rename /store/state/v1/.planned.yaml.tmp",
            "write_file /etc/b",
            "rename /store/state/v1/planned.yaml",
        ];
        for fault in faults {
            let host = new_host();
            host.add_file("/etc/a", "pristine-a\n");
            host.add_file("/etc/b", "pristine-b\n");
            let store = Store::open(&host, "/store").unwrap();

            // A completed first run over /etc/a.
            apply(&host, &ctx(), &store, &file_target("/etc/a", "managed-a\n")).unwrap();
            assert!(legal_combination(&store), "baseline after first run");

            // Second run adds /etc/b and dies at the injected step.
            let mut target = State::new();
            target
                .append(Resource::File(File {
                    regular_file: Some("managed-a\n".to_string()),
                    ..File::at("/etc/a")
                }))
                .unwrap();
            target
                .append(Resource::File(File {
                    regular_file: Some("managed-b\n".to_string()),
                    ..File::at("/etc/b")
                }))
                .unwrap();
            host.fail_when(fault);
            let result = apply(&host, &ctx(), &store, &target);
            assert!(result.is_err(), "fault '{fault}' did not fire");

            assert!(
                legal_combination(&store),
                "illegal slot combination after crash at '{fault}'"
            );
        }
    }

    #[test]
    fn fresh_store_crash_during_prepare_keeps_original_only() {
        let host = new_host();
        host.add_file("/etc/a", "pristine\n");
        let store = Store::open(&host, "/store").unwrap();
        host.fail_when("write_file /store/state/v1/.planned.yaml.tmp");

        let err = apply(&host, &ctx(), &store, &file_target("/etc/a", "x\n")).unwrap_err();
        assert!(err.to_string().contains("injected fault"), "got: {err}");

        // Row two of the legal table: original captured, nothing else.
        assert!(store.get(Slot::Original).unwrap().is_some());
        assert_eq!(store.get(Slot::Planned).unwrap(), None);
        assert_eq!(store.get(Slot::Committed).unwrap(), None);
    }
}
