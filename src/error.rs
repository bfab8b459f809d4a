//! Domain-specific error types for the reconciliation engine.
//!
//! This module provides a structured error hierarchy using [`thiserror`].
//! Internal modules return typed errors (e.g., [`HostError`], [`StoreError`])
//! while command handlers at the CLI boundary convert them to
//! [`anyhow::Error`] via the standard `?` operator.
//!
//! # Error hierarchy
//!
//! ```text
//! EngineError
//! ├── Validation(ValidationError) — resource structure, YAML, duplicate ids
//! ├── Graph(GraphError)           — dependency cycles, conflict collisions
//! ├── Store(StoreError)           — state snapshot persistence
//! ├── Host(HostError)             — remote syscalls and process execution
//! ├── Drift                       — committed host state no longer satisfied
//! └── Interrupted                 — planned slot present on startup
//! ```

use thiserror::Error;

/// Top-level error type for the reconciliation engine.
///
/// Aggregates domain-specific sub-errors and is convertible to
/// [`anyhow::Error`] for use at CLI command boundaries. The process exit
/// code is derived from the variant via [`EngineError::exit_code`] so that
/// automation can distinguish the two recoverable abort conditions.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Structural resource or document error (parsing, duplicate ids).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Dependency graph error (cycle, conflict glob collision).
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Store persistence error (slot read/write, log rotation).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Host operation error (remote syscall, process exec).
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// The committed state is no longer satisfied by the live host.
    #[error("committed host state changed: {0}")]
    Drift(String),

    /// A previous apply left a planned snapshot behind.
    #[error("previous apply interrupted: planned state present in store")]
    Interrupted,
}

impl EngineError {
    /// Process exit code for this error.
    ///
    /// `2` for [`Interrupted`](Self::Interrupted), `3` for
    /// [`Drift`](Self::Drift), `1` for everything else. `0` is reserved
    /// for success and never returned here.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted => 2,
            Self::Drift(_) => 3,
            _ => 1,
        }
    }
}

/// Errors that arise from resource documents and structural validation.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Two resources share the same (kind, id).
    #[error("duplicated resource {kind}:{id}")]
    DuplicatedResource {
        /// Resource kind name.
        kind: String,
        /// Resource id.
        id: String,
    },

    /// A resource body violates its structural contract.
    #[error("invalid {kind} resource '{id}': {reason}")]
    InvalidResource {
        /// Resource kind name.
        kind: String,
        /// Resource id (possibly empty when the id field itself is invalid).
        id: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A YAML document failed to parse or referenced an unknown type.
    #[error("invalid resource document {file}: {source}")]
    Yaml {
        /// Path of the offending file.
        file: String,
        /// Underlying serde error (includes line/column).
        source: serde_yaml::Error,
    },

    /// Two partial specifications of the same id cannot be merged.
    #[error("cannot merge {kind}:{id}: conflicting field '{field}'")]
    MergeConflict {
        /// Resource kind name.
        kind: String,
        /// Resource id.
        id: String,
        /// Field present with different values on both sides.
        field: String,
    },

    /// An I/O error occurred while reading a resource file.
    #[error("IO error reading resource file {path}: {source}")]
    Io {
        /// Path to the file that could not be read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Errors that arise during dependency graph construction and sorting.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Topological sort consumed fewer nodes than the graph contains.
    #[error("cycle detected in resource dependency graph")]
    CycleDetected,

    /// Two resource ids both match a kind's conflict glob.
    #[error("conflicting resources: '{a}' and '{b}' both match '{pattern}'")]
    Conflict {
        /// First matching id (kind-qualified).
        a: String,
        /// Second matching id (kind-qualified).
        b: String,
        /// The conflict glob that matched both.
        pattern: String,
    },
}

/// Errors that arise from store slot persistence and log rotation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A slot's YAML snapshot could not be decoded.
    #[error("corrupt {slot} snapshot: {source}")]
    Corrupt {
        /// Slot name (`original`, `planned`, `committed`).
        slot: &'static str,
        /// Underlying serde error.
        source: serde_yaml::Error,
    },

    /// A slot's YAML snapshot could not be encoded.
    #[error("cannot encode {slot} snapshot: {source}")]
    Encode {
        /// Slot name.
        slot: &'static str,
        /// Underlying serde error.
        source: serde_yaml::Error,
    },

    /// A host I/O operation against the store tree failed.
    #[error("store {op} failed for {path}: {source}")]
    Host {
        /// Operation name (`put`, `commit`, `log`).
        op: &'static str,
        /// Path within the store root.
        path: String,
        /// Underlying host error.
        source: HostError,
    },
}

/// Errors that arise from host filesystem and process operations.
///
/// Every variant carries the operation and path (or command) so that a
/// failure deep in a run is attributable without a backtrace.
#[derive(Error, Debug)]
pub enum HostError {
    /// The path does not exist on the host.
    ///
    /// Distinguished from [`Io`](Self::Io) because resource loading treats
    /// a missing path as an observable state, not a failure.
    #[error("{op} {path}: no such file or directory")]
    NotFound {
        /// Operation name.
        op: &'static str,
        /// Path that does not exist.
        path: String,
    },

    /// A filesystem operation failed.
    #[error("{op} {path}: {source}")]
    Io {
        /// Operation name (`lstat`, `readdir`, `write_file`, ...).
        op: &'static str,
        /// Path the operation targeted.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A process could not be spawned or driven to completion.
    #[error("exec '{cmd}': {detail}")]
    Exec {
        /// The command line that failed.
        cmd: String,
        /// Human-readable failure detail.
        detail: String,
    },

    /// A process ran but exited unsuccessfully where success was required.
    #[error("'{cmd}' failed ({status}): {stderr}")]
    CommandFailed {
        /// The command line.
        cmd: String,
        /// Formatted wait status (exit code or signal).
        status: String,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// A user or group name has no entry on the host.
    #[error("lookup {kind} '{name}': not found")]
    LookupFailed {
        /// `"user"` or `"group"`.
        kind: &'static str,
        /// The name that was looked up.
        name: String,
    },

    /// The requested operation or connection string is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The run context was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl HostError {
    /// Whether this error means the target path does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Classify an I/O error for `op` on `path`, mapping `NotFound` to the
    /// dedicated variant.
    #[must_use]
    pub fn from_io(op: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        let path = path.display().to_string();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { op, path }
        } else {
            Self::Io { op, path, source }
        }
    }
}
