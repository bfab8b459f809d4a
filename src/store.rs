//! On-host persistence: the three state snapshots and rolling run logs.
//!
//! The store lives on the *target* host (all I/O goes through the host
//! capability), under a user-chosen root:
//!
//! ```text
//! <root>/state/v1/original.yaml | planned.yaml | committed.yaml
//! <root>/logs/<UTC YYYYMMDDhhmmss>.<name>.gz
//! ```
//!
//! Every slot write is write-temp-then-rename on the same filesystem with
//! the data fsynced first, and the planned→committed commit is one rename,
//! so a kill at any instant leaves the slots in one of the legal
//! combinations the engine knows how to recover from.

use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::error::{HostError, StoreError};
use crate::host::Host;
use crate::logging::utc_log_stamp;
use crate::state::State;

/// Directory of the state snapshots, versioned for format evolution.
const STATE_DIR: &str = "state/v1";

/// Directory of the rolling run logs.
const LOGS_DIR: &str = "logs";

/// How many run logs survive rotation.
const KEEP_LOGS: usize = 10;

/// The three snapshot slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Host state before the engine ever touched the covered ids.
    Original,
    /// A state pending commit; present means a run was interrupted.
    Planned,
    /// The state successfully applied by the last completed run.
    Committed,
}

impl Slot {
    /// Slot name for error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Planned => "planned",
            Self::Committed => "committed",
        }
    }

    const fn file_name(self) -> &'static str {
        match self {
            Self::Original => "original.yaml",
            Self::Planned => "planned.yaml",
            Self::Committed => "committed.yaml",
        }
    }
}

/// Handle to one host's store.
#[derive(Debug)]
pub struct Store<'a> {
    host: &'a dyn Host,
    root: PathBuf,
}

fn host_err(op: &'static str, path: &Path, source: HostError) -> StoreError {
    StoreError::Host {
        op,
        path: path.display().to_string(),
        source,
    }
}

/// Create `path` and any missing ancestors as directories.
fn ensure_dir(host: &dyn Host, path: &Path) -> Result<(), StoreError> {
    let mut current = PathBuf::from("/");
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::RootDir | Component::CurDir => continue,
            other => current.push(other),
        }
        match host.lstat(&current) {
            Ok(info) if info.file_type.is_dir() => {}
            Ok(_) => {
                return Err(host_err(
                    "mkdir",
                    &current,
                    HostError::Io {
                        op: "mkdir",
                        path: current.display().to_string(),
                        source: std::io::Error::other("exists and is not a directory"),
                    },
                ));
            }
            Err(e) if e.is_not_found() => {
                host.mkdir(&current, 0o755)
                    .map_err(|e| host_err("mkdir", &current, e))?;
            }
            Err(e) => return Err(host_err("mkdir", &current, e)),
        }
    }
    Ok(())
}

impl<'a> Store<'a> {
    /// Open (creating directories as needed) the store under `root`.
    ///
    /// # Errors
    ///
    /// Fails when the store tree cannot be created on the host.
    pub fn open(host: &'a dyn Host, root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        ensure_dir(host, &root.join(STATE_DIR))?;
        ensure_dir(host, &root.join(LOGS_DIR))?;
        Ok(Self { host, root })
    }

    fn slot_path(&self, slot: Slot) -> PathBuf {
        self.root.join(STATE_DIR).join(slot.file_name())
    }

    /// Read a slot; `None` when it has never been written (or was cleared).
    ///
    /// # Errors
    ///
    /// [`StoreError::Corrupt`] when the snapshot does not decode, or a host
    /// error reading it.
    pub fn get(&self, slot: Slot) -> Result<Option<State>, StoreError> {
        let path = self.slot_path(slot);
        let mut reader = match self.host.read_file(&path) {
            Ok(reader) => reader,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(host_err("get", &path, e)),
        };
        let mut text = String::new();
        reader.read_to_string(&mut text).map_err(|e| {
            host_err("get", &path, HostError::from_io("read_file", &path, e))
        })?;
        let state: State = serde_yaml::from_str(&text).map_err(|source| StoreError::Corrupt {
            slot: slot.name(),
            source,
        })?;
        Ok(Some(state))
    }

    /// Atomically overwrite a slot: temp file on the same filesystem,
    /// fsync, rename.
    ///
    /// # Errors
    ///
    /// Encoding or host I/O failures; on failure the previous snapshot (if
    /// any) is still in place.
    pub fn put(&self, slot: Slot, state: &State) -> Result<(), StoreError> {
        let text = serde_yaml::to_string(state).map_err(|source| StoreError::Encode {
            slot: slot.name(),
            source,
        })?;
        let path = self.slot_path(slot);
        let temp = self.root.join(STATE_DIR).join(format!(
            ".{}.tmp",
            slot.file_name()
        ));
        self.host
            .write_file(&temp, &mut text.as_bytes())
            .map_err(|e| host_err("put", &temp, e))?;
        self.host
            .rename(&temp, &path)
            .map_err(|e| host_err("put", &path, e))?;
        tracing::debug!(slot = slot.name(), "snapshot persisted");
        Ok(())
    }

    /// Remove a slot; clearing an absent slot is a no-op.
    ///
    /// # Errors
    ///
    /// Host I/O failures other than absence.
    pub fn clear(&self, slot: Slot) -> Result<(), StoreError> {
        let path = self.slot_path(slot);
        match self.host.remove(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(host_err("clear", &path, e)),
        }
    }

    /// Promote *planned* to *committed* in one atomic rename; the planned
    /// slot is empty afterwards.
    ///
    /// # Errors
    ///
    /// Fails when no planned snapshot exists or the rename fails.
    pub fn commit_planned(&self) -> Result<(), StoreError> {
        let planned = self.slot_path(Slot::Planned);
        let committed = self.slot_path(Slot::Committed);
        self.host
            .rename(&planned, &committed)
            .map_err(|e| host_err("commit", &planned, e))?;
        tracing::debug!("planned snapshot committed");
        Ok(())
    }

    /// Start a new gzipped run log named `<stamp>.<name>.gz` and rotate old
    /// logs, keeping the [`KEEP_LOGS`] lexicographically newest.
    ///
    /// # Errors
    ///
    /// Host I/O failures while listing or pruning the log directory.
    pub fn open_log(&self, name: &str) -> Result<RunLog<'a>, StoreError> {
        let stamp = utc_log_stamp(chrono::Utc::now());
        let dir = self.root.join(LOGS_DIR);
        let path = dir.join(format!("{stamp}.{name}.gz"));

        // An empty gzip stream marks the log as the newest before rotation.
        let log = RunLog {
            host: self.host,
            path: path.clone(),
            encoder: Some(GzEncoder::new(Vec::new(), Compression::default())),
        };
        self.host
            .write_file(&path, &mut &[][..])
            .map_err(|e| host_err("log", &path, e))?;
        self.rotate_logs(&dir)?;
        Ok(log)
    }

    fn rotate_logs(&self, dir: &Path) -> Result<(), StoreError> {
        let mut names: Vec<String> = self
            .host
            .readdir(dir)
            .map_err(|e| host_err("log", dir, e))?
            .filter_map(Result::ok)
            .map(|entry| entry.name)
            .filter(|name| name.ends_with(".gz"))
            .collect();
        names.sort();
        if names.len() <= KEEP_LOGS {
            return Ok(());
        }
        let excess = names.len() - KEEP_LOGS;
        for name in names.iter().take(excess) {
            let path = dir.join(name);
            match self.host.remove(&path) {
                Ok(()) => tracing::debug!(log = %name, "rotated out"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(host_err("log", &path, e)),
            }
        }
        Ok(())
    }
}

/// One run's gzipped log stream.
///
/// Lines are compressed in memory and flushed to the host when the log is
/// [`close`](Self::close)d (or best-effort on drop); the log is
/// observability, not part of the store's atomicity contract.
#[derive(Debug)]
pub struct RunLog<'a> {
    host: &'a dyn Host,
    path: PathBuf,
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl RunLog<'_> {
    /// Append one line to the log.
    pub fn write_line(&mut self, line: &str) {
        if let Some(encoder) = self.encoder.as_mut() {
            let _ = encoder.write_all(line.as_bytes());
            let _ = encoder.write_all(b"\n");
        }
    }

    /// Finish the gzip stream and write it to the host.
    ///
    /// # Errors
    ///
    /// Host I/O failures writing the finished stream.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.flush_to_host()
    }

    fn flush_to_host(&mut self) -> Result<(), StoreError> {
        let Some(encoder) = self.encoder.take() else {
            return Ok(());
        };
        let compressed = encoder.finish().map_err(|e| {
            host_err(
                "log",
                &self.path,
                HostError::from_io("write_file", &self.path, e),
            )
        })?;
        self.host
            .write_file(&self.path, &mut compressed.as_slice())
            .map_err(|e| host_err("log", &self.path, e))
    }
}

impl Drop for RunLog<'_> {
    fn drop(&mut self) {
        let _ = self.flush_to_host();
    }
}
