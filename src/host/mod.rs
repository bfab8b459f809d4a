//! Abstract host capability: the filesystem and process surface every
//! transport implements.
//!
//! The engine and the discovery pipeline consume hosts exclusively through
//! the [`Host`] trait, so a run is transport-agnostic: local syscalls,
//! `docker exec`, or the in-process [`MemoryHost`](memory::MemoryHost) all
//! satisfy the same contract, bit-exactly for the operations below.

pub mod docker;
pub mod local;
pub mod memory;
mod process;

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::concurrency::RunContext;
use crate::error::HostError;

/// Default working directory for commands that do not set one.
pub const DEFAULT_DIR: &str = "/tmp";

/// Default environment for commands that do not set one.
///
/// A fixed locale and a root-capable PATH keep command output parseable and
/// behaviour identical across transports.
#[must_use]
pub fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("LANG".to_string(), "en_US.UTF-8".to_string()),
        (
            "PATH".to_string(),
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        ),
    ])
}

/// A command to run on a host.
///
/// Streams are owned sinks/sources so that callers can parse process output
/// incrementally (see the package database overlays); use
/// [`run_capture`]/[`run_ok`] when buffered output is enough.
#[derive(Default)]
pub struct Cmd {
    /// Program path or name (resolved against the command PATH).
    pub path: String,
    /// Arguments, excluding the program itself.
    pub args: Vec<String>,
    /// Environment; `None` selects [`default_env`].
    pub env: Option<BTreeMap<String, String>>,
    /// Working directory; `None` selects [`DEFAULT_DIR`]. Must be absolute.
    pub dir: Option<PathBuf>,
    /// Bytes fed to the process on stdin.
    pub stdin: Option<Box<dyn Read + Send>>,
    /// Sink for standard output; discarded when `None`.
    pub stdout: Option<Box<dyn Write + Send>>,
    /// Sink for standard error; discarded when `None`.
    pub stderr: Option<Box<dyn Write + Send>>,
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Cmd {
    /// Start building a command for `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory (must be absolute).
    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Add one environment variable on top of the default environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut env = self.env.take().unwrap_or_else(default_env);
        env.insert(key.into(), value.into());
        self.env = Some(env);
        self
    }

    /// Feed the process `bytes` on stdin.
    #[must_use]
    pub fn stdin_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(Box::new(std::io::Cursor::new(bytes)));
        self
    }

    /// Stream standard output into `sink`.
    #[must_use]
    pub fn stdout(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.stdout = Some(sink);
        self
    }

    /// Stream standard error into `sink`.
    #[must_use]
    pub fn stderr(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.stderr = Some(sink);
        self
    }

    /// The effective environment (the default when unset).
    #[must_use]
    pub fn resolved_env(&self) -> BTreeMap<String, String> {
        self.env.clone().unwrap_or_else(default_env)
    }

    /// The effective working directory.
    ///
    /// # Errors
    ///
    /// Fails when an explicit directory is not absolute.
    pub fn resolved_dir(&self) -> Result<PathBuf, HostError> {
        match &self.dir {
            None => Ok(PathBuf::from(DEFAULT_DIR)),
            Some(dir) if dir.is_absolute() => Ok(dir.clone()),
            Some(dir) => Err(HostError::Exec {
                cmd: self.command_line(),
                detail: format!("working directory '{}' is not absolute", dir.display()),
            }),
        }
    }

    /// The command line as a display string for error messages.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.path.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Termination status of a host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitStatus {
    /// Exit code; meaningful only when `exited` is true.
    pub exit_code: u32,
    /// Whether the process exited normally (as opposed to being signalled).
    pub exited: bool,
    /// Signal name when terminated by a signal, empty otherwise.
    pub signal: String,
}

impl WaitStatus {
    /// A normal exit with the given code.
    #[must_use]
    pub const fn exited(exit_code: u32) -> Self {
        Self {
            exit_code,
            exited: true,
            signal: String::new(),
        }
    }

    /// Whether the command succeeded: exited normally with code zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use hostconf_cli::host::WaitStatus;
    ///
    /// assert!(WaitStatus::exited(0).success());
    /// assert!(!WaitStatus::exited(127).success());
    /// ```
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exited && self.exit_code == 0
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exited {
            write!(f, "exit {}", self.exit_code)
        } else {
            write!(f, "signal {}", self.signal)
        }
    }
}

/// File type as reported by the kernel dirent stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Block device.
    Block,
    /// Character device.
    Char,
    /// Directory.
    Directory,
    /// Named pipe.
    Fifo,
    /// Symbolic link.
    Symlink,
    /// Regular file.
    Regular,
    /// Unix domain socket.
    Socket,
}

impl FileType {
    /// Decode the `S_IFMT` bits of a raw stat mode.
    #[must_use]
    pub const fn from_mode(mode: u32) -> Option<Self> {
        match mode & 0o170_000 {
            0o060_000 => Some(Self::Block),
            0o020_000 => Some(Self::Char),
            0o040_000 => Some(Self::Directory),
            0o010_000 => Some(Self::Fifo),
            0o120_000 => Some(Self::Symlink),
            0o100_000 => Some(Self::Regular),
            0o140_000 => Some(Self::Socket),
            _ => None,
        }
    }

    /// Decode the single-character type code used by `find -printf %y`.
    #[must_use]
    pub const fn from_find_code(code: char) -> Option<Self> {
        match code {
            'b' => Some(Self::Block),
            'c' => Some(Self::Char),
            'd' => Some(Self::Directory),
            'p' => Some(Self::Fifo),
            'l' => Some(Self::Symlink),
            'f' => Some(Self::Regular),
            's' => Some(Self::Socket),
            _ => None,
        }
    }

    /// Whether this is a directory.
    #[must_use]
    pub const fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }

    /// Whether this is a symbolic link.
    #[must_use]
    pub const fn is_symlink(self) -> bool {
        matches!(self, Self::Symlink)
    }
}

/// Metadata of one path, as observed by `lstat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The path's file type.
    pub file_type: FileType,
    /// Permission bits (the low 12 bits of the stat mode).
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Size in bytes (content length for regular files).
    pub size: u64,
}

/// One directory entry from a streaming `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    /// Entry name (a single path component).
    pub name: String,
    /// Entry type from the dirent stream, without a per-entry stat.
    pub file_type: FileType,
}

/// Streaming directory listing: entries one by one, each independently
/// fallible. Dropping the iterator cancels the stream.
pub type DirStream<'a> = Box<dyn Iterator<Item = Result<Dirent, HostError>> + Send + 'a>;

/// The abstract host surface implemented by every transport.
///
/// All operations are synchronous; concurrency is supplied by the callers
/// through the run context's task groups. Implementations must be safe to
/// share across worker threads.
pub trait Host: Send + Sync + fmt::Debug {
    /// Run a command to completion, streaming its standard I/O.
    ///
    /// # Errors
    ///
    /// Fails when the command cannot be spawned or driven; a non-zero exit
    /// is *not* an error here (see [`run_ok`] for that policy).
    fn run(&self, ctx: &RunContext, cmd: Cmd) -> Result<WaitStatus, HostError>;

    /// Stat a path without following symlinks.
    ///
    /// # Errors
    ///
    /// [`HostError::NotFound`] when the path does not exist.
    fn lstat(&self, path: &Path) -> Result<FileInfo, HostError>;

    /// Read a symlink's target.
    ///
    /// # Errors
    ///
    /// Fails when the path does not exist or is not a symlink.
    fn readlink(&self, path: &Path) -> Result<PathBuf, HostError>;

    /// Stream the entries of a directory with their dirent types.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be opened; per-entry failures are
    /// reported through the stream.
    fn readdir(&self, path: &Path) -> Result<DirStream<'_>, HostError>;

    /// Set a path's permission bits (follows symlinks).
    ///
    /// # Errors
    ///
    /// Fails on missing paths or insufficient privileges.
    fn chmod(&self, path: &Path, mode: u32) -> Result<(), HostError>;

    /// Change a path's ownership without following symlinks.
    ///
    /// # Errors
    ///
    /// Fails on missing paths or insufficient privileges.
    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), HostError>;

    /// Create a directory with exactly `mode` (the process umask is
    /// bypassed by an explicit chmod after creation).
    ///
    /// # Errors
    ///
    /// Fails when the parent is missing or the path already exists.
    fn mkdir(&self, path: &Path, mode: u32) -> Result<(), HostError>;

    /// Create a filesystem node of the given type (fifo, device).
    ///
    /// # Errors
    ///
    /// Fails when the node cannot be created or the type is unsupported by
    /// the transport.
    fn mknod(&self, path: &Path, file_type: FileType, mode: u32) -> Result<(), HostError>;

    /// Create a symbolic link at `link` pointing to `target`.
    ///
    /// # Errors
    ///
    /// Fails when `link` already exists or its parent is missing.
    fn symlink(&self, target: &Path, link: &Path) -> Result<(), HostError>;

    /// Remove a path: files and symlinks directly, directories recursively.
    ///
    /// # Errors
    ///
    /// [`HostError::NotFound`] when the path does not exist.
    fn remove(&self, path: &Path) -> Result<(), HostError>;

    /// Atomically rename `from` to `to` (same filesystem).
    ///
    /// The store's slot transitions depend on this being a single atomic
    /// step on the host.
    ///
    /// # Errors
    ///
    /// Fails when `from` is missing or the rename crosses filesystems.
    fn rename(&self, from: &Path, to: &Path) -> Result<(), HostError>;

    /// Open a file for streaming reads.
    ///
    /// # Errors
    ///
    /// [`HostError::NotFound`] when the path does not exist.
    fn read_file(&self, path: &Path) -> Result<Box<dyn Read + Send + '_>, HostError>;

    /// Create or truncate a file from a streaming reader, then fsync it.
    ///
    /// # Errors
    ///
    /// Fails when the parent is missing or the write is interrupted.
    fn write_file(&self, path: &Path, data: &mut dyn Read) -> Result<(), HostError>;

    /// Append a streaming reader to a file, creating it if missing.
    ///
    /// # Errors
    ///
    /// Fails when the parent is missing or the write is interrupted.
    fn append_file(&self, path: &Path, data: &mut dyn Read) -> Result<(), HostError>;

    /// Resolve a user name to a uid on this host.
    ///
    /// # Errors
    ///
    /// [`HostError::LookupFailed`] when the name has no entry.
    fn lookup_user(&self, name: &str) -> Result<u32, HostError>;

    /// Resolve a group name to a gid on this host.
    ///
    /// # Errors
    ///
    /// [`HostError::LookupFailed`] when the name has no entry.
    fn lookup_group(&self, name: &str) -> Result<u32, HostError>;

    /// Effective uid of operations on this host.
    ///
    /// # Errors
    ///
    /// Fails when the transport cannot determine it.
    fn geteuid(&self) -> Result<u32, HostError>;

    /// Effective gid of operations on this host.
    ///
    /// # Errors
    ///
    /// Fails when the transport cannot determine it.
    fn getegid(&self) -> Result<u32, HostError>;

    /// Stable string uniquely identifying this host.
    fn id(&self) -> String;

    /// Transport name (`"local"`, `"docker"`, `"memory"`).
    fn transport(&self) -> &'static str;
}

/// Open a host from a connection string.
///
/// Recognized forms: `local`, `docker:[user[:group]@]container`. The `ssh:`
/// and `agent:` schemes are reserved for transports this build does not
/// ship.
///
/// # Errors
///
/// Fails on unknown schemes, malformed docker specs, or reserved schemes.
pub fn connect(conn: &str) -> Result<Box<dyn Host>, HostError> {
    if conn == "local" {
        return Ok(Box::new(local::LocalHost::new()));
    }
    if let Some(spec) = conn.strip_prefix("docker:") {
        return Ok(Box::new(docker::DockerHost::new(spec)?));
    }
    if conn.starts_with("ssh:") || conn.starts_with("agent:") {
        return Err(HostError::Unsupported(format!(
            "transport for '{conn}' is not available in this build"
        )));
    }
    Err(HostError::Unsupported(format!(
        "unrecognized connection string '{conn}'"
    )))
}

/// A `Write` sink backed by a shared byte buffer, for capturing command
/// output across the `Cmd` ownership boundary.
#[derive(Debug, Clone, Default)]
pub struct SharedBuf {
    inner: std::sync::Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl SharedBuf {
    /// Create an empty shared buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the captured bytes as a lossily decoded string.
    #[must_use]
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run a command and capture its output, tolerating non-zero exits.
///
/// The transport-level analogue of running a process and inspecting the
/// result yourself; pair with [`run_ok`] for the bail-on-failure policy.
///
/// # Errors
///
/// Fails only when the command cannot be executed at all.
pub fn run_capture(
    host: &dyn Host,
    ctx: &RunContext,
    cmd: Cmd,
) -> Result<(WaitStatus, String, String), HostError> {
    let stdout = SharedBuf::new();
    let stderr = SharedBuf::new();
    let cmd = cmd
        .stdout(Box::new(stdout.clone()))
        .stderr(Box::new(stderr.clone()));
    let status = host.run(ctx, cmd)?;
    Ok((status, stdout.into_string(), stderr.into_string()))
}

/// Run a command, failing unless it exits zero; returns captured stdout.
///
/// # Errors
///
/// [`HostError::CommandFailed`] on non-zero exit or signal termination,
/// with trimmed stderr attached.
pub fn run_ok(host: &dyn Host, ctx: &RunContext, cmd: Cmd) -> Result<String, HostError> {
    let line = cmd.command_line();
    let (status, stdout, stderr) = run_capture(host, ctx, cmd)?;
    if status.success() {
        Ok(stdout)
    } else {
        Err(HostError::CommandFailed {
            cmd: line,
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Cmd defaults
    // -----------------------------------------------------------------------

    #[test]
    fn cmd_default_dir_is_tmp() {
        let cmd = Cmd::new("true");
        assert_eq!(cmd.resolved_dir().unwrap(), PathBuf::from("/tmp"));
    }

    #[test]
    fn cmd_relative_dir_is_rejected() {
        let cmd = Cmd::new("true").dir("relative/path");
        let err = cmd.resolved_dir().unwrap_err();
        assert!(err.to_string().contains("not absolute"), "got: {err}");
    }

    #[test]
    fn cmd_absolute_dir_is_kept() {
        let cmd = Cmd::new("true").dir("/var/lib");
        assert_eq!(cmd.resolved_dir().unwrap(), PathBuf::from("/var/lib"));
    }

    #[test]
    fn cmd_default_env_has_lang_and_path() {
        let env = Cmd::new("true").resolved_env();
        assert_eq!(env.get("LANG").map(String::as_str), Some("en_US.UTF-8"));
        assert!(env.get("PATH").unwrap().contains("/usr/sbin"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn cmd_command_line_joins_args() {
        let cmd = Cmd::new("apt-get").args(["install", "-y", "vim"]);
        assert_eq!(cmd.command_line(), "apt-get install -y vim");
    }

    // -----------------------------------------------------------------------
    // WaitStatus
    // -----------------------------------------------------------------------

    #[test]
    fn wait_status_success_requires_exit_zero() {
        assert!(WaitStatus::exited(0).success());
        assert!(!WaitStatus::exited(1).success());
        let signalled = WaitStatus {
            exit_code: 0,
            exited: false,
            signal: "SIGKILL".to_string(),
        };
        assert!(!signalled.success());
    }

    #[test]
    fn wait_status_display() {
        assert_eq!(WaitStatus::exited(127).to_string(), "exit 127");
        let signalled = WaitStatus {
            exit_code: 0,
            exited: false,
            signal: "SIGTERM".to_string(),
        };
        assert_eq!(signalled.to_string(), "signal SIGTERM");
    }

    // -----------------------------------------------------------------------
    // FileType decoding
    // -----------------------------------------------------------------------

    #[test]
    fn file_type_from_mode_covers_all_types() {
        assert_eq!(FileType::from_mode(0o100_644), Some(FileType::Regular));
        assert_eq!(FileType::from_mode(0o040_755), Some(FileType::Directory));
        assert_eq!(FileType::from_mode(0o120_777), Some(FileType::Symlink));
        assert_eq!(FileType::from_mode(0o010_600), Some(FileType::Fifo));
        assert_eq!(FileType::from_mode(0o060_660), Some(FileType::Block));
        assert_eq!(FileType::from_mode(0o020_666), Some(FileType::Char));
        assert_eq!(FileType::from_mode(0o140_755), Some(FileType::Socket));
        assert_eq!(FileType::from_mode(0o000_644), None);
    }

    #[test]
    fn file_type_from_find_code_round_trips() {
        for (code, expected) in [
            ('f', FileType::Regular),
            ('d', FileType::Directory),
            ('l', FileType::Symlink),
            ('p', FileType::Fifo),
            ('b', FileType::Block),
            ('c', FileType::Char),
            ('s', FileType::Socket),
        ] {
            assert_eq!(FileType::from_find_code(code), Some(expected));
        }
        assert_eq!(FileType::from_find_code('x'), None);
    }

    // -----------------------------------------------------------------------
    // connect
    // -----------------------------------------------------------------------

    #[test]
    fn connect_local() {
        let host = connect("local").unwrap();
        assert_eq!(host.transport(), "local");
    }

    #[test]
    fn connect_reserved_schemes_are_unsupported() {
        for conn in ["ssh:example.com", "agent:/run/agent.sock"] {
            let err = connect(conn).unwrap_err();
            assert!(
                err.to_string().contains("not available"),
                "{conn}: {err}"
            );
        }
    }

    #[test]
    fn connect_unknown_scheme_fails() {
        let err = connect("teleport:host").unwrap_err();
        assert!(err.to_string().contains("unrecognized"), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // SharedBuf
    // -----------------------------------------------------------------------

    #[test]
    fn shared_buf_clones_share_contents() {
        let buf = SharedBuf::new();
        let mut writer = buf.clone();
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        assert_eq!(buf.into_string(), "hello world");
    }
}
