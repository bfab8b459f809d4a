//! In-process host: an in-memory filesystem plus a canned command table.
//!
//! The primary test double for the engine and the discovery pipeline, in
//! the same spirit as an injectable executor: tests declare what each
//! command prints and observe every operation the code under test issued.
//! Also useful for exercising a run end-to-end without a disposable
//! machine.

use std::collections::BTreeMap;
use std::io::{Read, Write as _};
use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;

use crate::concurrency::RunContext;
use crate::error::HostError;

use super::{Cmd, DirStream, Dirent, FileInfo, FileType, Host, WaitStatus};

/// Canned response for one command invocation.
#[derive(Debug, Clone)]
pub struct CmdResponse {
    /// Bytes written to the command's stdout sink.
    pub stdout: String,
    /// Bytes written to the command's stderr sink.
    pub stderr: String,
    /// Exit code reported to the caller.
    pub exit_code: u32,
}

impl CmdResponse {
    /// A successful invocation printing `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// A failed invocation with the given exit code and stderr.
    #[must_use]
    pub fn fail(exit_code: u32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    file_type: FileType,
    mode: u32,
    uid: u32,
    gid: u32,
    content: Vec<u8>,
    target: PathBuf,
}

impl Node {
    fn new(file_type: FileType, mode: u32) -> Self {
        Self {
            file_type,
            mode,
            uid: 0,
            gid: 0,
            content: Vec::new(),
            target: PathBuf::new(),
        }
    }
}

#[derive(Debug)]
struct CmdRule {
    matcher: String,
    responses: Vec<CmdResponse>,
    served: usize,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<PathBuf, Node>,
    rules: Vec<CmdRule>,
    operations: Vec<String>,
    faults: Vec<String>,
    users: BTreeMap<String, u32>,
    groups: BTreeMap<String, u32>,
    euid: u32,
    egid: u32,
}

/// In-memory host implementation.
#[derive(Debug)]
pub struct MemoryHost {
    inner: Mutex<Inner>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

const SYMLINK_DEPTH_LIMIT: usize = 40;

impl MemoryHost {
    /// Create a host containing only the root directory, with `root`
    /// user/group tables and effective uid/gid 0.
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(PathBuf::from("/"), Node::new(FileType::Directory, 0o755));
        Self {
            inner: Mutex::new(Inner {
                nodes,
                users: BTreeMap::from([("root".to_string(), 0)]),
                groups: BTreeMap::from([("root".to_string(), 0)]),
                ..Inner::default()
            }),
        }
    }

    // -- test fixture builders ---------------------------------------------

    /// Add a directory (and any missing ancestors) with mode `0o755`.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = normalize(path.as_ref());
        let mut inner = self.inner.lock();
        let mut ancestor = PathBuf::from("/");
        for component in path.components().skip(1) {
            ancestor.push(component);
            inner
                .nodes
                .entry(ancestor.clone())
                .or_insert_with(|| Node::new(FileType::Directory, 0o755));
        }
    }

    /// Add a regular file with the given content and mode `0o644`.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let path = normalize(path.as_ref());
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        let mut node = Node::new(FileType::Regular, 0o644);
        node.content = content.into();
        self.inner.lock().nodes.insert(path, node);
    }

    /// Add a symlink pointing at `target`.
    pub fn add_symlink(&self, path: impl AsRef<Path>, target: impl Into<PathBuf>) {
        let path = normalize(path.as_ref());
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        let mut node = Node::new(FileType::Symlink, 0o777);
        node.target = target.into();
        self.inner.lock().nodes.insert(path, node);
    }

    /// Set ownership bits on an existing node.
    ///
    /// # Panics
    ///
    /// Panics when the path was not added first (test fixture misuse).
    pub fn set_owner(&self, path: impl AsRef<Path>, uid: u32, gid: u32, mode: u32) {
        let path = normalize(path.as_ref());
        let mut inner = self.inner.lock();
        let node = inner
            .nodes
            .get_mut(&path)
            .unwrap_or_else(|| panic!("set_owner: no node at {}", path.display()));
        node.uid = uid;
        node.gid = gid;
        node.mode = mode;
    }

    /// Register a user name → uid mapping.
    pub fn add_user(&self, name: impl Into<String>, uid: u32) {
        self.inner.lock().users.insert(name.into(), uid);
    }

    /// Register a group name → gid mapping.
    pub fn add_group(&self, name: impl Into<String>, gid: u32) {
        self.inner.lock().groups.insert(name.into(), gid);
    }

    /// Register canned responses for commands whose command line contains
    /// `matcher`.
    ///
    /// Responses are served in order; the last one repeats once the queue
    /// is exhausted, so a single response models a stable command and a
    /// sequence models state that changes between invocations.
    pub fn on_command(&self, matcher: impl Into<String>, responses: Vec<CmdResponse>) {
        assert!(!responses.is_empty(), "on_command needs at least one response");
        self.inner.lock().rules.push(CmdRule {
            matcher: matcher.into(),
            responses,
            served: 0,
        });
    }

    /// Make every host operation whose log line contains `matcher` fail.
    ///
    /// This is the crash-injection point for store atomicity tests: failing
    /// exactly one transition simulates a kill between two store writes.
    pub fn fail_when(&self, matcher: impl Into<String>) {
        self.inner.lock().faults.push(matcher.into());
    }

    /// Every operation issued against this host, in order.
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        self.inner.lock().operations.clone()
    }

    /// Forget recorded operations (fixture setup noise).
    pub fn clear_operations(&self) {
        self.inner.lock().operations.clear();
    }

    // -- internals ----------------------------------------------------------

    fn record(&self, op: &str, detail: &str) -> Result<(), HostError> {
        let line = format!("{op} {detail}");
        let mut inner = self.inner.lock();
        inner.operations.push(line.clone());
        if inner.faults.iter().any(|fault| line.contains(fault.as_str())) {
            return Err(HostError::Io {
                op: "fault",
                path: detail.to_string(),
                source: std::io::Error::other(format!("injected fault at '{line}'")),
            });
        }
        Ok(())
    }

    fn node(&self, op: &'static str, path: &Path) -> Result<Node, HostError> {
        self.inner
            .lock()
            .nodes
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| HostError::NotFound {
                op,
                path: path.display().to_string(),
            })
    }

    /// Resolve symlinks until a non-link node (or a dangling target).
    fn resolve(&self, op: &'static str, path: &Path) -> Result<(PathBuf, Node), HostError> {
        let mut current = normalize(path);
        for _ in 0..SYMLINK_DEPTH_LIMIT {
            let node = self.node(op, &current)?;
            if node.file_type != FileType::Symlink {
                return Ok((current, node));
            }
            let target = if node.target.is_absolute() {
                node.target.clone()
            } else {
                current
                    .parent()
                    .map_or_else(|| node.target.clone(), |p| p.join(&node.target))
            };
            current = normalize(&target);
        }
        Err(HostError::Io {
            op,
            path: path.display().to_string(),
            source: std::io::Error::other("too many levels of symbolic links"),
        })
    }

    fn require_parent_dir(&self, op: &'static str, path: &Path) -> Result<(), HostError> {
        let parent = normalize(path)
            .parent()
            .map_or_else(|| PathBuf::from("/"), Path::to_path_buf);
        let node = self.node(op, &parent)?;
        if node.file_type.is_dir() {
            Ok(())
        } else {
            Err(HostError::Io {
                op,
                path: path.display().to_string(),
                source: std::io::Error::other("parent is not a directory"),
            })
        }
    }
}

impl Host for MemoryHost {
    fn run(&self, ctx: &RunContext, mut cmd: Cmd) -> Result<WaitStatus, HostError> {
        ctx.check_cancelled()?;
        let _ = cmd.resolved_dir()?;
        let line = cmd.command_line();
        self.record("run", &line)?;

        let response = {
            let mut inner = self.inner.lock();
            inner
                .rules
                .iter_mut()
                .find(|rule| line.contains(rule.matcher.as_str()))
                .map(|rule| {
                    let index = rule.served.min(rule.responses.len() - 1);
                    rule.served += 1;
                    rule.responses
                        .get(index)
                        .cloned()
                        .unwrap_or_else(|| CmdResponse::fail(1, "empty response queue"))
                })
        };

        let response = response.unwrap_or_else(|| {
            CmdResponse::fail(127, format!("{}: command not found", cmd.path))
        });

        if let Some(sink) = cmd.stdout.as_mut() {
            sink.write_all(response.stdout.as_bytes())
                .and_then(|()| sink.flush())
                .map_err(|e| HostError::Exec {
                    cmd: line.clone(),
                    detail: format!("stdout stream: {e}"),
                })?;
        }
        if let Some(sink) = cmd.stderr.as_mut() {
            sink.write_all(response.stderr.as_bytes())
                .and_then(|()| sink.flush())
                .map_err(|e| HostError::Exec {
                    cmd: line,
                    detail: format!("stderr stream: {e}"),
                })?;
        }
        Ok(WaitStatus::exited(response.exit_code))
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo, HostError> {
        self.record("lstat", &path.display().to_string())?;
        let node = self.node("lstat", path)?;
        Ok(FileInfo {
            file_type: node.file_type,
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            size: node.content.len() as u64,
        })
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf, HostError> {
        self.record("readlink", &path.display().to_string())?;
        let node = self.node("readlink", path)?;
        if node.file_type == FileType::Symlink {
            Ok(node.target)
        } else {
            Err(HostError::Io {
                op: "readlink",
                path: path.display().to_string(),
                source: std::io::Error::other("not a symlink"),
            })
        }
    }

    fn readdir(&self, path: &Path) -> Result<DirStream<'_>, HostError> {
        self.record("readdir", &path.display().to_string())?;
        let dir = normalize(path);
        let node = self.node("readdir", &dir)?;
        if !node.file_type.is_dir() {
            return Err(HostError::Io {
                op: "readdir",
                path: path.display().to_string(),
                source: std::io::Error::other("not a directory"),
            });
        }
        let entries: Vec<Result<Dirent, HostError>> = self
            .inner
            .lock()
            .nodes
            .iter()
            .filter(|(candidate, _)| candidate.parent() == Some(dir.as_path()))
            .map(|(candidate, node)| {
                Ok(Dirent {
                    name: candidate
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    file_type: node.file_type,
                })
            })
            .collect();
        Ok(Box::new(entries.into_iter()))
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), HostError> {
        self.record("chmod", &format!("{} {mode:04o}", path.display()))?;
        let (resolved, _) = self.resolve("chmod", path)?;
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(&resolved) {
            node.mode = mode;
        }
        Ok(())
    }

    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), HostError> {
        self.record("lchown", &format!("{} {uid}:{gid}", path.display()))?;
        let key = normalize(path);
        let mut inner = self.inner.lock();
        let node = inner.nodes.get_mut(&key).ok_or_else(|| HostError::NotFound {
            op: "lchown",
            path: path.display().to_string(),
        })?;
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<(), HostError> {
        self.record("mkdir", &path.display().to_string())?;
        let key = normalize(path);
        self.require_parent_dir("mkdir", &key)?;
        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(&key) {
            return Err(HostError::Io {
                op: "mkdir",
                path: path.display().to_string(),
                source: std::io::Error::other("file exists"),
            });
        }
        let (euid, egid) = (inner.euid, inner.egid);
        let mut node = Node::new(FileType::Directory, mode);
        node.uid = euid;
        node.gid = egid;
        inner.nodes.insert(key, node);
        Ok(())
    }

    fn mknod(&self, path: &Path, file_type: FileType, mode: u32) -> Result<(), HostError> {
        self.record("mknod", &path.display().to_string())?;
        let key = normalize(path);
        self.require_parent_dir("mknod", &key)?;
        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(&key) {
            return Err(HostError::Io {
                op: "mknod",
                path: path.display().to_string(),
                source: std::io::Error::other("file exists"),
            });
        }
        inner.nodes.insert(key, Node::new(file_type, mode));
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<(), HostError> {
        self.record(
            "symlink",
            &format!("{} -> {}", link.display(), target.display()),
        )?;
        let key = normalize(link);
        self.require_parent_dir("symlink", &key)?;
        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(&key) {
            return Err(HostError::Io {
                op: "symlink",
                path: link.display().to_string(),
                source: std::io::Error::other("file exists"),
            });
        }
        let mut node = Node::new(FileType::Symlink, 0o777);
        node.target = target.to_path_buf();
        inner.nodes.insert(key, node);
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), HostError> {
        self.record("remove", &path.display().to_string())?;
        let key = normalize(path);
        let mut inner = self.inner.lock();
        if !inner.nodes.contains_key(&key) {
            return Err(HostError::NotFound {
                op: "remove",
                path: path.display().to_string(),
            });
        }
        inner
            .nodes
            .retain(|candidate, _| candidate != &key && !candidate.starts_with(&key));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), HostError> {
        self.record("rename", &format!("{} -> {}", from.display(), to.display()))?;
        let from_key = normalize(from);
        let to_key = normalize(to);
        let mut inner = self.inner.lock();
        let node = inner.nodes.remove(&from_key).ok_or_else(|| HostError::NotFound {
            op: "rename",
            path: from.display().to_string(),
        })?;
        // Move any subtree along with the node itself.
        let descendants: Vec<PathBuf> = inner
            .nodes
            .keys()
            .filter(|candidate| candidate.starts_with(&from_key))
            .cloned()
            .collect();
        for old in descendants {
            if let (Some(moved), Ok(rest)) =
                (inner.nodes.remove(&old), old.strip_prefix(&from_key))
            {
                inner.nodes.insert(to_key.join(rest), moved);
            }
        }
        inner.nodes.insert(to_key, node);
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<Box<dyn Read + Send + '_>, HostError> {
        self.record("read_file", &path.display().to_string())?;
        let (_, node) = self.resolve("read_file", path)?;
        if node.file_type != FileType::Regular {
            return Err(HostError::Io {
                op: "read_file",
                path: path.display().to_string(),
                source: std::io::Error::other("not a regular file"),
            });
        }
        Ok(Box::new(std::io::Cursor::new(node.content)))
    }

    fn write_file(&self, path: &Path, data: &mut dyn Read) -> Result<(), HostError> {
        self.record("write_file", &path.display().to_string())?;
        let key = normalize(path);
        self.require_parent_dir("write_file", &key)?;
        let mut content = Vec::new();
        data.read_to_end(&mut content)
            .map_err(|e| HostError::from_io("write_file", path, e))?;
        let mut inner = self.inner.lock();
        let (euid, egid) = (inner.euid, inner.egid);
        let node = inner.nodes.entry(key).or_insert_with(|| {
            let mut node = Node::new(FileType::Regular, 0o644);
            node.uid = euid;
            node.gid = egid;
            node
        });
        node.content = content;
        Ok(())
    }

    fn append_file(&self, path: &Path, data: &mut dyn Read) -> Result<(), HostError> {
        self.record("append_file", &path.display().to_string())?;
        let key = normalize(path);
        self.require_parent_dir("append_file", &key)?;
        let mut content = Vec::new();
        data.read_to_end(&mut content)
            .map_err(|e| HostError::from_io("append_file", path, e))?;
        let mut inner = self.inner.lock();
        let (euid, egid) = (inner.euid, inner.egid);
        let node = inner.nodes.entry(key).or_insert_with(|| {
            let mut node = Node::new(FileType::Regular, 0o644);
            node.uid = euid;
            node.gid = egid;
            node
        });
        node.content.extend_from_slice(&content);
        Ok(())
    }

    fn lookup_user(&self, name: &str) -> Result<u32, HostError> {
        self.record("lookup_user", name)?;
        self.inner
            .lock()
            .users
            .get(name)
            .copied()
            .ok_or_else(|| HostError::LookupFailed {
                kind: "user",
                name: name.to_string(),
            })
    }

    fn lookup_group(&self, name: &str) -> Result<u32, HostError> {
        self.record("lookup_group", name)?;
        self.inner
            .lock()
            .groups
            .get(name)
            .copied()
            .ok_or_else(|| HostError::LookupFailed {
                kind: "group",
                name: name.to_string(),
            })
    }

    fn geteuid(&self) -> Result<u32, HostError> {
        Ok(self.inner.lock().euid)
    }

    fn getegid(&self) -> Result<u32, HostError> {
        Ok(self.inner.lock().egid)
    }

    fn id(&self) -> String {
        "memory".to_string()
    }

    fn transport(&self) -> &'static str {
        "memory"
    }
}
