//! Bounded-concurrency recursive listing of a host filesystem.
//!
//! The walk fans out one job per directory over a fixed worker pool; its
//! bound is independent of the run's global limiter because a directory
//! listing is cheap and already I/O-bound on the remote side. The first
//! error stops new work and drains the in-flight jobs.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use globset::{GlobSet, GlobSetBuilder};
use parking_lot::{Condvar, Mutex};

use crate::concurrency::RunContext;
use crate::host::{Dirent, FileType, Host};

/// Inner walk concurrency, independent of the global limiter.
const WALK_CONCURRENCY: usize = 128;

/// Directory names never worth walking.
const BLACKLIST: &[&str] = &["__pycache__"];

/// One entry of the walked tree; the absolute path is reconstructed by
/// following parent links.
#[derive(Debug)]
pub struct PathNode {
    dirent: Dirent,
    parent: Option<Arc<PathNode>>,
    children: Mutex<Vec<Arc<PathNode>>>,
}

impl PathNode {
    fn root(path: &Path) -> Arc<Self> {
        Arc::new(Self {
            dirent: Dirent {
                name: path.display().to_string(),
                file_type: FileType::Directory,
            },
            parent: None,
            children: Mutex::new(Vec::new()),
        })
    }

    /// The entry's name and dirent type.
    #[must_use]
    pub const fn dirent(&self) -> &Dirent {
        &self.dirent
    }

    /// The absolute path, rebuilt by walking parent links.
    #[must_use]
    pub fn to_path(&self) -> PathBuf {
        self.parent.as_ref().map_or_else(
            || PathBuf::from(&self.dirent.name),
            |parent| parent.to_path().join(&self.dirent.name),
        )
    }

    /// Snapshot of the node's children.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Self>> {
        self.children.lock().clone()
    }

    /// Lazy pre-order traversal of the subtree, this node included.
    #[must_use]
    pub fn list_recursively(self: &Arc<Self>) -> RecursiveIter {
        RecursiveIter {
            stack: vec![Arc::clone(self)],
        }
    }
}

/// Iterator behind [`PathNode::list_recursively`].
#[derive(Debug)]
pub struct RecursiveIter {
    stack: Vec<Arc<PathNode>>,
}

impl Iterator for RecursiveIter {
    type Item = Arc<PathNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let children = node.children.lock();
        for child in children.iter().rev() {
            self.stack.push(Arc::clone(child));
        }
        drop(children);
        Some(node)
    }
}

/// Compile ignore patterns (extended globs, `**` supported).
fn build_ignore_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            globset::Glob::new(pattern)
                .with_context(|| format!("invalid ignore pattern '{pattern}'"))?,
        );
    }
    builder.build().context("compiling ignore patterns")
}

#[derive(Debug, Default)]
struct WalkState {
    queue: VecDeque<Arc<PathNode>>,
    active: usize,
    failed: Option<anyhow::Error>,
}

struct Walk<'a> {
    host: &'a dyn Host,
    ctx: &'a RunContext,
    ignore: GlobSet,
    state: Mutex<WalkState>,
    cv: Condvar,
}

impl Walk<'_> {
    /// List one directory, attach child nodes, and return the
    /// subdirectories to queue next.
    fn list_dir(&self, dir: &Arc<PathNode>) -> Result<Vec<Arc<PathNode>>> {
        self.ctx.check_cancelled()?;
        let dir_path = dir.to_path();
        let mut subdirs = Vec::new();

        let entries = self.host.readdir(&dir_path)?;
        for entry in entries {
            let entry = entry?;
            if BLACKLIST.contains(&entry.name.as_str()) {
                continue;
            }
            let full = dir_path.join(&entry.name);
            if self.ignore.is_match(&full) {
                continue;
            }
            let node = Arc::new(PathNode {
                dirent: entry,
                parent: Some(Arc::clone(dir)),
                children: Mutex::new(Vec::new()),
            });
            if node.dirent.file_type.is_dir() {
                subdirs.push(Arc::clone(&node));
            }
            dir.children.lock().push(node);
        }
        Ok(subdirs)
    }

    fn worker(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if state.failed.is_some() || (state.queue.is_empty() && state.active == 0) {
                        self.cv.notify_all();
                        return;
                    }
                    if let Some(dir) = state.queue.pop_front() {
                        state.active += 1;
                        break dir;
                    }
                    self.cv.wait(&mut state);
                }
            };

            let result = self.list_dir(&job);

            let mut state = self.state.lock();
            state.active -= 1;
            match result {
                Ok(subdirs) => state.queue.extend(subdirs),
                Err(e) => {
                    if state.failed.is_none() {
                        state.failed = Some(e);
                    }
                }
            }
            self.cv.notify_all();
        }
    }
}

/// Walk the host filesystem from `root`, honouring ignore patterns.
///
/// Symlinks are recorded but never followed (a symlinked directory is a
/// leaf); `__pycache__` directories are skipped outright. The returned
/// tree's traversal order is not deterministic; consumers sort.
///
/// # Errors
///
/// The first listing error (remaining workers drain before it returns),
/// or an invalid ignore pattern.
pub fn walk(
    host: &dyn Host,
    ctx: &RunContext,
    root: &Path,
    ignore: &[String],
) -> Result<Arc<PathNode>> {
    let root_node = PathNode::root(root);
    let walk = Walk {
        host,
        ctx,
        ignore: build_ignore_set(ignore)?,
        state: Mutex::new(WalkState {
            queue: VecDeque::from([Arc::clone(&root_node)]),
            active: 0,
            failed: None,
        }),
        cv: Condvar::new(),
    };

    std::thread::scope(|scope| {
        for _ in 0..WALK_CONCURRENCY {
            scope.spawn(|| walk.worker());
        }
    });

    let mut state = walk.state.lock();
    if let Some(e) = state.failed.take() {
        return Err(e).with_context(|| format!("walking {}", root.display()));
    }
    drop(state);
    Ok(root_node)
}
