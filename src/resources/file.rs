//! Filesystem path resource: regular files, symlinks, directories, fifos.

use std::io::Read as _;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::host::{FileType, Host};

/// Desired (or observed) state of one filesystem path.
///
/// At most one of `regular_file`, `symlink`, `directory`, `fifo`, `absent`
/// may be set; a resource with none of them constrains only ownership and
/// permissions. `uid`/`user` and `gid`/`group` are mutually exclusive;
/// names are resolved against the target host when constraints are
/// evaluated, not at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct File {
    /// Absolute path; the resource id.
    pub path: PathBuf,

    /// Content of a regular file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regular_file: Option<String>,

    /// Target of a symbolic link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink: Option<PathBuf>,

    /// The path is a directory.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub directory: bool,

    /// The path is a named pipe.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fifo: bool,

    /// The path must not exist.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub absent: bool,

    /// Permission bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,

    /// Owning user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    /// Owning user name (resolved on the host).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Owning group id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    /// Owning group name (resolved on the host).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl File {
    /// An empty specification for `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            regular_file: None,
            symlink: None,
            directory: false,
            fifo: false,
            absent: false,
            mode: None,
            uid: None,
            user: None,
            gid: None,
            group: None,
        }
    }

    /// The resource id: the absolute path.
    #[must_use]
    pub fn id(&self) -> String {
        self.path.display().to_string()
    }

    fn invalid(&self, reason: impl Into<String>) -> ValidationError {
        ValidationError::InvalidResource {
            kind: "File".to_string(),
            id: self.id(),
            reason: reason.into(),
        }
    }

    /// Structural validation.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.path.is_absolute() {
            return Err(self.invalid("path must be absolute"));
        }
        let type_fields = usize::from(self.regular_file.is_some())
            + usize::from(self.symlink.is_some())
            + usize::from(self.directory)
            + usize::from(self.fifo)
            + usize::from(self.absent);
        if type_fields > 1 {
            return Err(self.invalid(
                "regular_file, symlink, directory, fifo and absent are mutually exclusive",
            ));
        }
        if self.uid.is_some() && self.user.is_some() {
            return Err(self.invalid("uid and user are mutually exclusive"));
        }
        if self.gid.is_some() && self.group.is_some() {
            return Err(self.invalid("gid and group are mutually exclusive"));
        }
        if self.absent
            && (self.mode.is_some()
                || self.uid.is_some()
                || self.user.is_some()
                || self.gid.is_some()
                || self.group.is_some())
        {
            return Err(self.invalid("absent excludes mode and ownership fields"));
        }
        if let Some(mode) = self.mode
            && mode > 0o7777
        {
            return Err(self.invalid(format!("mode {mode:#o} exceeds 0o7777")));
        }
        Ok(())
    }

    /// Read the path's current state from the host.
    ///
    /// A missing path loads as `absent: true`; everything else captures
    /// type, content/target, mode and numeric ownership.
    ///
    /// # Errors
    ///
    /// Fails on host I/O errors other than absence.
    pub fn load(&self, host: &dyn Host) -> Result<Self> {
        let mut loaded = Self::at(self.path.clone());
        let info = match host.lstat(&self.path) {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                loaded.absent = true;
                return Ok(loaded);
            }
            Err(e) => return Err(e).context("loading file state"),
        };

        loaded.mode = Some(info.mode);
        loaded.uid = Some(info.uid);
        loaded.gid = Some(info.gid);
        match info.file_type {
            FileType::Regular => {
                let mut content = String::new();
                host.read_file(&self.path)?
                    .read_to_string(&mut content)
                    .with_context(|| format!("reading {}", self.path.display()))?;
                loaded.regular_file = Some(content);
            }
            FileType::Symlink => {
                loaded.symlink = Some(host.readlink(&self.path)?);
                // Link permissions are not meaningful.
                loaded.mode = None;
            }
            FileType::Directory => loaded.directory = true,
            FileType::Fifo => loaded.fifo = true,
            other => anyhow::bail!(
                "{}: unsupported file type {other:?}",
                self.path.display()
            ),
        }
        Ok(loaded)
    }

    /// Resolve the desired owner to numeric ids using the host's tables.
    fn desired_owner(&self, host: &dyn Host) -> Result<(Option<u32>, Option<u32>)> {
        let uid = match (&self.uid, &self.user) {
            (Some(uid), _) => Some(*uid),
            (None, Some(user)) => Some(host.lookup_user(user)?),
            (None, None) => None,
        };
        let gid = match (&self.gid, &self.group) {
            (Some(gid), _) => Some(*gid),
            (None, Some(group)) => Some(host.lookup_group(group)?),
            (None, None) => None,
        };
        Ok((uid, gid))
    }

    /// Whether `self` (a loaded state) meets every constraint in `other`.
    ///
    /// # Errors
    ///
    /// Fails when resolving `other`'s user/group names on the host fails.
    pub fn satisfies(&self, host: &dyn Host, other: &Self) -> Result<bool> {
        if other.absent {
            return Ok(self.absent);
        }
        if self.absent {
            return Ok(false);
        }
        if let Some(content) = &other.regular_file
            && self.regular_file.as_ref() != Some(content)
        {
            return Ok(false);
        }
        if let Some(target) = &other.symlink
            && self.symlink.as_ref() != Some(target)
        {
            return Ok(false);
        }
        if other.directory && !self.directory {
            return Ok(false);
        }
        if other.fifo && !self.fifo {
            return Ok(false);
        }
        if let Some(mode) = other.mode
            && self.mode != Some(mode)
        {
            return Ok(false);
        }
        let (uid, gid) = other.desired_owner(host)?;
        if let Some(uid) = uid
            && self.uid != Some(uid)
        {
            return Ok(false);
        }
        if let Some(gid) = gid
            && self.gid != Some(gid)
        {
            return Ok(false);
        }
        Ok(true)
    }

    fn desired_type(&self) -> Option<FileType> {
        if self.regular_file.is_some() {
            Some(FileType::Regular)
        } else if self.symlink.is_some() {
            Some(FileType::Symlink)
        } else if self.directory {
            Some(FileType::Directory)
        } else if self.fifo {
            Some(FileType::Fifo)
        } else {
            None
        }
    }

    /// Mutate the host so that `self.load(host)` satisfies `self`.
    ///
    /// Idempotent: state is inspected first and only the differing aspects
    /// are touched.
    ///
    /// # Errors
    ///
    /// Fails on host I/O errors, or when a path with no type constraint
    /// does not exist (there is nothing to create).
    pub fn apply(&self, host: &dyn Host) -> Result<()> {
        let current = self.load(host)?;

        if self.absent {
            if !current.absent {
                host.remove(&self.path)?;
            }
            return Ok(());
        }

        let desired = self.desired_type();
        let current_type = current.desired_type();

        if let Some(desired) = desired {
            // A wrong-type path is replaced, not patched.
            if !current.absent && current_type != Some(desired) {
                host.remove(&self.path)?;
            }
            match desired {
                FileType::Regular => {
                    let content = self.regular_file.as_deref().unwrap_or_default();
                    if current.absent
                        || current_type != Some(FileType::Regular)
                        || current.regular_file.as_deref() != Some(content)
                    {
                        host.write_file(&self.path, &mut content.as_bytes())?;
                    }
                }
                FileType::Symlink => {
                    let target = self
                        .symlink
                        .clone()
                        .unwrap_or_default();
                    if current.symlink.as_ref() != Some(&target) {
                        if !current.absent && current_type == Some(FileType::Symlink) {
                            host.remove(&self.path)?;
                        }
                        host.symlink(&target, &self.path)?;
                    }
                }
                FileType::Directory => {
                    if current.absent || !current.directory {
                        host.mkdir(&self.path, self.mode.unwrap_or(0o755))?;
                    }
                }
                FileType::Fifo => {
                    if current.absent || !current.fifo {
                        host.mknod(&self.path, FileType::Fifo, self.mode.unwrap_or(0o644))?;
                    }
                }
                _ => {}
            }
        } else if current.absent {
            anyhow::bail!(
                "{}: cannot apply ownership or mode, path does not exist",
                self.path.display()
            );
        }

        // Converge permission bits (meaningless on symlinks) and ownership
        // after creation.
        let after = self.load(host)?;
        if desired != Some(FileType::Symlink)
            && let Some(mode) = self.mode
            && after.mode != Some(mode)
        {
            host.chmod(&self.path, mode)?;
        }
        let (uid, gid) = self.desired_owner(host)?;
        if uid.is_some() || gid.is_some() {
            let want_uid = uid.or(after.uid).unwrap_or_default();
            let want_gid = gid.or(after.gid).unwrap_or_default();
            if after.uid != Some(want_uid) || after.gid != Some(want_gid) {
                host.lchown(&self.path, want_uid, want_gid)?;
            }
        }
        Ok(())
    }

    /// Merge two partial specifications of the same path.
    ///
    /// # Errors
    ///
    /// [`ValidationError::MergeConflict`] when the sides set the same field
    /// to different values; `self` is not modified.
    pub fn merge(&self, other: &Self) -> Result<Self, ValidationError> {
        if self.path != other.path {
            return Err(self.conflict("path"));
        }
        Ok(Self {
            path: self.path.clone(),
            regular_file: self.merge_option("regular_file", &self.regular_file, &other.regular_file)?,
            symlink: self.merge_option("symlink", &self.symlink, &other.symlink)?,
            directory: self.directory || other.directory,
            fifo: self.fifo || other.fifo,
            absent: self.absent || other.absent,
            mode: self.merge_option("mode", &self.mode, &other.mode)?,
            uid: self.merge_option("uid", &self.uid, &other.uid)?,
            user: self.merge_option("user", &self.user, &other.user)?,
            gid: self.merge_option("gid", &self.gid, &other.gid)?,
            group: self.merge_option("group", &self.group, &other.group)?,
        })
    }

    fn conflict(&self, field: &str) -> ValidationError {
        ValidationError::MergeConflict {
            kind: "File".to_string(),
            id: self.id(),
            field: field.to_string(),
        }
    }

    fn merge_option<T: Clone + PartialEq>(
        &self,
        field: &str,
        a: &Option<T>,
        b: &Option<T>,
    ) -> Result<Option<T>, ValidationError> {
        match (a, b) {
            (Some(a), Some(b)) if a != b => Err(self.conflict(field)),
            (Some(a), _) => Ok(Some(a.clone())),
            (None, b) => Ok(b.clone()),
        }
    }
}
