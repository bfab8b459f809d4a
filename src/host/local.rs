//! Local transport: direct syscalls against the machine the engine runs on.

use std::fs;
use std::io::{Read, Write as _};
use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};

use crate::concurrency::RunContext;
use crate::error::HostError;

use super::process;
use super::{Cmd, DirStream, Dirent, FileInfo, FileType, Host, WaitStatus};

/// Host implementation backed by the local machine.
#[derive(Debug, Default)]
pub struct LocalHost;

impl LocalHost {
    /// Create a local host.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Permission bits of a raw stat mode (including setuid/setgid/sticky).
const PERM_MASK: u32 = 0o7777;

fn file_type_of(meta: &fs::Metadata) -> FileType {
    use std::os::unix::fs::FileTypeExt as _;
    let ft = meta.file_type();
    if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_fifo() {
        FileType::Fifo
    } else if ft.is_block_device() {
        FileType::Block
    } else if ft.is_char_device() {
        FileType::Char
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::Regular
    }
}

fn dirent_type(ft: &fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt as _;
    if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_fifo() {
        FileType::Fifo
    } else if ft.is_block_device() {
        FileType::Block
    } else if ft.is_char_device() {
        FileType::Char
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::Regular
    }
}

impl Host for LocalHost {
    fn run(&self, ctx: &RunContext, cmd: Cmd) -> Result<WaitStatus, HostError> {
        let dir = cmd.resolved_dir()?;
        let env = cmd.resolved_env();
        let mut command = std::process::Command::new(&cmd.path);
        command.args(&cmd.args).current_dir(dir).env_clear().envs(env);
        process::drive(command, cmd, ctx)
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo, HostError> {
        let meta =
            fs::symlink_metadata(path).map_err(|e| HostError::from_io("lstat", path, e))?;
        Ok(FileInfo {
            file_type: file_type_of(&meta),
            mode: meta.mode() & PERM_MASK,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
        })
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf, HostError> {
        fs::read_link(path).map_err(|e| HostError::from_io("readlink", path, e))
    }

    fn readdir(&self, path: &Path) -> Result<DirStream<'_>, HostError> {
        // `fs::read_dir` surfaces the kernel dirent stream; `file_type()` on
        // each entry comes from d_type and does not stat the entry on Linux.
        let owned = path.to_path_buf();
        let entries =
            fs::read_dir(path).map_err(|e| HostError::from_io("readdir", path, e))?;
        Ok(Box::new(entries.map(move |entry| {
            let entry = entry.map_err(|e| HostError::from_io("readdir", &owned, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| HostError::from_io("readdir", &entry.path(), e))?;
            Ok(Dirent {
                name: entry.file_name().to_string_lossy().into_owned(),
                file_type: dirent_type(&file_type),
            })
        })))
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), HostError> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| HostError::from_io("chmod", path, e))
    }

    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), HostError> {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))
            .map_err(|e| HostError::from_io("lchown", path, e))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<(), HostError> {
        fs::create_dir(path).map_err(|e| HostError::from_io("mkdir", path, e))?;
        // The umask applied at creation time is undone here.
        self.chmod(path, mode)
    }

    fn mknod(&self, path: &Path, file_type: FileType, mode: u32) -> Result<(), HostError> {
        let kind = match file_type {
            FileType::Fifo => nix::sys::stat::SFlag::S_IFIFO,
            FileType::Block => nix::sys::stat::SFlag::S_IFBLK,
            FileType::Char => nix::sys::stat::SFlag::S_IFCHR,
            other => {
                return Err(HostError::Unsupported(format!(
                    "mknod of {other:?} at {}",
                    path.display()
                )));
            }
        };
        let perm = nix::sys::stat::Mode::from_bits_truncate(mode);
        nix::sys::stat::mknod(path, kind, perm, 0).map_err(|e| HostError::Io {
            op: "mknod",
            path: path.display().to_string(),
            source: std::io::Error::from(e),
        })?;
        // As with mkdir, take the umask back out of the picture.
        self.chmod(path, mode)
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<(), HostError> {
        std::os::unix::fs::symlink(target, link)
            .map_err(|e| HostError::from_io("symlink", link, e))
    }

    fn remove(&self, path: &Path) -> Result<(), HostError> {
        let info = self.lstat(path)?;
        if info.file_type.is_dir() {
            fs::remove_dir_all(path).map_err(|e| HostError::from_io("remove", path, e))
        } else {
            fs::remove_file(path).map_err(|e| HostError::from_io("remove", path, e))
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), HostError> {
        fs::rename(from, to).map_err(|e| HostError::from_io("rename", from, e))
    }

    fn read_file(&self, path: &Path) -> Result<Box<dyn Read + Send + '_>, HostError> {
        let file = fs::File::open(path).map_err(|e| HostError::from_io("read_file", path, e))?;
        Ok(Box::new(file))
    }

    fn write_file(&self, path: &Path, data: &mut dyn Read) -> Result<(), HostError> {
        let mut file =
            fs::File::create(path).map_err(|e| HostError::from_io("write_file", path, e))?;
        std::io::copy(data, &mut file)
            .map_err(|e| HostError::from_io("write_file", path, e))?;
        // Durability before any rename that may follow.
        file.sync_all()
            .map_err(|e| HostError::from_io("write_file", path, e))
    }

    fn append_file(&self, path: &Path, data: &mut dyn Read) -> Result<(), HostError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| HostError::from_io("append_file", path, e))?;
        std::io::copy(data, &mut file)
            .map_err(|e| HostError::from_io("append_file", path, e))?;
        file.flush()
            .map_err(|e| HostError::from_io("append_file", path, e))
    }

    fn lookup_user(&self, name: &str) -> Result<u32, HostError> {
        match nix::unistd::User::from_name(name) {
            Ok(Some(user)) => Ok(user.uid.as_raw()),
            Ok(None) => Err(HostError::LookupFailed {
                kind: "user",
                name: name.to_string(),
            }),
            Err(e) => Err(HostError::Io {
                op: "lookup_user",
                path: name.to_string(),
                source: std::io::Error::from(e),
            }),
        }
    }

    fn lookup_group(&self, name: &str) -> Result<u32, HostError> {
        match nix::unistd::Group::from_name(name) {
            Ok(Some(group)) => Ok(group.gid.as_raw()),
            Ok(None) => Err(HostError::LookupFailed {
                kind: "group",
                name: name.to_string(),
            }),
            Err(e) => Err(HostError::Io {
                op: "lookup_group",
                path: name.to_string(),
                source: std::io::Error::from(e),
            }),
        }
    }

    fn geteuid(&self) -> Result<u32, HostError> {
        Ok(nix::unistd::geteuid().as_raw())
    }

    fn getegid(&self) -> Result<u32, HostError> {
        Ok(nix::unistd::getegid().as_raw())
    }

    fn id(&self) -> String {
        "local".to_string()
    }

    fn transport(&self) -> &'static str {
        "local"
    }
}
