//! Docker transport: drives a running container through `docker exec`.
//!
//! Connection string form: `[user[:group]@]container`. Filesystem
//! operations ride on the container's own coreutils (`stat`, `find`,
//! `cat`, ...), so the container needs a POSIX userland but no agent.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::concurrency::RunContext;
use crate::error::HostError;

use super::process;
use super::{Cmd, DirStream, Dirent, FileInfo, FileType, Host, SharedBuf, WaitStatus};

/// Host implementation backed by `docker exec` against one container.
#[derive(Debug)]
pub struct DockerHost {
    container: String,
    user: Option<String>,
    docker_bin: PathBuf,
}

/// Split a `[user[:group]@]container` connection spec.
fn parse_spec(spec: &str) -> Result<(Option<String>, String), HostError> {
    let (user, container) = match spec.rsplit_once('@') {
        Some((user, container)) => (Some(user.to_string()), container.to_string()),
        None => (None, spec.to_string()),
    };
    if container.is_empty() {
        return Err(HostError::Unsupported(format!(
            "docker connection '{spec}' has no container name"
        )));
    }
    if let Some(user) = &user
        && (user.is_empty() || user.split(':').any(str::is_empty))
    {
        return Err(HostError::Unsupported(format!(
            "docker connection '{spec}' has a malformed user spec"
        )));
    }
    Ok((user, container))
}

/// Parse `stat -c '%f %u %g %s'` output into file metadata.
fn parse_stat(line: &str) -> Option<FileInfo> {
    let mut fields = line.split_whitespace();
    let raw_mode = u32::from_str_radix(fields.next()?, 16).ok()?;
    let uid = fields.next()?.parse().ok()?;
    let gid = fields.next()?.parse().ok()?;
    let size = fields.next()?.parse().ok()?;
    Some(FileInfo {
        file_type: FileType::from_mode(raw_mode)?,
        mode: raw_mode & 0o7777,
        uid,
        gid,
        size,
    })
}

/// Parse one `find -printf '%y %f\n'` line into a directory entry.
fn parse_find_line(line: &str) -> Option<Dirent> {
    let (code, name) = line.split_once(' ')?;
    let file_type = FileType::from_find_code(code.chars().next()?)?;
    Some(Dirent {
        name: name.to_string(),
        file_type,
    })
}

/// Extract the id field from a `getent passwd`/`getent group` line.
fn parse_getent_id(line: &str) -> Option<u32> {
    line.split(':').nth(2)?.parse().ok()
}

fn not_found(op: &'static str, path: &Path, stderr: &str) -> HostError {
    if stderr.contains("No such file or directory") {
        HostError::NotFound {
            op,
            path: path.display().to_string(),
        }
    } else {
        HostError::Io {
            op,
            path: path.display().to_string(),
            source: std::io::Error::other(stderr.trim().to_string()),
        }
    }
}

/// Streaming reader over `docker exec ... cat`; reaps the child on drop.
struct ChildReader {
    child: std::process::Child,
    stdout: std::process::ChildStdout,
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl DockerHost {
    /// Open a docker host from a `[user[:group]@]container` spec.
    ///
    /// # Errors
    ///
    /// Fails when the spec is malformed or the `docker` binary is absent.
    pub fn new(spec: &str) -> Result<Self, HostError> {
        let (user, container) = parse_spec(spec)?;
        let docker_bin = which::which("docker").map_err(|e| {
            HostError::Unsupported(format!("docker binary not found on PATH: {e}"))
        })?;
        Ok(Self {
            container,
            user,
            docker_bin,
        })
    }

    /// `docker exec` argument prefix: flags, user mapping, container name.
    fn exec_prefix(&self, interactive: bool) -> Vec<String> {
        let mut argv = vec!["exec".to_string()];
        if interactive {
            argv.push("-i".to_string());
        }
        if let Some(user) = &self.user {
            argv.push("-u".to_string());
            argv.push(user.clone());
        }
        argv.push(self.container.clone());
        argv
    }

    /// Run a raw command inside the container, capturing output.
    fn exec_capture(
        &self,
        argv: impl IntoIterator<Item = String>,
    ) -> Result<(WaitStatus, String, String), HostError> {
        let mut full = self.exec_prefix(false);
        full.extend(argv);

        let mut command = std::process::Command::new(&self.docker_bin);
        command.args(&full);

        let stdout = SharedBuf::new();
        let stderr = SharedBuf::new();
        let cmd = Cmd {
            path: self.docker_bin.display().to_string(),
            args: full,
            stdout: Some(Box::new(stdout.clone())),
            stderr: Some(Box::new(stderr.clone())),
            ..Cmd::default()
        };
        let status = process::drive(command, cmd, &RunContext::new())?;
        Ok((status, stdout.into_string(), stderr.into_string()))
    }

    /// Run a command inside the container, mapping failure to a path error.
    fn exec_ok(
        &self,
        op: &'static str,
        path: &Path,
        argv: impl IntoIterator<Item = String>,
    ) -> Result<String, HostError> {
        let (status, stdout, stderr) = self.exec_capture(argv)?;
        if status.success() {
            Ok(stdout)
        } else {
            Err(not_found(op, path, &stderr))
        }
    }

    /// Feed `data` into a shell snippet's stdin (used by file writes).
    fn exec_with_stdin(
        &self,
        op: &'static str,
        path: &Path,
        script: &str,
        data: &mut dyn Read,
    ) -> Result<(), HostError> {
        let mut argv = self.exec_prefix(true);
        argv.extend([
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            path.display().to_string(),
        ]);

        let io_err = |e: std::io::Error| HostError::from_io(op, path, e);
        let mut child = std::process::Command::new(&self.docker_bin)
            .args(&argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(io_err)?;

        if let Some(mut stdin) = child.stdin.take() {
            std::io::copy(data, &mut stdin).map_err(io_err)?;
        }
        let output = child.wait_with_output().map_err(io_err)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(not_found(
                op,
                path,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

impl Host for DockerHost {
    fn run(&self, ctx: &RunContext, cmd: Cmd) -> Result<WaitStatus, HostError> {
        let dir = cmd.resolved_dir()?;
        let env = cmd.resolved_env();

        // env -i resets the container environment; the sh trampoline enters
        // the working directory and exec's the target, so a missing command
        // surfaces as the conventional exit 127.
        let mut argv = self.exec_prefix(cmd.stdin.is_some());
        argv.extend(["env".to_string(), "-i".to_string()]);
        argv.extend(env.into_iter().map(|(k, v)| format!("{k}={v}")));
        argv.extend([
            "sh".to_string(),
            "-c".to_string(),
            r#"cd "$1" || exit 1; shift; exec "$@""#.to_string(),
            "sh".to_string(),
            dir.display().to_string(),
            cmd.path.clone(),
        ]);
        argv.extend(cmd.args.iter().cloned());

        let mut command = std::process::Command::new(&self.docker_bin);
        command.args(&argv);
        process::drive(command, cmd, ctx)
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo, HostError> {
        let out = self.exec_ok(
            "lstat",
            path,
            [
                "stat".to_string(),
                "-c".to_string(),
                "%f %u %g %s".to_string(),
                "--".to_string(),
                path.display().to_string(),
            ],
        )?;
        parse_stat(out.trim()).ok_or_else(|| HostError::Io {
            op: "lstat",
            path: path.display().to_string(),
            source: std::io::Error::other(format!("unparseable stat output: {out:?}")),
        })
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf, HostError> {
        let out = self.exec_ok(
            "readlink",
            path,
            [
                "readlink".to_string(),
                "--".to_string(),
                path.display().to_string(),
            ],
        )?;
        Ok(PathBuf::from(out.trim_end_matches('\n')))
    }

    fn readdir(&self, path: &Path) -> Result<DirStream<'_>, HostError> {
        let out = self.exec_ok(
            "readdir",
            path,
            [
                "find".to_string(),
                path.display().to_string(),
                "-mindepth".to_string(),
                "1".to_string(),
                "-maxdepth".to_string(),
                "1".to_string(),
                "-printf".to_string(),
                "%y %f\\n".to_string(),
            ],
        )?;
        let owned = path.display().to_string();
        let entries: Vec<Result<Dirent, HostError>> = out
            .lines()
            .map(|line| {
                parse_find_line(line).ok_or_else(|| HostError::Io {
                    op: "readdir",
                    path: owned.clone(),
                    source: std::io::Error::other(format!("unparseable entry: {line:?}")),
                })
            })
            .collect();
        Ok(Box::new(entries.into_iter()))
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), HostError> {
        self.exec_ok(
            "chmod",
            path,
            [
                "chmod".to_string(),
                format!("{mode:04o}"),
                "--".to_string(),
                path.display().to_string(),
            ],
        )
        .map(|_| ())
    }

    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), HostError> {
        self.exec_ok(
            "lchown",
            path,
            [
                "chown".to_string(),
                "-h".to_string(),
                format!("{uid}:{gid}"),
                "--".to_string(),
                path.display().to_string(),
            ],
        )
        .map(|_| ())
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<(), HostError> {
        self.exec_ok(
            "mkdir",
            path,
            [
                "mkdir".to_string(),
                "--".to_string(),
                path.display().to_string(),
            ],
        )?;
        self.chmod(path, mode)
    }

    fn mknod(&self, path: &Path, file_type: FileType, mode: u32) -> Result<(), HostError> {
        if file_type != FileType::Fifo {
            return Err(HostError::Unsupported(format!(
                "mknod of {file_type:?} over the docker transport"
            )));
        }
        self.exec_ok(
            "mknod",
            path,
            [
                "mkfifo".to_string(),
                "--".to_string(),
                path.display().to_string(),
            ],
        )?;
        self.chmod(path, mode)
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<(), HostError> {
        self.exec_ok(
            "symlink",
            link,
            [
                "ln".to_string(),
                "-s".to_string(),
                "--".to_string(),
                target.display().to_string(),
                link.display().to_string(),
            ],
        )
        .map(|_| ())
    }

    fn remove(&self, path: &Path) -> Result<(), HostError> {
        // rm -rf is happy with missing paths; surface those first.
        self.lstat(path).map_err(|e| match e {
            HostError::NotFound { path, .. } => HostError::NotFound { op: "remove", path },
            other => other,
        })?;
        self.exec_ok(
            "remove",
            path,
            [
                "rm".to_string(),
                "-rf".to_string(),
                "--".to_string(),
                path.display().to_string(),
            ],
        )
        .map(|_| ())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), HostError> {
        self.exec_ok(
            "rename",
            from,
            [
                "mv".to_string(),
                "-T".to_string(),
                "--".to_string(),
                from.display().to_string(),
                to.display().to_string(),
            ],
        )
        .map(|_| ())
    }

    fn read_file(&self, path: &Path) -> Result<Box<dyn Read + Send + '_>, HostError> {
        // Existence check up front: cat's failure would otherwise only
        // surface once the caller reads to EOF.
        let info = self.lstat(path)?;
        if info.file_type != FileType::Regular {
            return Err(HostError::Io {
                op: "read_file",
                path: path.display().to_string(),
                source: std::io::Error::other("not a regular file"),
            });
        }

        let mut argv = self.exec_prefix(false);
        argv.extend([
            "cat".to_string(),
            "--".to_string(),
            path.display().to_string(),
        ]);
        let mut child = std::process::Command::new(&self.docker_bin)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HostError::from_io("read_file", path, e))?;
        let stdout = child.stdout.take().ok_or_else(|| HostError::Io {
            op: "read_file",
            path: path.display().to_string(),
            source: std::io::Error::other("no stdout pipe"),
        })?;
        Ok(Box::new(ChildReader { child, stdout }))
    }

    fn write_file(&self, path: &Path, data: &mut dyn Read) -> Result<(), HostError> {
        self.exec_with_stdin("write_file", path, r#"cat > "$1" && sync"#, data)
    }

    fn append_file(&self, path: &Path, data: &mut dyn Read) -> Result<(), HostError> {
        self.exec_with_stdin("append_file", path, r#"cat >> "$1""#, data)
    }

    fn lookup_user(&self, name: &str) -> Result<u32, HostError> {
        let (status, stdout, _) = self.exec_capture([
            "getent".to_string(),
            "passwd".to_string(),
            name.to_string(),
        ])?;
        if !status.success() {
            return Err(HostError::LookupFailed {
                kind: "user",
                name: name.to_string(),
            });
        }
        parse_getent_id(stdout.trim()).ok_or_else(|| HostError::LookupFailed {
            kind: "user",
            name: name.to_string(),
        })
    }

    fn lookup_group(&self, name: &str) -> Result<u32, HostError> {
        let (status, stdout, _) = self.exec_capture([
            "getent".to_string(),
            "group".to_string(),
            name.to_string(),
        ])?;
        if !status.success() {
            return Err(HostError::LookupFailed {
                kind: "group",
                name: name.to_string(),
            });
        }
        parse_getent_id(stdout.trim()).ok_or_else(|| HostError::LookupFailed {
            kind: "group",
            name: name.to_string(),
        })
    }

    fn geteuid(&self) -> Result<u32, HostError> {
        let out = self.exec_ok("geteuid", Path::new("/"), ["id".to_string(), "-u".to_string()])?;
        out.trim().parse().map_err(|_| HostError::Io {
            op: "geteuid",
            path: "/".to_string(),
            source: std::io::Error::other(format!("unparseable id output: {out:?}")),
        })
    }

    fn getegid(&self) -> Result<u32, HostError> {
        let out = self.exec_ok("getegid", Path::new("/"), ["id".to_string(), "-g".to_string()])?;
        out.trim().parse().map_err(|_| HostError::Io {
            op: "getegid",
            path: "/".to_string(),
            source: std::io::Error::other(format!("unparseable id output: {out:?}")),
        })
    }

    fn id(&self) -> String {
        self.user.as_ref().map_or_else(
            || format!("docker:{}", self.container),
            |user| format!("docker:{user}@{}", self.container),
        )
    }

    fn transport(&self) -> &'static str {
        "docker"
    }
}
