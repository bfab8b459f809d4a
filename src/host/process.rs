//! Shared subprocess driver for transports that spawn controller-side
//! processes (local exec, `docker exec`).

use std::io::{Read, Write};
use std::process::Stdio;

use crate::concurrency::RunContext;
use crate::error::HostError;

use super::{Cmd, WaitStatus};

/// Name of a termination signal, `"signal <n>"` for unknown numbers.
pub(crate) fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map_or_else(|_| format!("signal {signal}"), |s| s.as_str().to_string())
}

/// Convert a process exit status into the transport-independent form.
pub(crate) fn wait_status(status: std::process::ExitStatus) -> WaitStatus {
    use std::os::unix::process::ExitStatusExt as _;
    status.code().map_or_else(
        || WaitStatus {
            exit_code: 0,
            exited: false,
            signal: status.signal().map_or_else(String::new, signal_name),
        },
        |code| WaitStatus::exited(code.unsigned_abs()),
    )
}

/// Spawn `command` and drive `cmd`'s streams until the process exits.
///
/// The stdin source is copied into the child and closed at EOF; stdout and
/// stderr are copied into the caller's sinks concurrently so a full pipe
/// never deadlocks the child. Cancellation is checked before spawning; an
/// in-flight process is one I/O boundary and runs to completion.
pub(crate) fn drive(
    mut command: std::process::Command,
    mut cmd: Cmd,
    ctx: &RunContext,
) -> Result<WaitStatus, HostError> {
    ctx.check_cancelled()?;

    let line = cmd.command_line();
    command
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if cmd.stdout.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(if cmd.stderr.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    let mut child = command.spawn().map_err(|e| HostError::Exec {
        cmd: line.clone(),
        detail: e.to_string(),
    })?;

    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let copy_failure = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        if let (Some(mut pipe), Some(source)) = (stdin_pipe, cmd.stdin.as_mut()) {
            handles.push(scope.spawn(move || {
                // Dropping the pipe at end of scope closes the child's stdin.
                std::io::copy(source, &mut pipe).map(|_| ()).map_err(|e| ("stdin", e))
            }));
        }
        if let (Some(mut pipe), Some(sink)) = (stdout_pipe, cmd.stdout.as_mut()) {
            handles.push(scope.spawn(move || {
                copy_stream(&mut pipe, sink.as_mut()).map_err(|e| ("stdout", e))
            }));
        }
        if let (Some(mut pipe), Some(sink)) = (stderr_pipe, cmd.stderr.as_mut()) {
            handles.push(scope.spawn(move || {
                copy_stream(&mut pipe, sink.as_mut()).map_err(|e| ("stderr", e))
            }));
        }
        handles
            .into_iter()
            .filter_map(|h| h.join().ok().and_then(Result::err))
            .next()
    });

    let status = child.wait().map_err(|e| HostError::Exec {
        cmd: line.clone(),
        detail: e.to_string(),
    })?;

    if let Some((stream, e)) = copy_failure {
        return Err(HostError::Exec {
            cmd: line,
            detail: format!("{stream} stream: {e}"),
        });
    }

    Ok(wait_status(status))
}

/// Copy a child pipe into a caller sink in small chunks so output is
/// observable while the process runs.
fn copy_stream(pipe: &mut dyn Read, sink: &mut dyn Write) -> Result<(), std::io::Error> {
    let mut buf = [0_u8; 8192];
    loop {
        let n = pipe.read(&mut buf)?;
        if n == 0 {
            return sink.flush();
        }
        sink.write_all(buf.get(..n).unwrap_or_default())?;
    }
}
