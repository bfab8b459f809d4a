// Shared helpers for integration tests.
//
// Builds in-memory hosts with canned package-manager behaviour so the
// engine and discovery flows can run end to end without a disposable
// machine. Used by test binaries that declare `mod common;`.
#![allow(dead_code)]

use hostconf_cli::concurrency::RunContext;
use hostconf_cli::host::memory::{CmdResponse, MemoryHost};
use hostconf_cli::resources::{AptPackage, File, Resource};
use hostconf_cli::state::State;

/// A run context with a small limiter, as commands would build.
pub fn ctx() -> RunContext {
    RunContext::new().with_limit(4)
}

/// A `dpkg-query -W` line for an installed package.
pub fn installed_line(package: &str, arch: &str, version: &str) -> String {
    format!("{package}\t{arch}\t{version}\tinstalled\n")
}

/// An exit-1 `dpkg-query` response for packages with no dpkg record.
pub fn not_installed() -> CmdResponse {
    CmdResponse {
        stdout: String::new(),
        stderr: "dpkg-query: no packages found\n".to_string(),
        exit_code: 1,
    }
}

/// Host whose package tooling exists but reports nothing installed and
/// nothing held; `apt-get`/`apt-mark` mutations succeed silently.
pub fn host_with_apt() -> MemoryHost {
    let host = MemoryHost::new();
    host.add_dir("/etc");
    host.on_command("dpkg-query", vec![not_installed()]);
    host.on_command("apt-mark showhold", vec![CmdResponse::ok("")]);
    host.on_command("apt-mark hold", vec![CmdResponse::ok("")]);
    host.on_command("apt-mark unhold", vec![CmdResponse::ok("")]);
    host.on_command("apt-get", vec![CmdResponse::ok("")]);
    host
}

/// Target state with a single package resource.
pub fn package_target(package: AptPackage) -> State {
    let mut state = State::new();
    state
        .append(Resource::AptPackage(package))
        .expect("single package cannot collide");
    state
}

/// Target state with a single regular-file resource.
pub fn file_target(path: &str, content: &str) -> State {
    let mut state = State::new();
    state
        .append(Resource::File(File {
            regular_file: Some(content.to_string()),
            ..File::at(path)
        }))
        .expect("single file cannot collide");
    state
}
