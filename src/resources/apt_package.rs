//! Debian package resource, applied through apt as one transaction.
//!
//! `APTPackage` is a Group kind: the engine hands every instance in the
//! current state to [`apply_all`] at once, because package installation
//! must be atomic at the package-manager level (a single `apt-get install`
//! resolves the whole set together).

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::concurrency::RunContext;
use crate::error::ValidationError;
use crate::host::{Cmd, Host, run_capture, run_ok};

/// Desired (or observed) state of one Debian package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AptPackage {
    /// Package name.
    pub package: String,

    /// Architecture qualifier (`i386`, `amd64`, ...); part of the id when
    /// set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    /// Exact version to install; unset means any version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Pin the package against upgrades (`apt-mark hold`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hold: bool,

    /// The package must not be installed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub absent: bool,
}

impl AptPackage {
    /// A bare specification for `package`.
    #[must_use]
    pub fn named(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            architecture: None,
            version: None,
            hold: false,
            absent: false,
        }
    }

    /// The resource id: `package` or `package:architecture`.
    #[must_use]
    pub fn id(&self) -> String {
        self.architecture.as_ref().map_or_else(
            || self.package.clone(),
            |arch| format!("{}:{arch}", self.package),
        )
    }

    fn invalid(&self, reason: impl Into<String>) -> ValidationError {
        ValidationError::InvalidResource {
            kind: "APTPackage".to_string(),
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
        if self.package.is_empty() {
            return Err(self.invalid("package name must not be empty"));
        }
        if self
            .package
            .chars()
            .any(|c| c.is_whitespace() || c == '=' || c == ':' || c == '/')
        {
            return Err(self.invalid("package name contains a reserved character"));
        }
        if let Some(arch) = &self.architecture
            && (arch.is_empty() || arch.chars().any(char::is_whitespace))
        {
            return Err(self.invalid("architecture must be a single word"));
        }
        if let Some(version) = &self.version
            && version.is_empty()
        {
            return Err(self.invalid("version must not be empty when set"));
        }
        if self.absent && (self.hold || self.version.is_some()) {
            return Err(self.invalid("absent excludes version and hold"));
        }
        Ok(())
    }

    /// Whether `self` (a loaded state) meets every constraint in `other`.
    #[must_use]
    pub fn satisfies(&self, other: &Self) -> bool {
        if other.absent {
            return self.absent;
        }
        if self.absent {
            return false;
        }
        if let Some(version) = &other.version
            && self.version.as_ref() != Some(version)
        {
            return false;
        }
        self.hold == other.hold
    }

    /// Merge two partial specifications of the same id.
    ///
    /// Booleans merge by OR (absent false is "unspecified" in a partial
    /// document); optional fields must agree when both are set.
    ///
    /// # Errors
    ///
    /// [`ValidationError::MergeConflict`] on a disagreeing field.
    pub fn merge(&self, other: &Self) -> Result<Self, ValidationError> {
        let conflict = |field: &str| ValidationError::MergeConflict {
            kind: "APTPackage".to_string(),
            id: self.id(),
            field: field.to_string(),
        };
        if self.package != other.package {
            return Err(conflict("package"));
        }
        if self.architecture != other.architecture {
            return Err(conflict("architecture"));
        }
        let version = match (&self.version, &other.version) {
            (Some(a), Some(b)) if a != b => return Err(conflict("version")),
            (Some(a), _) => Some(a.clone()),
            (None, b) => b.clone(),
        };
        Ok(Self {
            package: self.package.clone(),
            architecture: self.architecture.clone(),
            version,
            hold: self.hold || other.hold,
            absent: self.absent || other.absent,
        })
    }
}

/// Split an id back into `(package, architecture)`.
fn split_id(id: &str) -> (String, Option<String>) {
    id.split_once(':').map_or_else(
        || (id.to_string(), None),
        |(package, arch)| (package.to_string(), Some(arch.to_string())),
    )
}

/// One parsed `dpkg-query -W` line: name, architecture, version, status.
fn parse_query_line(line: &str) -> Option<(String, String, String, String)> {
    let mut fields = line.split('\t');
    let package = fields.next()?.to_string();
    let architecture = fields.next()?.to_string();
    let version = fields.next()?.to_string();
    let status = fields.next()?.to_string();
    Some((package, architecture, version, status))
}

const QUERY_FORMAT: &str = "${Package}\\t${Architecture}\\t${Version}\\t${db:Status-Status}\\n";

/// The set of held package names on the host.
fn show_hold(host: &dyn Host, ctx: &RunContext) -> Result<BTreeSet<String>> {
    let out = run_ok(host, ctx, Cmd::new("apt-mark").arg("showhold"))
        .context("querying held packages")?;
    Ok(out.lines().map(str::to_string).collect())
}

/// Load the current state of every id in one `dpkg-query` batch.
///
/// The result preserves the order of `ids`; an id that is not installed
/// (or only has leftover config files) loads as `absent`.
///
/// # Errors
///
/// Fails when the query cannot run at all; unknown packages are state, not
/// errors (`dpkg-query` exits 1 for those).
pub fn load_all(host: &dyn Host, ctx: &RunContext, ids: &[String]) -> Result<Vec<AptPackage>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    ctx.check_cancelled()?;

    let cmd = Cmd::new("dpkg-query")
        .args(["-W", "-f", QUERY_FORMAT])
        .args(ids.iter().cloned());
    let line = cmd.command_line();
    let (status, stdout, stderr) = run_capture(host, ctx, cmd)?;
    // Exit 1 just flags ids with no dpkg record; anything else is a real
    // failure (127 for a missing dpkg-query, say).
    if !status.success() && !(status.exited && status.exit_code == 1) {
        anyhow::bail!("'{line}' failed ({status}): {}", stderr.trim());
    }

    let mut installed: HashMap<String, (String, String)> = HashMap::new();
    for query_line in stdout.lines() {
        if let Some((package, architecture, version, state)) = parse_query_line(query_line)
            && state == "installed"
        {
            installed.insert(package.clone(), (architecture.clone(), version.clone()));
            installed.insert(format!("{package}:{architecture}"), (architecture, version));
        }
    }

    let holds = show_hold(host, ctx)?;

    Ok(ids
        .iter()
        .map(|id| {
            let (package, architecture) = split_id(id);
            installed.get(id).map_or_else(
                || AptPackage {
                    package: package.clone(),
                    architecture: architecture.clone(),
                    version: None,
                    hold: false,
                    absent: true,
                },
                |(_, version)| AptPackage {
                    package: package.clone(),
                    architecture: architecture.clone(),
                    version: Some(version.clone()),
                    hold: holds.contains(&package) || holds.contains(id),
                    absent: false,
                },
            )
        })
        .collect())
}

/// Apply every member in one apt transaction, then converge hold marks.
///
/// The install command pins versions with `pkg=version` and removes absent
/// members with the `pkg-` suffix, so the whole set is resolved together.
/// Idempotent with respect to [`AptPackage::satisfies`]: apt treats
/// already-satisfied entries as no-ops, and hold marks are only touched
/// when they differ.
///
/// # Errors
///
/// Fails when apt or apt-mark report failure.
pub fn apply_all(host: &dyn Host, ctx: &RunContext, packages: &[&AptPackage]) -> Result<()> {
    assert!(!packages.is_empty(), "apt apply with no members");
    ctx.check_cancelled()?;

    let specs: Vec<String> = packages
        .iter()
        .map(|p| {
            if p.absent {
                format!("{}-", p.id())
            } else {
                p.version
                    .as_ref()
                    .map_or_else(|| p.id(), |version| format!("{}={version}", p.id()))
            }
        })
        .collect();

    run_ok(
        host,
        ctx,
        Cmd::new("apt-get")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .args(["--yes", "--allow-downgrades", "install"])
            .args(specs),
    )
    .context("apt install transaction")?;

    let held = show_hold(host, ctx)?;
    let want_hold: Vec<String> = packages
        .iter()
        .filter(|p| p.hold && !p.absent && !held.contains(&p.package))
        .map(|p| p.package.clone())
        .collect();
    let want_unhold: Vec<String> = packages
        .iter()
        .filter(|p| !p.hold && !p.absent && held.contains(&p.package))
        .map(|p| p.package.clone())
        .collect();

    if !want_hold.is_empty() {
        run_ok(host, ctx, Cmd::new("apt-mark").arg("hold").args(want_hold))
            .context("holding packages")?;
    }
    if !want_unhold.is_empty() {
        run_ok(host, ctx, Cmd::new("apt-mark").arg("unhold").args(want_unhold))
            .context("unholding packages")?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::host::memory::{CmdResponse, MemoryHost};

    fn ctx() -> RunContext {
        RunContext::new()
    }

    // -----------------------------------------------------------------------
    // Ids and validation
    // -----------------------------------------------------------------------

    #[test]
    fn id_includes_architecture_when_set() {
        assert_eq!(AptPackage::named("vim").id(), "vim");
        let wine = AptPackage {
            architecture: Some("i386".to_string()),
            ..AptPackage::named("wine")
        };
        assert_eq!(wine.id(), "wine:i386");
    }

    #[test]
    fn validate_rejects_empty_and_reserved_names() {
        assert!(AptPackage::named("").validate().is_err());
        assert!(AptPackage::named("vim=9").validate().is_err());
        assert!(AptPackage::named("vim core").validate().is_err());
        assert!(AptPackage::named("vim").validate().is_ok());
    }

    #[test]
    fn validate_rejects_absent_with_version_or_hold() {
        let p = AptPackage {
            absent: true,
            version: Some("1".to_string()),
            ..AptPackage::named("vim")
        };
        assert!(p.validate().is_err());
        let p = AptPackage {
            absent: true,
            hold: true,
            ..AptPackage::named("vim")
        };
        assert!(p.validate().is_err());
    }

    // -----------------------------------------------------------------------
    // satisfies
    // -----------------------------------------------------------------------

    fn installed(version: &str, hold: bool) -> AptPackage {
        AptPackage {
            version: Some(version.to_string()),
            hold,
            ..AptPackage::named("vim")
        }
    }

    #[test]
    fn satisfies_unversioned_target_accepts_any_version() {
        let target = AptPackage::named("vim");
        assert!(installed("9.1", false).satisfies(&target));
        assert!(installed("8.2", false).satisfies(&target));
    }

    #[test]
    fn satisfies_versioned_target_requires_exact_version() {
        let target = installed("9.1", false);
        assert!(installed("9.1", false).satisfies(&target));
        assert!(!installed("8.2", false).satisfies(&target));
    }

    #[test]
    fn satisfies_hold_must_match() {
        let target = installed("9.1", true);
        assert!(!installed("9.1", false).satisfies(&target));
        assert!(installed("9.1", true).satisfies(&target));
    }

    #[test]
    fn satisfies_absent() {
        let gone = AptPackage {
            absent: true,
            ..AptPackage::named("vim")
        };
        assert!(gone.satisfies(&gone));
        assert!(!installed("9.1", false).satisfies(&gone));
        assert!(!gone.satisfies(&AptPackage::named("vim")));
    }

    // -----------------------------------------------------------------------
    // merge
    // -----------------------------------------------------------------------

    #[test]
    fn merge_takes_set_fields_and_ors_flags() {
        let a = AptPackage::named("vim");
        let b = AptPackage {
            version: Some("9.1".to_string()),
            hold: true,
            ..AptPackage::named("vim")
        };
        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.version.as_deref(), Some("9.1"));
        assert!(merged.hold);
    }

    #[test]
    fn merge_conflicting_versions_fails() {
        let a = installed("9.1", false);
        let b = installed("8.2", false);
        let err = a.merge(&b).unwrap_err();
        assert!(err.to_string().contains("version"), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // load_all
    // -----------------------------------------------------------------------

    fn host_with_query(stdout: &str, holds: &str) -> MemoryHost {
        let host = MemoryHost::new();
        host.on_command("dpkg-query", vec![CmdResponse::ok(stdout)]);
        host.on_command("apt-mark showhold", vec![CmdResponse::ok(holds)]);
        host
    }

    #[test]
    fn load_all_parses_installed_packages() {
        let host = host_with_query("vim\tamd64\t9.1\tinstalled\n", "");
        let loaded = load_all(&host, &ctx(), &["vim".to_string()]).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].version.as_deref(), Some("9.1"));
        assert!(!loaded[0].absent);
        assert!(!loaded[0].hold);
    }

    #[test]
    fn load_all_marks_held_packages() {
        let host = host_with_query("vim\tamd64\t9.1\tinstalled\n", "vim\n");
        let loaded = load_all(&host, &ctx(), &["vim".to_string()]).unwrap();
        assert!(loaded[0].hold);
    }

    #[test]
    fn load_all_missing_package_is_absent() {
        let host = MemoryHost::new();
        host.on_command(
            "dpkg-query",
            vec![CmdResponse {
                stdout: String::new(),
                stderr: "dpkg-query: no packages found matching ghost\n".to_string(),
                exit_code: 1,
            }],
        );
        host.on_command("apt-mark showhold", vec![CmdResponse::ok("")]);
        let loaded = load_all(&host, &ctx(), &["ghost".to_string()]).unwrap();
        assert!(loaded[0].absent);
    }

    #[test]
    fn load_all_config_files_state_is_absent() {
        let host = host_with_query("vim\tamd64\t9.1\tconfig-files\n", "");
        let loaded = load_all(&host, &ctx(), &["vim".to_string()]).unwrap();
        assert!(loaded[0].absent);
    }

    #[test]
    fn load_all_resolves_arch_qualified_ids() {
        let host = host_with_query("wine\ti386\t8.0\tinstalled\n", "");
        let loaded = load_all(&host, &ctx(), &["wine:i386".to_string()]).unwrap();
        assert_eq!(loaded[0].architecture.as_deref(), Some("i386"));
        assert_eq!(loaded[0].version.as_deref(), Some("8.0"));
    }

    #[test]
    fn load_all_preserves_id_order() {
        let host = host_with_query(
            "vim\tamd64\t9.1\tinstalled\ngit\tamd64\t2.39\tinstalled\n",
            "",
        );
        let loaded = load_all(
            &host,
            &ctx(),
            &["git".to_string(), "ghost".to_string(), "vim".to_string()],
        )
        .unwrap();
        assert_eq!(loaded[0].package, "git");
        assert!(loaded[1].absent);
        assert_eq!(loaded[2].package, "vim");
    }

    #[test]
    fn load_all_fails_when_dpkg_query_missing() {
        let host = MemoryHost::new();
        // No rules registered: every command is exit 127.
        let err = load_all(&host, &ctx(), &["vim".to_string()]).unwrap_err();
        assert!(err.to_string().contains("exit 127"), "got: {err}");
    }

    #[test]
    fn load_all_empty_ids_runs_nothing() {
        let host = MemoryHost::new();
        let loaded = load_all(&host, &ctx(), &[]).unwrap();
        assert!(loaded.is_empty());
        assert!(host.operations().is_empty());
    }

    // -----------------------------------------------------------------------
    // apply_all
    // -----------------------------------------------------------------------

    #[test]
    fn apply_all_builds_one_pinned_transaction() {
        let host = MemoryHost::new();
        host.on_command("apt-get", vec![CmdResponse::ok("")]);
        host.on_command("apt-mark showhold", vec![CmdResponse::ok("")]);
        host.on_command("apt-mark hold", vec![CmdResponse::ok("")]);

        let vim = AptPackage {
            version: Some("9.1".to_string()),
            hold: true,
            ..AptPackage::named("vim")
        };
        let stale = AptPackage {
            absent: true,
            ..AptPackage::named("stale")
        };
        apply_all(&host, &ctx(), &[&vim, &stale]).unwrap();

        let ops = host.operations();
        let install = ops
            .iter()
            .find(|op| op.contains("apt-get"))
            .expect("apt-get invocation");
        assert!(install.contains("vim=9.1"), "got: {install}");
        assert!(install.contains("stale-"), "got: {install}");
        let hold = ops
            .iter()
            .find(|op| op.contains("apt-mark hold"))
            .expect("apt-mark hold invocation");
        assert!(hold.contains("vim"), "got: {hold}");
    }

    #[test]
    fn apply_all_skips_hold_when_already_held() {
        let host = MemoryHost::new();
        host.on_command("apt-get", vec![CmdResponse::ok("")]);
        host.on_command("apt-mark showhold", vec![CmdResponse::ok("vim\n")]);

        let vim = AptPackage {
            hold: true,
            ..AptPackage::named("vim")
        };
        apply_all(&host, &ctx(), &[&vim]).unwrap();

        assert!(
            !host.operations().iter().any(|op| op.contains("apt-mark hold")),
            "hold must not be re-issued: {:?}",
            host.operations()
        );
    }

    #[test]
    fn apply_all_unholds_when_target_is_unpinned() {
        let host = MemoryHost::new();
        host.on_command("apt-get", vec![CmdResponse::ok("")]);
        host.on_command("apt-mark showhold", vec![CmdResponse::ok("vim\n")]);
        host.on_command("apt-mark unhold", vec![CmdResponse::ok("")]);

        let vim = AptPackage::named("vim");
        apply_all(&host, &ctx(), &[&vim]).unwrap();

        assert!(
            host.operations().iter().any(|op| op.contains("apt-mark unhold vim")),
            "got: {:?}",
            host.operations()
        );
    }

    #[test]
    fn apply_all_propagates_apt_failure() {
        let host = MemoryHost::new();
        host.on_command(
            "apt-get",
            vec![CmdResponse::fail(100, "E: Unable to locate package ghost")],
        );
        let ghost = AptPackage::named("ghost");
        let err = apply_all(&host, &ctx(), &[&ghost]).unwrap_err();
        assert!(err.to_string().contains("apt install"), "got: {err}");
    }
}
