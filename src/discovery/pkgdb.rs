//! Package database: dpkg metadata joined into a path→owners index.
//!
//! Construction order matters: diversions load first so that every path
//! from the package file lists is rewritten to its effective on-disk
//! location before insertion into the index. Three overlays follow:
//! verify (parallel, one dpkg invocation per package under the shared
//! limiter), manual marks, hold marks. Each subprocess is streamed through
//! an OS pipe: a worker runs the process and reports its outcome over a
//! channel while the parser consumes the pipe to EOF; both failure modes
//! are surfaced together.
//!
//! After construction the indices are frozen; only the per-package
//! attribution lists stay mutable, serialized by each package's own mutex.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use regex::Regex;

use crate::concurrency::{RunContext, join_errors, run_all};
use crate::host::{Cmd, Host, SharedBuf};

/// One installed package with its ownership and attribution data.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Package {
    /// Qualified name, `package:architecture`.
    pub name: String,
    /// Installed version.
    pub version: String,
    /// Source package name (defaults to the binary package name).
    pub source_package: String,
    /// Paths owned by the package, after diversion rewriting.
    pub paths: Vec<PathBuf>,
    /// Conffile paths (hash suffixes stripped).
    pub conffiles: Vec<PathBuf>,
    /// Marked as manually installed.
    pub manual: bool,
    /// Held against upgrades.
    pub hold: bool,
    /// Owned symlinks whose targets do not exist (populated by discovery).
    pub broken_symlinks: Vec<PathBuf>,
    /// Paths attributed to this package by unique-ancestor inference.
    pub inferred_paths: Vec<PathBuf>,
    /// Owned paths dpkg reports as missing from disk.
    pub missing_paths: Vec<PathBuf>,
    /// Owned paths whose digest no longer matches the package database.
    pub digest_check_failed_paths: Vec<PathBuf>,
}

impl Package {
    /// The unqualified package name (architecture stripped).
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }

    /// The architecture component of the name, when present.
    #[must_use]
    pub fn architecture(&self) -> Option<&str> {
        self.name.split_once(':').map(|(_, arch)| arch)
    }
}

/// A package shared across discovery workers; writes lock, post-overlay
/// reads lock briefly and never contend.
pub type SharedPackage = Arc<Mutex<Package>>;

/// The frozen package database.
#[derive(Debug, Default)]
pub struct PackageDb {
    packages: HashMap<String, SharedPackage>,
    path_index: HashMap<PathBuf, Vec<String>>,
    diversions: HashMap<PathBuf, PathBuf>,
}

// ---------------------------------------------------------------------------
// Subprocess streaming
// ---------------------------------------------------------------------------

/// Run `cmd` on the host, streaming its stdout into `parse`.
///
/// The process is driven by a worker thread that reports the wait outcome
/// over a channel; the calling thread parses the pipe until EOF, so it can
/// never block waiting on the process after output ends. Parse and wait
/// errors are both surfaced. Exit codes above `max_exit` fail the call
/// (some dpkg tools exit 1 to flag findings, not failure).
fn stream_command<T>(
    host: &dyn Host,
    ctx: &RunContext,
    cmd: Cmd,
    max_exit: u32,
    parse: impl FnOnce(&mut dyn BufRead) -> Result<T>,
) -> Result<T> {
    let line = cmd.command_line();
    let (reader, writer) = std::io::pipe().context("creating stdout pipe")?;
    let stderr = SharedBuf::new();
    let cmd = cmd
        .stdout(Box::new(writer))
        .stderr(Box::new(stderr.clone()));

    let (tx, rx) = mpsc::channel();
    let parsed = std::thread::scope(|scope| {
        scope.spawn(move || {
            // Cmd (and with it the pipe writer) drops when run returns,
            // closing the stream so the parser sees EOF.
            let outcome = host.run(ctx, cmd);
            let _ = tx.send(outcome);
        });
        let mut buffered = BufReader::new(reader);
        parse(&mut buffered)
    });
    let outcome = rx
        .recv()
        .context("worker vanished without reporting an outcome")?;

    match (outcome, parsed) {
        (Err(run_err), Err(parse_err)) => {
            anyhow::bail!("'{line}': {run_err}; while parsing its output: {parse_err:#}")
        }
        (Err(run_err), Ok(_)) => Err(run_err).with_context(|| format!("running '{line}'")),
        (Ok(_), Err(parse_err)) => {
            Err(parse_err).with_context(|| format!("parsing output of '{line}'"))
        }
        (Ok(status), Ok(value)) => {
            if !status.success() && !(status.exited && status.exit_code <= max_exit) {
                anyhow::bail!(
                    "'{line}' failed ({status}): {}",
                    stderr.into_string().trim()
                );
            }
            Ok(value)
        }
    }
}

/// Collect every line of a streamed command.
fn stream_lines(host: &dyn Host, ctx: &RunContext, cmd: Cmd, max_exit: u32) -> Result<Vec<String>> {
    stream_command(host, ctx, cmd, max_exit, |reader| {
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line.context("reading command output")?;
            if !line.is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    })
}

// ---------------------------------------------------------------------------
// Record parsing (dpkg-query --show)
// ---------------------------------------------------------------------------

/// Record separator emitted by the show format string.
const SENTINEL: &str = "---";

/// The dpkg-query format producing one sentinel-delimited record per
/// package, with multi-line blocks indented by one space.
const SHOW_FORMAT: &str = "Package: ${Package}\\nArchitecture: ${Architecture}\\nVersion: ${Version}\\nsource:Package: ${source:Package}\\nConffiles:\\n${Conffiles}\\ndb-fsys:Files:\\n${db-fsys:Files}\\n---\\n";

/// Keys whose values continue over indented lines, each with its own line
/// cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultiKey {
    Conffiles,
    Files,
}

impl MultiKey {
    /// Clean one continuation line into a path, `None` for noise lines.
    fn value(self, line: &str) -> Option<PathBuf> {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return None;
        }
        match self {
            // " <path> <hash>"; the hash (and an optional "obsolete"
            // marker) trail the path.
            Self::Conffiles => {
                let path = trimmed
                    .rsplit_once(' ')
                    .map_or(trimmed, |(rest, last)| {
                        if last == "obsolete" {
                            rest.rsplit_once(' ').map_or(rest, |(path, _)| path)
                        } else {
                            rest
                        }
                    });
                Some(normalize_path(path))
            }
            Self::Files => {
                if trimmed == "/." {
                    return None;
                }
                Some(normalize_path(trimmed))
            }
        }
    }
}

/// Normalize dpkg path spellings (`/./` segments, duplicate slashes).
fn normalize_path(raw: &str) -> PathBuf {
    let mut out = String::with_capacity(raw.len());
    for segment in raw.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    PathBuf::from(out)
}

#[derive(Debug, Default)]
struct RecordBuilder {
    package: String,
    architecture: String,
    version: String,
    source_package: String,
    conffiles: Vec<PathBuf>,
    files: Vec<PathBuf>,
}

impl RecordBuilder {
    fn is_empty(&self) -> bool {
        self.package.is_empty()
    }

    fn finish(self, diversions: &HashMap<PathBuf, PathBuf>) -> Result<Package> {
        if self.package.is_empty() {
            anyhow::bail!("show record without a Package key");
        }
        let name = if self.architecture.is_empty() {
            self.package.clone()
        } else {
            format!("{}:{}", self.package, self.architecture)
        };
        let source_package = if self.source_package.is_empty() {
            self.package.clone()
        } else {
            // "src (version)" forms reduce to the bare name.
            self.source_package
                .split_whitespace()
                .next()
                .unwrap_or(&self.source_package)
                .to_string()
        };
        let divert = |path: PathBuf| diversions.get(&path).cloned().unwrap_or(path);
        Ok(Package {
            name,
            version: self.version,
            source_package,
            paths: self.files.into_iter().map(divert).collect(),
            conffiles: self.conffiles.into_iter().map(divert).collect(),
            ..Package::default()
        })
    }
}

/// Parse the sentinel-delimited record stream into packages.
fn parse_show_stream(
    reader: &mut dyn BufRead,
    diversions: &HashMap<PathBuf, PathBuf>,
) -> Result<Vec<Package>> {
    let mut packages = Vec::new();
    let mut record = RecordBuilder::default();
    let mut multi: Option<MultiKey> = None;

    for line in reader.lines() {
        let line = line.context("reading show output")?;
        if line == SENTINEL {
            if !record.is_empty() {
                packages.push(std::mem::take(&mut record).finish(diversions)?);
            }
            record = RecordBuilder::default();
            multi = None;
            continue;
        }
        if line.starts_with(' ') {
            // Indented continuation of the most recent multi-line key.
            if let Some(key) = multi
                && let Some(path) = key.value(&line)
            {
                match key {
                    MultiKey::Conffiles => record.conffiles.push(path),
                    MultiKey::Files => record.files.push(path),
                }
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("Package: ") {
            record.package = value.to_string();
            multi = None;
        } else if let Some(value) = line.strip_prefix("Architecture: ") {
            record.architecture = value.to_string();
            multi = None;
        } else if let Some(value) = line.strip_prefix("Version: ") {
            record.version = value.to_string();
            multi = None;
        } else if let Some(value) = line.strip_prefix("source:Package: ") {
            record.source_package = value.to_string();
            multi = None;
        } else if line == "Conffiles:" {
            multi = Some(MultiKey::Conffiles);
        } else if line == "db-fsys:Files:" {
            multi = Some(MultiKey::Files);
        } else if !line.is_empty() {
            anyhow::bail!("unrecognized show line: {line:?}");
        }
    }
    if !record.is_empty() {
        packages.push(record.finish(diversions)?);
    }
    Ok(packages)
}

// ---------------------------------------------------------------------------
// Overlays
// ---------------------------------------------------------------------------

/// `dpkg-divert --list` line forms.
fn diversion_regexes() -> (Regex, Regex) {
    #[allow(clippy::expect_used)]
    let local = Regex::new(r"^local diversion of (.+) to (.+)$")
        .expect("static diversion regex");
    #[allow(clippy::expect_used)]
    let package = Regex::new(r"^diversion of (.+) to (.+) by (.+)$")
        .expect("static diversion regex");
    (local, package)
}

fn parse_diversions(lines: &[String]) -> Result<HashMap<PathBuf, PathBuf>> {
    let (local, package) = diversion_regexes();
    let mut diversions = HashMap::new();
    for line in lines {
        let captures = local.captures(line).or_else(|| package.captures(line));
        let Some(captures) = captures else {
            anyhow::bail!("unrecognized diversion line: {line:?}");
        };
        let (Some(from), Some(to)) = (captures.get(1), captures.get(2)) else {
            anyhow::bail!("unrecognized diversion line: {line:?}");
        };
        diversions.insert(PathBuf::from(from.as_str()), PathBuf::from(to.as_str()));
    }
    Ok(diversions)
}

/// `dpkg --verify` line format: a status column, a conffile marker, and
/// the path.
const VERIFY_PATTERN: &str = r"^(missing  |\?\?([?.5])\?\?\?\?\?\?) ([c ]) (.+)$";

#[derive(Debug, PartialEq, Eq)]
enum VerifyFinding {
    Missing(PathBuf),
    DigestFailed(PathBuf),
    Other,
}

fn parse_verify_line(regex: &Regex, line: &str) -> Result<VerifyFinding> {
    let captures = regex
        .captures(line)
        .ok_or_else(|| anyhow::anyhow!("unrecognized verify line: {line:?}"))?;
    let path = captures
        .get(4)
        .map(|m| PathBuf::from(m.as_str()))
        .ok_or_else(|| anyhow::anyhow!("unrecognized verify line: {line:?}"))?;
    if captures.get(1).is_some_and(|m| m.as_str() == "missing  ") {
        return Ok(VerifyFinding::Missing(path));
    }
    if captures.get(2).is_some_and(|m| m.as_str() == "5") {
        return Ok(VerifyFinding::DigestFailed(path));
    }
    Ok(VerifyFinding::Other)
}

/// Run `dpkg --verify` for one package and record its findings.
fn verify_package(
    host: &dyn Host,
    ctx: &RunContext,
    regex: &Regex,
    package: &SharedPackage,
) -> Result<()> {
    let name = package.lock().name.clone();
    // Exit 1 means findings were printed, not that the tool failed.
    let lines = stream_lines(
        host,
        ctx,
        Cmd::new("dpkg").arg("--verify").arg(name.clone()),
        1,
    )
    .with_context(|| format!("verifying {name}"))?;

    for line in &lines {
        match parse_verify_line(regex, line)? {
            VerifyFinding::Missing(path) => {
                let mut package = package.lock();
                package.missing_paths.push(path);
            }
            VerifyFinding::DigestFailed(path) => {
                let mut package = package.lock();
                package.digest_check_failed_paths.push(path);
            }
            VerifyFinding::Other => {}
        }
    }
    Ok(())
}

impl PackageDb {
    /// Build the database from the host's package manager.
    ///
    /// Pipeline: diversions, then the show stream (paths rewritten through
    /// diversions on insertion), then the verify / manual / hold overlays.
    /// Verification fans out one task per package under the shared limiter.
    ///
    /// # Errors
    ///
    /// Any subprocess, parse, or wait failure; parallel verify failures
    /// are all collected and joined.
    pub fn load(host: &dyn Host, ctx: &RunContext) -> Result<Self> {
        ctx.check_cancelled()?;

        let diversion_lines = stream_lines(
            host,
            ctx,
            Cmd::new("dpkg-divert").args(["--list"]),
            0,
        )
        .context("listing diversions")?;
        let diversions = parse_diversions(&diversion_lines)?;
        tracing::debug!(count = diversions.len(), "diversions loaded");

        let parsed = stream_command(
            host,
            ctx,
            Cmd::new("dpkg-query").args(["--show", "--showformat", SHOW_FORMAT]),
            0,
            |reader| parse_show_stream(reader, &diversions),
        )
        .context("listing installed packages")?;
        tracing::debug!(count = parsed.len(), "packages parsed");

        let mut packages: HashMap<String, SharedPackage> = HashMap::new();
        let mut path_index: HashMap<PathBuf, Vec<String>> = HashMap::new();
        for package in parsed {
            for path in &package.paths {
                let owners = path_index.entry(path.clone()).or_default();
                if !owners.contains(&package.name) {
                    owners.push(package.name.clone());
                }
            }
            packages.insert(package.name.clone(), Arc::new(Mutex::new(package)));
        }

        let db = Self {
            packages,
            path_index,
            diversions,
        };
        db.overlay_verify(host, ctx)?;
        db.overlay_mark(host, ctx, "showmanual", |package| package.manual = true)?;
        db.overlay_mark(host, ctx, "showhold", |package| package.hold = true)?;
        Ok(db)
    }

    fn overlay_verify(&self, host: &dyn Host, ctx: &RunContext) -> Result<()> {
        #[allow(clippy::expect_used)]
        let regex = Regex::new(VERIFY_PATTERN).expect("static verify regex");
        let tasks: Vec<_> = self
            .packages
            .values()
            .map(|package| {
                let package = Arc::clone(package);
                let regex = &regex;
                move || verify_package(host, ctx, regex, &package)
            })
            .collect();
        join_errors(run_all(ctx, tasks)).context("verify overlay")?;
        Ok(())
    }

    /// Apply an `apt-mark` listing to every named package.
    fn overlay_mark(
        &self,
        host: &dyn Host,
        ctx: &RunContext,
        subcommand: &str,
        mark: impl Fn(&mut Package),
    ) -> Result<()> {
        let lines = stream_lines(host, ctx, Cmd::new("apt-mark").arg(subcommand), 0)
            .with_context(|| format!("apt-mark {subcommand}"))?;
        for name in &lines {
            for package in self.packages.values() {
                let mut package = package.lock();
                if &package.name == name || package.short_name() == name {
                    mark(&mut package);
                }
            }
        }
        Ok(())
    }

    /// The owners of `path`, empty when unowned.
    #[must_use]
    pub fn path_to_packages(&self, path: &Path) -> &[String] {
        self.path_index
            .get(path)
            .map_or(&[], Vec::as_slice)
    }

    /// Look up a package by qualified name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SharedPackage> {
        self.packages.get(name)
    }

    /// All packages, unordered.
    pub fn packages(&self) -> impl Iterator<Item = &SharedPackage> {
        self.packages.values()
    }

    /// The effective location of a diverted path, if a diversion applies.
    #[must_use]
    pub fn divert(&self, path: &Path) -> Option<&PathBuf> {
        self.diversions.get(path)
    }

    /// Number of packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Whether the database holds no packages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Build a database from parts (discovery tests).
    #[cfg(test)]
    pub(crate) fn from_parts(
        packages: Vec<Package>,
        diversions: HashMap<PathBuf, PathBuf>,
    ) -> Self {
        let mut map = HashMap::new();
        let mut path_index: HashMap<PathBuf, Vec<String>> = HashMap::new();
        for package in packages {
            for path in &package.paths {
                let owners = path_index.entry(path.clone()).or_default();
                if !owners.contains(&package.name) {
                    owners.push(package.name.clone());
                }
            }
            map.insert(package.name.clone(), Arc::new(Mutex::new(package)));
        }
        Self {
            packages: map,
            path_index,
            diversions,
        }
    }
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
    // Show record parsing
    // -----------------------------------------------------------------------

    const SHOW_OUTPUT: &str = "\
Package: vim
Architecture: amd64
Version: 2:9.1.0-1
source:Package: vim
Conffiles:
 /etc/vim/vimrc 0123456789abcdef0123456789abcdef
db-fsys:Files:
 /.
 /usr/bin/vim
 /usr/share/vim/vimrc
---
Package: libwine
Architecture: i386
Version: 8.0-1
source:Package: wine
Conffiles:
db-fsys:Files:
 /usr/lib/wine/wine.so
---
";

    fn parse_show(text: &str, diversions: &HashMap<PathBuf, PathBuf>) -> Vec<Package> {
        let mut reader = std::io::Cursor::new(text.as_bytes().to_vec());
        parse_show_stream(&mut reader, diversions).unwrap()
    }

    #[test]
    fn show_parser_splits_records_on_sentinel() {
        let packages = parse_show(SHOW_OUTPUT, &HashMap::new());
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "vim:amd64");
        assert_eq!(packages[1].name, "libwine:i386");
    }

    #[test]
    fn show_parser_collects_indented_file_lists() {
        let packages = parse_show(SHOW_OUTPUT, &HashMap::new());
        assert_eq!(
            packages[0].paths,
            vec![
                PathBuf::from("/usr/bin/vim"),
                PathBuf::from("/usr/share/vim/vimrc")
            ],
            "the /. line is noise, not a path"
        );
    }

    #[test]
    fn show_parser_strips_conffile_hashes() {
        let packages = parse_show(SHOW_OUTPUT, &HashMap::new());
        assert_eq!(packages[0].conffiles, vec![PathBuf::from("/etc/vim/vimrc")]);
    }

    #[test]
    fn show_parser_takes_source_package() {
        let packages = parse_show(SHOW_OUTPUT, &HashMap::new());
        assert_eq!(packages[0].source_package, "vim");
        assert_eq!(packages[1].source_package, "wine");
    }

    #[test]
    fn show_parser_defaults_source_to_binary_name() {
        let text = "\
Package: standalone
Architecture: amd64
Version: 1.0
source:Package:
Conffiles:
db-fsys:Files:
 /usr/bin/standalone
---
";
        let packages = parse_show(text, &HashMap::new());
        assert_eq!(packages[0].source_package, "standalone");
    }

    #[test]
    fn show_parser_rejects_garbage_lines() {
        let mut reader = std::io::Cursor::new(b"Bogus line here\n".to_vec());
        assert!(parse_show_stream(&mut reader, &HashMap::new()).is_err());
    }

    #[test]
    fn conffile_obsolete_marker_is_stripped() {
        let line = " /etc/old.conf 0123456789abcdef0123456789abcdef obsolete";
        assert_eq!(
            MultiKey::Conffiles.value(line),
            Some(PathBuf::from("/etc/old.conf"))
        );
    }

    #[test]
    fn normalize_path_collapses_dot_segments() {
        assert_eq!(normalize_path("/usr/./bin//vim"), PathBuf::from("/usr/bin/vim"));
        assert_eq!(normalize_path("/."), PathBuf::from("/"));
    }

    // -----------------------------------------------------------------------
    // Diversions (P5)
    // -----------------------------------------------------------------------

    #[test]
    fn diversion_lines_parse_both_forms() {
        let lines = vec![
            "local diversion of /usr/bin/vim to /usr/bin/vim.distrib".to_string(),
            "diversion of /usr/share/man/vim.1 to /usr/share/man/vim.1.orig by vim-tiny"
                .to_string(),
        ];
        let diversions = parse_diversions(&lines).unwrap();
        assert_eq!(
            diversions.get(Path::new("/usr/bin/vim")),
            Some(&PathBuf::from("/usr/bin/vim.distrib"))
        );
        assert_eq!(
            diversions.get(Path::new("/usr/share/man/vim.1")),
            Some(&PathBuf::from("/usr/share/man/vim.1.orig"))
        );
    }

    #[test]
    fn diversion_garbage_is_rejected() {
        let lines = vec!["something unexpected".to_string()];
        assert!(parse_diversions(&lines).is_err());
    }

    #[test]
    fn diverted_paths_index_under_effective_location() {
        let diversions = HashMap::from([(
            PathBuf::from("/usr/bin/vim"),
            PathBuf::from("/usr/bin/vim.distrib"),
        )]);
        let packages = parse_show(SHOW_OUTPUT, &diversions);
        let db = PackageDb::from_parts(packages, diversions);

        // The divert-to location owns the file; the original never does.
        assert_eq!(
            db.path_to_packages(Path::new("/usr/bin/vim.distrib")),
            ["vim:amd64"]
        );
        assert!(db.path_to_packages(Path::new("/usr/bin/vim")).is_empty());
    }

    // -----------------------------------------------------------------------
    // Verify line parsing
    // -----------------------------------------------------------------------

    fn verify_regex() -> Regex {
        Regex::new(VERIFY_PATTERN).unwrap()
    }

    #[test]
    fn verify_missing_line() {
        let finding =
            parse_verify_line(&verify_regex(), "missing     /usr/share/vim/doc.txt").unwrap();
        assert_eq!(
            finding,
            VerifyFinding::Missing(PathBuf::from("/usr/share/vim/doc.txt"))
        );
    }

    #[test]
    fn verify_digest_failure_line() {
        let finding =
            parse_verify_line(&verify_regex(), "??5??????? c /etc/vim/vimrc");
        // The conffile marker column is separated by a single space.
        let finding2 =
            parse_verify_line(&verify_regex(), "??5?????? c /etc/vim/vimrc").unwrap();
        assert_eq!(
            finding2,
            VerifyFinding::DigestFailed(PathBuf::from("/etc/vim/vimrc"))
        );
        assert!(finding.is_err(), "ten-column status must not match");
    }

    #[test]
    fn verify_unknown_status_is_other() {
        let finding = parse_verify_line(&verify_regex(), "??.??????   /usr/bin/vim").unwrap();
        assert_eq!(finding, VerifyFinding::Other);
    }

    #[test]
    fn verify_garbage_is_an_error() {
        assert!(parse_verify_line(&verify_regex(), "not a verify line").is_err());
    }

    // -----------------------------------------------------------------------
    // Full load over a canned host
    // -----------------------------------------------------------------------

    fn canned_host() -> MemoryHost {
        let host = MemoryHost::new();
        host.on_command("dpkg-divert --list", vec![CmdResponse::ok("")]);
        host.on_command("dpkg-query --show", vec![CmdResponse::ok(SHOW_OUTPUT)]);
        host.on_command(
            "dpkg --verify vim:amd64",
            vec![CmdResponse {
                stdout: "missing     /usr/share/vim/vimrc\n??5?????? c /etc/vim/vimrc\n"
                    .to_string(),
                stderr: String::new(),
                exit_code: 1,
            }],
        );
        host.on_command("dpkg --verify", vec![CmdResponse::ok("")]);
        host.on_command("apt-mark showmanual", vec![CmdResponse::ok("vim\n")]);
        host.on_command("apt-mark showhold", vec![CmdResponse::ok("libwine\n")]);
        host
    }

    #[test]
    fn load_builds_index_and_overlays() {
        let host = canned_host();
        let db = PackageDb::load(&host, &ctx()).unwrap();
        assert_eq!(db.len(), 2);

        let vim = db.get("vim:amd64").expect("vim present").lock();
        assert!(vim.manual, "showmanual overlay");
        assert!(!vim.hold);
        assert_eq!(vim.missing_paths, vec![PathBuf::from("/usr/share/vim/vimrc")]);
        assert_eq!(
            vim.digest_check_failed_paths,
            vec![PathBuf::from("/etc/vim/vimrc")]
        );
        drop(vim);

        let wine = db.get("libwine:i386").expect("wine present").lock();
        assert!(wine.hold, "showhold overlay");
        assert!(!wine.manual);
        drop(wine);

        assert_eq!(
            db.path_to_packages(Path::new("/usr/bin/vim")),
            ["vim:amd64"]
        );
        assert!(db.path_to_packages(Path::new("/nonexistent")).is_empty());
    }

    #[test]
    fn load_runs_verify_once_per_package() {
        let host = canned_host();
        let _db = PackageDb::load(&host, &ctx()).unwrap();
        let verifies = host
            .operations()
            .iter()
            .filter(|op| op.contains("dpkg --verify"))
            .count();
        assert_eq!(verifies, 2);
    }

    #[test]
    fn load_joins_parallel_verify_failures() {
        // Both verifies print garbage, so both parse failures must be
        // reported together.
        let host = MemoryHost::new();
        host.on_command("dpkg-divert --list", vec![CmdResponse::ok("")]);
        host.on_command("dpkg-query --show", vec![CmdResponse::ok(SHOW_OUTPUT)]);
        host.on_command("dpkg --verify", vec![CmdResponse::ok("garbage output\n")]);
        host.on_command("apt-mark", vec![CmdResponse::ok("")]);

        let err = PackageDb::load(&host, &ctx()).unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("2 task(s) failed"), "got: {text}");
    }

    #[test]
    fn load_propagates_missing_tooling() {
        let host = MemoryHost::new();
        let err = PackageDb::load(&host, &ctx()).unwrap_err();
        assert!(format!("{err:#}").contains("exit 127"), "got: {err:#}");
    }

    #[test]
    fn package_name_helpers() {
        let package = Package {
            name: "wine:i386".to_string(),
            ..Package::default()
        };
        assert_eq!(package.short_name(), "wine");
        assert_eq!(package.architecture(), Some("i386"));
    }
}
