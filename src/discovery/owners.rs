//! Ownership resolution: classify every walked path against the package
//! database and compile the result into resource documents.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::host::Host;
use crate::resources::{AptPackage, File, Resource};

use super::pkgdb::PackageDb;
use super::walker::PathNode;

/// Outcome of joining the walked tree with the package database.
///
/// Inferred-path attribution lives on the packages themselves (their
/// `inferred_paths` lists); this struct carries the host-level sets.
#[derive(Debug, Default)]
pub struct Ownership {
    /// Packages owning at least one walked path.
    pub to_install: BTreeSet<String>,
    /// Paths with no attributable owner.
    pub orphans: BTreeSet<PathBuf>,
    /// Symlinks whose targets do not exist (owned ones are also recorded
    /// on their package).
    pub broken_symlinks: BTreeSet<PathBuf>,
}

/// Resolve a symlink target against the link's directory.
fn absolute_target(link: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        link.parent()
            .map_or_else(|| target.to_path_buf(), |parent| parent.join(target))
    }
}

/// The unique owner among all owned ancestors of `path`, if exactly one
/// package emerges.
fn unique_ancestor_owner(db: &PackageDb, path: &Path) -> Option<String> {
    let mut owners: BTreeSet<&String> = BTreeSet::new();
    for ancestor in path.ancestors().skip(1) {
        if ancestor == Path::new("/") {
            break;
        }
        owners.extend(db.path_to_packages(ancestor));
    }
    if owners.len() == 1 {
        owners.pop_first().cloned()
    } else {
        None
    }
}

/// Classify every path produced by the walker.
///
/// Directories are skipped; symlinks resolve their target once (directory
/// targets are skipped, dangling ones recorded as broken); remaining paths
/// are attributed to their direct owners, a unique owning ancestor, or the
/// orphan set.
///
/// # Errors
///
/// Host I/O failures while resolving symlink targets.
pub fn resolve(host: &dyn Host, db: &PackageDb, tree: &Arc<PathNode>) -> Result<Ownership> {
    let mut ownership = Ownership::default();

    for node in tree.list_recursively() {
        let dirent = node.dirent();
        if dirent.file_type.is_dir() {
            continue;
        }
        let path = node.to_path();

        if dirent.file_type.is_symlink() {
            let target = host
                .readlink(&path)
                .with_context(|| format!("resolving symlink {}", path.display()))?;
            let target = absolute_target(&path, &target);
            match host.lstat(&target) {
                Ok(info) if info.file_type.is_dir() => continue,
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    ownership.broken_symlinks.insert(path.clone());
                    for owner in db.path_to_packages(&path) {
                        if let Some(package) = db.get(owner) {
                            package.lock().broken_symlinks.push(path.clone());
                        }
                    }
                    continue;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("inspecting symlink target {}", target.display()));
                }
            }
        }

        let owners = db.path_to_packages(&path);
        if !owners.is_empty() {
            ownership.to_install.extend(owners.iter().cloned());
            continue;
        }

        if let Some(owner) = unique_ancestor_owner(db, &path) {
            if let Some(package) = db.get(&owner) {
                package.lock().inferred_paths.push(path);
            }
            continue;
        }

        ownership.orphans.insert(path);
    }

    Ok(ownership)
}

/// One emitted document: file name and its resources in canonical order.
pub type Document = (String, Vec<Resource>);

/// File name of the unattributable-path document.
pub const ORPHAN_FILE: &str = "orphan_files.yaml";

fn package_resource(db: &PackageDb, name: &str) -> Option<AptPackage> {
    let package = db.get(name)?.lock();
    Some(AptPackage {
        package: package.short_name().to_string(),
        architecture: package.architecture().map(str::to_string),
        // Unpinned unless the hold mark freezes the version too.
        version: package.hold.then(|| package.version.clone()),
        hold: package.hold,
        absent: false,
    })
}

/// Compile ownership results into per-source-package resource documents.
///
/// Each group file carries the group's `APTPackage` resources (sorted by
/// name) followed by a `File` resource, loaded from the host, for every
/// inferred-owned path (sorted). Orphan paths land in
/// [`ORPHAN_FILE`], except broken symlinks, which are logged and dropped.
/// Output is fully deterministic for a fixed walk and database.
///
/// # Errors
///
/// Host I/O failures while loading file states.
pub fn compile_resources(
    host: &dyn Host,
    db: &PackageDb,
    ownership: &Ownership,
) -> Result<Vec<Document>> {
    #[derive(Default)]
    struct Group {
        packages: BTreeSet<String>,
        files: BTreeSet<PathBuf>,
    }
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();

    for name in &ownership.to_install {
        if let Some(package) = db.get(name) {
            let source = package.lock().source_package.clone();
            groups.entry(source).or_default().packages.insert(name.clone());
        }
    }
    for package in db.packages() {
        let package = package.lock();
        if !package.inferred_paths.is_empty() {
            let group = groups.entry(package.source_package.clone()).or_default();
            group.files.extend(package.inferred_paths.iter().cloned());
        }
    }

    let mut documents = Vec::new();
    for (source, group) in groups {
        let mut resources = Vec::new();
        for name in &group.packages {
            if let Some(resource) = package_resource(db, name) {
                resources.push(Resource::AptPackage(resource));
            }
        }
        for path in &group.files {
            let loaded = File::at(path.clone())
                .load(host)
                .with_context(|| format!("loading inferred-owned {}", path.display()))?;
            resources.push(Resource::File(loaded));
        }
        documents.push((format!("{source}.yaml"), resources));
    }

    let mut orphan_resources = Vec::new();
    for path in &ownership.orphans {
        if ownership.broken_symlinks.contains(path) {
            tracing::warn!(path = %path.display(), "dropping broken symlink from orphans");
            continue;
        }
        let loaded = File::at(path.clone())
            .load(host)
            .with_context(|| format!("loading orphan {}", path.display()))?;
        orphan_resources.push(Resource::File(loaded));
    }
    if !orphan_resources.is_empty() {
        documents.push((ORPHAN_FILE.to_string(), orphan_resources));
    }

    Ok(documents)
}
