//! Declarative resource primitives: the closed set of host-state kinds and
//! the contract the engine drives them through.
//!
//! A [`Resource`] is one declarative unit of host state. The enum is
//! externally tagged, so the YAML form of each resource is the single-key
//! mapping `{TypeName: body}` with no extra plumbing. Polymorphism is a sum
//! type rather than trait objects: the kind set is closed, and the
//! Single/Group distinction is a property of the [`Kind`], not a runtime
//! check on instances.

pub mod apt_package;
pub mod dpkg_arch;
pub mod file;

pub use apt_package::AptPackage;
pub use dpkg_arch::DpkgArch;
pub use file::File;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::concurrency::RunContext;
use crate::error::ValidationError;
use crate::host::Host;

/// The closed set of resource kinds.
///
/// Kind-level metadata lives here: whether instances apply one at a time or
/// as one native batch, and the id globs that inject ordering edges and
/// coexistence conflicts into the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    /// Debian package managed through apt (a Group kind: one apt
    /// transaction covers every instance).
    AptPackage,
    /// dpkg foreign-architecture configuration.
    DpkgArch,
    /// A filesystem path: regular file, symlink, directory, or fifo.
    File,
}

impl Kind {
    /// The kind's type name as used in YAML documents and qualified ids.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AptPackage => "APTPackage",
            Self::DpkgArch => "DpkgArch",
            Self::File => "File",
        }
    }

    /// Whether instances of this kind apply as one native batch.
    #[must_use]
    pub const fn is_group(self) -> bool {
        matches!(self, Self::AptPackage)
    }

    /// Id globs naming resources that must be applied before this kind.
    ///
    /// Matched against qualified `Kind:id` strings.
    #[must_use]
    pub const fn pre_require_globs(self) -> &'static [&'static str] {
        match self {
            Self::AptPackage => &["DpkgArch:*"],
            Self::DpkgArch => &[],
            Self::File => &["DpkgArch:*", "APTPackage:*"],
        }
    }

    /// Id globs that forbid coexistence: two resources whose qualified ids
    /// both match one of these patterns are a fatal validation error.
    #[must_use]
    pub const fn conflict_globs(self) -> &'static [&'static str] {
        match self {
            // A host has exactly one dpkg architecture configuration.
            Self::DpkgArch => &["DpkgArch:*"],
            Self::AptPackage | Self::File => &[],
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One declarative unit of host state.
///
/// Serialized externally tagged: `APTPackage: {...}`, `DpkgArch: {...}`,
/// `File: {...}`. Unknown type names and unknown body fields are hard
/// deserialization errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    /// Debian package state.
    #[serde(rename = "APTPackage")]
    AptPackage(AptPackage),
    /// dpkg foreign architectures.
    DpkgArch(DpkgArch),
    /// Filesystem path state.
    File(File),
}

impl Resource {
    /// The resource's kind.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::AptPackage(_) => Kind::AptPackage,
            Self::DpkgArch(_) => Kind::DpkgArch,
            Self::File(_) => Kind::File,
        }
    }

    /// Stable id, unique within the kind on one host.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::AptPackage(p) => p.id(),
            Self::DpkgArch(d) => d.id(),
            Self::File(f) => f.id(),
        }
    }

    /// `Kind:id`, the form id globs are matched against.
    ///
    /// # Examples
    ///
    /// ```
    /// use hostconf_cli::resources::{AptPackage, Resource};
    ///
    /// let vim = Resource::AptPackage(AptPackage::named("vim"));
    /// assert_eq!(vim.qualified_id(), "APTPackage:vim");
    /// ```
    #[must_use]
    pub fn qualified_id(&self) -> String {
        format!("{}:{}", self.kind().name(), self.id())
    }

    /// Structural validation: required fields, exclusive fields, bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidResource`] describing the first
    /// violated constraint.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::AptPackage(p) => p.validate(),
            Self::DpkgArch(d) => d.validate(),
            Self::File(f) => f.validate(),
        }
    }

    /// Read the current host state for this resource's id.
    ///
    /// Group kinds accept this per-instance entry point too (it issues a
    /// one-element batch); bulk loading goes through [`load_group`].
    ///
    /// # Errors
    ///
    /// Fails on host I/O errors; a missing path or package is state
    /// (`absent`), not an error.
    pub fn load(&self, host: &dyn Host, ctx: &RunContext) -> Result<Self> {
        match self {
            Self::AptPackage(p) => {
                let loaded = apt_package::load_all(host, ctx, &[p.id()])?;
                loaded
                    .into_iter()
                    .next()
                    .map(Self::AptPackage)
                    .ok_or_else(|| anyhow::anyhow!("batched load returned no entry for '{}'", p.id()))
            }
            Self::DpkgArch(d) => d.load(host, ctx).map(Self::DpkgArch),
            Self::File(f) => f.load(host).map(Self::File),
        }
    }

    /// Whether `self` (a loaded state) meets every constraint expressed by
    /// `other`. Fields left unset in `other` are unconstrained.
    ///
    /// # Errors
    ///
    /// Fails when evaluating a constraint needs host lookups that fail
    /// (e.g. resolving a user name to a uid).
    pub fn satisfies(&self, host: &dyn Host, other: &Self) -> Result<bool> {
        match (self, other) {
            (Self::AptPackage(a), Self::AptPackage(b)) => Ok(a.satisfies(b)),
            (Self::DpkgArch(a), Self::DpkgArch(b)) => Ok(a.satisfies(b)),
            (Self::File(a), Self::File(b)) => a.satisfies(host, b),
            _ => Ok(false),
        }
    }

    /// Apply this resource to the host (Single kinds).
    ///
    /// Group kinds must go through [`apply_group`]; routing an instance of
    /// one here is a dispatch bug.
    ///
    /// # Errors
    ///
    /// Fails on host I/O or command errors.
    ///
    /// # Panics
    ///
    /// Panics when called on a Group kind.
    pub fn apply(&self, host: &dyn Host, ctx: &RunContext) -> Result<()> {
        match self {
            Self::AptPackage(_) => {
                panic!("group kind {} dispatched to single apply", self.kind())
            }
            Self::DpkgArch(d) => d.apply(host, ctx),
            Self::File(f) => f.apply(host),
        }
    }

    /// Merge two compatible partial specifications of the same id.
    ///
    /// # Errors
    ///
    /// [`ValidationError::MergeConflict`] when the sides disagree on a
    /// field; `self` is not modified (a new resource is returned).
    pub fn merge(&self, other: &Self) -> Result<Self, ValidationError> {
        match (self, other) {
            (Self::AptPackage(a), Self::AptPackage(b)) => a.merge(b).map(Self::AptPackage),
            (Self::DpkgArch(a), Self::DpkgArch(b)) => a.merge(b).map(Self::DpkgArch),
            (Self::File(a), Self::File(b)) => a.merge(b).map(Self::File),
            _ => Err(ValidationError::MergeConflict {
                kind: self.kind().name().to_string(),
                id: self.id(),
                field: "kind".to_string(),
            }),
        }
    }
}

/// Batched load for a Group kind: all `ids` in one native query.
///
/// # Errors
///
/// Fails on host I/O or command errors.
///
/// # Panics
///
/// Panics when `kind` is not a Group kind (dispatch bug).
pub fn load_group(
    host: &dyn Host,
    ctx: &RunContext,
    kind: Kind,
    ids: &[String],
) -> Result<Vec<Resource>> {
    match kind {
        Kind::AptPackage => Ok(apt_package::load_all(host, ctx, ids)?
            .into_iter()
            .map(Resource::AptPackage)
            .collect()),
        other => panic!("kind {other} is not a group"),
    }
}

/// Batched apply for a Group kind: one native transaction over `members`.
///
/// # Errors
///
/// Fails on host I/O or command errors.
///
/// # Panics
///
/// Panics when `kind` is not a Group kind or `members` contains a foreign
/// kind or is empty (dispatch bugs).
pub fn apply_group(
    host: &dyn Host,
    ctx: &RunContext,
    kind: Kind,
    members: &[Resource],
) -> Result<()> {
    assert!(!members.is_empty(), "group apply with no members");
    match kind {
        Kind::AptPackage => {
            let packages: Vec<&AptPackage> = members
                .iter()
                .map(|member| match member {
                    Resource::AptPackage(p) => p,
                    other => panic!("{} member in {kind} group", other.kind()),
                })
                .collect();
            apt_package::apply_all(host, ctx, &packages)
        }
        other => panic!("kind {other} is not a group"),
    }
}
