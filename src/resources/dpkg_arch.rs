//! dpkg foreign-architecture resource.
//!
//! A host has exactly one of these (the kind's conflict glob enforces it);
//! it must be applied before any `APTPackage`, which the package kind's
//! pre-require glob guarantees.

use std::collections::BTreeSet;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::concurrency::RunContext;
use crate::error::ValidationError;
use crate::host::{Cmd, Host, run_ok};

/// The set of foreign architectures dpkg accepts packages for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DpkgArch {
    /// Foreign architectures (the native one is implicit).
    pub foreign_architectures: Vec<String>,
}

/// The fixed id: one dpkg configuration per host.
pub const DPKG_ARCH_ID: &str = "dpkg";

impl DpkgArch {
    /// The resource id (constant: at most one instance per host).
    #[must_use]
    pub fn id(&self) -> String {
        DPKG_ARCH_ID.to_string()
    }

    /// Structural validation.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = BTreeSet::new();
        for arch in &self.foreign_architectures {
            if arch.is_empty() || arch.chars().any(char::is_whitespace) {
                return Err(ValidationError::InvalidResource {
                    kind: "DpkgArch".to_string(),
                    id: self.id(),
                    reason: format!("architecture '{arch}' must be a single word"),
                });
            }
            if !seen.insert(arch) {
                return Err(ValidationError::InvalidResource {
                    kind: "DpkgArch".to_string(),
                    id: self.id(),
                    reason: format!("architecture '{arch}' listed twice"),
                });
            }
        }
        Ok(())
    }

    /// Read the currently configured foreign architectures.
    ///
    /// # Errors
    ///
    /// Fails when `dpkg` cannot be queried.
    pub fn load(&self, host: &dyn Host, ctx: &RunContext) -> Result<Self> {
        let out = run_ok(
            host,
            ctx,
            Cmd::new("dpkg").arg("--print-foreign-architectures"),
        )
        .context("querying foreign architectures")?;
        Ok(Self {
            foreign_architectures: out.lines().map(str::to_string).collect(),
        })
    }

    /// Whether `self` (a loaded state) enables everything `other` asks for.
    #[must_use]
    pub fn satisfies(&self, other: &Self) -> bool {
        let have: BTreeSet<&String> = self.foreign_architectures.iter().collect();
        other
            .foreign_architectures
            .iter()
            .all(|arch| have.contains(arch))
    }

    /// Add missing architectures and remove extras, one dpkg call each.
    ///
    /// # Errors
    ///
    /// Fails when a dpkg invocation fails.
    pub fn apply(&self, host: &dyn Host, ctx: &RunContext) -> Result<()> {
        let current = self.load(host, ctx)?;
        let want: BTreeSet<&String> = self.foreign_architectures.iter().collect();
        let have: BTreeSet<&String> = current.foreign_architectures.iter().collect();

        for arch in want.difference(&have) {
            run_ok(
                host,
                ctx,
                Cmd::new("dpkg").arg("--add-architecture").arg((*arch).clone()),
            )
            .with_context(|| format!("adding architecture {arch}"))?;
        }
        for arch in have.difference(&want) {
            run_ok(
                host,
                ctx,
                Cmd::new("dpkg")
                    .arg("--remove-architecture")
                    .arg((*arch).clone()),
            )
            .with_context(|| format!("removing architecture {arch}"))?;
        }
        Ok(())
    }

    /// Merge two specifications: the union of requested architectures.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature matches the resource contract.
    pub fn merge(&self, other: &Self) -> Result<Self, ValidationError> {
        let mut merged = self.foreign_architectures.clone();
        for arch in &other.foreign_architectures {
            if !merged.contains(arch) {
                merged.push(arch.clone());
            }
        }
        Ok(Self {
            foreign_architectures: merged,
        })
    }
}
