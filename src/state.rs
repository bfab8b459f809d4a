//! Ordered bag of resources with a unique `(kind, id)` invariant.
//!
//! Insertion order is semantically significant: the dependency graph is
//! derived from it, and the store persists it. The YAML form of a state is
//! exactly a resource document (a sequence of single-key mappings), so
//! store slots and user documents share one format.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::concurrency::{RunContext, batches, join_errors, run_all};
use crate::error::ValidationError;
use crate::graph::{Graph, NodePayload};
use crate::host::Host;
use crate::resources::{Kind, Resource, load_group};

/// An ordered collection of resources, indexed by `(kind, id)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Resource>", into = "Vec<Resource>")]
pub struct State {
    resources: Vec<Resource>,
    index: HashMap<(Kind, String), usize>,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.resources == other.resources
    }
}

impl TryFrom<Vec<Resource>> for State {
    type Error = ValidationError;

    fn try_from(resources: Vec<Resource>) -> Result<Self, Self::Error> {
        let mut state = Self::new();
        for resource in resources {
            state.append(resource)?;
        }
        Ok(state)
    }
}

impl From<State> for Vec<Resource> {
    fn from(state: State) -> Self {
        state.resources
    }
}

impl State {
    /// An empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resource, failing when its `(kind, id)` already exists.
    ///
    /// # Errors
    ///
    /// [`ValidationError::DuplicatedResource`]; the state is unchanged.
    pub fn append(&mut self, resource: Resource) -> Result<(), ValidationError> {
        let key = (resource.kind(), resource.id());
        if self.index.contains_key(&key) {
            return Err(ValidationError::DuplicatedResource {
                kind: key.0.name().to_string(),
                id: key.1,
            });
        }
        self.index.insert(key, self.resources.len());
        self.resources.push(resource);
        Ok(())
    }

    /// Look up a resource by kind and id.
    #[must_use]
    pub fn get(&self, kind: Kind, id: &str) -> Option<&Resource> {
        self.index
            .get(&(kind, id.to_string()))
            .and_then(|&i| self.resources.get(i))
    }

    /// Whether a `(kind, id)` is present.
    #[must_use]
    pub fn contains(&self, kind: Kind, id: &str) -> bool {
        self.index.contains_key(&(kind, id.to_string()))
    }

    /// Resources in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// `(kind, id)` pairs in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<(Kind, String)> {
        self.resources
            .iter()
            .map(|r| (r.kind(), r.id()))
            .collect()
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the state holds no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Validate every resource structurally.
    ///
    /// # Errors
    ///
    /// The first resource-level violation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for resource in &self.resources {
            resource.validate()?;
        }
        Ok(())
    }

    /// Whether `self` satisfies every resource in `other`.
    ///
    /// A missing `(kind, id)` fails; present resources delegate to their
    /// kind's `satisfies`.
    ///
    /// # Errors
    ///
    /// Fails when a constraint evaluation needs host lookups that fail.
    pub fn satisfies(&self, host: &dyn Host, other: &Self) -> Result<bool> {
        for wanted in other.iter() {
            match self.get(wanted.kind(), &wanted.id()) {
                None => return Ok(false),
                Some(mine) => {
                    if !mine.satisfies(host, wanted)? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Load the current host state for every resource, preserving order.
    ///
    /// Group kinds load all their ids in one batched query; Single kinds
    /// are partitioned into limiter-sized batches and loaded concurrently.
    ///
    /// # Errors
    ///
    /// All load failures, joined.
    pub fn load(&self, host: &dyn Host, ctx: &RunContext) -> Result<Self> {
        type LoadTask<'a> = Box<dyn FnOnce() -> Result<Vec<(usize, Resource)>> + Send + 'a>;
        let mut group_ids: Vec<(Kind, Vec<(usize, String)>)> = Vec::new();
        let mut singles: Vec<(usize, Resource)> = Vec::new();

        for (position, resource) in self.resources.iter().enumerate() {
            let kind = resource.kind();
            if kind.is_group() {
                match group_ids.iter_mut().find(|(k, _)| *k == kind) {
                    Some((_, ids)) => ids.push((position, resource.id())),
                    None => group_ids.push((kind, vec![(position, resource.id())])),
                }
            } else {
                singles.push((position, resource.clone()));
            }
        }

        let mut tasks: Vec<LoadTask<'_>> = Vec::new();
        for batch in batches(ctx, singles) {
            tasks.push(Box::new(move || {
                batch
                    .into_iter()
                    .map(|(position, resource)| Ok((position, resource.load(host, ctx)?)))
                    .collect()
            }));
        }
        for (kind, members) in group_ids {
            tasks.push(Box::new(move || {
                let ids: Vec<String> = members.iter().map(|(_, id)| id.clone()).collect();
                let loaded = load_group(host, ctx, kind, &ids)?;
                Ok(members
                    .iter()
                    .map(|(position, _)| *position)
                    .zip(loaded)
                    .collect())
            }));
        }

        let results = join_errors(run_all(ctx, tasks))?;
        let mut slots: Vec<Option<Resource>> = vec![None; self.resources.len()];
        for (position, resource) in results.into_iter().flatten() {
            if let Some(slot) = slots.get_mut(position) {
                *slot = Some(resource);
            }
        }

        let resources: Vec<Resource> = slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| {
                slot.unwrap_or_else(|| panic!("resource at position {position} was not loaded"))
            })
            .collect();
        Self::try_from(resources).map_err(Into::into)
    }

    /// Apply every resource in dependency order.
    ///
    /// Routed through the dependency graph: Single nodes apply one at a
    /// time, Group nodes as one batched call; the walk across nodes is
    /// strictly sequential.
    ///
    /// # Errors
    ///
    /// Graph construction errors or the first node apply failure.
    pub fn apply(&self, host: &dyn Host, ctx: &RunContext) -> Result<()> {
        let graph = Graph::build(&self.resources)?;
        tracing::debug!(graph = %graph.to_dot(), "dependency graph");
        for node in graph.sorted()? {
            ctx.check_cancelled()?;
            match node.payload() {
                NodePayload::Single(resource) => {
                    tracing::debug!(resource = %resource.qualified_id(), "applying");
                    resource.apply(host, ctx)?;
                }
                NodePayload::Group { kind, members } => {
                    tracing::debug!(kind = %kind, members = members.len(), "applying group");
                    crate::resources::apply_group(host, ctx, *kind, members)?;
                }
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a State {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.iter()
    }
}
