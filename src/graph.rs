//! Resource dependency graph: built from the linear resource list, sorted
//! topologically, applied in order.
//!
//! Edge derivation is deliberately conservative: each resource depends on
//! the one before it unless they can share a Group node, so the apply order
//! is mostly the document order with fan-in where Group kinds are
//! revisited. Pre-require and conflict globs declared by kinds inject the
//! remaining edges.

use std::collections::{BTreeSet, HashMap};

use crate::error::GraphError;
use crate::resources::{Kind, Resource};

/// What a node applies: one Single resource or a whole Group kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePayload {
    /// One resource, applied by itself.
    Single(Resource),
    /// Every instance of a Group kind, applied as one native batch.
    Group {
        /// The group's kind.
        kind: Kind,
        /// Members in insertion order.
        members: Vec<Resource>,
    },
}

/// A graph node with its `required_by` edge set.
///
/// An edge `r → n` (n in r's `required_by`) means r must be applied before
/// n.
#[derive(Debug, Clone)]
pub struct Node {
    payload: NodePayload,
    required_by: BTreeSet<usize>,
}

impl Node {
    /// The node's payload.
    #[must_use]
    pub const fn payload(&self) -> &NodePayload {
        &self.payload
    }

    /// Indices of nodes that require this one to be applied first.
    #[must_use]
    pub const fn required_by(&self) -> &BTreeSet<usize> {
        &self.required_by
    }

    /// Display label: the qualified id, or the kind name for groups.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.payload {
            NodePayload::Single(resource) => resource.qualified_id(),
            NodePayload::Group { kind, .. } => kind.name().to_string(),
        }
    }

    fn qualified_ids(&self) -> Vec<String> {
        match &self.payload {
            NodePayload::Single(resource) => vec![resource.qualified_id()],
            NodePayload::Group { members, .. } => {
                members.iter().map(Resource::qualified_id).collect()
            }
        }
    }

    fn kind(&self) -> Kind {
        match &self.payload {
            NodePayload::Single(resource) => resource.kind(),
            NodePayload::Group { kind, .. } => *kind,
        }
    }
}

/// Compile a static kind glob.
fn matcher(pattern: &str) -> globset::GlobMatcher {
    globset::Glob::new(pattern).map_or_else(
        |e| panic!("invalid kind glob '{pattern}': {e}"),
        |glob| glob.compile_matcher(),
    )
}

/// The resource dependency graph.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    /// Build the graph from a resource list.
    ///
    /// 1. Walk the list: Group kinds reuse their node, everything else gets
    ///    a fresh one; each new node is linked after the previous step's
    ///    `required_nodes`, with the latent-pre-requisite carry-over for
    ///    nodes that were already linked.
    /// 2. Inject pre-require edges from kind globs.
    /// 3. Reject conflict-glob collisions.
    ///
    /// # Errors
    ///
    /// [`GraphError::Conflict`] when two ids match one conflict glob.
    pub fn build(resources: &[Resource]) -> Result<Self, GraphError> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut group_index: HashMap<Kind, usize> = HashMap::new();
        let mut required: BTreeSet<usize> = BTreeSet::new();

        for resource in resources {
            let kind = resource.kind();
            let node = if kind.is_group() {
                if let Some(&existing) = group_index.get(&kind) {
                    if let Some(node) = nodes.get_mut(existing)
                        && let NodePayload::Group { members, .. } = &mut node.payload
                    {
                        members.push(resource.clone());
                    }
                    existing
                } else {
                    nodes.push(Node {
                        payload: NodePayload::Group {
                            kind,
                            members: vec![resource.clone()],
                        },
                        required_by: BTreeSet::new(),
                    });
                    group_index.insert(kind, nodes.len() - 1);
                    nodes.len() - 1
                }
            } else {
                nodes.push(Node {
                    payload: NodePayload::Single(resource.clone()),
                    required_by: BTreeSet::new(),
                });
                nodes.len() - 1
            };

            let mut next_required = BTreeSet::from([node]);
            for &previous in &required {
                if previous == node {
                    continue;
                }
                // A link in either direction means this pair was ordered by
                // an earlier step (a revisited Group node); adding the edge
                // again would either duplicate or close a loop. The pending
                // requirement carries over to the next node instead.
                let already_linked = nodes
                    .get(previous)
                    .is_some_and(|p| p.required_by.contains(&node))
                    || nodes
                        .get(node)
                        .is_some_and(|n| n.required_by.contains(&previous));
                if already_linked {
                    next_required.insert(previous);
                } else if let Some(p) = nodes.get_mut(previous) {
                    p.required_by.insert(node);
                }
            }
            required = next_required;
        }

        let mut graph = Self { nodes };
        graph.add_glob_edges();
        graph.check_conflicts()?;
        Ok(graph)
    }

    /// Inject `pre_require` edges: for node n of kind K, every other node
    /// with an id matching one of K's globs must precede n.
    fn add_glob_edges(&mut self) {
        let ids: Vec<Vec<String>> = self.nodes.iter().map(Node::qualified_ids).collect();
        for n in 0..self.nodes.len() {
            let kind = match self.nodes.get(n) {
                Some(node) => node.kind(),
                None => continue,
            };
            for pattern in kind.pre_require_globs() {
                let glob = matcher(pattern);
                for (m, m_ids) in ids.iter().enumerate() {
                    if m != n
                        && m_ids.iter().any(|id| glob.is_match(id))
                        && let Some(node) = self.nodes.get_mut(m)
                    {
                        node.required_by.insert(n);
                    }
                }
            }
        }
    }

    /// Fail when two distinct ids both match one conflict glob.
    fn check_conflicts(&self) -> Result<(), GraphError> {
        let mut kinds: BTreeSet<Kind> = BTreeSet::new();
        for node in &self.nodes {
            kinds.insert(node.kind());
        }
        let all_ids: Vec<String> = self.nodes.iter().flat_map(Node::qualified_ids).collect();

        for kind in kinds {
            for pattern in kind.conflict_globs() {
                let glob = matcher(pattern);
                let matching: Vec<&String> =
                    all_ids.iter().filter(|id| glob.is_match(id)).collect();
                if let [first, second, ..] = matching.as_slice() {
                    return Err(GraphError::Conflict {
                        a: (*first).clone(),
                        b: (*second).clone(),
                        pattern: (*pattern).to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in construction order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Topological sort via Kahn's algorithm, ties broken by node index so
    /// the order is deterministic.
    ///
    /// # Errors
    ///
    /// [`GraphError::CycleDetected`] when the sort consumes fewer nodes
    /// than the graph holds.
    pub fn sorted(&self) -> Result<Vec<&Node>, GraphError> {
        let mut in_degree = vec![0_usize; self.nodes.len()];
        for node in &self.nodes {
            for &dependent in &node.required_by {
                if let Some(count) = in_degree.get_mut(dependent) {
                    *count += 1;
                }
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| (d == 0).then_some(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            let Some(node) = self.nodes.get(next) else {
                break;
            };
            order.push(node);
            for &dependent in &node.required_by {
                if let Some(count) = in_degree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(GraphError::CycleDetected)
        }
    }

    /// Graphviz rendering of the node list and its `required_by` edges.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph resources {\n");
        for node in &self.nodes {
            out.push_str(&format!("  \"{}\";\n", node.label()));
        }
        for node in &self.nodes {
            for &dependent in &node.required_by {
                if let Some(target) = self.nodes.get(dependent) {
                    out.push_str(&format!(
                        "  \"{}\" -> \"{}\";\n",
                        node.label(),
                        target.label()
                    ));
                }
            }
        }
        out.push_str("}\n");
        out
    }

    /// Build a graph from raw nodes (cycle tests need edges the
    /// construction rules cannot produce).
    #[cfg(test)]
    fn from_parts(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }
}
