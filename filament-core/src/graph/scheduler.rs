//! Update Scheduler
//!
//! The scheduler owns the dependency graph and decides which nodes a write
//! affects and in which order they must be brought up to date.
//!
//! # Algorithm
//!
//! 1. When a source changes, its direct dependents are marked `Dirty`
//! 2. Everything reachable beyond them is marked `MaybeDirty`
//! 3. The affected nodes are sorted topologically (dependencies first)
//! 4. The runtime processes them in that order:
//!    - `Dirty` nodes recompute
//!    - `MaybeDirty` nodes first check whether a memo they read changed
//!
//! This "push-pull" approach minimizes unnecessary recomputation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use thiserror::Error;

use super::node::{DirtyState, Node};
use crate::reactive::NodeRef;

/// A dependency set that would have closed a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle: {}", DisplayChain(.chain))]
pub struct CycleError {
    /// The nodes forming the cycle, starting and ending with the same node.
    pub chain: Vec<NodeRef>,
}

struct DisplayChain<'a>(&'a [NodeRef]);

impl fmt::Display for DisplayChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{node}")?;
        }
        Ok(())
    }
}

/// The update scheduler manages the dependency graph and coordinates updates.
#[derive(Debug, Default)]
pub struct UpdateScheduler {
    nodes: HashMap<NodeRef, Node>,
}

impl UpdateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph. Adding an existing node is a no-op.
    pub fn add_node(&mut self, id: NodeRef) {
        self.nodes.entry(id).or_insert_with(|| Node::new(id));
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: NodeRef) {
        if let Some(node) = self.nodes.remove(&id) {
            for dep_id in node.dependencies() {
                if let Some(dep) = self.nodes.get_mut(dep_id) {
                    dep.dependents_mut().shift_remove(&id);
                }
            }

            for dependent_id in node.dependents() {
                if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                    dependent.dependencies_mut().shift_remove(&id);
                }
            }
        }
    }

    pub fn contains(&self, id: NodeRef) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get_node(&self, id: NodeRef) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn state(&self, id: NodeRef) -> Option<DirtyState> {
        self.nodes.get(&id).map(Node::dirty_state)
    }

    pub fn mark_clean(&mut self, id: NodeRef) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.mark_clean();
        }
    }

    pub fn mark_dirty(&mut self, id: NodeRef) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.mark_dirty();
        }
    }

    /// Nodes reading `id`, in the order they subscribed.
    pub fn dependents(&self, id: NodeRef) -> Vec<NodeRef> {
        self.nodes
            .get(&id)
            .map(|node| node.dependents().iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependencies(&self, id: NodeRef) -> Vec<NodeRef> {
        self.nodes
            .get(&id)
            .map(|node| node.dependencies().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Replace the dependency set of `id` with `deps`.
    ///
    /// Dependencies are captured fresh on every run, so the previous edges
    /// are dropped entirely. Unknown dependencies (already disposed) are
    /// skipped. If any new edge would close a cycle, nothing changes.
    pub fn set_dependencies<I>(&mut self, id: NodeRef, deps: I) -> Result<(), CycleError>
    where
        I: IntoIterator<Item = NodeRef>,
    {
        let deps: Vec<NodeRef> = deps
            .into_iter()
            .filter(|dep| self.nodes.contains_key(dep))
            .collect();

        for &dep in &deps {
            if dep == id {
                return Err(CycleError {
                    chain: vec![id, id],
                });
            }
            // `dep` downstream of `id` means `id -> ... -> dep -> id`
            if let Some(mut path) = self.path(id, dep) {
                path.push(id);
                return Err(CycleError { chain: path });
            }
        }

        let old: Vec<NodeRef> = match self.nodes.get_mut(&id) {
            Some(node) => node.dependencies_mut().drain(..).collect(),
            None => return Ok(()),
        };
        for dep in old {
            if let Some(dep_node) = self.nodes.get_mut(&dep) {
                dep_node.dependents_mut().shift_remove(&id);
            }
        }

        for dep in deps {
            if let Some(dep_node) = self.nodes.get_mut(&dep) {
                dep_node.dependents_mut().insert(id);
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                node.dependencies_mut().insert(dep);
            }
        }
        Ok(())
    }

    /// Shortest path from `from` to `to` following dependent edges.
    fn path(&self, from: NodeRef, to: NodeRef) -> Option<Vec<NodeRef>> {
        let mut parents: HashMap<NodeRef, NodeRef> = HashMap::new();
        let mut visited = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&parent) = parents.get(&cursor) {
                    path.push(parent);
                    cursor = parent;
                }
                path.reverse();
                return Some(path);
            }
            if let Some(node) = self.nodes.get(&current) {
                for &next in node.dependents() {
                    if visited.insert(next) {
                        parents.insert(next, current);
                        queue.push_back(next);
                    }
                }
            }
        }
        None
    }

    /// Mark a source node as changed and propagate dirty flags.
    ///
    /// Direct dependents become `Dirty`, everything further downstream
    /// becomes `MaybeDirty`. Returns the affected nodes in topological order.
    pub fn mark_changed(&mut self, source_id: NodeRef) -> Vec<NodeRef> {
        let mut to_process = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        let direct: Vec<NodeRef> = self.dependents(source_id);
        for &dependent_id in &direct {
            if let Some(node) = self.nodes.get_mut(&dependent_id) {
                node.mark_dirty();
            }
            queue.push_back(dependent_id);
        }

        // BFS to propagate maybe-dirty status
        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }

            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.mark_maybe_dirty();
                to_process.push(node_id);

                for &dependent_id in node.dependents() {
                    queue.push_back(dependent_id);
                }
            }
        }

        // The graph is acyclic by construction; fall back to BFS order if not.
        self.topological_sort(&to_process).unwrap_or(to_process)
    }

    /// Perform a topological sort of the given nodes.
    ///
    /// Returns nodes in order such that dependencies come before dependents,
    /// or the nodes left over when the subgraph contains a cycle.
    pub fn topological_sort(&self, nodes: &[NodeRef]) -> Result<Vec<NodeRef>, CycleError> {
        let node_set: HashSet<_> = nodes.iter().copied().collect();
        let mut in_degree: HashMap<NodeRef, usize> = HashMap::new();
        let mut result = Vec::with_capacity(nodes.len());
        let mut queue = VecDeque::new();

        // Calculate in-degrees (only counting edges within the node set)
        for &node_id in nodes {
            if let Some(node) = self.nodes.get(&node_id) {
                let degree = node
                    .dependencies()
                    .iter()
                    .filter(|d| node_set.contains(d))
                    .count();
                in_degree.insert(node_id, degree);
                if degree == 0 {
                    queue.push_back(node_id);
                }
            }
        }

        // Kahn's algorithm
        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            if let Some(node) = self.nodes.get(&node_id) {
                for &dependent_id in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(&dependent_id) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent_id);
                        }
                    }
                }
            }
        }

        if result.len() < in_degree.len() {
            let chain = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(CycleError { chain });
        }
        Ok(result)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
