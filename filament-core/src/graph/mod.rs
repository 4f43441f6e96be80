//! Dependency Graph
//!
//! This module implements the dependency graph that connects signals to the
//! computations reading them.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are signals, memos, effects and component render passes
//! - Edges represent dependencies: if A reads B, there is an edge from B to A
//!
//! When a signal is written, we traverse the graph to find all affected nodes
//! and mark them dirty. Direct readers become `Dirty`; anything further away
//! only becomes `MaybeDirty` and is verified against memo epochs before it
//! runs again.
//!
//! # Design Decisions
//!
//! 1. Edges are never accumulated. Every run of a computation replaces its
//!    dependency set completely with what it read during that run.
//!
//! 2. Adding a dependency set that would close a cycle is rejected with the
//!    offending chain instead of being recorded.
//!
//! 3. Both forward (dependencies) and reverse (dependents) edges are kept in
//!    insertion-ordered sets so traversal order is deterministic.

mod node;
mod scheduler;

pub use node::{DirtyState, Node, NodeKind};
pub use scheduler::{CycleError, UpdateScheduler};
