//! Graph Nodes
//!
//! One [`Node`] per signal, memo, effect and component instance, holding
//! its edges in both directions and its staleness.

use indexmap::IndexSet;

use crate::reactive::NodeRef;

/// Role a participant plays in propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Signals: written directly, never recomputed.
    Source,

    /// Memos: recomputed on demand, read by other nodes.
    Derived,

    /// Effects and component renders: queued when stale, read by nobody.
    Sink,
}

impl From<NodeRef> for NodeKind {
    fn from(node: NodeRef) -> Self {
        match node {
            NodeRef::Signal(_) => NodeKind::Source,
            NodeRef::Memo(_) => NodeKind::Derived,
            NodeRef::Effect(_) | NodeRef::Component(_) => NodeKind::Sink,
        }
    }
}

/// Staleness of a derived node or sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// Up to date.
    Clean,

    /// A memo upstream changed; recompute only if its value did too.
    MaybeDirty,

    /// A signal it read was written.
    Dirty,
}

/// Graph entry for one participant.
#[derive(Debug)]
pub struct Node {
    id: NodeRef,
    kind: NodeKind,
    dirty: DirtyState,

    /// What this node read on its last run.
    dependencies: IndexSet<NodeRef>,

    /// Who read this node.
    dependents: IndexSet<NodeRef>,
}

impl Node {
    /// Create a node for the given graph participant.
    pub fn new(id: NodeRef) -> Self {
        let kind = NodeKind::from(id);
        Self {
            id,
            kind,
            dirty: match kind {
                NodeKind::Source => DirtyState::Clean,
                // Never computed yet
                NodeKind::Derived | NodeKind::Sink => DirtyState::Dirty,
            },
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
        }
    }

    pub fn id(&self) -> NodeRef {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    pub fn is_clean(&self) -> bool {
        self.dirty == DirtyState::Clean
    }

    pub fn mark_clean(&mut self) {
        self.dirty = DirtyState::Clean;
    }

    /// Mark as maybe dirty; never downgrades a `Dirty` node.
    pub fn mark_maybe_dirty(&mut self) {
        if self.dirty == DirtyState::Clean {
            self.dirty = DirtyState::MaybeDirty;
        }
    }

    pub fn mark_dirty(&mut self) {
        // Sources carry no dirty state
        if self.kind != NodeKind::Source {
            self.dirty = DirtyState::Dirty;
        }
    }

    pub fn dependencies(&self) -> &IndexSet<NodeRef> {
        &self.dependencies
    }

    pub fn dependents(&self) -> &IndexSet<NodeRef> {
        &self.dependents
    }

    pub(super) fn dependencies_mut(&mut self) -> &mut IndexSet<NodeRef> {
        &mut self.dependencies
    }

    pub(super) fn dependents_mut(&mut self) -> &mut IndexSet<NodeRef> {
        &mut self.dependents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::arena::Arena;
    use crate::reactive::{MemoId, SignalId};

    #[test]
    fn fresh_nodes_start_by_role() {
        let mut arena = Arena::new();
        let signal = Node::new(NodeRef::Signal(SignalId::new(arena.insert(()))));
        let memo = Node::new(NodeRef::Memo(MemoId::new(arena.insert(()))));

        assert_eq!((signal.kind(), signal.dirty_state()), (NodeKind::Source, DirtyState::Clean));
        assert_eq!((memo.kind(), memo.dirty_state()), (NodeKind::Derived, DirtyState::Dirty));
        assert!(memo.dependencies().is_empty() && memo.dependents().is_empty());
    }

    #[test]
    fn maybe_dirty_never_masks_a_write() {
        let mut arena = Arena::new();
        let mut memo = Node::new(NodeRef::Memo(MemoId::new(arena.insert(()))));
        memo.mark_clean();

        memo.mark_maybe_dirty();
        assert_eq!(memo.dirty_state(), DirtyState::MaybeDirty);

        // A direct write upgrades; a later upstream ripple must not downgrade it.
        memo.mark_dirty();
        memo.mark_maybe_dirty();
        assert_eq!(memo.dirty_state(), DirtyState::Dirty);
    }

    #[test]
    fn sources_ignore_dirty_marks() {
        let mut arena = Arena::new();
        let mut node = Node::new(NodeRef::Signal(SignalId::new(arena.insert(()))));
        node.mark_dirty();
        assert!(node.is_clean());
    }
}
