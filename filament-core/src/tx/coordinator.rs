//! Transaction frames, version counter and snapshot table.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use indexmap::{IndexMap, IndexSet};

use super::TxError;
use crate::reactive::{NodeRef, SignalId, Value};

/// Identifies one transaction frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Identifies a snapshot taken with [`Runtime::snapshot`](crate::reactive::Runtime::snapshot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotToken(u64);

impl fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot#{}", self.0)
    }
}

/// Where the coordinator is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Idle,
    Open,
    Nested,
    Committing,
    Aborting,
}

/// One open transaction.
#[derive(Debug)]
pub struct TxFrame {
    pub id: TxId,
    pub name: Cow<'static, str>,
    /// Buffered writes, in first-write order.
    pub writes: IndexMap<SignalId, Value>,
    /// Nodes marked stale by the buffered writes.
    pub affected: IndexSet<NodeRef>,
    /// Committed version when the frame opened.
    pub base_version: u64,
}

#[derive(Debug)]
struct Snapshot {
    /// Taken inside a transaction; expires when that transaction ends.
    in_tx: bool,
    /// Committed values resolved so far.
    cache: HashMap<SignalId, Value>,
}

/// Frame stack and bookkeeping for one runtime.
#[derive(Debug)]
pub struct TxCoordinator {
    frames: Vec<TxFrame>,
    version: u64,
    next_id: u64,
    transition: Option<TxPhase>,
    snapshots: HashMap<SnapshotToken, Snapshot>,
    next_snapshot: u64,
}

impl TxCoordinator {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            version: 0,
            next_id: 1,
            transition: None,
            snapshots: HashMap::new(),
            next_snapshot: 1,
        }
    }

    /// Committed version counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_open(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn phase(&self) -> TxPhase {
        if let Some(phase) = self.transition {
            return phase;
        }
        match self.frames.len() {
            0 => TxPhase::Idle,
            1 => TxPhase::Open,
            _ => TxPhase::Nested,
        }
    }

    pub fn frames(&self) -> &[TxFrame] {
        &self.frames
    }

    pub fn innermost_id(&self) -> Option<TxId> {
        self.frames.last().map(|frame| frame.id)
    }

    pub(crate) fn set_transition(&mut self, phase: Option<TxPhase>) {
        self.transition = phase;
    }

    pub(crate) fn push(&mut self, name: Cow<'static, str>) -> TxId {
        let id = TxId(self.next_id);
        self.next_id += 1;
        self.frames.push(TxFrame {
            id,
            name,
            writes: IndexMap::new(),
            affected: IndexSet::new(),
            base_version: self.version,
        });
        id
    }

    pub(crate) fn pop(&mut self) -> Option<TxFrame> {
        self.frames.pop()
    }

    /// Buffer a write in the innermost frame.
    pub(crate) fn buffer(&mut self, id: SignalId, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.writes.insert(id, value);
        }
    }

    pub(crate) fn note_affected(&mut self, nodes: impl IntoIterator<Item = NodeRef>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.affected.extend(nodes);
        }
    }

    /// Most recent buffered value for `id` across all open frames.
    pub fn buffered(&self, id: SignalId) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.writes.get(&id))
    }

    /// Whether a still-open frame marked `node` stale.
    pub fn is_affected(&self, node: NodeRef) -> bool {
        self.frames.iter().any(|frame| frame.affected.contains(&node))
    }

    /// Fold a closed nested frame into its parent.
    pub(crate) fn merge_into_parent(&mut self, frame: TxFrame) {
        if let Some(parent) = self.frames.last_mut() {
            for (id, value) in frame.writes {
                parent.writes.insert(id, value);
            }
            parent.affected.extend(frame.affected);
        }
    }

    pub(crate) fn advance_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub(crate) fn take_snapshot(&mut self) -> SnapshotToken {
        let token = SnapshotToken(self.next_snapshot);
        self.next_snapshot += 1;
        self.snapshots.insert(
            token,
            Snapshot {
                in_tx: self.is_open(),
                cache: HashMap::new(),
            },
        );
        token
    }

    /// Cached value of `id` in the snapshot, `None` if not resolved yet.
    pub(crate) fn snapshot_value(&self, token: SnapshotToken, id: SignalId) -> Result<Option<Value>, TxError> {
        self.snapshots
            .get(&token)
            .map(|snapshot| snapshot.cache.get(&id).cloned())
            .ok_or(TxError::SnapshotExpired(token))
    }

    pub(crate) fn cache_snapshot(&mut self, token: SnapshotToken, id: SignalId, value: Value) {
        if let Some(snapshot) = self.snapshots.get_mut(&token) {
            snapshot.cache.insert(id, value);
        }
    }

    /// Committed storage changed; every snapshot is now stale.
    pub(crate) fn expire_snapshots(&mut self) {
        self.snapshots.clear();
    }

    /// The outermost transaction ended without committing.
    pub(crate) fn expire_tx_snapshots(&mut self) {
        self.snapshots.retain(|_, snapshot| !snapshot.in_tx);
    }

    pub fn live_snapshots(&self) -> usize {
        self.snapshots.len()
    }
}

impl Default for TxCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::arena::Arena;
    use std::sync::Arc;

    fn signal(arena: &mut Arena<()>) -> SignalId {
        SignalId::new(arena.insert(()))
    }

    #[test]
    fn phases_follow_frame_depth() {
        let mut tx = TxCoordinator::new();
        assert_eq!(tx.phase(), TxPhase::Idle);
        tx.push("outer".into());
        assert_eq!(tx.phase(), TxPhase::Open);
        tx.push("inner".into());
        assert_eq!(tx.phase(), TxPhase::Nested);
        tx.set_transition(Some(TxPhase::Committing));
        assert_eq!(tx.phase(), TxPhase::Committing);
    }

    #[test]
    fn inner_writes_shadow_outer_ones() {
        let mut arena = Arena::new();
        let id = signal(&mut arena);
        let mut tx = TxCoordinator::new();

        tx.push("outer".into());
        tx.buffer(id, Arc::new(1));
        tx.push("inner".into());
        tx.buffer(id, Arc::new(2));
        assert_eq!(tx.buffered(id).and_then(|v| v.downcast_ref::<i32>()), Some(&2));

        let inner = tx.pop().unwrap();
        assert_eq!(tx.buffered(id).and_then(|v| v.downcast_ref::<i32>()), Some(&1));
        tx.merge_into_parent(inner);
        assert_eq!(tx.buffered(id).and_then(|v| v.downcast_ref::<i32>()), Some(&2));
    }

    #[test]
    fn snapshots_taken_in_tx_expire_with_it() {
        let mut tx = TxCoordinator::new();
        let idle = tx.take_snapshot();
        tx.push("outer".into());
        let inside = tx.take_snapshot();
        tx.pop();
        tx.expire_tx_snapshots();

        let mut arena = Arena::new();
        let id = signal(&mut arena);
        assert!(tx.snapshot_value(idle, id).is_ok());
        assert!(matches!(tx.snapshot_value(inside, id), Err(TxError::SnapshotExpired(_))));

        tx.expire_snapshots();
        assert!(tx.snapshot_value(idle, id).is_err());
    }
}
