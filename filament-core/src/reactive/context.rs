//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a signal is read,
//! we can register the current computation as a dependent.
//!
//! # Implementation
//!
//! Each [`Runtime`](super::Runtime) owns a stack of frames. Entering a render
//! pass, memo, effect or event handler pushes a frame; leaving it pops the
//! frame and hands back whatever was read. The stack lives inside the runtime
//! rather than in a thread-local so that two sessions on the same worker
//! thread never observe each other's frames.
//!
//! Nested frames are normal: a render pass reading a memo pushes the memo's
//! frame on top of the render frame while the memo recomputes.

use smallvec::SmallVec;

use super::ids::{EffectId, InstanceId, MemoId, NodeRef};

/// What kind of computation a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A component render pass. Reads are tracked; writes are rejected.
    Render(InstanceId),
    /// A memo recomputation. Reads are tracked; writes are rejected.
    Memo(MemoId),
    /// An effect body. Reads are tracked; writes are flagged.
    Effect(EffectId),
    /// An event handler or other transactional unit of work. Reads are legal
    /// but not tracked.
    Handler,
    /// An explicitly untracked section.
    Untracked,
}

impl FrameKind {
    /// The graph node that records dependencies for this frame, if any.
    pub fn observer(&self) -> Option<NodeRef> {
        match self {
            FrameKind::Render(id) => Some(NodeRef::Component(*id)),
            FrameKind::Memo(id) => Some(NodeRef::Memo(*id)),
            FrameKind::Effect(id) => Some(NodeRef::Effect(*id)),
            FrameKind::Handler | FrameKind::Untracked => None,
        }
    }
}

/// Memo epochs observed by a computation during its last run.
///
/// A `MaybeDirty` computation compares these against the memos' current
/// epochs to decide whether it actually has to run again.
pub type ObservedEpochs = SmallVec<[(MemoId, u64); 4]>;

/// What one frame read while it was active.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub dependencies: SmallVec<[NodeRef; 8]>,
    pub epochs: ObservedEpochs,
}

/// Stack of active frames for one runtime.
#[derive(Debug, Default)]
pub struct TrackingStack {
    frames: Vec<Frame>,
}

impl TrackingStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: FrameKind) {
        self.frames.push(Frame {
            kind,
            dependencies: SmallVec::new(),
            epochs: SmallVec::new(),
        });
    }

    /// Pop the innermost frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Drop frames until only `depth` remain (used after a caught panic).
    pub fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Check if there is an active context of any kind.
    pub fn is_active(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Frame kinds from innermost to outermost.
    pub fn kinds(&self) -> impl Iterator<Item = FrameKind> + '_ {
        self.frames.iter().rev().map(|frame| frame.kind)
    }

    pub fn current(&self) -> Option<FrameKind> {
        self.frames.last().map(|frame| frame.kind)
    }

    /// Record a dependency for the innermost frame, if it tracks.
    pub fn track(&mut self, node: NodeRef) {
        if let Some(frame) = self.frames.last_mut() {
            if frame.kind.observer().is_some() && !frame.dependencies.contains(&node) {
                frame.dependencies.push(node);
            }
        }
    }

    /// Record a memo dependency together with the epoch that was read.
    pub fn track_memo(&mut self, memo: MemoId, epoch: u64) {
        self.track(NodeRef::Memo(memo));
        if let Some(frame) = self.frames.last_mut() {
            if frame.kind.observer().is_some() && !frame.epochs.iter().any(|(id, _)| *id == memo) {
                frame.epochs.push((memo, epoch));
            }
        }
    }

    /// The innermost render or memo frame anywhere on the stack.
    ///
    /// Writes are illegal while one exists, even from an untracked section
    /// nested inside it.
    pub fn derivation(&self) -> Option<FrameKind> {
        self.frames
            .iter()
            .rev()
            .map(|frame| frame.kind)
            .find(|kind| matches!(kind, FrameKind::Render(_) | FrameKind::Memo(_)))
    }

    /// The innermost effect frame, if the current computation is an effect.
    pub fn current_effect(&self) -> Option<EffectId> {
        match self.current() {
            Some(FrameKind::Effect(id)) => Some(id),
            _ => None,
        }
    }

    /// Memo frames currently on the stack, outermost first.
    pub fn memo_chain(&self) -> Vec<NodeRef> {
        self.frames
            .iter()
            .filter_map(|frame| match frame.kind {
                FrameKind::Memo(id) => Some(NodeRef::Memo(id)),
                _ => None,
            })
            .collect()
    }
}
