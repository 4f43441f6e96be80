//! Memo Implementation
//!
//! A Memo is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Memos Work
//!
//! 1. On first read, the memo runs its computation inside a tracking frame
//!    and caches the result together with everything it read.
//!
//! 2. When read again with nothing upstream changed, the cache is returned.
//!
//! 3. When a signal it reads is written, the memo is marked `Dirty`; memos
//!    further downstream are only `MaybeDirty`.
//!
//! 4. A `MaybeDirty` memo refreshes the memos it read and compares their
//!    epochs with the ones it saw last time. If none moved, it is marked
//!    clean without recomputing.
//!
//! 5. The epoch only advances when a recompute yields a value that is not
//!    equal to the cached one, so equal results stop propagation.
//!
//! Dependencies are captured fresh on every run and replace the previous
//! set entirely.

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::trace;

use super::context::{FrameKind, ObservedEpochs};
use super::ids::{InstanceId, MemoId, NodeRef};
use super::runtime::Runtime;
use super::signal::Value;
use crate::error::{StoreError, UsageError};
use crate::graph::{CycleError, DirtyState};

pub(crate) type ComputeFn = Box<dyn FnMut(&mut Runtime) -> Value + Send>;

/// A cached derived value of type `T`.
///
/// Like [`Signal`](super::Signal), this is a `Copy` handle into the runtime.
pub struct Memo<T> {
    id: MemoId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Memo<T> {
    pub(crate) fn from_id(id: MemoId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> MemoId {
        self.id
    }
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Memo<T> {}

impl<T> PartialEq for Memo<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Memo<T> {}

impl<T> fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("id", &self.id)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Storage for one memo inside the runtime.
pub struct MemoSlot {
    /// Taken out while the computation runs; `None` here means re-entry.
    pub(crate) compute: Option<ComputeFn>,
    pub(crate) value: Option<Value>,
    /// Advances each time the cached value changes.
    pub(crate) epoch: u64,
    pub(crate) eq: fn(&Value, &Value) -> bool,
    pub(crate) observed: ObservedEpochs,
    pub(crate) owner: Option<InstanceId>,
    pub(crate) label: Option<String>,
    pub(crate) type_id: TypeId,
    pub(crate) recomputes: u64,
}

impl MemoSlot {
    fn new<T: PartialEq + Send + Sync + 'static>(compute: ComputeFn, owner: Option<InstanceId>) -> Self {
        Self {
            compute: Some(compute),
            value: None,
            epoch: 0,
            eq: value_eq::<T>,
            observed: ObservedEpochs::new(),
            owner,
            label: None,
            type_id: TypeId::of::<T>(),
            recomputes: 0,
        }
    }

    pub(crate) fn describe(&self, id: MemoId) -> String {
        match &self.label {
            Some(label) => format!("{id} `{label}`"),
            None => id.to_string(),
        }
    }
}

impl fmt::Debug for MemoSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoSlot")
            .field("epoch", &self.epoch)
            .field("computing", &self.compute.is_none())
            .field("cached", &self.value.is_some())
            .field("owner", &self.owner)
            .finish()
    }
}

fn value_eq<T: PartialEq + 'static>(a: &Value, b: &Value) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl Runtime {
    /// Create a memo owned by the session.
    ///
    /// The computation does not run until the memo is first read.
    pub fn create_memo<T, F>(&mut self, compute: F) -> Memo<T>
    where
        T: PartialEq + Send + Sync + 'static,
        F: FnMut(&mut Runtime) -> T + Send + 'static,
    {
        self.alloc_memo(compute, None)
    }

    pub(crate) fn alloc_memo<T, F>(&mut self, mut compute: F, owner: Option<InstanceId>) -> Memo<T>
    where
        T: PartialEq + Send + Sync + 'static,
        F: FnMut(&mut Runtime) -> T + Send + 'static,
    {
        let compute: ComputeFn = Box::new(move |rt| Arc::new(compute(rt)) as Value);
        let id = MemoId::new(self.memos.insert(MemoSlot::new::<T>(compute, owner)));
        self.graph.add_node(NodeRef::Memo(id));
        Memo::from_id(id)
    }

    /// Attach a diagnostic label to a memo.
    pub fn label_memo<T>(&mut self, memo: Memo<T>, label: impl Into<String>) {
        if let Some(slot) = self.memos.get_mut(memo.id().key()) {
            slot.label = Some(label.into());
        }
    }

    pub fn dispose_memo<T>(&mut self, memo: Memo<T>) {
        self.dispose_memo_id(memo.id());
    }

    pub(crate) fn dispose_memo_id(&mut self, id: MemoId) {
        if self.memos.remove(id.key()).is_some() {
            self.graph.remove_node(NodeRef::Memo(id));
        }
    }

    /// Current dirty state of a memo, `None` once disposed.
    pub fn memo_state<T>(&self, memo: Memo<T>) -> Option<DirtyState> {
        if !self.memos.contains(memo.id().key()) {
            return None;
        }
        self.graph.state(NodeRef::Memo(memo.id()))
    }

    /// How many times the memo's computation has run.
    pub fn memo_recomputes<T>(&self, memo: Memo<T>) -> u64 {
        self.memos
            .get(memo.id().key())
            .map(|slot| slot.recomputes)
            .unwrap_or(0)
    }

    /// Bring a memo up to date and return its value and epoch.
    pub(crate) fn refresh_memo(&mut self, id: MemoId) -> Result<(Value, u64), StoreError> {
        let node = NodeRef::Memo(id);
        let slot = self
            .memos
            .get(id.key())
            .ok_or_else(|| StoreError::Disposed(id.to_string()))?;

        if let Some(value) = &slot.value {
            let cached = (value.clone(), slot.epoch);
            match self.graph.state(node).unwrap_or(DirtyState::Dirty) {
                DirtyState::Clean => return Ok(cached),
                DirtyState::MaybeDirty => {
                    if !self.needs_rerun(node) {
                        self.graph.mark_clean(node);
                        return Ok(cached);
                    }
                }
                DirtyState::Dirty => {}
            }
        }

        self.recompute_memo(id)
    }

    fn recompute_memo(&mut self, id: MemoId) -> Result<(Value, u64), StoreError> {
        let node = NodeRef::Memo(id);
        let slot = self
            .memos
            .get_mut(id.key())
            .ok_or_else(|| StoreError::Disposed(id.to_string()))?;

        let Some(mut compute) = slot.compute.take() else {
            // Re-entered while computing
            let mut chain = self.tracking.memo_chain();
            let start = chain.iter().position(|n| *n == node).unwrap_or(0);
            chain.drain(..start);
            chain.push(node);
            let err = UsageError::Cycle(CycleError { chain });
            self.report(err.clone());
            return Err(err.into());
        };

        let depth = self.tracking.depth();
        self.tracking.push(FrameKind::Memo(id));
        let result = panic::catch_unwind(AssertUnwindSafe(|| compute(self)));
        self.tracking.truncate(depth + 1);
        let frame = self.tracking.pop();

        let Some(slot) = self.memos.get_mut(id.key()) else {
            return Err(StoreError::Disposed(id.to_string()));
        };
        slot.compute = Some(compute);

        let value = match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        };

        let changed = match &slot.value {
            Some(old) => !(slot.eq)(old, &value),
            None => true,
        };
        if changed {
            slot.epoch += 1;
        }
        slot.value = Some(value.clone());
        slot.recomputes += 1;
        let epoch = slot.epoch;

        let (dependencies, epochs) = frame
            .map(|frame| (frame.dependencies, frame.epochs))
            .unwrap_or_default();
        slot.observed = epochs;

        trace!(memo = %id, epoch, changed, "memo recomputed");

        if let Err(cycle) = self.graph.set_dependencies(node, dependencies) {
            self.report(UsageError::Cycle(cycle));
        }
        self.graph.mark_clean(node);

        Ok((value, epoch))
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use crate::graph::DirtyState;
    use crate::reactive::Runtime;

    #[test]
    fn memo_is_lazy_and_cached() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(2);
        let doubled = rt.create_memo(move |rt| rt.get(count) * 2);

        assert_eq!(rt.memo_recomputes(doubled), 0);
        assert_eq!(rt.peek(doubled), 4);
        assert_eq!(rt.peek(doubled), 4);
        assert_eq!(rt.memo_recomputes(doubled), 1);
    }

    #[test]
    fn memo_recomputes_after_write() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(1);
        let doubled = rt.create_memo(move |rt| rt.get(count) * 2);
        assert_eq!(rt.peek(doubled), 2);

        rt.set(count, 5).unwrap();
        assert_eq!(rt.memo_state(doubled), Some(DirtyState::Dirty));
        assert_eq!(rt.peek(doubled), 10);
        assert_eq!(rt.memo_state(doubled), Some(DirtyState::Clean));
    }

    #[test]
    fn equal_results_stop_propagation() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(3);
        let parity = rt.create_memo(move |rt| rt.get(count) % 2);
        let label = rt.create_memo(move |rt| {
            if rt.get(parity) == 0 {
                "even"
            } else {
                "odd"
            }
        });

        assert_eq!(rt.peek(label), "odd");
        rt.set(count, 5).unwrap();
        assert_eq!(rt.memo_state(label), Some(DirtyState::MaybeDirty));

        assert_eq!(rt.peek(label), "odd");
        assert_eq!(rt.memo_recomputes(parity), 2);
        assert_eq!(rt.memo_recomputes(label), 1);
    }

    #[test]
    fn dependencies_are_replaced_each_run() {
        let mut rt = Runtime::default();
        let flag = rt.create_signal(true);
        let a = rt.create_signal(1);
        let b = rt.create_signal(2);
        let pick = rt.create_memo(move |rt| if rt.get(flag) { rt.get(a) } else { rt.get(b) });

        assert_eq!(rt.peek(pick), 1);
        assert_eq!(rt.subscriber_count(a), 1);
        assert_eq!(rt.subscriber_count(b), 0);

        rt.set(flag, false).unwrap();
        assert_eq!(rt.peek(pick), 2);
        assert_eq!(rt.subscriber_count(a), 0);
        assert_eq!(rt.subscriber_count(b), 1);
    }

    #[test]
    fn self_referential_memo_reports_cycle() {
        let mut rt = Runtime::default();
        let slot = rt.create_signal(None);
        let memo = rt.create_memo(move |rt| match rt.get(slot) {
            Some(inner) => rt.try_get(inner).unwrap_or(-1),
            None => 0,
        });
        rt.set(slot, Some(memo)).unwrap();

        assert_eq!(rt.peek(memo), -1);
        assert!(rt
            .diagnostics()
            .iter()
            .any(|err| matches!(err, crate::error::UsageError::Cycle(_))));
    }
}
