//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect is queued; it first runs in the next effect
//!    pass, after the commit that created it has been rendered and sent.
//!
//! 2. When any dependency changes, the commit queues it again.
//!
//! 3. Before re-running, the previous cleanup runs, the previous run's
//!    cancellation token is cancelled and the old dependencies are dropped;
//!    new ones are tracked during execution.
//!
//! 4. Effects queued by one commit run in registration order, each inside its
//!    own nested transaction. A panicking effect is contained: its buffered
//!    writes are discarded and the pass continues.
//!
//! # Writes
//!
//! Writing a signal from inside an effect body is legal but flagged: the
//! write is recorded on the effect and logged, since effects that feed their
//! own inputs are the usual cause of stabilization overruns.
//!
//! # Cleanup
//!
//! Effects can optionally return a cleanup function. It is called before the
//! effect re-runs and when the effect is disposed.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use super::context::{FrameKind, ObservedEpochs};
use super::ids::{EffectId, InstanceId, NodeRef, SignalId};
use super::runtime::Runtime;
use crate::error::UsageError;
use crate::graph::DirtyState;

/// Teardown returned by an effect body.
pub type Cleanup = Box<dyn FnOnce() + Send>;

pub(crate) type EffectFn = Box<dyn FnMut(&mut Runtime) -> Option<Cleanup> + Send>;

/// Handle to a registered effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Effect {
    id: EffectId,
}

impl Effect {
    pub(crate) fn from_id(id: EffectId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> EffectId {
        self.id
    }
}

/// Storage for one effect inside the runtime.
pub struct EffectSlot {
    /// Taken out while the effect runs.
    pub(crate) run: Option<EffectFn>,
    pub(crate) cleanup: Option<Cleanup>,
    /// Registration order.
    pub(crate) seq: u64,
    pub(crate) owner: Option<InstanceId>,
    /// Cancelled when the effect re-runs or is disposed.
    pub(crate) token: CancellationToken,
    /// Signals written during the most recent run.
    pub(crate) wrote: SmallVec<[SignalId; 2]>,
    pub(crate) observed: ObservedEpochs,
    pub(crate) run_count: u64,
    pub(crate) label: Option<String>,
}

impl EffectSlot {
    pub(crate) fn describe(&self, id: EffectId) -> String {
        match &self.label {
            Some(label) => format!("{id} `{label}`"),
            None => id.to_string(),
        }
    }
}

impl fmt::Debug for EffectSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectSlot")
            .field("seq", &self.seq)
            .field("running", &self.run.is_none())
            .field("run_count", &self.run_count)
            .field("owner", &self.owner)
            .finish()
    }
}

/// What one effect pass did.
#[derive(Debug, Default)]
pub(crate) struct EffectPass {
    pub ran: Vec<EffectId>,
    /// Effects that wrote signals, with what they wrote.
    pub writes: Vec<(EffectId, SmallVec<[SignalId; 2]>)>,
    /// Signals committed at the end of the pass.
    pub committed: usize,
}

impl EffectPass {
    pub fn cascaded(&self) -> bool {
        self.committed > 0
    }
}

impl Runtime {
    /// Register a session-owned effect.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let count = rt.create_signal(0);
    /// rt.create_effect(move |rt| {
    ///     tracing::info!(count = rt.get(count), "count changed");
    ///     None
    /// });
    /// ```
    pub fn create_effect<F>(&mut self, run: F) -> Effect
    where
        F: FnMut(&mut Runtime) -> Option<Cleanup> + Send + 'static,
    {
        self.alloc_effect(Box::new(run), None)
    }

    pub(crate) fn alloc_effect(&mut self, run: EffectFn, owner: Option<InstanceId>) -> Effect {
        let seq = self.next_effect_seq;
        self.next_effect_seq += 1;

        let token = self.token_for(owner).child_token();
        let id = EffectId::new(self.effects.insert(EffectSlot {
            run: Some(run),
            cleanup: None,
            seq,
            owner,
            token,
            wrote: SmallVec::new(),
            observed: ObservedEpochs::new(),
            run_count: 0,
            label: None,
        }));
        self.graph.add_node(NodeRef::Effect(id));
        self.pending_effects.insert(id);
        Effect { id }
    }

    pub fn label_effect(&mut self, effect: Effect, label: impl Into<String>) {
        if let Some(slot) = self.effects.get_mut(effect.id.key()) {
            slot.label = Some(label.into());
        }
    }

    /// Run the effect's cleanup, cancel its token and remove it.
    pub fn dispose_effect(&mut self, effect: Effect) {
        self.dispose_effect_id(effect.id);
    }

    pub(crate) fn dispose_effect_id(&mut self, id: EffectId) {
        let Some(mut slot) = self.effects.remove(id.key()) else {
            return;
        };
        slot.token.cancel();
        if let Some(cleanup) = slot.cleanup.take() {
            run_cleanup(id, cleanup);
        }
        self.graph.remove_node(NodeRef::Effect(id));
        self.pending_effects.shift_remove(&id);
    }

    pub fn effect_run_count(&self, effect: Effect) -> u64 {
        self.effects
            .get(effect.id.key())
            .map(|slot| slot.run_count)
            .unwrap_or(0)
    }

    /// Signals the effect wrote during its most recent run.
    pub fn effect_writes(&self, effect: Effect) -> Vec<SignalId> {
        self.effects
            .get(effect.id.key())
            .map(|slot| slot.wrote.to_vec())
            .unwrap_or_default()
    }

    pub fn has_pending_effects(&self) -> bool {
        !self.pending_effects.is_empty()
    }

    pub(crate) fn note_effect_write(&mut self, id: EffectId, signal: SignalId) {
        if let Some(slot) = self.effects.get_mut(id.key()) {
            if !slot.wrote.contains(&signal) {
                slot.wrote.push(signal);
            }
            warn!(effect = %slot.describe(id), %signal, "effect wrote a signal during its run");
        }
    }

    /// Run one effect now. Returns `false` if its body panicked.
    pub(crate) fn run_effect(&mut self, id: EffectId) -> bool {
        let node = NodeRef::Effect(id);
        let owner_token = {
            let owner = self.effects.get(id.key()).and_then(|slot| slot.owner);
            self.token_for(owner).clone()
        };
        let Some(slot) = self.effects.get_mut(id.key()) else {
            return true;
        };
        let Some(mut run) = slot.run.take() else {
            // Already running further up the stack
            return true;
        };

        slot.token.cancel();
        slot.token = owner_token.child_token();
        slot.wrote.clear();
        slot.run_count += 1;
        let cleanup = slot.cleanup.take();
        if let Some(cleanup) = cleanup {
            run_cleanup(id, cleanup);
        }

        let depth = self.tracking.depth();
        self.tracking.push(FrameKind::Effect(id));
        let result = panic::catch_unwind(AssertUnwindSafe(|| run(self)));
        self.tracking.truncate(depth + 1);
        let frame = self.tracking.pop();

        let Some(slot) = self.effects.get_mut(id.key()) else {
            // Disposed by its own body
            return result.is_ok();
        };
        slot.run = Some(run);

        let ok = match result {
            Ok(cleanup) => {
                slot.cleanup = cleanup;
                true
            }
            Err(payload) => {
                error!(
                    effect = %slot.describe(id),
                    panic = %panic_message(payload.as_ref()),
                    "effect panicked"
                );
                false
            }
        };

        let (dependencies, epochs) = frame
            .map(|frame| (frame.dependencies, frame.epochs))
            .unwrap_or_default();
        slot.observed = epochs;

        if let Err(cycle) = self.graph.set_dependencies(node, dependencies) {
            self.report(UsageError::Cycle(cycle));
        }
        self.graph.mark_clean(node);
        trace!(effect = %id, ok, "effect ran");
        ok
    }

    /// Run every queued effect once, in registration order.
    ///
    /// The pass is one transaction; each effect runs in a nested one so a
    /// panicking effect only loses its own writes.
    pub(crate) fn run_effect_pass(&mut self) -> EffectPass {
        let mut pass = EffectPass::default();
        if self.pending_effects.is_empty() {
            return pass;
        }
        if self.tx.is_open() {
            warn!("effect pass requested inside an open transaction; deferred");
            return pass;
        }

        let mut batch: Vec<EffectId> = self.pending_effects.drain(..).collect();
        batch.sort_by_key(|id| {
            self.effects
                .get(id.key())
                .map(|slot| slot.seq)
                .unwrap_or(u64::MAX)
        });

        let outer = self.begin("effects");
        for id in batch {
            let node = NodeRef::Effect(id);
            let due = match self.graph.state(node) {
                Some(DirtyState::Dirty) => true,
                Some(DirtyState::MaybeDirty) => self.needs_rerun(node),
                Some(DirtyState::Clean) | None => false,
            };
            if !due {
                self.graph.mark_clean(node);
                continue;
            }

            let inner = self.begin("effect");
            let ok = self.run_effect(id);
            let closed = if ok {
                self.commit(inner).map(|_| ())
            } else {
                self.abort(inner)
            };
            if let Err(err) = closed {
                warn!(effect = %id, error = %err, "effect transaction did not close cleanly");
            }

            pass.ran.push(id);
            if ok {
                let wrote = self.effects.get(id.key()).map(|slot| slot.wrote.clone());
                if let Some(wrote) = wrote.filter(|wrote| !wrote.is_empty()) {
                    pass.writes.push((id, wrote));
                }
            }
        }

        match self.commit(outer) {
            Ok(Some(summary)) => pass.committed = summary.written,
            Ok(None) => {}
            Err(err) => warn!(error = %err, "effect pass transaction did not commit"),
        }
        pass
    }

    /// Dependency chain explaining why effects are still queued after `pass`.
    pub(crate) fn cascade_chain(&self, pass: &EffectPass) -> Vec<NodeRef> {
        for pending in &self.pending_effects {
            let deps = self.graph.dependencies(NodeRef::Effect(*pending));
            for (writer, wrote) in &pass.writes {
                if let Some(signal) = wrote
                    .iter()
                    .find(|signal| deps.contains(&NodeRef::Signal(**signal)))
                {
                    return vec![
                        NodeRef::Effect(*writer),
                        NodeRef::Signal(*signal),
                        NodeRef::Effect(*pending),
                    ];
                }
            }
        }
        self.pending_effects
            .iter()
            .map(|id| NodeRef::Effect(*id))
            .collect()
    }

    /// Drop every queued effect without running it.
    pub(crate) fn abandon_pending_effects(&mut self) -> usize {
        let pending: Vec<EffectId> = self.pending_effects.drain(..).collect();
        for id in &pending {
            self.graph.mark_clean(NodeRef::Effect(*id));
        }
        pending.len()
    }
}

fn run_cleanup(id: EffectId, cleanup: Cleanup) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cleanup)) {
        error!(
            effect = %id,
            panic = %panic_message(payload.as_ref()),
            "effect cleanup panicked"
        );
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::Cleanup;
    use crate::reactive::Runtime;

    #[test]
    fn effect_runs_on_first_flush() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(0);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = seen.clone();
        let effect = rt.create_effect(move |rt| {
            seen_in.store(rt.get(count), Ordering::SeqCst);
            None
        });

        assert_eq!(rt.effect_run_count(effect), 0);
        rt.flush_effects().unwrap();
        assert_eq!(rt.effect_run_count(effect), 1);

        rt.set(count, 7).unwrap();
        rt.flush_effects().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(rt.effect_run_count(effect), 2);
    }

    #[test]
    fn effect_skips_unrelated_writes() {
        let mut rt = Runtime::default();
        let a = rt.create_signal(1);
        let b = rt.create_signal(1);
        let effect = rt.create_effect(move |rt| {
            rt.get(a);
            None
        });
        rt.flush_effects().unwrap();

        rt.set(b, 2).unwrap();
        rt.flush_effects().unwrap();
        assert_eq!(rt.effect_run_count(effect), 1);
    }

    #[test]
    fn cleanup_runs_before_rerun_and_on_dispose() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(0);
        let cleanups = Arc::new(AtomicUsize::new(0));
        let cleanups_in = cleanups.clone();
        let effect = rt.create_effect(move |rt| {
            rt.get(count);
            let cleanups = cleanups_in.clone();
            let cleanup: Cleanup = Box::new(move || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            });
            Some(cleanup)
        });
        rt.flush_effects().unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);

        rt.set(count, 1).unwrap();
        rt.flush_effects().unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        rt.dispose_effect(effect);
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn effects_run_in_registration_order() {
        let mut rt = Runtime::default();
        let trigger = rt.create_signal(0);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            rt.create_effect(move |rt| {
                rt.get(trigger);
                order.lock().push(name);
                None
            });
        }
        rt.flush_effects().unwrap();
        order.lock().clear();

        rt.set(trigger, 1).unwrap();
        rt.flush_effects().unwrap();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn writes_inside_effects_are_flagged_and_cascade() {
        let mut rt = Runtime::default();
        let source = rt.create_signal(1);
        let mirror = rt.create_signal(0);
        let writer = rt.create_effect(move |rt| {
            let value = rt.get(source);
            rt.set(mirror, value * 10).unwrap();
            None
        });

        rt.flush_effects().unwrap();
        assert_eq!(rt.peek(mirror), 10);
        assert_eq!(rt.effect_writes(writer), vec![mirror.id()]);
    }

    #[test]
    fn panicking_effect_loses_only_its_own_writes() {
        let mut rt = Runtime::default();
        let a = rt.create_signal(0);
        let b = rt.create_signal(0);
        rt.create_effect(move |rt| {
            rt.set(a, 1).unwrap();
            panic!("effect failure");
        });
        rt.create_effect(move |rt| {
            rt.set(b, 2).unwrap();
            None
        });

        rt.flush_effects().unwrap();
        assert_eq!(rt.peek(a), 0);
        assert_eq!(rt.peek(b), 2);
    }

    #[test]
    fn self_triggering_effect_is_bounded() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(0u32);
        rt.create_effect(move |rt| {
            let value = rt.get(count);
            rt.set(count, value + 1).unwrap();
            None
        });

        let err = rt.flush_effects().unwrap_err();
        assert_eq!(err.cycles, 16);
        assert!(!err.chain.is_empty());
        assert!(!rt.has_pending_effects());
    }
}
