//! Transaction operations on the runtime.

use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, trace, warn};

use super::coordinator::{SnapshotToken, TxFrame, TxId, TxPhase};
use super::{CommitSummary, TxError};
use crate::error::{HandlerError, StoreError};
use crate::reactive::{panic_message, FrameKind, NodeRef, Runtime, Signal};

impl Runtime {
    /// Open a transaction frame. Nested inside an open one if any.
    pub fn begin(&mut self, name: impl Into<Cow<'static, str>>) -> TxId {
        let name = name.into();
        let id = self.tx.push(name);
        trace!(tx = %id, depth = self.tx.depth(), "transaction opened");
        id
    }

    /// Close the innermost frame.
    ///
    /// A nested frame merges into its parent and returns `None`; the
    /// outermost frame applies the write-set and returns what it did.
    pub fn commit(&mut self, id: TxId) -> Result<Option<CommitSummary>, TxError> {
        let frame = self.pop_innermost(id)?;
        if self.tx.is_open() {
            self.tx.merge_into_parent(frame);
            return Ok(None);
        }
        Ok(Some(self.commit_outermost(frame)))
    }

    /// Discard the innermost frame and everything it wrote.
    pub fn abort(&mut self, id: TxId) -> Result<(), TxError> {
        let frame = self.pop_innermost(id)?;
        self.rollback(frame);
        Ok(())
    }

    /// Abort every frame down to and including `id`.
    pub(crate) fn abort_to(&mut self, id: TxId) {
        while let Some(frame) = self.tx.pop() {
            let done = frame.id == id;
            self.rollback(frame);
            if done {
                break;
            }
        }
    }

    pub fn tx_phase(&self) -> TxPhase {
        self.tx.phase()
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_open()
    }

    /// Run `body` as one transaction.
    ///
    /// Commits when `body` returns `Ok`. When it returns an error or panics,
    /// every write it buffered is discarded and the failure comes back as a
    /// [`TxError`]; the runtime stays usable either way. Called inside
    /// another transaction, the frame is nested and merges into the parent.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// rt.transaction("transfer", |rt| {
    ///     let amount = rt.get(pending);
    ///     rt.update(balance, |b| *b -= amount)?;
    ///     rt.set(pending, 0)?;
    ///     Ok(())
    /// })?;
    /// ```
    pub fn transaction<R, F>(&mut self, name: impl Into<Cow<'static, str>>, body: F) -> Result<R, TxError>
    where
        F: FnOnce(&mut Runtime) -> Result<R, HandlerError>,
    {
        let name = name.into();
        let depth = self.tracking.depth();
        let id = self.begin(name.clone());
        self.tracking.push(FrameKind::Handler);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        self.tracking.truncate(depth);

        match outcome {
            Ok(Ok(value)) => {
                self.close_leaked(id);
                self.commit(id)?;
                Ok(value)
            }
            Ok(Err(source)) => {
                self.abort_to(id);
                warn!(tx = %name, error = %source, "transaction aborted");
                Err(TxError::Aborted { name, source })
            }
            Err(payload) => {
                self.abort_to(id);
                let message = panic_message(payload.as_ref());
                error!(tx = %name, panic = %message, "transaction panicked");
                Err(TxError::Panicked { name, message })
            }
        }
    }

    /// Take a snapshot of committed state.
    ///
    /// Inside a transaction the snapshot shows values as of the start of the
    /// outermost one and stays valid until it ends; taken while idle it stays
    /// valid until the next commit.
    pub fn snapshot(&mut self) -> SnapshotToken {
        self.tx.take_snapshot()
    }

    /// Value of `signal` in the snapshot. Shallow: shares the stored value.
    pub fn snapshot_get<T: Clone + 'static>(&mut self, token: SnapshotToken, signal: Signal<T>) -> Result<T, TxError> {
        let id = signal.id();
        let value = match self.tx.snapshot_value(token, id)? {
            Some(value) => value,
            None => {
                let value = self.committed_value(id)?;
                self.tx.cache_snapshot(token, id, value.clone());
                value
            }
        };
        value.downcast_ref::<T>().cloned().ok_or_else(|| {
            TxError::Store(StoreError::TypeMismatch {
                what: id.to_string(),
                expected: std::any::type_name::<T>(),
                found: "a different type",
            })
        })
    }

    fn pop_innermost(&mut self, id: TxId) -> Result<TxFrame, TxError> {
        match self.tx.innermost_id() {
            Some(innermost) if innermost == id => self.tx.pop().ok_or(TxError::NotOpen),
            Some(_) => Err(TxError::NotInnermost(id)),
            None => Err(TxError::NotOpen),
        }
    }

    /// Abort frames a body opened and never closed.
    fn close_leaked(&mut self, id: TxId) {
        while let Some(innermost) = self.tx.innermost_id() {
            if innermost == id {
                break;
            }
            warn!(tx = %innermost, "transaction left open by its body; aborting");
            if let Some(frame) = self.tx.pop() {
                self.rollback(frame);
            }
        }
    }

    fn commit_outermost(&mut self, frame: TxFrame) -> CommitSummary {
        self.tx.set_transition(Some(TxPhase::Committing));

        let TxFrame {
            id, writes, affected, ..
        } = frame;
        let version = if writes.is_empty() {
            self.tx.version()
        } else {
            self.tx.advance_version()
        };

        let mut written = Vec::with_capacity(writes.len());
        for (signal, value) in writes {
            if let Some(slot) = self.signals.get_mut(signal.key()) {
                slot.value = value;
                slot.version = version;
                written.push(signal);
            }
        }

        // Dependencies may have changed since the writes were buffered
        // (an effect reading what it just wrote), so propagate once more.
        let mut stale = affected;
        for signal in &written {
            stale.extend(self.graph.mark_changed(NodeRef::Signal(*signal)));
        }
        self.queue_sinks(stale);
        self.publish_globals(&written);
        if !written.is_empty() {
            self.tx.expire_snapshots();
        } else {
            self.tx.expire_tx_snapshots();
        }

        self.tx.set_transition(None);
        debug!(tx = %id, version, written = written.len(), "transaction committed");

        CommitSummary {
            tx: id,
            version,
            written: written.len(),
        }
    }

    /// Undo the dirty marks left by a discarded frame.
    fn rollback(&mut self, frame: TxFrame) {
        self.tx.set_transition(Some(TxPhase::Aborting));

        for signal in frame.writes.keys() {
            // Memos that cached a buffered value become dirty again.
            let affected = self.graph.mark_changed(NodeRef::Signal(*signal));
            for node in affected {
                let queued = match node {
                    NodeRef::Component(id) => self.pending_renders.contains(&id),
                    NodeRef::Effect(id) => self.pending_effects.contains(&id),
                    NodeRef::Signal(_) | NodeRef::Memo(_) => continue,
                };
                if !queued && !self.tx.is_affected(node) {
                    self.graph.mark_clean(node);
                }
            }
        }

        if !self.tx.is_open() {
            self.tx.expire_tx_snapshots();
        }
        self.tx.set_transition(None);
        debug!(tx = %frame.id, name = %frame.name, discarded = frame.writes.len(), "transaction rolled back");
    }
}
