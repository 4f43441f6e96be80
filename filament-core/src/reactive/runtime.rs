//! Reactive Runtime
//!
//! The runtime is the per-session store that connects signals, memos,
//! effects and component instances. It owns the dependency graph, the
//! tracking stack and the transaction coordinator, and everything reaches
//! them through `&mut Runtime`: there are no ambient globals.
//!
//! # How It Works
//!
//! 1. Reading a signal or memo inside a render, memo or effect frame records
//!    the read on that frame. When the frame closes, its reads replace the
//!    computation's dependency edges in the graph.
//!
//! 2. Writing a signal buffers the value in the open transaction (opening a
//!    single-write one if none is open) and marks downstream nodes dirty.
//!    Reads inside the transaction see the buffered value.
//!
//! 3. The outermost commit makes the write-set visible at once, advances the
//!    version counter and queues every dirty component and effect.
//!
//! 4. Memos are lazy: they recompute on the next read that finds them stale.
//!
//! # Threading
//!
//! A runtime is owned by exactly one session loop. It is `Send` so the loop
//! task may migrate between worker threads, but it is never shared. Writes
//! check the thread the owning loop bound last; off-loop work must come back
//! through the session handle instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use indexmap::IndexSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::arena::Arena;
use super::context::{FrameKind, ObservedEpochs, TrackingStack};
use super::effect::{EffectPass, EffectSlot};
use super::global::GlobalSignals;
use super::ids::{EffectId, InstanceId, MemoId, NodeRef, SignalId};
use super::memo::{Memo, MemoSlot};
use super::signal::{PersistCodec, PersistError, Scope, Signal, SignalOptions, SignalSlot, Value};
use crate::config::{Mode, RuntimeConfig, UsagePolicy};
use crate::error::{StoreError, UsageError};
use crate::graph::UpdateScheduler;
use crate::render::ComponentInstance;
use crate::session::{AsyncSlot, TaskSpawner};
use crate::tx::{OverrunError, TxCoordinator};

static RUNTIME_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

mod sealed {
    pub trait Sealed {}
}

/// A reactive source that can be read through the runtime.
///
/// Implemented for [`Signal<T>`] and [`Memo<T>`].
pub trait Readable: Copy + sealed::Sealed {
    type Value: 'static;

    #[doc(hidden)]
    fn read_raw(self, rt: &mut Runtime, track: bool) -> Result<Value, StoreError>;

    #[doc(hidden)]
    fn describe(&self) -> String;
}

impl<T> sealed::Sealed for Signal<T> {}

impl<T: 'static> Readable for Signal<T> {
    type Value = T;

    fn read_raw(self, rt: &mut Runtime, track: bool) -> Result<Value, StoreError> {
        rt.read_signal(self.id(), track)
    }

    fn describe(&self) -> String {
        self.id().to_string()
    }
}

impl<T> sealed::Sealed for Memo<T> {}

impl<T: 'static> Readable for Memo<T> {
    type Value = T;

    fn read_raw(self, rt: &mut Runtime, track: bool) -> Result<Value, StoreError> {
        rt.read_memo(self.id(), track)
    }

    fn describe(&self) -> String {
        self.id().to_string()
    }
}

/// The reactive store of one session.
pub struct Runtime {
    id: u64,
    pub(crate) signals: Arena<SignalSlot>,
    pub(crate) memos: Arena<MemoSlot>,
    pub(crate) effects: Arena<EffectSlot>,
    pub(crate) instances: Arena<ComponentInstance>,
    pub(crate) asyncs: Arena<AsyncSlot>,
    pub(crate) graph: UpdateScheduler,
    pub(crate) tracking: TrackingStack,
    pub(crate) tx: TxCoordinator,
    /// Effects queued by commits, run by the next effect pass.
    pub(crate) pending_effects: IndexSet<EffectId>,
    /// Component instances queued by commits, rendered by the next pass.
    pub(crate) pending_renders: IndexSet<InstanceId>,
    pub(crate) next_effect_seq: u64,
    pub(crate) max_commit_cycles: usize,
    pub(crate) spawner: Option<TaskSpawner>,
    session_keys: HashMap<String, SignalId>,
    global_keys: HashMap<String, SignalId>,
    globals: Arc<GlobalSignals>,
    /// Persisted values not currently held by a live signal.
    restored: HashMap<String, Vec<u8>>,
    token: CancellationToken,
    owner: Option<ThreadId>,
    mode: Mode,
    policy: UsagePolicy,
    detect_cross_thread: bool,
    diagnostics: Vec<UsageError>,
    invalidated: Option<String>,
}

impl Runtime {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            id: RUNTIME_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            signals: Arena::new(),
            memos: Arena::new(),
            effects: Arena::new(),
            instances: Arena::new(),
            asyncs: Arena::new(),
            graph: UpdateScheduler::new(),
            tracking: TrackingStack::new(),
            tx: TxCoordinator::new(),
            pending_effects: IndexSet::new(),
            pending_renders: IndexSet::new(),
            next_effect_seq: 0,
            max_commit_cycles: config.max_commit_cycles,
            spawner: None,
            session_keys: HashMap::new(),
            global_keys: HashMap::new(),
            globals: Arc::new(GlobalSignals::new()),
            restored: HashMap::new(),
            token: CancellationToken::new(),
            owner: Some(thread::current().id()),
            mode: config.mode,
            policy: config.usage_policy,
            detect_cross_thread: config.detect_cross_thread(),
            diagnostics: Vec::new(),
            invalidated: None,
        }
    }

    /// Process-unique id of this runtime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Share a process-wide signal table with other runtimes.
    #[must_use]
    pub fn with_globals(mut self, globals: Arc<GlobalSignals>) -> Self {
        self.globals = globals;
        self
    }

    /// Seed persisted values, keyed by persistence key.
    pub fn restore(&mut self, values: HashMap<String, Vec<u8>>) {
        self.restored.extend(values);
    }

    /// Hand the runtime its loop's spawner; enables off-loop work and global
    /// signal delivery.
    pub(crate) fn attach_spawner(&mut self, spawner: TaskSpawner) {
        for key in self.global_keys.keys() {
            self.globals.subscribe(key, self.id, spawner.handle().clone());
        }
        self.spawner = Some(spawner);
    }

    /// Declare the calling thread the only one allowed to mutate this runtime.
    ///
    /// The session loop calls this at the start of every unit of work.
    pub fn bind_to_current_thread(&mut self) {
        self.owner = Some(thread::current().id());
    }

    /// Root cancellation token; cancelled when the session shuts down.
    pub fn session_token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn token_for(&self, owner: Option<InstanceId>) -> &CancellationToken {
        owner
            .and_then(|id| self.instances.get(id.key()))
            .map(|instance| &instance.token)
            .unwrap_or(&self.token)
    }

    /// Token scoped to the computation currently running.
    pub fn current_token(&self) -> CancellationToken {
        for kind in self.tracking.kinds() {
            match kind {
                FrameKind::Effect(id) => {
                    if let Some(slot) = self.effects.get(id.key()) {
                        return slot.token.clone();
                    }
                }
                FrameKind::Render(id) => return self.token_for(Some(id)).clone(),
                _ => {}
            }
        }
        self.token.clone()
    }

    // ---- Diagnostics ----

    /// Record a usage error and apply the configured policy.
    pub(crate) fn report(&mut self, err: UsageError) {
        match self.mode {
            Mode::Development => error!(error = %err, "usage error"),
            Mode::Production => warn!(error = %err, "usage error"),
        }
        if self.mode == Mode::Production && self.policy == UsagePolicy::InvalidateSession {
            self.invalidate(err.to_string());
        }
        self.diagnostics.push(err);
    }

    /// Usage errors recorded so far.
    pub fn diagnostics(&self) -> &[UsageError] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<UsageError> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Mark the session as no longer usable. The loop shuts down after the
    /// current unit of work.
    pub fn invalidate(&mut self, reason: impl Into<String>) {
        if self.invalidated.is_none() {
            let reason = reason.into();
            error!(%reason, "session invalidated");
            self.invalidated = Some(reason);
        }
    }

    pub fn invalidation(&self) -> Option<&str> {
        self.invalidated.as_deref()
    }

    fn check_owner(&mut self, target: impl FnOnce() -> String) -> Result<(), StoreError> {
        if !self.detect_cross_thread {
            return Ok(());
        }
        let current = thread::current().id();
        match self.owner {
            Some(owner) if owner != current => {
                let err = UsageError::CrossThreadMutation {
                    target: target(),
                    owner: format!("{owner:?}"),
                    current: format!("{current:?}"),
                };
                self.report(err.clone());
                Err(err.into())
            }
            _ => Ok(()),
        }
    }

    // ---- Signals ----

    /// Create a session-owned signal.
    pub fn create_signal<T: Send + Sync + 'static>(&mut self, value: T) -> Signal<T> {
        self.alloc_signal(value, Scope::Session, SignalOptions::default(), None)
    }

    pub fn create_signal_with<T: Send + Sync + 'static>(
        &mut self,
        options: SignalOptions,
        value: T,
    ) -> Signal<T> {
        self.alloc_signal(value, Scope::Session, options, None)
    }

    pub(crate) fn alloc_signal<T: Send + Sync + 'static>(
        &mut self,
        value: T,
        scope: Scope,
        options: SignalOptions,
        codec: Option<PersistCodec>,
    ) -> Signal<T> {
        let mut slot = SignalSlot::new(value, scope, self.tx.version());
        slot.persist_key = options.persist_key;
        slot.transient = options.transient;
        slot.label = options.label;
        slot.codec = codec;
        let id = SignalId::new(self.signals.insert(slot));
        self.graph.add_node(NodeRef::Signal(id));
        Signal::from_id(id)
    }

    /// Allocate a persisted signal, seeded from restored state when present.
    pub(crate) fn alloc_persisted<T>(
        &mut self,
        key: &str,
        scope: Scope,
        init: impl FnOnce() -> T,
    ) -> Result<Signal<T>, StoreError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let codec = PersistCodec::of::<T>();
        let restored = match self.restored.remove(key) {
            Some(bytes) => Some(decode_restored::<T>(&codec, key, &bytes)?),
            None => None,
        };
        let value = restored.unwrap_or_else(init);
        Ok(self.alloc_signal(value, scope, SignalOptions::new().persist(key), Some(codec)))
    }

    /// Get or create the session signal stored under `key`.
    pub fn session_signal<T: Send + Sync + 'static>(
        &mut self,
        key: &str,
        init: impl FnOnce() -> T,
    ) -> Result<Signal<T>, StoreError> {
        if let Some(&id) = self.session_keys.get(key) {
            if self.signals.contains(id.key()) {
                self.expect_type::<T>(id)?;
                return Ok(Signal::from_id(id));
            }
        }
        let signal = self.alloc_signal(init(), Scope::Session, SignalOptions::new().label(key), None);
        self.session_keys.insert(key.to_string(), signal.id());
        Ok(signal)
    }

    /// Get or create a durable session signal stored under `key`.
    ///
    /// The value is included in session snapshots and seeded from them when
    /// a session is resumed.
    pub fn persisted_signal<T>(&mut self, key: &str, init: impl FnOnce() -> T) -> Result<Signal<T>, StoreError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if let Some(&id) = self.session_keys.get(key) {
            if self.signals.contains(id.key()) {
                self.expect_type::<T>(id)?;
                return Ok(Signal::from_id(id));
            }
        }
        let signal = self.alloc_persisted(key, Scope::Session, init)?;
        self.session_keys.insert(key.to_string(), signal.id());
        Ok(signal)
    }

    /// Mirror the process-wide cell `key` into this session.
    ///
    /// Commits that write the returned signal publish the new value to every
    /// other session mirroring the same key.
    pub fn global_signal<T: Send + Sync + 'static>(
        &mut self,
        key: &str,
        init: impl FnOnce() -> T,
    ) -> Result<Signal<T>, StoreError> {
        if let Some(&id) = self.global_keys.get(key) {
            if self.signals.contains(id.key()) {
                self.expect_type::<T>(id)?;
                return Ok(Signal::from_id(id));
            }
        }

        let value = self.globals.get_or_init(key, init)?;
        let mut slot = SignalSlot::new((), Scope::Global, self.tx.version());
        slot.value = value;
        slot.type_id = std::any::TypeId::of::<T>();
        slot.type_name = std::any::type_name::<T>();
        slot.global_key = Some(key.to_string());
        slot.label = Some(key.to_string());
        let id = SignalId::new(self.signals.insert(slot));
        self.graph.add_node(NodeRef::Signal(id));
        self.global_keys.insert(key.to_string(), id);

        if let Some(spawner) = &self.spawner {
            self.globals.subscribe(key, self.id, spawner.handle().clone());
        }
        Ok(Signal::from_id(id))
    }

    /// Apply a value another session published for a global key.
    pub(crate) fn apply_global(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        let Some(&id) = self.global_keys.get(key) else {
            return Ok(());
        };
        let current = self.signal_value(id)?;
        if Arc::ptr_eq(&current, &value) {
            return Ok(());
        }
        self.write_value(id, value)
    }

    /// Publish committed writes of global mirrors.
    pub(crate) fn publish_globals(&mut self, written: &[SignalId]) {
        for id in written {
            let Some(slot) = self.signals.get(id.key()) else {
                continue;
            };
            if let Some(key) = &slot.global_key {
                let notified = self.globals.publish(key, slot.value.clone(), Some(self.id));
                debug!(key = %key, notified, "published global signal");
            }
        }
    }

    fn expect_type<T: 'static>(&self, id: SignalId) -> Result<(), StoreError> {
        match self.signals.get(id.key()) {
            Some(slot) if slot.type_id == std::any::TypeId::of::<T>() => Ok(()),
            Some(slot) => Err(StoreError::TypeMismatch {
                what: slot.describe(id),
                expected: std::any::type_name::<T>(),
                found: slot.type_name,
            }),
            None => Err(StoreError::Disposed(id.to_string())),
        }
    }

    pub fn label_signal<T>(&mut self, signal: Signal<T>, label: impl Into<String>) {
        if let Some(slot) = self.signals.get_mut(signal.id().key()) {
            slot.label = Some(label.into());
        }
    }

    pub fn dispose_signal<T>(&mut self, signal: Signal<T>) {
        self.dispose_signal_id(signal.id());
    }

    pub(crate) fn dispose_signal_id(&mut self, id: SignalId) {
        let Some(slot) = self.signals.remove(id.key()) else {
            return;
        };
        if let (true, Some(key), Some(codec)) = (slot.is_durable(), &slot.persist_key, &slot.codec) {
            match codec.encode(key, &slot.value) {
                Ok(bytes) => {
                    self.restored.insert(key.clone(), bytes);
                }
                Err(err) => warn!(key = %key, error = %err, "dropping persisted value"),
            }
        }
        if let Some(key) = &slot.global_key {
            self.global_keys.remove(key);
            self.globals.unsubscribe(key, self.id);
        }
        self.graph.remove_node(NodeRef::Signal(id));
    }

    /// Encoded values of every durable signal, live or previously disposed.
    pub fn persisted_values(&self) -> Result<HashMap<String, Vec<u8>>, PersistError> {
        let mut values = self.restored.clone();
        for (_, slot) in self.signals.iter() {
            if !slot.is_durable() {
                continue;
            }
            if let (Some(key), Some(codec)) = (&slot.persist_key, &slot.codec) {
                values.insert(key.clone(), codec.encode(key, &slot.value)?);
            }
        }
        Ok(values)
    }

    // ---- Reads ----

    /// Read a signal or memo and track it in the current computation.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been disposed or a memo forms a cycle. Use
    /// [`try_get`](Self::try_get) to handle those cases.
    pub fn get<R>(&mut self, source: R) -> R::Value
    where
        R: Readable,
        R::Value: Clone,
    {
        match self.try_get(source) {
            Ok(value) => value,
            Err(err) => panic!("failed to read {}: {err}", source.describe()),
        }
    }

    pub fn try_get<R>(&mut self, source: R) -> Result<R::Value, StoreError>
    where
        R: Readable,
        R::Value: Clone,
    {
        self.try_with(source, Clone::clone)
    }

    /// Borrow the current value without cloning it.
    pub fn try_with<R, U>(&mut self, source: R, f: impl FnOnce(&R::Value) -> U) -> Result<U, StoreError>
    where
        R: Readable,
    {
        if !self.tracking.is_active() {
            self.report(UsageError::ReadOutsideContext {
                signal: source.describe(),
            });
        }
        let value = source.read_raw(self, true)?;
        downcast(&value, &source).map(f)
    }

    /// # Panics
    ///
    /// Same conditions as [`get`](Self::get).
    pub fn with<R, U>(&mut self, source: R, f: impl FnOnce(&R::Value) -> U) -> U
    where
        R: Readable,
    {
        match self.try_with(source, f) {
            Ok(value) => value,
            Err(err) => panic!("failed to read {}: {err}", source.describe()),
        }
    }

    /// Read without registering a dependency.
    ///
    /// Peeking is allowed outside any context; it is how tests and tools
    /// inspect the store.
    ///
    /// # Panics
    ///
    /// Same conditions as [`get`](Self::get).
    pub fn peek<R>(&mut self, source: R) -> R::Value
    where
        R: Readable,
        R::Value: Clone,
    {
        match self.try_peek(source) {
            Ok(value) => value,
            Err(err) => panic!("failed to read {}: {err}", source.describe()),
        }
    }

    pub fn try_peek<R>(&mut self, source: R) -> Result<R::Value, StoreError>
    where
        R: Readable,
        R::Value: Clone,
    {
        let value = source.read_raw(self, false)?;
        downcast(&value, &source).map(Clone::clone)
    }

    /// Run `f` with dependency tracking suspended.
    pub fn untracked<R>(&mut self, f: impl FnOnce(&mut Runtime) -> R) -> R {
        let depth = self.tracking.depth();
        self.tracking.push(FrameKind::Untracked);
        let result = f(self);
        self.tracking.truncate(depth);
        result
    }

    /// Buffered value if the open transaction wrote one, else the committed one.
    pub(crate) fn signal_value(&self, id: SignalId) -> Result<Value, StoreError> {
        let slot = self
            .signals
            .get(id.key())
            .ok_or_else(|| StoreError::Disposed(id.to_string()))?;
        Ok(self.tx.buffered(id).unwrap_or(&slot.value).clone())
    }

    pub(crate) fn committed_value(&self, id: SignalId) -> Result<Value, StoreError> {
        self.signals
            .get(id.key())
            .map(|slot| slot.value.clone())
            .ok_or_else(|| StoreError::Disposed(id.to_string()))
    }

    fn read_signal(&mut self, id: SignalId, track: bool) -> Result<Value, StoreError> {
        let value = self.signal_value(id)?;
        if track {
            self.tracking.track(NodeRef::Signal(id));
        }
        Ok(value)
    }

    fn read_memo(&mut self, id: MemoId, track: bool) -> Result<Value, StoreError> {
        let (value, epoch) = self.refresh_memo(id)?;
        if track {
            self.tracking.track_memo(id, epoch);
        }
        Ok(value)
    }

    // ---- Writes ----

    /// Replace a signal's value.
    ///
    /// Inside a transaction the value is buffered until the outermost commit;
    /// otherwise a single-write transaction is opened and committed.
    pub fn set<T: Send + Sync + 'static>(&mut self, signal: Signal<T>, value: T) -> Result<(), StoreError> {
        self.write_value(signal.id(), Arc::new(value))
    }

    /// Write a modified copy of the current value.
    ///
    /// The stored value is never mutated in place; `f` edits a clone.
    pub fn update<T>(&mut self, signal: Signal<T>, f: impl FnOnce(&mut T)) -> Result<(), StoreError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut value = self.try_peek(signal)?;
        f(&mut value);
        self.set(signal, value)
    }

    pub(crate) fn write_value(&mut self, id: SignalId, value: Value) -> Result<(), StoreError> {
        let describe = {
            let slot = self
                .signals
                .get(id.key())
                .ok_or_else(|| StoreError::Disposed(id.to_string()))?;
            slot.describe(id)
        };
        self.check_owner(|| describe.clone())?;

        if let Some(kind) = self.tracking.derivation() {
            let err = UsageError::WriteInDerivation {
                signal: describe,
                context: match kind {
                    FrameKind::Memo(_) => "memo",
                    _ => "render pass",
                },
            };
            self.report(err.clone());
            return Err(err.into());
        }
        if let Some(effect) = self.tracking.current_effect() {
            self.note_effect_write(effect, id);
        }

        if self.tx.is_open() {
            self.buffer_write(id, value);
        } else {
            let tx = self.begin("write");
            self.buffer_write(id, value);
            if let Err(err) = self.commit(tx) {
                warn!(error = %err, "implicit write transaction failed to commit");
            }
        }
        Ok(())
    }

    fn buffer_write(&mut self, id: SignalId, value: Value) {
        self.tx.buffer(id, value);
        let affected = self.graph.mark_changed(NodeRef::Signal(id));
        self.tx.note_affected(affected);
    }

    // ---- Scheduling ----

    /// Whether a stale computation really has to run again.
    ///
    /// Refreshes the memos it read last time and compares their epochs.
    pub(crate) fn needs_rerun(&mut self, node: NodeRef) -> bool {
        let observed: ObservedEpochs = match node {
            NodeRef::Memo(id) => match self.memos.get(id.key()) {
                Some(slot) => slot.observed.clone(),
                None => return false,
            },
            NodeRef::Effect(id) => match self.effects.get(id.key()) {
                Some(slot) => slot.observed.clone(),
                None => return false,
            },
            NodeRef::Component(id) => match self.instances.get(id.key()) {
                Some(instance) => instance.observed.clone(),
                None => return false,
            },
            NodeRef::Signal(_) => return false,
        };

        observed.into_iter().any(|(memo, epoch)| {
            !matches!(self.refresh_memo(memo), Ok((_, current)) if current == epoch)
        })
    }

    /// Queue every stale sink in `nodes` for the next render or effect pass.
    pub(crate) fn queue_sinks(&mut self, nodes: impl IntoIterator<Item = NodeRef>) {
        for node in nodes {
            if self.graph.get_node(node).map_or(true, |n| n.is_clean()) {
                continue;
            }
            match node {
                NodeRef::Component(id) => {
                    self.pending_renders.insert(id);
                }
                NodeRef::Effect(id) => {
                    self.pending_effects.insert(id);
                }
                NodeRef::Signal(_) | NodeRef::Memo(_) => {}
            }
        }
    }

    /// Run effect passes until nothing is queued.
    ///
    /// Used where no render pipeline is attached; the session loop
    /// interleaves renders between passes itself.
    pub fn flush_effects(&mut self) -> Result<usize, OverrunError> {
        let mut cycles = 0;
        let mut last = EffectPass::default();
        while self.has_pending_effects() {
            if cycles == self.max_commit_cycles {
                return Err(self.overrun(cycles, &last));
            }
            last = self.run_effect_pass();
            cycles += 1;
        }
        Ok(cycles)
    }

    /// Abandon the queued cascade and describe it.
    pub(crate) fn overrun(&mut self, cycles: usize, last: &EffectPass) -> OverrunError {
        let chain = self.cascade_chain(last);
        let abandoned = self.abandon_pending_effects();
        let err = OverrunError { cycles, chain };
        error!(error = %err, abandoned, "stabilization overrun");
        err
    }

    // ---- Introspection ----

    /// Committed version counter.
    pub fn version(&self) -> u64 {
        self.tx.version()
    }

    /// Version at which the signal was last committed.
    pub fn signal_version<T>(&self, signal: Signal<T>) -> Option<u64> {
        self.signals.get(signal.id().key()).map(|slot| slot.version)
    }

    /// Number of computations currently depending on the signal.
    pub fn subscriber_count<T>(&self, signal: Signal<T>) -> usize {
        self.graph.dependents(NodeRef::Signal(signal.id())).len()
    }

    pub fn contains_signal<T>(&self, signal: Signal<T>) -> bool {
        self.signals.contains(signal.id().key())
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    /// Cancel all work owned by this runtime.
    pub fn shutdown(&mut self) {
        self.token.cancel();
        for (_, slot) in self.effects.iter() {
            slot.token.cancel();
        }
        for key in self.global_keys.keys() {
            self.globals.unsubscribe(key, self.id);
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(&RuntimeConfig::default())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("version", &self.tx.version())
            .field("signals", &self.signals.len())
            .field("memos", &self.memos.len())
            .field("effects", &self.effects.len())
            .field("instances", &self.instances.len())
            .field("tx_depth", &self.tx.depth())
            .finish()
    }
}

fn downcast<'a, R: Readable>(value: &'a Value, source: &R) -> Result<&'a R::Value, StoreError> {
    value
        .downcast_ref::<R::Value>()
        .ok_or_else(|| StoreError::TypeMismatch {
            what: source.describe(),
            expected: std::any::type_name::<R::Value>(),
            found: "a different type",
        })
}

fn decode_restored<T: Clone + Send + Sync + 'static>(
    codec: &PersistCodec,
    key: &str,
    bytes: &[u8],
) -> Result<T, StoreError> {
    let value = codec.decode(bytes)?;
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| PersistError::TypeMismatch { key: key.to_string() }.into())
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, RuntimeConfig, UsagePolicy};
    use crate::error::HandlerError;

    #[test]
    fn writes_are_visible_after_implicit_commit() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(5);
        let before = rt.version();

        rt.set(count, 6).unwrap();
        assert_eq!(rt.peek(count), 6);
        assert_eq!(rt.version(), before + 1);
        assert_eq!(rt.signal_version(count), Some(before + 1));
    }

    #[test]
    fn update_replaces_composite_values() {
        let mut rt = Runtime::default();
        let items = rt.create_signal(vec![1, 2]);
        let before = rt.peek(items);

        rt.update(items, |items| items.push(3)).unwrap();
        assert_eq!(rt.peek(items), vec![1, 2, 3]);
        assert_eq!(before, vec![1, 2]);
    }

    #[test]
    fn read_outside_context_is_reported_but_returns() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(1);

        assert_eq!(rt.get(count), 1);
        assert!(matches!(
            rt.diagnostics(),
            [UsageError::ReadOutsideContext { .. }]
        ));
    }

    #[test]
    fn handler_reads_are_not_tracked() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(1);
        rt.transaction("read", |rt| {
            rt.get(count);
            Ok(())
        })
        .unwrap();
        assert!(rt.diagnostics().is_empty());
        assert_eq!(rt.subscriber_count(count), 0);
    }

    #[test]
    fn memo_cannot_write() {
        let mut rt = Runtime::default();
        let source = rt.create_signal(1);
        let target = rt.create_signal(0);
        let memo = rt.create_memo(move |rt| {
            let value = rt.get(source);
            rt.set(target, value).is_err()
        });

        assert!(rt.peek(memo));
        assert_eq!(rt.peek(target), 0);
        assert!(matches!(
            rt.diagnostics(),
            [UsageError::WriteInDerivation { context: "memo", .. }]
        ));
    }

    #[test]
    fn cross_thread_write_is_rejected() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(1);

        let rt = std::thread::spawn(move || {
            let mut rt = rt;
            let result = rt.set(count, 2);
            assert!(matches!(
                result,
                Err(StoreError::Usage(UsageError::CrossThreadMutation { .. }))
            ));
            rt
        })
        .join()
        .unwrap();

        let mut rt = rt;
        assert_eq!(rt.peek(count), 1);
        rt.bind_to_current_thread();
        rt.set(count, 3).unwrap();
        assert_eq!(rt.peek(count), 3);
    }

    #[test]
    fn production_policy_can_invalidate() {
        let config = RuntimeConfig {
            mode: Mode::Production,
            usage_policy: UsagePolicy::InvalidateSession,
            ..RuntimeConfig::default()
        };
        let mut rt = Runtime::new(&config);
        let count = rt.create_signal(1);
        rt.get(count);
        assert!(rt.invalidation().is_some());
    }

    #[test]
    fn session_signals_are_keyed() {
        let mut rt = Runtime::default();
        let a = rt.session_signal("theme", || "light".to_string()).unwrap();
        let b = rt.session_signal("theme", || "dark".to_string()).unwrap();
        assert_eq!(a, b);
        assert_eq!(rt.peek(b), "light");

        let err = rt.session_signal("theme", || 1u8).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }

    #[test]
    fn persisted_signals_survive_restore() {
        let mut rt = Runtime::default();
        let name = rt.persisted_signal("name", || "anon".to_string()).unwrap();
        let scratch = rt.create_signal_with(SignalOptions::new().persist("scratch").transient(), 0u8);
        rt.set(name, "ada".to_string()).unwrap();
        rt.set(scratch, 9).unwrap();

        let saved = rt.persisted_values().unwrap();
        assert!(saved.contains_key("name"));
        assert!(!saved.contains_key("scratch"));

        let mut resumed = Runtime::default();
        resumed.restore(saved);
        let name = resumed.persisted_signal("name", || "anon".to_string()).unwrap();
        assert_eq!(resumed.peek(name), "ada");
    }

    #[test]
    fn disposed_handles_fail_cleanly() {
        let mut rt = Runtime::default();
        let count = rt.create_signal(1);
        rt.dispose_signal(count);
        assert!(matches!(rt.try_peek(count), Err(StoreError::Disposed(_))));
        assert!(matches!(rt.set(count, 2), Err(StoreError::Disposed(_))));

        let replacement = rt.create_signal(7);
        assert_ne!(replacement.id(), count.id());
        assert!(matches!(rt.try_peek(count), Err(StoreError::Disposed(_))));
    }

    #[test]
    fn global_signals_share_initial_value() {
        let globals = Arc::new(GlobalSignals::new());
        let mut a = Runtime::default().with_globals(globals.clone());
        let mut b = Runtime::default().with_globals(globals.clone());

        let motd_a = a.global_signal("motd", || "hello".to_string()).unwrap();
        let motd_b = b.global_signal("motd", || "ignored".to_string()).unwrap();
        assert_eq!(b.peek(motd_b), "hello");

        a.transaction("motd", |rt| {
            rt.set(motd_a, "updated".to_string())?;
            Ok::<_, HandlerError>(())
        })
        .unwrap();
        assert_eq!(globals.get::<String>("motd").as_deref(), Some("updated"));
    }
}
