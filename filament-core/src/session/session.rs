//! Session Aggregate
//!
//! A [`Session`] owns one runtime, the component tree mounted in it, the
//! differ tracking what the client holds and the sink the client listens
//! on. It is driven by the session loop but has no async parts itself, so
//! tests can drive it directly.
//!
//! # How a Unit of Work Runs
//!
//! 1. The unit (an event handler, a callback, a timer) runs inside one
//!    transaction. A failure aborts the transaction and is counted; the
//!    session carries on.
//!
//! 2. The commit pipeline then runs until nothing is queued: re-render the
//!    stale part of the tree, diff it against the last sent tree, encode the
//!    patches and send them as one frame, then run one pass of the effects
//!    the commit queued.
//!
//! 3. Effects that write fold into a new commit cycle, which goes around
//!    the pipeline again. After `max_commit_cycles` passes the remaining
//!    cascade is abandoned and reported as a stabilization overrun.
//!
//! 4. A frame that fails to decode, a diff that finds the tree out of step
//!    with the client, or a batch the development mirror rejects all end in
//!    a full resync: a `Reset` followed by the whole tree.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use super::budget::StormBudget;
use super::event_loop::{Callback, SessionHandle};
use super::store::StoreBackendError;
use super::tasks::TaskSpawner;
use crate::codec::{decode_event, decode_frame, encode_frame, encode_patches, EncodeError, Event, EventData, HandshakeError};
use crate::config::{Mode, RuntimeConfig};
use crate::error::{HandlerError, HandlerResult};
use crate::reactive::{EffectPass, GlobalSignals, InstanceId, PersistError, Runtime};
use crate::render::{ComponentView, DiffError, Differ, Handler, LiveTree, Patch, Shape, VNode};
use crate::transport::{FrameSink, NullSink};
use crate::tx::OverrunError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("session invalidated: {0}")]
    Invalidated(String),

    #[error("circuit breaker open after a `{category}` budget breach")]
    CircuitOpen { category: String },

    #[error("unknown session `{0}`")]
    UnknownSession(String),

    #[error("no component is mounted")]
    NotMounted,

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("malformed session snapshot: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Backend(#[from] StoreBackendError),
}

impl SessionError {
    /// Whether the loop must stop after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Closed | SessionError::Invalidated(_) | SessionError::CircuitOpen { .. }
        )
    }
}

/// Counters describing what a session has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Render/diff passes that ran.
    pub render_passes: u64,
    pub frames_sent: u64,
    pub patches_sent: u64,
    /// Outermost commits, including effect passes.
    pub commits: u64,
    pub aborted_transactions: u64,
    pub overruns: u64,
    pub decode_failures: u64,
    pub resyncs: u64,
}

pub struct Session {
    id: String,
    config: RuntimeConfig,
    rt: Runtime,
    root: Option<InstanceId>,
    differ: Differ,
    /// Tree as last sent, handles assigned.
    tree: Vec<VNode>,
    /// Client model used to check outgoing batches in development mode.
    mirror: Option<LiveTree>,
    sink: Box<dyn FrameSink>,
    attached: bool,
    /// Generation of the connection `sink` belongs to.
    connection: u64,
    budget: Arc<StormBudget>,
    stats: SessionStats,
    needs_resync: bool,
    last_overrun: Option<OverrunError>,
}

impl Session {
    pub fn new(id: impl Into<String>, config: &RuntimeConfig, sink: Box<dyn FrameSink>) -> Self {
        Self {
            id: id.into(),
            config: config.clone(),
            rt: Runtime::new(config),
            root: None,
            differ: Differ::new(),
            tree: Vec::new(),
            mirror: (config.mode == Mode::Development).then(LiveTree::new),
            sink,
            attached: true,
            connection: 0,
            budget: Arc::new(StormBudget::new(config.budget.clone())),
            stats: SessionStats::default(),
            needs_resync: false,
            last_overrun: None,
        }
    }

    /// Share process-scoped signals with other sessions.
    #[must_use]
    pub fn with_globals(mut self, globals: Arc<GlobalSignals>) -> Self {
        self.rt = self.rt.with_globals(globals);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.rt
    }

    pub fn budget(&self) -> &Arc<StormBudget> {
        &self.budget
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// The tree the client currently holds.
    pub fn tree(&self) -> &[VNode] {
        &self.tree
    }

    pub fn root(&self) -> Option<InstanceId> {
        self.root
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Generation of the current (or most recently detached) connection.
    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// The most recent stabilization overrun, if any.
    pub fn last_overrun(&self) -> Option<&OverrunError> {
        self.last_overrun.as_ref()
    }

    pub(crate) fn attach_handle(&mut self, handle: SessionHandle) {
        self.rt.attach_spawner(TaskSpawner::new(handle, self.budget.clone()));
    }

    /// Mount the root component and send its first render.
    pub fn mount(&mut self, view: ComponentView) -> Result<(), SessionError> {
        if let Some(previous) = self.root.take() {
            self.rt.unmount(previous);
        }
        self.root = Some(self.rt.mount_root(view));
        self.settle()
    }

    /// Decode one framed event record and dispatch it.
    ///
    /// Undecodable input means the client and server no longer agree on the
    /// stream; the session answers with a full resync.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let decoded = decode_frame(bytes, &self.config.limits)
            .and_then(|body| decode_event(body, &self.config.limits));
        match decoded {
            Ok(event) => self.dispatch(event),
            Err(err) => {
                self.stats.decode_failures += 1;
                warn!(error = %err, len = bytes.len(), "undecodable frame; resyncing");
                self.resync()
            }
        }
    }

    /// Run the handler `event` targets inside one transaction.
    ///
    /// Events for nodes that are gone, or for kinds the node does not
    /// listen to, are dropped; they race with removals routinely.
    pub fn dispatch(&mut self, event: Event) -> Result<(), SessionError> {
        let kind = event.kind();
        let handler = VNode::find(&self.tree, event.target)
            .and_then(VNode::as_element)
            .and_then(|element| element.listener(kind))
            .cloned();
        let Some(handler) = handler else {
            debug!(target = %event.target, %kind, "event has no listener; dropped");
            return Ok(());
        };
        if !handler.accepts(kind) {
            warn!(target = %event.target, %kind, shape = handler.shape(), "handler cannot take event");
            return Ok(());
        }
        let name = format!("event:{}", kind.name());
        self.run_unit(name, move |rt| invoke(&handler, rt, &event.data))
    }

    /// Run work submitted through the session handle.
    pub(crate) fn run_callback(&mut self, name: Cow<'static, str>, run: Callback) -> Result<(), SessionError> {
        self.run_unit(name, run)
    }

    /// Run `body` as one unit of work: a transaction, then the commit
    /// pipeline.
    pub fn run_unit<F>(&mut self, name: impl Into<Cow<'static, str>>, body: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Runtime) -> HandlerResult,
    {
        let before = self.rt.version();
        if self.rt.transaction(name, body).is_err() {
            self.stats.aborted_transactions += 1;
        }
        self.stats.commits += self.rt.version() - before;
        self.settle()
    }

    /// Send the whole tree again under fresh handles.
    pub fn resync(&mut self) -> Result<(), SessionError> {
        self.needs_resync = true;
        self.settle()
    }

    /// Route output to a new client; it receives the full tree.
    pub fn attach(&mut self, sink: Box<dyn FrameSink>) -> Result<(), SessionError> {
        self.attach_connection(self.connection + 1, sink)
    }

    /// Attach `sink` as connection `connection`.
    ///
    /// A generation older than the current one lost a reconnect race and is
    /// dropped unused.
    pub fn attach_connection(&mut self, connection: u64, sink: Box<dyn FrameSink>) -> Result<(), SessionError> {
        if connection < self.connection {
            debug!(connection, current = self.connection, "stale attach ignored");
            return Ok(());
        }
        self.sink = sink;
        self.attached = true;
        self.connection = connection;
        debug!(connection, "client attached");
        self.resync()
    }

    /// Drop the current connection, whichever it is.
    pub fn detach(&mut self) {
        self.sink = Box::new(NullSink);
        self.attached = false;
        debug!(connection = self.connection, "client detached");
    }

    /// Drop connection `connection` if it is still the current one.
    ///
    /// Returns whether anything was detached.
    pub fn detach_connection(&mut self, connection: u64) -> bool {
        if connection != self.connection || !self.attached {
            debug!(connection, current = self.connection, "stale detach ignored");
            return false;
        }
        self.detach();
        true
    }

    /// Persisted signal values, serialized for the durable store.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, SessionError> {
        let values = self.rt.persisted_values()?;
        rmp_serde::to_vec(&values).map_err(|err| SessionError::Snapshot(err.to_string()))
    }

    /// Seed persisted signals from a snapshot taken by [`snapshot_bytes`].
    ///
    /// Call before mounting so the first render sees the restored values.
    /// The client still holds the old tree, so the next render resyncs.
    ///
    /// [`snapshot_bytes`]: Self::snapshot_bytes
    pub fn restore_snapshot(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let values: HashMap<String, Vec<u8>> =
            rmp_serde::from_slice(bytes).map_err(|err| SessionError::Snapshot(err.to_string()))?;
        debug!(values = values.len(), "restoring session snapshot");
        self.rt.restore(values);
        self.needs_resync = true;
        Ok(())
    }

    /// Unmount everything and cancel all outstanding work.
    pub fn close(&mut self) {
        if let Some(root) = self.root.take() {
            self.rt.unmount(root);
        }
        self.rt.shutdown();
        self.detach();
        debug!(stats = ?self.stats, "session closed");
    }

    fn settle(&mut self) -> Result<(), SessionError> {
        let before = self.rt.version();
        let result = self.stabilize();
        self.stats.commits += self.rt.version() - before;
        result?;
        self.check_health()
    }

    /// Drive render and effect passes until nothing is queued.
    fn stabilize(&mut self) -> Result<(), SessionError> {
        let mut cycles = 0;
        let mut last = EffectPass::default();
        loop {
            self.flush_render()?;
            if !self.rt.has_pending_effects() {
                break;
            }
            if cycles == self.rt.max_commit_cycles {
                self.stats.overruns += 1;
                self.last_overrun = Some(self.rt.overrun(cycles, &last));
                break;
            }
            last = self.rt.run_effect_pass();
            cycles += 1;
        }
        Ok(())
    }

    fn flush_render(&mut self) -> Result<(), SessionError> {
        let Some(root) = self.root else {
            return Ok(());
        };
        if !self.rt.has_pending_renders() && !self.needs_resync {
            return Ok(());
        }
        let mut tree = match self.rt.render_root(root) {
            Ok(tree) => tree,
            Err(err) => {
                error!(error = %err, "root component failed to render");
                Vec::new()
            }
        };
        self.stats.render_passes += 1;

        let patches = self.diff(&mut tree)?;
        self.tree = tree;
        self.send(&patches)
    }

    fn diff(&mut self, tree: &mut Vec<VNode>) -> Result<Vec<Patch>, SessionError> {
        if self.needs_resync {
            return self.full_resync(tree);
        }
        let patches = match self.differ.diff(&self.tree, tree) {
            Ok(patches) => patches,
            Err(err) => {
                error!(error = %err, "tree out of step with client; resyncing");
                return self.full_resync(tree);
            }
        };
        if let Some(mirror) = &mut self.mirror {
            let verdict = match mirror.apply_all(&patches) {
                Ok(()) if mirror.shape() == Shape::of(tree) => Ok(()),
                Ok(()) => Err("mirror does not match the rendered tree".to_string()),
                Err(err) => Err(err.to_string()),
            };
            if let Err(reason) = verdict {
                error!(%reason, "patch batch failed verification; resyncing");
                return self.full_resync(tree);
            }
        }
        Ok(patches)
    }

    fn full_resync(&mut self, tree: &mut Vec<VNode>) -> Result<Vec<Patch>, SessionError> {
        let patches = self.differ.resync(tree)?;
        if let Some(mirror) = &mut self.mirror {
            *mirror = LiveTree::new();
            if let Err(err) = mirror.apply_all(&patches) {
                error!(error = %err, "resync batch rejected by mirror");
            }
        }
        self.needs_resync = false;
        self.stats.resyncs += 1;
        debug!(patches = patches.len(), "full resync");
        Ok(patches)
    }

    fn send(&mut self, patches: &[Patch]) -> Result<(), SessionError> {
        if patches.is_empty() {
            return Ok(());
        }
        let frame = match encode_patches(patches, &self.config.limits)
            .and_then(|body| encode_frame(&body, &self.config.limits))
        {
            Ok(frame) => frame,
            Err(err) => {
                // The client never saw this batch.
                self.needs_resync = true;
                error!(error = %err, patches = patches.len(), "patch batch exceeds codec limits");
                return Err(err.into());
            }
        };
        self.stats.frames_sent += 1;
        self.stats.patches_sent += patches.len() as u64;
        debug!(patches = patches.len(), bytes = frame.len(), "patch batch sent");
        if let Err(err) = self.sink.send(frame) {
            warn!(error = %err, "client connection lost");
            self.detach();
        }
        Ok(())
    }

    fn check_health(&self) -> Result<(), SessionError> {
        if let Some(category) = self.budget.tripped_by() {
            return Err(SessionError::CircuitOpen { category });
        }
        match self.rt.invalidation() {
            Some(reason) => Err(SessionError::Invalidated(reason.to_string())),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("attached", &self.attached)
            .field("live_handles", &self.differ.live_count())
            .field("stats", &self.stats)
            .finish()
    }
}

fn invoke(handler: &Handler, rt: &mut Runtime, data: &EventData) -> HandlerResult {
    match (handler, data) {
        (Handler::Action(f), _) => f(rt),
        (Handler::Text(f), EventData::Input(value) | EventData::Change(value)) => f(rt, value),
        (Handler::Form(f), EventData::Submit(fields)) => f(rt, fields),
        (Handler::Key(f), EventData::KeyDown(input)) => f(rt, input),
        (Handler::Extension(f), EventData::Extension { subtype, payload }) => f(rt, *subtype, payload),
        (handler, data) => Err(HandlerError::msg(format!(
            "`{}` handler cannot take a {} event",
            handler.shape(),
            data.kind()
        ))),
    }
}

// ---- Tests ----
