//! Session Loop
//!
//! The single writer of a session. Everything that touches the session's
//! runtime arrives here as an [`Inbound`] message and is processed strictly
//! one at a time.
//!
//! # How It Works
//!
//! 1. [`SessionLoop::new`] pairs a [`Session`] with an unbounded channel and
//!    hands out a [`SessionHandle`]. The handle is `Clone + Send` and is the
//!    only way other threads (transport readers, spawned tasks, timers,
//!    other sessions publishing globals) reach the session.
//!
//! 2. The loop mounts the root component, then waits for messages. Each
//!    message becomes one unit of work: a transaction, followed by the
//!    commit pipeline (render, diff, encode, send, effects) until the
//!    session is stable again.
//!
//! 3. The loop never awaits inside a unit of work. Blocking work is spawned
//!    off the loop and comes back as a callback through the handle.
//!
//! 4. The loop ends on [`SessionHandle::close`] or on a fatal session error
//!    (invalidation, open circuit breaker), and then tears the session
//!    down.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn, Instrument};

use super::session::{Session, SessionError};
use crate::error::HandlerResult;
use crate::reactive::Runtime;
use crate::render::ComponentView;
use crate::transport::FrameSink;

/// Work submitted to a session from outside its loop.
pub(crate) type Callback = Box<dyn FnOnce(&mut Runtime) -> HandlerResult + Send>;

/// Messages the loop processes.
pub(crate) enum Inbound {
    /// One framed event record from the client.
    Frame(Vec<u8>),
    Callback {
        name: Cow<'static, str>,
        run: Callback,
    },
    /// A (re)connected client; the session resyncs to it.
    Attach {
        sink: Box<dyn FrameSink>,
        connection: u64,
    },
    /// The given connection went away. Ignored if a newer one attached.
    Detach(u64),
    Snapshot(oneshot::Sender<Result<Vec<u8>, SessionError>>),
    Close,
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inbound::Frame(bytes) => write!(f, "Frame({} bytes)", bytes.len()),
            Inbound::Callback { name, .. } => write!(f, "Callback({name})"),
            Inbound::Attach { connection, .. } => write!(f, "Attach({connection})"),
            Inbound::Detach(connection) => write!(f, "Detach({connection})"),
            Inbound::Snapshot(_) => f.write_str("Snapshot"),
            Inbound::Close => f.write_str("Close"),
        }
    }
}

/// Thread-safe re-entry point into one session.
#[derive(Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    tx: mpsc::UnboundedSender<Inbound>,
    /// Last connection generation handed out; the mounting sink is 0.
    connections: Arc<AtomicU64>,
}

impl SessionHandle {
    pub(crate) fn channel(id: &str) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Arc::from(id),
                tx,
                connections: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run `f` on the session loop inside its own transaction.
    pub fn enqueue<F>(&self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Runtime) -> HandlerResult + Send + 'static,
    {
        self.enqueue_named("callback", f)
    }

    pub fn enqueue_named<F>(&self, name: impl Into<Cow<'static, str>>, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Runtime) -> HandlerResult + Send + 'static,
    {
        self.send(Inbound::Callback {
            name: name.into(),
            run: Box::new(f),
        })
    }

    /// Deliver one framed event record received from the client.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        self.send(Inbound::Frame(frame))
    }

    /// Route output to a new connection and resync it.
    ///
    /// Returns the connection's generation, which its [`detach`] must name.
    ///
    /// [`detach`]: Self::detach
    pub fn attach(&self, sink: Box<dyn FrameSink>) -> Result<u64, SessionError> {
        let connection = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        self.send(Inbound::Attach { sink, connection })?;
        Ok(connection)
    }

    /// Drop `connection` if it is still the current one; the session keeps
    /// running either way.
    pub fn detach(&self, connection: u64) -> Result<(), SessionError> {
        self.send(Inbound::Detach(connection))
    }

    /// Serialized persisted state, taken between units of work.
    pub async fn snapshot(&self) -> Result<Vec<u8>, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(Inbound::Snapshot(reply))?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    /// Ask the loop to shut the session down after the current unit.
    pub fn close(&self) {
        let _ = self.tx.send(Inbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, message: Inbound) -> Result<(), SessionError> {
        self.tx.send(message).map_err(|_| SessionError::Closed)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Owns a session and processes its inbox.
pub struct SessionLoop {
    session: Session,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    root: Option<ComponentView>,
}

impl SessionLoop {
    pub fn new(mut session: Session, root: ComponentView) -> (Self, SessionHandle) {
        let (handle, inbox) = SessionHandle::channel(session.id());
        session.attach_handle(handle.clone());
        let session_loop = Self {
            session,
            inbox,
            root: Some(root),
        };
        (session_loop, handle)
    }

    /// Run the loop on the current tokio runtime.
    ///
    /// The task yields the torn-down session when the loop ends.
    pub fn spawn(self) -> JoinHandle<Session> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> Session {
        let span = info_span!("session", id = %self.session.id());
        self.process().instrument(span).await
    }

    async fn process(mut self) -> Session {
        self.session.runtime_mut().bind_to_current_thread();
        if let Some(root) = self.root.take() {
            if let Err(err) = self.session.mount(root) {
                error!(error = %err, "session failed to mount");
                if err.is_fatal() {
                    self.session.close();
                    return self.session;
                }
            }
        }

        while let Some(message) = self.inbox.recv().await {
            self.session.runtime_mut().bind_to_current_thread();
            let outcome = match message {
                Inbound::Frame(bytes) => self.session.handle_frame(&bytes),
                Inbound::Callback { name, run } => self.session.run_callback(name, run),
                Inbound::Attach { sink, connection } => self.session.attach_connection(connection, sink),
                Inbound::Detach(connection) => {
                    self.session.detach_connection(connection);
                    Ok(())
                }
                Inbound::Snapshot(reply) => {
                    let _ = reply.send(self.session.snapshot_bytes());
                    Ok(())
                }
                Inbound::Close => {
                    debug!("close requested");
                    break;
                }
            };
            if let Err(err) = outcome {
                if err.is_fatal() {
                    error!(error = %err, "session terminated");
                    break;
                }
                warn!(error = %err, "unit of work failed");
            }
        }

        self.inbox.close();
        self.session.close();
        self.session
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::render::{component, el};
    use crate::transport::MemorySink;

    fn counter() -> ComponentView {
        component("counter", |cx| {
            let count = cx.runtime().session_signal("count", || 0u32)?;
            let value = cx.get(count);
            Ok(el("span").text(format!("{value}")).into())
        })
    }

    #[tokio::test]
    async fn callbacks_run_in_order_on_the_loop() {
        let sink = MemorySink::new();
        let session = Session::new("s1", &RuntimeConfig::default(), Box::new(sink.clone()));
        let (session_loop, handle) = SessionLoop::new(session, counter());
        let task = session_loop.spawn();

        for _ in 0..3 {
            handle
                .enqueue(|rt| {
                    let count = rt.session_signal("count", || 0u32)?;
                    rt.update(count, |c| *c += 1)?;
                    Ok(())
                })
                .unwrap();
        }
        handle.close();

        let mut session = task.await.unwrap();
        let count = session.runtime_mut().session_signal("count", || 0u32).unwrap();
        assert_eq!(session.runtime_mut().peek(count), 3);
        // mount + three increments
        assert_eq!(sink.frames().len(), 4);
        assert!(handle.enqueue(|_| Ok(())).is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_the_loop() {
        let session = Session::new("s2", &RuntimeConfig::default(), Box::new(MemorySink::new()));
        let (session_loop, handle) = SessionLoop::new(session, counter());
        let task = session_loop.spawn();

        let bytes = handle.snapshot().await.unwrap();
        assert!(!bytes.is_empty());
        handle.close();
        task.await.unwrap();
        assert!(matches!(handle.snapshot().await, Err(SessionError::Closed)));
    }
}
