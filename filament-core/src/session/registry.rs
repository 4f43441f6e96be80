//! Session Registry
//!
//! The process-wide table of live sessions and the entry point for new
//! connections.
//!
//! # How a Connection Finds Its Session
//!
//! 1. The client's first message is a JSON hello. Its protocol version and
//!    anti-forgery token are checked before anything is allocated.
//!
//! 2. A hello naming a session that is still live (connected or inside its
//!    grace window) re-attaches the new connection; the session resyncs it.
//!
//! 3. A hello naming an evicted session restores it from the durable store.
//!    Unknown ids, and hellos without one, start a fresh session.
//!
//! 4. On disconnect the session is detached, not destroyed. It keeps
//!    running without output until [`SessionRegistry::evict_expired`] finds
//!    it past the grace window, saves its snapshot and shuts it down.
//!
//! Session ids double as resume credentials, so they are random (UUID v4).
//! Every attach gets a connection generation; a disconnect reported for an
//! older generation than the session's current one is ignored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event_loop::{SessionHandle, SessionLoop};
use super::session::{Session, SessionError};
use super::store::SessionStore;
use crate::codec::{parse_client_hello, HandshakeError, ServerHello};
use crate::config::RuntimeConfig;
use crate::reactive::GlobalSignals;
use crate::render::ComponentView;
use crate::transport::FrameSink;

/// Checks the anti-forgery token a client presents in its hello.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> bool;
}

impl<F> TokenVerifier for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn verify(&self, token: &str) -> bool {
        self(token)
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub session_id: String,
    pub handle: SessionHandle,
    /// Generation to pass back to [`SessionRegistry::detach`].
    pub connection: u64,
    /// Reply to send before any binary frame.
    pub hello: ServerHello,
}

#[derive(Debug)]
struct Entry {
    handle: SessionHandle,
    connection: u64,
    detached_at: Option<Instant>,
}

pub struct SessionRegistry {
    config: RuntimeConfig,
    sessions: DashMap<String, Entry>,
    store: Arc<dyn SessionStore>,
    verifier: Arc<dyn TokenVerifier>,
    globals: Arc<GlobalSignals>,
    app: ComponentView,
}

impl SessionRegistry {
    pub fn new(
        config: RuntimeConfig,
        app: ComponentView,
        store: Arc<dyn SessionStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            store,
            verifier,
            globals: Arc::new(GlobalSignals::new()),
            app,
        }
    }

    /// Share process-scoped signals with other registries.
    #[must_use]
    pub fn with_globals(mut self, globals: Arc<GlobalSignals>) -> Self {
        self.globals = globals;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn globals(&self) -> &Arc<GlobalSignals> {
        &self.globals
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Complete a handshake and bind `sink` to the resulting session.
    pub async fn accept(&self, hello_text: &str, sink: Box<dyn FrameSink>) -> Result<Accepted, SessionError> {
        let limits = &self.config.session;
        let hello = parse_client_hello(hello_text, limits.max_handshake_len, limits.protocol_version)?;
        if !self.verifier.verify(&hello.token) {
            return Err(HandshakeError::InvalidToken.into());
        }

        if let Some(id) = hello.resume {
            let live = self
                .sessions
                .get(&id)
                .map(|entry| entry.handle.clone())
                .filter(|handle| !handle.is_closed());
            if let Some(handle) = live {
                let connection = handle.attach(sink)?;
                if let Some(mut entry) = self.sessions.get_mut(&id) {
                    entry.connection = entry.connection.max(connection);
                    entry.detached_at = None;
                }
                info!(session = %id, connection, "client re-attached");
                return Ok(self.accepted(id, handle, true, connection));
            }

            if let Some(bytes) = self.store.load(&id).await? {
                let handle = self.start(&id, Some(&bytes), sink)?;
                self.store.delete(&id).await?;
                info!(session = %id, "session restored from store");
                return Ok(self.accepted(id, handle, true, 0));
            }
            debug!(session = %id, "resume target unknown; starting fresh");
        }

        let id = next_session_id();
        let handle = self.start(&id, None, sink)?;
        info!(session = %id, "session started");
        Ok(self.accepted(id, handle, false, 0))
    }

    /// Mark connection `connection` of a session as gone. The grace window
    /// starts now.
    ///
    /// A connection the client has since replaced by resuming elsewhere is
    /// ignored, so a slow reader on the old socket cannot cut off the new
    /// one.
    pub fn detach(&self, id: &str, connection: u64) {
        let Some(mut entry) = self.sessions.get_mut(id) else {
            return;
        };
        if entry.connection != connection {
            debug!(session = %id, connection, current = entry.connection, "stale detach ignored");
            return;
        }
        if entry.handle.detach(connection).is_err() {
            debug!(session = %id, "detach after the session loop ended");
        }
        entry.detached_at = Some(Instant::now());
    }

    /// Persist and destroy sessions detached longer than the grace window.
    ///
    /// Sessions whose loop has already ended are dropped without saving.
    /// Returns how many sessions were evicted.
    pub async fn evict_expired(&self) -> Result<usize, SessionError> {
        let grace = self.config.session.grace_window();
        let now = Instant::now();
        let candidates: Vec<(String, SessionHandle)> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.handle.is_closed() || entry.detached_at.is_some_and(|at| now.duration_since(at) >= grace)
            })
            .map(|entry| (entry.key().clone(), entry.handle.clone()))
            .collect();

        let mut evicted = 0;
        for (id, handle) in candidates {
            if handle.is_closed() {
                self.sessions.remove(&id);
                continue;
            }
            let snapshot = handle.snapshot().await;
            if self.sessions.get(&id).is_some_and(|entry| entry.detached_at.is_none()) {
                // Re-attached while the snapshot was taken.
                continue;
            }
            match snapshot {
                Ok(bytes) => self.store.save(&id, bytes, self.config.session.persist_ttl()).await?,
                Err(err) => warn!(session = %id, error = %err, "evicting without a snapshot"),
            }
            handle.close();
            self.sessions.remove(&id);
            evicted += 1;
            info!(session = %id, "session evicted");
        }
        Ok(evicted)
    }

    /// Sweep expired sessions every `every` until the registry is dropped.
    pub fn spawn_evictor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Err(err) = registry.evict_expired().await {
                    warn!(error = %err, "eviction sweep failed");
                }
            }
        })
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.handle.clone())
    }

    pub fn is_detached(&self, id: &str) -> bool {
        self.sessions.get(id).is_some_and(|entry| entry.detached_at.is_some())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session without saving it.
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.handle.close();
        }
        self.sessions.clear();
    }

    fn start(&self, id: &str, snapshot: Option<&[u8]>, sink: Box<dyn FrameSink>) -> Result<SessionHandle, SessionError> {
        let mut session = Session::new(id, &self.config, sink).with_globals(self.globals.clone());
        if let Some(bytes) = snapshot {
            session.restore_snapshot(bytes)?;
        }
        let (session_loop, handle) = SessionLoop::new(session, self.app.clone());
        drop(session_loop.spawn());
        self.sessions.insert(
            id.to_string(),
            Entry {
                handle: handle.clone(),
                connection: 0,
                detached_at: None,
            },
        );
        Ok(handle)
    }

    fn accepted(&self, session_id: String, handle: SessionHandle, resumed: bool, connection: u64) -> Accepted {
        let hello = ServerHello::new(session_id.clone(), self.config.session.protocol_version, resumed);
        Accepted {
            session_id,
            handle,
            connection,
            hello,
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("globals", &self.globals.len())
            .finish()
    }
}

fn next_session_id() -> String {
    Uuid::new_v4().to_string()
}

// ---- Tests ----
