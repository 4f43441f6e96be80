//! Transport Layer
//!
//! Sessions do not know what carries their frames. They write encoded patch
//! frames into a [`FrameSink`]; a connection adapter such as the WebSocket
//! one in [`ws`] forwards them to the client and feeds received event
//! frames back through the session handle.

pub mod ws;

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::HandshakeError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("session refused the connection: {0}")]
    Refused(String),
}

/// Outbound side of a client connection.
pub trait FrameSink: Send {
    /// Queue one encoded frame. Must not block the session loop.
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Forwards frames to a writer task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// Keeps every frame in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

impl FrameSink for MemorySink {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.frames.lock().push(frame);
        Ok(())
    }
}

/// Drops frames while no client is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn send(&mut self, _frame: Vec<u8>) -> Result<(), TransportError> {
        Ok(())
    }
}

// ---- Tests ----
