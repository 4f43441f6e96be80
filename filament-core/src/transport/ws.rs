//! WebSocket Adapter
//!
//! Carries one session's traffic over a WebSocket connection.
//!
//! # How a Connection Is Served
//!
//! 1. The upgrade is accepted and the stream split into a reader and a
//!    writer half.
//!
//! 2. The first message must be the client's JSON hello (a text message).
//!    The registry validates it and binds a [`WsSink`] to the session; a
//!    refused hello is answered with a JSON rejection and the connection
//!    closes.
//!
//! 3. The server hello is written before the writer task starts, so the
//!    client always sees it ahead of the first binary frame the session
//!    queued while mounting.
//!
//! 4. Every binary message afterwards is one framed event record and goes
//!    straight into the session's inbox. When the reader ends the session
//!    is detached; it stays resumable until its grace window runs out.
//!
//! Message and frame sizes are capped from the codec limits, so an oversized
//! message is refused by the WebSocket layer before it is buffered.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{FrameSink, TransportError};
use crate::codec::{HandshakeError, HelloReject, ServerHandshake, MAX_VARINT_LEN};
use crate::config::RuntimeConfig;
use crate::session::{SessionError, SessionRegistry};

/// Queues frames for the connection's writer task.
#[derive(Debug, Clone)]
pub struct WsSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl WsSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FrameSink for WsSink {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(Message::Binary(frame)).map_err(|_| TransportError::Closed)
    }
}

/// WebSocket limits matching what the codec and handshake accept.
///
/// The largest legal message is either a full event frame (length prefix
/// plus body) or the client hello.
pub fn websocket_config(config: &RuntimeConfig) -> WebSocketConfig {
    let largest = (config.limits.max_frame_len + MAX_VARINT_LEN).max(config.session.max_handshake_len);
    let mut ws = WebSocketConfig::default();
    ws.max_message_size = Some(largest);
    ws.max_frame_size = Some(largest);
    ws
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, registry: Arc<SessionRegistry>) -> Result<(), TransportError> {
    info!(addr = ?listener.local_addr().ok(), "accepting connections");
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(connection_task(stream, peer, registry));
    }
}

async fn connection_task<S>(stream: S, peer: SocketAddr, registry: Arc<SessionRegistry>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let span = info_span!("connection", %peer);
    if let Err(err) = serve_connection(stream, registry).instrument(span).await {
        warn!(%peer, error = %err, "connection ended with an error");
    }
}

/// Serve one already-established byte stream.
pub async fn serve_connection<S>(stream: S, registry: Arc<SessionRegistry>) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = accept_async_with_config(stream, Some(websocket_config(registry.config()))).await?;
    let (mut write, mut read) = ws.split();

    let hello = match read.next().await {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Close(_))) | None => return Ok(()),
        Some(Ok(_)) => {
            let err = HandshakeError::NotText;
            reject(&mut write, HelloReject::from(&err)).await?;
            return Err(err.into());
        }
        Some(Err(err)) => return Err(err.into()),
    };

    let (sink, mut outbound) = WsSink::new();
    let accepted = match registry.accept(&hello, Box::new(sink)).await {
        Ok(accepted) => accepted,
        Err(SessionError::Handshake(err)) => {
            reject(&mut write, HelloReject::from(&err)).await?;
            return Err(err.into());
        }
        Err(err) => {
            let reason = err.to_string();
            reject(
                &mut write,
                HelloReject {
                    reason: reason.clone(),
                    expected_version: None,
                },
            )
            .await?;
            return Err(TransportError::Refused(reason));
        }
    };
    let session_id = accepted.session_id.clone();
    let connection = accepted.connection;
    debug!(session = %session_id, connection, resumed = accepted.hello.resumed, "handshake complete");

    let reply = ServerHandshake::Hello(accepted.hello).to_json()?;
    write.send(Message::Text(reply)).await?;

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Binary(frame)) => {
                if accepted.handle.send_frame(frame).is_err() {
                    debug!(session = %session_id, "session loop has ended");
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(_)) => warn!(session = %session_id, "text message after handshake ignored"),
            Ok(_) => {}
            Err(err) => {
                warn!(session = %session_id, error = %err, "read failed");
                break;
            }
        }
    }

    registry.detach(&session_id, connection);
    // The writer drains until the session drops its sink.
    drop(writer);
    info!(session = %session_id, "client disconnected");
    Ok(())
}

async fn reject<S>(
    write: &mut futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
    reject: HelloReject,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = ServerHandshake::Reject(reject).to_json()?;
    write.send(Message::Text(text)).await?;
    write.close().await?;
    Ok(())
}

// ---- Tests ----
