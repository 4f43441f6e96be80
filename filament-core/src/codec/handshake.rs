//! Connection handshake.
//!
//! Before binary framing starts, each side sends one JSON text message.
//!
//! ```text
//! Client                                         Server
//!   |                                               |
//!   |  -- {protocol_version, token, resume?} ---->  |
//!   |                                               |
//!   |  <-- {"type":"hello", session_id, ...} -----  |
//!   |      OR                                       |
//!   |  <-- {"type":"reject", reason, ...} --------  |
//!   |                                               |
//! ```
//!
//! Unknown fields are rejected so a client built against a different
//! protocol fails loudly instead of being half understood.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First message from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientHello {
    pub protocol_version: u32,
    /// Anti-forgery token issued with the page.
    pub token: String,
    /// Session to resume after a reconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
}

impl ClientHello {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            protocol_version: super::PROTOCOL_VERSION,
            token: token.into(),
            resume: None,
        }
    }

    #[must_use]
    pub fn resuming(mut self, session_id: impl Into<String>) -> Self {
        self.resume = Some(session_id.into());
        self
    }

    pub fn to_json(&self) -> Result<String, HandshakeError> {
        serde_json::to_string(self).map_err(|err| HandshakeError::Malformed(err.to_string()))
    }
}

/// Accepted handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerHello {
    pub protocol_version: u32,
    pub session_id: String,
    /// Milliseconds since the Unix epoch.
    pub server_time_ms: u64,
    /// Whether an existing session was picked up.
    pub resumed: bool,
}

impl ServerHello {
    pub fn new(session_id: impl Into<String>, protocol_version: u32, resumed: bool) -> Self {
        Self {
            protocol_version,
            session_id: session_id.into(),
            server_time_ms: now_ms(),
            resumed,
        }
    }
}

/// Refused handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelloReject {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u32>,
}

impl From<&HandshakeError> for HelloReject {
    fn from(err: &HandshakeError) -> Self {
        Self {
            reason: err.to_string(),
            expected_version: match err {
                HandshakeError::VersionMismatch { server, .. } => Some(*server),
                _ => None,
            },
        }
    }
}

/// Server side of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerHandshake {
    Hello(ServerHello),
    Reject(HelloReject),
}

impl ServerHandshake {
    pub fn to_json(&self) -> Result<String, HandshakeError> {
        serde_json::to_string(self).map_err(|err| HandshakeError::Malformed(err.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, HandshakeError> {
        serde_json::from_str(text).map_err(|err| HandshakeError::Malformed(err.to_string()))
    }
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("handshake of {len} bytes exceeds the limit of {limit}")]
    TooLarge { len: usize, limit: usize },

    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("protocol version {client} is not supported (server speaks {server})")]
    VersionMismatch { client: u32, server: u32 },

    #[error("anti-forgery token rejected")]
    InvalidToken,

    #[error("binary frame received before the handshake completed")]
    NotText,
}

/// Parse and validate the client's first message.
pub fn parse_client_hello(text: &str, max_len: usize, server_version: u32) -> Result<ClientHello, HandshakeError> {
    if text.len() > max_len {
        return Err(HandshakeError::TooLarge {
            len: text.len(),
            limit: max_len,
        });
    }
    let hello: ClientHello =
        serde_json::from_str(text).map_err(|err| HandshakeError::Malformed(err.to_string()))?;
    if hello.protocol_version != server_version {
        return Err(HandshakeError::VersionMismatch {
            client: hello.protocol_version,
            server: server_version,
        });
    }
    Ok(hello)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PROTOCOL_VERSION;

    #[test]
    fn hello_round_trip() {
        let hello = ClientHello::new("csrf-123").resuming("s-42");
        let text = hello.to_json().unwrap();
        assert_eq!(parse_client_hello(&text, 1024, PROTOCOL_VERSION).unwrap(), hello);
    }

    #[test]
    fn version_mismatch_is_reported_with_expected_version() {
        let text = r#"{"protocol_version":9,"token":"t"}"#;
        let err = parse_client_hello(text, 1024, PROTOCOL_VERSION).unwrap_err();
        assert_eq!(
            err,
            HandshakeError::VersionMismatch {
                client: 9,
                server: PROTOCOL_VERSION
            }
        );
        assert_eq!(HelloReject::from(&err).expected_version, Some(PROTOCOL_VERSION));
    }

    #[test]
    fn unknown_fields_and_oversize_are_rejected() {
        let text = r#"{"protocol_version":1,"token":"t","extra":true}"#;
        assert!(matches!(
            parse_client_hello(text, 1024, PROTOCOL_VERSION),
            Err(HandshakeError::Malformed(_))
        ));
        assert!(matches!(
            parse_client_hello(text, 8, PROTOCOL_VERSION),
            Err(HandshakeError::TooLarge { limit: 8, .. })
        ));
    }

    #[test]
    fn server_messages_are_tagged() {
        let reply = ServerHandshake::Hello(ServerHello::new("s-1", PROTOCOL_VERSION, false));
        let text = reply.to_json().unwrap();
        assert!(text.starts_with(r#"{"type":"hello""#));
        assert_eq!(ServerHandshake::from_json(&text).unwrap(), reply);
    }
}
