//! Error types shared across the runtime.
//!
//! Each subsystem defines its own structured error enum next to the code
//! that raises it; this module holds the ones that cross subsystem
//! boundaries ([`UsageError`], [`StoreError`], [`HandlerError`]) and the
//! crate-level [`Error`] that wraps them all.
//!
//! # Error Classification
//!
//! - **Usage errors**: programming mistakes (hook order, reading outside a
//!   context, mutating from another thread). Reported loudly and recorded in
//!   the runtime's diagnostics; see [`UsagePolicy`](crate::config::UsagePolicy).
//! - **Recoverable conditions** (budget exceeded, cancelled, stale): resolved
//!   at the primitive that produced them.
//! - **Structural failures** (handler failure, decode failure): contained at
//!   the nearest transaction or connection boundary.

use std::fmt;

use thiserror::Error;

use crate::codec::{DecodeError, EncodeError, HandshakeError};
use crate::graph::CycleError;
use crate::reactive::{HookOrderError, PersistError};
use crate::render::DiffError;
use crate::session::{BudgetError, SessionError, StoreBackendError, TaskError};
use crate::transport::TransportError;
use crate::tx::TxError;

/// Misuse of the runtime API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error(transparent)]
    HookOrder(#[from] HookOrderError),

    #[error("{signal} was read outside of any render, effect or handler context")]
    ReadOutsideContext { signal: String },

    #[error(
        "{target} was mutated from thread {current} but the session is owned by {owner}; \
         enqueue a callback through the session handle instead"
    )]
    CrossThreadMutation {
        target: String,
        owner: String,
        current: String,
    },

    #[error("{signal} was written inside a {context}; renders and memos must not write")]
    WriteInDerivation {
        signal: String,
        context: &'static str,
    },

    #[error("a `{shape}` handler cannot receive `{kind}` events (on <{element}>)")]
    HandlerShape {
        element: String,
        kind: &'static str,
        shape: &'static str,
    },

    #[error(transparent)]
    Cycle(#[from] CycleError),
}

/// Failure of a reactive store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} has been disposed")]
    Disposed(String),

    #[error("{what} holds `{found}`, not `{expected}`")]
    TypeMismatch {
        what: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Failure raised by an event handler, callback or other unit of work.
///
/// Returning one from a transaction body aborts the transaction.
pub struct HandlerError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// A failure described only by a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("message", &self.message)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

macro_rules! handler_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for HandlerError {
                fn from(err: $ty) -> Self {
                    HandlerError::new(err)
                }
            }
        )*
    };
}

handler_error_from!(
    StoreError,
    UsageError,
    TxError,
    BudgetError,
    TaskError,
    DecodeError,
    EncodeError,
);

/// Result of a handler, callback or effect-scheduled unit of work.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Backend(#[from] StoreBackendError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn handler_error_keeps_source() {
        let err = HandlerError::from(StoreError::Disposed("signal#1".into()));
        assert_eq!(err.message(), "signal#1 has been disposed");
        assert!(err.source().is_some());
    }

    #[test]
    fn handler_error_from_message() {
        let err = HandlerError::msg("boom");
        assert_eq!(err.to_string(), "boom");
        assert!(err.source().is_none());
    }
}
