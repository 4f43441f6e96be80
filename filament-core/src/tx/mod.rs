//! Transaction Coordinator
//!
//! Every mutation of the reactive store happens inside a transaction.
//!
//! # State Machine
//!
//! ```text
//! Idle -> Open -> (Nested <-> Open) -> Committing -> Idle
//!           \________________________-> Aborting  -> Idle
//! ```
//!
//! - `begin` pushes a frame. A frame pushed while another is open is nested
//!   and never commits on its own: closing it merges its write-set into the
//!   parent.
//! - Writes buffer into the innermost frame; reads resolve innermost frame
//!   first, then outer frames, then committed storage.
//! - The outermost commit applies the merged write-set in one step, advances
//!   the version counter and queues every stale component and effect.
//! - Aborting a frame drops its write-set. Nothing it wrote ever becomes
//!   visible; side effects it caused outside the store are not undone.
//!
//! Snapshots give a stable view of committed values as of the start of the
//! outermost transaction.

mod commit;
mod coordinator;

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

use crate::error::{HandlerError, StoreError};
use crate::reactive::NodeRef;

pub use coordinator::{SnapshotToken, TxCoordinator, TxFrame, TxId, TxPhase};

/// Failure of a transaction operation.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("transaction `{name}` aborted: {source}")]
    Aborted {
        name: Cow<'static, str>,
        #[source]
        source: HandlerError,
    },

    #[error("transaction `{name}` panicked: {message}")]
    Panicked {
        name: Cow<'static, str>,
        message: String,
    },

    #[error("{0} is not the innermost open transaction")]
    NotInnermost(TxId),

    #[error("no transaction is open")]
    NotOpen,

    #[error("snapshot {0} has expired")]
    SnapshotExpired(SnapshotToken),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TxError {
    /// The handler error that caused an abort, if any.
    pub fn handler_error(&self) -> Option<&HandlerError> {
        match self {
            TxError::Aborted { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Effects kept re-triggering each other past the commit-cycle limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stabilization did not settle within {cycles} commit cycles: {}", DisplayChain(.chain))]
pub struct OverrunError {
    pub cycles: usize,
    /// The dependency chain still feeding the cascade.
    pub chain: Vec<NodeRef>,
}

struct DisplayChain<'a>(&'a [NodeRef]);

impl fmt::Display for DisplayChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{node}")?;
        }
        Ok(())
    }
}

/// What an outermost commit applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub tx: TxId,
    /// Version counter after the commit.
    pub version: u64,
    /// Number of signals written.
    pub written: usize,
}
