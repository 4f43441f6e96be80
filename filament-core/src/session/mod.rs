//! Session Layer
//!
//! One session per connected client. Each session is a [`Session`]
//! aggregate owned by a [`SessionLoop`] task, reached from everywhere else
//! through a [`SessionHandle`].
//!
//! - `session`: the aggregate and its commit pipeline
//! - `event_loop`: the single-writer loop and the re-entry handle
//! - `tasks`: off-loop work, timers and keyed async state
//! - `budget`: the per-category storm budget and circuit breaker
//! - `store`: durable snapshots for evicted sessions
//! - `registry`: handshake acceptance, resume and grace-window eviction

mod budget;
mod event_loop;
mod registry;
#[allow(clippy::module_inception)]
mod session;
mod store;
mod tasks;

pub use budget::{BudgetError, StormBudget};
pub use event_loop::{SessionHandle, SessionLoop};
pub use registry::{Accepted, SessionRegistry, TokenVerifier};
pub use session::{Session, SessionError, SessionStats};
pub use store::{MemoryStore, SessionStore, StoreBackendError};
pub use tasks::{AsyncSlot, AsyncState, RetryPolicy, TaskError, TaskSpawner, KEYED_ASYNC, SPAWN, TIMER};
