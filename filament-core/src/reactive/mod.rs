//! Reactive Primitives
//!
//! This module implements the reactive store: signals, memos, effects and
//! the hook slots components allocate them through.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for state. When a signal is read within a
//! tracking frame (a render pass, memo or effect), the frame records it as a
//! dependency. Writing a signal marks every dependent stale. Values are
//! immutable once stored: a write always hands over a fresh value.
//!
//! ## Memos
//!
//! A Memo is a derived value that caches its result and re-evaluates only
//! when something it read has changed.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that re-runs after a commit
//! changes one of its dependencies, strictly after the commit has been
//! rendered and sent.
//!
//! # Implementation Notes
//!
//! All state lives in a [`Runtime`] owned by one session. Handles are small
//! `Copy` ids into its arenas, and dependency tracking uses a frame stack
//! owned by the runtime rather than thread-local storage, so many sessions
//! can share a worker thread without seeing each other's frames.

pub(crate) mod arena;
mod context;
mod effect;
mod global;
mod hooks;
mod ids;
mod memo;
mod runtime;
mod signal;

pub use context::{Frame, FrameKind, ObservedEpochs, TrackingStack};
pub use effect::{Cleanup, Effect, EffectSlot};
pub use global::GlobalSignals;
pub use hooks::{HookKind, HookOrderError, HookSlot, HookSlots};
pub use ids::{AsyncId, EffectId, InstanceId, MemoId, NodeRef, SignalId};
pub use memo::{Memo, MemoSlot};
pub use runtime::{Readable, Runtime};
pub use signal::{PersistCodec, PersistError, Scope, Signal, SignalOptions, SignalSlot, Value};

pub(crate) use effect::{panic_message, EffectPass};
