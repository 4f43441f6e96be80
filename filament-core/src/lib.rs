//! Filament Core
//!
//! This crate provides the server-side runtime for the Filament reactive UI
//! framework. Application state and component logic live on the server; a
//! thin client renders what it is told and reports user events back.
//!
//! It implements:
//!
//! - Reactive primitives (signals, memos, effects) with hook-slot identity
//! - Transactions with all-or-nothing commits and stable snapshots
//! - A component renderer and a keyed tree differ producing patches
//! - A bounded binary wire codec with varint framing
//! - Per-session single-writer loops, async work, timers and a storm budget
//! - A session registry and a WebSocket transport
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: signals, memos, effects and the per-session [`Runtime`]
//! - `graph`: the explicit dependency graph and its scheduler
//! - `tx`: the transaction coordinator
//! - `render`: components, resolved trees, the differ and patches
//! - `codec`: the wire format in both directions
//! - `session`: session aggregate, loop, tasks, budget, store and registry
//! - `transport`: frame sinks and the WebSocket adapter
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_core::render::{component, el};
//!
//! let counter = component("counter", |cx| {
//!     let count = cx.use_signal(|| 0)?;
//!     let value = cx.get(count);
//!     Ok(el("button")
//!         .text(format!("Count: {value}"))
//!         .on_click(move |rt| {
//!             rt.update(count, |n| *n += 1)?;
//!             Ok(())
//!         })
//!         .into())
//! });
//! // Clicking sends exactly one SetText patch to the client.
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod render;
pub mod session;
pub mod transport;
pub mod tx;

pub use config::RuntimeConfig;
pub use error::{Error, HandlerError, HandlerResult, Result};
pub use reactive::{Effect, Memo, Runtime, Signal};
pub use render::{component, el, ComponentView, View};
pub use session::{Session, SessionHandle, SessionLoop, SessionRegistry};
