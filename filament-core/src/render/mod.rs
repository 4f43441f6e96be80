//! Rendering Pipeline
//!
//! Components produce views, views resolve into a node tree, and the differ
//! turns consecutive trees into patch batches.
//!
//! # How a Commit Reaches the Client
//!
//! 1. [`Runtime::render_root`](crate::reactive::Runtime::render_root)
//!    re-renders the stale part of the component tree and returns the
//!    resolved [`VNode`]s. Clean subtrees reuse their previous output.
//!
//! 2. The session's [`Differ`] matches the new tree against the tree it sent
//!    last, copying handles onto surviving nodes and minting new ones.
//!
//! 3. The resulting [`Patch`] batch is encoded and sent as one frame.
//!
//! Handles are never reissued within a session, and a batch only names
//! handles that are live or inserted earlier in the same batch. A
//! [`LiveTree`] applies batches under exactly those rules.

mod component;
mod diff;
mod live;
mod patch;
mod vnode;

pub(crate) use component::unexpected_slot;
pub use component::{component, ChildKey, ComponentInstance, ComponentView, RenderCx, RenderError, RenderFn};
pub use diff::{DiffError, Differ};
pub use live::{ApplyError, LiveTree, Shape};
pub use patch::{NodeSpec, Patch, PatchKind};
pub use vnode::{el, fragment, text, Element, ElementView, Handle, HandleAllocator, Handler, Key, Listener, VNode, View};
