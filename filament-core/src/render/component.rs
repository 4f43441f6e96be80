//! Component Instances
//!
//! A component is a named render function. Every place a component appears
//! in a parent's output becomes a mounted instance with its own hook slots,
//! dependency edges and cancellation token.
//!
//! # How Rendering Works
//!
//! 1. The session resolves the root instance. An instance re-renders when it
//!    has never rendered, when its parent re-rendered, or when a committed
//!    write reached it (directly, or through a memo whose value changed).
//!
//! 2. A render runs inside a `Render` tracking frame. Everything it reads
//!    becomes its new dependency set; hook allocations go through the
//!    instance's [`HookSlots`] in call order.
//!
//! 3. The returned [`View`] is resolved into [`VNode`]s. Child component
//!    views are matched to existing instances by key, or by position among
//!    unkeyed siblings of the same name, and resolved recursively. Children
//!    that no longer appear are unmounted: slots disposed, effect cleanups
//!    run, tokens cancelled.
//!
//! 4. An instance whose subtree has nothing stale reuses its previous
//!    output without running any render function.
//!
//! # Failed Renders
//!
//! A render that returns an error, panics or breaks hook order is discarded
//! as a whole. Slots allocated by a failed first render are disposed, the
//! instance keeps its previous output, and it stays clean until one of its
//! previous dependencies changes again.

use std::any::TypeId;
use std::borrow::Cow;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::vnode::{Element, Key, View, VNode};
use crate::error::{StoreError, UsageError};
use crate::graph::DirtyState;
use crate::reactive::{
    panic_message, Cleanup, Effect, FrameKind, HookKind, HookOrderError, HookSlot, HookSlots, InstanceId, Memo,
    NodeRef, ObservedEpochs, Runtime, Scope, Signal, SignalOptions,
};

/// Render function of a component.
pub type RenderFn = Arc<dyn Fn(&mut RenderCx<'_>) -> Result<View, RenderError> + Send + Sync>;

/// A component placed in a view.
#[derive(Clone)]
pub struct ComponentView {
    pub(crate) name: Cow<'static, str>,
    pub(crate) key: Option<Key>,
    pub(crate) render: RenderFn,
}

impl ComponentView {
    /// Identify this instance among its siblings by key instead of position.
    #[must_use]
    pub fn key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ComponentView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentView")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Declare a component.
///
/// # Example
///
/// ```rust,ignore
/// let counter = component("Counter", |cx| {
///     let count = cx.use_signal(|| 0)?;
///     let value = cx.get(count);
///     Ok(el("button")
///         .on_click(move |rt| Ok(rt.update(count, |n| *n += 1)?))
///         .text(format!("Count: {value}"))
///         .into())
/// });
/// ```
pub fn component<F>(name: impl Into<Cow<'static, str>>, render: F) -> ComponentView
where
    F: Fn(&mut RenderCx<'_>) -> Result<View, RenderError> + Send + Sync + 'static,
{
    ComponentView {
        name: name.into(),
        key: None,
        render: Arc::new(render),
    }
}

/// Why a render attempt was discarded.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    HookOrder(#[from] HookOrderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("`{component}` panicked while rendering: {message}")]
    Panicked { component: String, message: String },

    #[error("{0}")]
    Failed(String),
}

impl RenderError {
    pub fn msg(message: impl Into<String>) -> Self {
        RenderError::Failed(message.into())
    }
}

/// Identity of a child instance within its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChildKey {
    Keyed(Cow<'static, str>, Key),
    /// Position among unkeyed siblings with the same component name.
    Positional(Cow<'static, str>, usize),
}

/// One mounted component.
pub struct ComponentInstance {
    pub(crate) name: Cow<'static, str>,
    pub(crate) render: RenderFn,
    pub(crate) hooks: HookSlots,
    /// Output of the last successful render.
    pub(crate) view: Option<View>,
    /// Resolved output, reused while nothing in the subtree is stale.
    pub(crate) output: Vec<VNode>,
    pub(crate) children: IndexMap<ChildKey, InstanceId>,
    pub(crate) parent: Option<InstanceId>,
    pub(crate) depth: usize,
    /// Cancelled on unmount; parent of every effect and task token it owns.
    pub(crate) token: CancellationToken,
    pub(crate) observed: ObservedEpochs,
    pub(crate) renders: u64,
}

impl ComponentInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn renders(&self) -> u64 {
        self.renders
    }

    pub fn hooks(&self) -> &HookSlots {
        &self.hooks
    }

    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInstance")
            .field("name", &self.name)
            .field("slots", &self.hooks.len())
            .field("children", &self.children.len())
            .field("parent", &self.parent)
            .field("renders", &self.renders)
            .finish()
    }
}

/// Render-time access to the runtime plus hook allocation for one instance.
///
/// Dereferences to [`Runtime`], so reads like `cx.get(signal)` are tracked
/// as dependencies of the instance.
pub struct RenderCx<'a> {
    rt: &'a mut Runtime,
    instance: InstanceId,
    hook_error: Option<HookOrderError>,
}

impl Deref for RenderCx<'_> {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        self.rt
    }
}

impl DerefMut for RenderCx<'_> {
    fn deref_mut(&mut self) -> &mut Runtime {
        self.rt
    }
}

impl<'a> RenderCx<'a> {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Claim the next hook slot of this instance.
    pub(crate) fn claim(
        &mut self,
        kind: HookKind,
        ty: Option<(TypeId, &'static str)>,
    ) -> Result<Option<HookSlot>, RenderError> {
        let instance = self
            .rt
            .instances
            .get_mut(self.instance.key())
            .ok_or_else(|| RenderError::msg(format!("{} is no longer mounted", self.instance)))?;
        match instance.hooks.next(kind, ty) {
            Ok(slot) => Ok(slot),
            Err(err) => {
                // Remembered so a render that swallows the error still fails.
                self.hook_error.get_or_insert_with(|| err.clone());
                Err(err.into())
            }
        }
    }

    pub(crate) fn record(&mut self, slot: HookSlot) {
        if let Some(instance) = self.rt.instances.get_mut(self.instance.key()) {
            instance.hooks.push(slot);
        }
    }

    pub(crate) fn runtime(&mut self) -> &mut Runtime {
        self.rt
    }

    /// Instance-scoped state, created with `init()` on the first render.
    pub fn use_signal<T: Send + Sync + 'static>(&mut self, init: impl FnOnce() -> T) -> Result<Signal<T>, RenderError> {
        self.use_signal_with(SignalOptions::new(), init)
    }

    pub fn use_signal_with<T: Send + Sync + 'static>(
        &mut self,
        options: SignalOptions,
        init: impl FnOnce() -> T,
    ) -> Result<Signal<T>, RenderError> {
        let ty = (TypeId::of::<T>(), std::any::type_name::<T>());
        match self.claim(HookKind::Signal, Some(ty))? {
            Some(HookSlot::Signal { id, .. }) => Ok(Signal::from_id(id)),
            Some(other) => Err(unexpected_slot(other)),
            None => {
                let owner = self.instance;
                let signal = self.rt.alloc_signal(init(), Scope::Instance(owner), options, None);
                self.record(HookSlot::Signal {
                    id: signal.id(),
                    ty: ty.0,
                    type_name: ty.1,
                });
                Ok(signal)
            }
        }
    }

    /// Instance-scoped state that is included in session snapshots under
    /// `key` and restored from them on resume.
    pub fn use_persisted_signal<T>(&mut self, key: &str, init: impl FnOnce() -> T) -> Result<Signal<T>, RenderError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let ty = (TypeId::of::<T>(), std::any::type_name::<T>());
        match self.claim(HookKind::Signal, Some(ty))? {
            Some(HookSlot::Signal { id, .. }) => Ok(Signal::from_id(id)),
            Some(other) => Err(unexpected_slot(other)),
            None => {
                let owner = self.instance;
                let signal = self.rt.alloc_persisted(key, Scope::Instance(owner), init)?;
                self.record(HookSlot::Signal {
                    id: signal.id(),
                    ty: ty.0,
                    type_name: ty.1,
                });
                Ok(signal)
            }
        }
    }

    /// Derived value owned by this instance.
    ///
    /// Only the closure passed on the first render is kept; later renders
    /// get the same memo back and their closure is dropped.
    pub fn use_memo<T, F>(&mut self, compute: F) -> Result<Memo<T>, RenderError>
    where
        T: PartialEq + Send + Sync + 'static,
        F: FnMut(&mut Runtime) -> T + Send + 'static,
    {
        let ty = (TypeId::of::<T>(), std::any::type_name::<T>());
        match self.claim(HookKind::Memo, Some(ty))? {
            Some(HookSlot::Memo { id, .. }) => Ok(Memo::from_id(id)),
            Some(other) => Err(unexpected_slot(other)),
            None => {
                let owner = self.instance;
                let memo = self.rt.alloc_memo(compute, Some(owner));
                self.record(HookSlot::Memo {
                    id: memo.id(),
                    ty: ty.0,
                    type_name: ty.1,
                });
                Ok(memo)
            }
        }
    }

    /// Side effect owned by this instance. It first runs after the commit
    /// that mounted the instance has been rendered and sent, and is cleaned
    /// up when the instance unmounts.
    pub fn use_effect<F>(&mut self, run: F) -> Result<Effect, RenderError>
    where
        F: FnMut(&mut Runtime) -> Option<Cleanup> + Send + 'static,
    {
        match self.claim(HookKind::Effect, None)? {
            Some(HookSlot::Effect { id }) => Ok(Effect::from_id(id)),
            Some(other) => Err(unexpected_slot(other)),
            None => {
                let owner = self.instance;
                let effect = self.rt.alloc_effect(Box::new(run), Some(owner));
                self.record(HookSlot::Effect { id: effect.id() });
                Ok(effect)
            }
        }
    }
}

pub(crate) fn unexpected_slot(slot: HookSlot) -> RenderError {
    RenderError::msg(format!("hook slot holds an unexpected {}", slot.kind()))
}

impl Runtime {
    /// Mount `view` as a root instance. It renders on the next render pass.
    pub fn mount_root(&mut self, view: ComponentView) -> InstanceId {
        let token = self.session_token().child_token();
        self.alloc_instance(view, None, 0, token)
    }

    fn alloc_instance(
        &mut self,
        view: ComponentView,
        parent: Option<InstanceId>,
        depth: usize,
        token: CancellationToken,
    ) -> InstanceId {
        let hooks = HookSlots::new(view.name.to_string());
        let id = InstanceId::new(self.instances.insert(ComponentInstance {
            name: view.name,
            render: view.render,
            hooks,
            view: None,
            output: Vec::new(),
            children: IndexMap::new(),
            parent,
            depth,
            token,
            observed: ObservedEpochs::new(),
            renders: 0,
        }));
        self.graph.add_node(NodeRef::Component(id));
        self.pending_renders.insert(id);
        debug!(instance = %id, depth, "component mounted");
        id
    }

    pub fn instance(&self, id: InstanceId) -> Option<&ComponentInstance> {
        self.instances.get(id.key())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn has_pending_renders(&self) -> bool {
        !self.pending_renders.is_empty()
    }

    /// Resolve the tree under `root`, re-rendering whatever is stale.
    ///
    /// Fails only when the root itself has never rendered successfully.
    pub fn render_root(&mut self, root: InstanceId) -> Result<Vec<VNode>, RenderError> {
        let result = self.resolve_instance(root, false);
        self.pending_renders.clear();
        result
    }

    /// Unmount an instance and everything below it.
    pub fn unmount(&mut self, id: InstanceId) {
        let parent = self.instances.get(id.key()).and_then(|instance| instance.parent);
        if let Some(parent) = parent.and_then(|parent| self.instances.get_mut(parent.key())) {
            parent.children.retain(|_, child| *child != id);
        }
        self.unmount_instance(id);
    }

    fn unmount_instance(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get_mut(id.key()) else {
            return;
        };
        let children: Vec<InstanceId> = instance.children.drain(..).map(|(_, child)| child).collect();
        let slots = instance.hooks.drain();
        for child in children {
            self.unmount_instance(child);
        }
        for slot in slots {
            self.dispose_hook(slot);
        }
        if let Some(instance) = self.instances.remove(id.key()) {
            instance.token.cancel();
            debug!(instance = %id, name = %instance.name, "component unmounted");
        }
        self.graph.remove_node(NodeRef::Component(id));
        self.pending_renders.shift_remove(&id);
    }

    fn resolve_instance(&mut self, id: InstanceId, force: bool) -> Result<Vec<VNode>, RenderError> {
        let node = NodeRef::Component(id);
        let (never_rendered, is_root) = match self.instances.get(id.key()) {
            Some(instance) => (instance.view.is_none(), instance.parent.is_none()),
            None => return Ok(Vec::new()),
        };
        let due = force
            || never_rendered
            || match self.graph.state(node) {
                Some(DirtyState::Dirty) => true,
                Some(DirtyState::MaybeDirty) => self.needs_rerun(node),
                Some(DirtyState::Clean) | None => false,
            };

        let mut fresh = false;
        if due {
            match self.render_instance(id) {
                Ok(view) => {
                    if let Some(instance) = self.instances.get_mut(id.key()) {
                        instance.view = Some(view);
                    }
                    fresh = true;
                }
                Err(err) => {
                    let name = self.instance_name(id);
                    if never_rendered {
                        error!(instance = %id, component = %name, error = %err, "first render failed");
                        if let Some(instance) = self.instances.get_mut(id.key()) {
                            instance.view = Some(View::Empty);
                            instance.output.clear();
                        }
                        if is_root {
                            return Err(err);
                        }
                        return Ok(Vec::new());
                    }
                    warn!(instance = %id, component = %name, error = %err, "render failed; keeping previous output");
                }
            }
        } else {
            self.graph.mark_clean(node);
        }

        if !fresh && !self.children_stale(id) {
            return Ok(self
                .instances
                .get(id.key())
                .map(|instance| instance.output.clone())
                .unwrap_or_default());
        }

        let view = self
            .instances
            .get(id.key())
            .and_then(|instance| instance.view.clone())
            .unwrap_or_default();
        let mut resolution = Resolution {
            owner: id,
            fresh,
            seen: Vec::new(),
            positional: IndexMap::new(),
        };
        let mut output = Vec::new();
        self.resolve_view(view, &mut resolution, &mut output);

        let stale: Vec<InstanceId> = match self.instances.get_mut(id.key()) {
            Some(instance) => {
                let mut stale = Vec::new();
                instance.children.retain(|key, child| {
                    let keep = resolution.seen.contains(key);
                    if !keep {
                        stale.push(*child);
                    }
                    keep
                });
                instance.output = output.clone();
                stale
            }
            None => Vec::new(),
        };
        for child in stale {
            self.unmount_instance(child);
        }
        Ok(output)
    }

    fn instance_name(&self, id: InstanceId) -> String {
        self.instances
            .get(id.key())
            .map(|instance| instance.name.to_string())
            .unwrap_or_default()
    }

    /// Whether any descendant needs to re-render or re-resolve.
    fn children_stale(&self, id: InstanceId) -> bool {
        let Some(instance) = self.instances.get(id.key()) else {
            return false;
        };
        instance.children.values().any(|child| {
            let node_stale = self
                .graph
                .state(NodeRef::Component(*child))
                .is_some_and(|state| state != DirtyState::Clean);
            let unrendered = self
                .instances
                .get(child.key())
                .is_some_and(|instance| instance.view.is_none());
            node_stale || unrendered || self.children_stale(*child)
        })
    }

    /// Run one render function.
    fn render_instance(&mut self, id: InstanceId) -> Result<View, RenderError> {
        let node = NodeRef::Component(id);
        let (render, name) = {
            let instance = self
                .instances
                .get_mut(id.key())
                .ok_or_else(|| RenderError::msg(format!("{id} is not mounted")))?;
            instance.hooks.begin();
            (instance.render.clone(), instance.name.to_string())
        };

        let depth = self.tracking.depth();
        self.tracking.push(FrameKind::Render(id));
        let mut cx = RenderCx {
            rt: self,
            instance: id,
            hook_error: None,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| render(&mut cx)));
        let hook_error = cx.hook_error.take();
        self.tracking.truncate(depth + 1);
        let frame = self.tracking.pop();

        let result = match result {
            Ok(result) => result,
            Err(payload) => Err(RenderError::Panicked {
                component: name,
                message: panic_message(payload.as_ref()),
            }),
        };
        let result = match hook_error {
            Some(err) => Err(RenderError::HookOrder(err)),
            None => result,
        };
        let result = result.and_then(|view| {
            let instance = self
                .instances
                .get_mut(id.key())
                .ok_or_else(|| RenderError::msg(format!("{id} unmounted itself while rendering")))?;
            instance.hooks.finish()?;
            Ok(view)
        });

        if let Err(err) = &result {
            let discarded = self
                .instances
                .get_mut(id.key())
                .map(|instance| instance.hooks.rollback())
                .unwrap_or_default();
            for slot in discarded {
                self.dispose_hook(slot);
            }
            if let RenderError::HookOrder(hook) = err {
                self.report(UsageError::HookOrder(hook.clone()));
            }
        }

        // A failed attempt still subscribes to what it read, so the next
        // write to any of it retries the render. Reads of slots rolled back
        // above are gone from the graph and drop out here.
        let (mut dependencies, mut epochs) = frame
            .map(|frame| (frame.dependencies, frame.epochs))
            .unwrap_or_default();
        if result.is_err() {
            // The kept output still answers to the inputs that produced it.
            for dep in self.graph.dependencies(node) {
                if !dependencies.contains(&dep) {
                    dependencies.push(dep);
                }
            }
            if let Some(instance) = self.instances.get(id.key()) {
                for &(memo, epoch) in &instance.observed {
                    if !epochs.iter().any(|(seen, _)| *seen == memo) {
                        epochs.push((memo, epoch));
                    }
                }
            }
        }
        if let Some(instance) = self.instances.get_mut(id.key()) {
            instance.observed = epochs;
            if result.is_ok() {
                instance.renders += 1;
            }
        }
        if let Err(cycle) = self.graph.set_dependencies(node, dependencies) {
            self.report(UsageError::Cycle(cycle));
        }
        self.graph.mark_clean(node);
        result
    }

    fn resolve_view(&mut self, view: View, res: &mut Resolution, out: &mut Vec<VNode>) {
        match view {
            View::Empty => {}
            View::Text(text) => out.push(VNode::text(text)),
            View::Fragment(items) => {
                for item in items {
                    self.resolve_view(item, res, out);
                }
            }
            View::Element(element) => {
                let mut children = Vec::with_capacity(element.children.len());
                for child in element.children {
                    self.resolve_view(child, res, &mut children);
                }
                let mut listeners = element.listeners;
                if res.fresh {
                    listeners.retain(|listener| {
                        if listener.handler.accepts(listener.kind) {
                            return true;
                        }
                        self.report(UsageError::HandlerShape {
                            element: element.tag.to_string(),
                            kind: listener.kind.name(),
                            shape: listener.handler.shape(),
                        });
                        false
                    });
                } else {
                    listeners.retain(|listener| listener.handler.accepts(listener.kind));
                }
                out.push(VNode::Element(Element {
                    tag: element.tag,
                    key: element.key,
                    handle: None,
                    attrs: element.attrs,
                    listeners,
                    children,
                }));
            }
            View::Component(component) => {
                let key = match &component.key {
                    Some(key) => ChildKey::Keyed(component.name.clone(), key.clone()),
                    None => {
                        let index = res.positional.entry(component.name.clone()).or_insert(0);
                        let key = ChildKey::Positional(component.name.clone(), *index);
                        *index += 1;
                        key
                    }
                };
                if res.seen.contains(&key) {
                    warn!(parent = %res.owner, child = ?key, "duplicate child key; skipping");
                    return;
                }
                res.seen.push(key.clone());
                let sibling_key = component.key.clone();

                let existing = self
                    .instances
                    .get(res.owner.key())
                    .and_then(|instance| instance.children.get(&key).copied());
                let (child, force) = match existing {
                    Some(child) => {
                        if res.fresh {
                            if let Some(instance) = self.instances.get_mut(child.key()) {
                                instance.render = component.render.clone();
                            }
                        }
                        (child, res.fresh)
                    }
                    None => {
                        let Some((token, depth)) = self
                            .instances
                            .get(res.owner.key())
                            .map(|parent| (parent.token.child_token(), parent.depth + 1))
                        else {
                            return;
                        };
                        let child = self.alloc_instance(component, Some(res.owner), depth, token);
                        if let Some(parent) = self.instances.get_mut(res.owner.key()) {
                            parent.children.insert(key, child);
                        }
                        (child, false)
                    }
                };
                match self.resolve_instance(child, force) {
                    Ok(mut nodes) => {
                        // The differ matches siblings by element key, so a keyed
                        // component lends its key to a single unkeyed root.
                        if let (Some(key), [VNode::Element(root)]) = (sibling_key, nodes.as_mut_slice()) {
                            root.key.get_or_insert(key);
                        }
                        out.extend(nodes);
                    }
                    Err(err) => warn!(instance = %child, error = %err, "child render failed"),
                }
            }
        }
    }
}

/// Bookkeeping while one instance's view is resolved.
struct Resolution {
    owner: InstanceId,
    /// The view was just produced by a render, so child instances re-render
    /// and listeners are validated.
    fresh: bool,
    seen: Vec<ChildKey>,
    positional: IndexMap<Cow<'static, str>, usize>,
}

// ---- Tests ----
