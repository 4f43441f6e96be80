//! Render output and the resolved node tree.
//!
//! Components return a [`View`]: elements, text, fragments and child
//! components, with listeners attached to elements. The renderer resolves a
//! view into [`VNode`]s, where child components have been replaced by their
//! own output. The differ then gives every node a [`Handle`].

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::component::ComponentView;
use crate::codec::{EventKind, FormFields, KeyInput};
use crate::error::HandlerResult;
use crate::reactive::Runtime;

/// Sibling identity that survives reordering.
pub type Key = Cow<'static, str>;

/// Stable identifier of a live node within one session.
///
/// Handle 0 is the synthetic mount root; real nodes start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(u64);

impl Handle {
    pub const ROOT: Handle = Handle(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Mints handles that have never been used in the session.
#[derive(Debug)]
pub struct HandleAllocator {
    next: u64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn mint(&mut self) -> Handle {
        let handle = Handle(self.next);
        self.next += 1;
        handle
    }

    /// Make sure later mints never collide with `handle`.
    pub fn reserve(&mut self, handle: Handle) {
        self.next = self.next.max(handle.0 + 1);
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Supported handler signatures, fixed when the listener is attached.
#[derive(Clone)]
pub enum Handler {
    /// No payload: clicks, focus, blur, plain submits.
    Action(Arc<dyn Fn(&mut Runtime) -> HandlerResult + Send + Sync>),
    /// Receives the value of input and change events.
    Text(Arc<dyn Fn(&mut Runtime, &str) -> HandlerResult + Send + Sync>),
    /// Receives submitted form fields.
    Form(Arc<dyn Fn(&mut Runtime, &FormFields) -> HandlerResult + Send + Sync>),
    /// Receives key presses.
    Key(Arc<dyn Fn(&mut Runtime, &KeyInput) -> HandlerResult + Send + Sync>),
    /// Receives extension subtype and payload.
    Extension(Arc<dyn Fn(&mut Runtime, u8, &[u8]) -> HandlerResult + Send + Sync>),
}

impl Handler {
    pub fn action(f: impl Fn(&mut Runtime) -> HandlerResult + Send + Sync + 'static) -> Self {
        Handler::Action(Arc::new(f))
    }

    pub fn text(f: impl Fn(&mut Runtime, &str) -> HandlerResult + Send + Sync + 'static) -> Self {
        Handler::Text(Arc::new(f))
    }

    pub fn form(f: impl Fn(&mut Runtime, &FormFields) -> HandlerResult + Send + Sync + 'static) -> Self {
        Handler::Form(Arc::new(f))
    }

    pub fn key(f: impl Fn(&mut Runtime, &KeyInput) -> HandlerResult + Send + Sync + 'static) -> Self {
        Handler::Key(Arc::new(f))
    }

    pub fn extension(f: impl Fn(&mut Runtime, u8, &[u8]) -> HandlerResult + Send + Sync + 'static) -> Self {
        Handler::Extension(Arc::new(f))
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Handler::Action(_) => "action",
            Handler::Text(_) => "text",
            Handler::Form(_) => "form",
            Handler::Key(_) => "key",
            Handler::Extension(_) => "extension",
        }
    }

    /// Whether this shape can receive events of `kind`.
    pub fn accepts(&self, kind: EventKind) -> bool {
        match self {
            Handler::Action(_) => matches!(
                kind,
                EventKind::Click | EventKind::Focus | EventKind::Blur | EventKind::Submit
            ),
            Handler::Text(_) => matches!(kind, EventKind::Input | EventKind::Change),
            Handler::Form(_) => kind == EventKind::Submit,
            Handler::Key(_) => kind == EventKind::KeyDown,
            Handler::Extension(_) => kind == EventKind::Extension,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{}", self.shape())
    }
}

/// An event handler attached to an element.
#[derive(Debug, Clone)]
pub struct Listener {
    pub kind: EventKind,
    pub handler: Handler,
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.handler.shape() == other.handler.shape()
    }
}

/// A resolved element.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub tag: Cow<'static, str>,
    pub key: Option<Key>,
    /// Assigned by the differ.
    pub handle: Option<Handle>,
    pub attrs: IndexMap<Cow<'static, str>, String>,
    pub listeners: SmallVec<[Listener; 2]>,
    pub children: Vec<VNode>,
}

impl Element {
    pub fn listener_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.listeners.iter().map(|l| l.kind).collect();
        kinds.dedup();
        kinds
    }

    pub fn listener(&self, kind: EventKind) -> Option<&Handler> {
        self.listeners
            .iter()
            .find(|listener| listener.kind == kind)
            .map(|listener| &listener.handler)
    }
}

/// A node of the resolved tree.
#[derive(Debug, Clone, PartialEq)]
pub enum VNode {
    Element(Element),
    Text { handle: Option<Handle>, text: String },
    /// Flattened into the parent before diffing.
    Fragment(Vec<VNode>),
}

impl VNode {
    pub fn text(text: impl Into<String>) -> Self {
        VNode::Text {
            handle: None,
            text: text.into(),
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            VNode::Element(element) => element.handle,
            VNode::Text { handle, .. } => *handle,
            VNode::Fragment(_) => None,
        }
    }

    pub(crate) fn set_handle(&mut self, new: Handle) {
        match self {
            VNode::Element(element) => element.handle = Some(new),
            VNode::Text { handle, .. } => *handle = Some(new),
            VNode::Fragment(_) => {}
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            VNode::Element(element) => element.key.as_deref(),
            _ => None,
        }
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            VNode::Element(element) => Some(element),
            _ => None,
        }
    }

    /// Replace fragments by their children, recursively.
    pub fn flatten(nodes: Vec<VNode>) -> Vec<VNode> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                VNode::Fragment(children) => out.extend(Self::flatten(children)),
                VNode::Element(mut element) => {
                    element.children = Self::flatten(std::mem::take(&mut element.children));
                    out.push(VNode::Element(element));
                }
                text @ VNode::Text { .. } => out.push(text),
            }
        }
        out
    }

    /// Find a live node by handle.
    pub fn find(nodes: &[VNode], handle: Handle) -> Option<&VNode> {
        for node in nodes {
            if node.handle() == Some(handle) {
                return Some(node);
            }
            let children = match node {
                VNode::Element(element) => &element.children,
                VNode::Fragment(children) => children,
                VNode::Text { .. } => continue,
            };
            if let Some(found) = Self::find(children, handle) {
                return Some(found);
            }
        }
        None
    }
}

/// Element under construction in a render function.
#[derive(Debug, Clone)]
pub struct ElementView {
    pub(crate) tag: Cow<'static, str>,
    pub(crate) key: Option<Key>,
    pub(crate) attrs: IndexMap<Cow<'static, str>, String>,
    pub(crate) listeners: SmallVec<[Listener; 2]>,
    pub(crate) children: Vec<View>,
}

impl ElementView {
    #[must_use]
    pub fn key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn attr(mut self, name: impl Into<Cow<'static, str>>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn child(mut self, child: impl Into<View>) -> Self {
        self.children.push(child.into());
        self
    }

    #[must_use]
    pub fn children<I, V>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<View>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn text(self, text: impl Into<String>) -> Self {
        self.child(View::Text(text.into()))
    }

    /// Attach a handler. A handler whose shape cannot receive `kind` is
    /// reported as a usage error when the view is resolved.
    #[must_use]
    pub fn on(mut self, kind: EventKind, handler: Handler) -> Self {
        self.listeners.retain(|listener| listener.kind != kind);
        self.listeners.push(Listener { kind, handler });
        self
    }

    #[must_use]
    pub fn on_click(self, f: impl Fn(&mut Runtime) -> HandlerResult + Send + Sync + 'static) -> Self {
        self.on(EventKind::Click, Handler::action(f))
    }

    #[must_use]
    pub fn on_input(self, f: impl Fn(&mut Runtime, &str) -> HandlerResult + Send + Sync + 'static) -> Self {
        self.on(EventKind::Input, Handler::text(f))
    }

    #[must_use]
    pub fn on_change(self, f: impl Fn(&mut Runtime, &str) -> HandlerResult + Send + Sync + 'static) -> Self {
        self.on(EventKind::Change, Handler::text(f))
    }

    #[must_use]
    pub fn on_submit(
        self,
        f: impl Fn(&mut Runtime, &FormFields) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.on(EventKind::Submit, Handler::form(f))
    }

    #[must_use]
    pub fn on_key_down(
        self,
        f: impl Fn(&mut Runtime, &KeyInput) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.on(EventKind::KeyDown, Handler::key(f))
    }
}

/// What a render function returns.
#[derive(Debug, Clone, Default)]
pub enum View {
    Element(ElementView),
    Text(String),
    Fragment(Vec<View>),
    Component(ComponentView),
    #[default]
    Empty,
}

impl From<ElementView> for View {
    fn from(element: ElementView) -> Self {
        View::Element(element)
    }
}

impl From<String> for View {
    fn from(text: String) -> Self {
        View::Text(text)
    }
}

impl From<&str> for View {
    fn from(text: &str) -> Self {
        View::Text(text.to_string())
    }
}

impl From<ComponentView> for View {
    fn from(component: ComponentView) -> Self {
        View::Component(component)
    }
}

/// Start an element.
pub fn el(tag: impl Into<Cow<'static, str>>) -> ElementView {
    ElementView {
        tag: tag.into(),
        key: None,
        attrs: IndexMap::new(),
        listeners: SmallVec::new(),
        children: Vec::new(),
    }
}

pub fn text(text: impl Into<String>) -> View {
    View::Text(text.into())
}

pub fn fragment<I, V>(items: I) -> View
where
    I: IntoIterator<Item = V>,
    V: Into<View>,
{
    View::Fragment(items.into_iter().map(Into::into).collect())
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_never_reissues() {
        let mut alloc = HandleAllocator::new();
        let a = alloc.mint();
        alloc.reserve(Handle::new(10));
        let b = alloc.mint();
        assert_eq!(a, Handle::new(1));
        assert_eq!(b, Handle::new(11));
        assert!(!a.is_root());
    }

    #[test]
    fn flatten_removes_nested_fragments() {
        let nodes = vec![
            VNode::text("a"),
            VNode::Fragment(vec![VNode::text("b"), VNode::Fragment(vec![VNode::text("c")])]),
        ];
        let flat = VNode::flatten(nodes);
        assert_eq!(flat, vec![VNode::text("a"), VNode::text("b"), VNode::text("c")]);
    }

    #[test]
    fn handler_shapes_accept_matching_events() {
        let action = Handler::action(|_| Ok(()));
        let text = Handler::text(|_, _| Ok(()));
        assert!(action.accepts(EventKind::Click));
        assert!(!action.accepts(EventKind::Input));
        assert!(text.accepts(EventKind::Change));
        assert!(!text.accepts(EventKind::KeyDown));
    }

    #[test]
    fn later_listener_replaces_earlier_one() {
        let view = el("button")
            .on_click(|_| Ok(()))
            .on(EventKind::Click, Handler::action(|_| Ok(())));
        assert_eq!(view.listeners.len(), 1);
    }
}
