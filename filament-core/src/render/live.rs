//! Handle-indexed mirror of what the client holds.
//!
//! [`LiveTree`] applies patch batches exactly the way a renderer must:
//! strictly in order, rejecting any patch that names a handle which is not
//! live. Sessions in development mode keep one to check every outgoing batch
//! against the tree it was diffed from; test clients use it as their
//! renderer.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use super::patch::{NodeSpec, Patch};
use super::vnode::{Handle, VNode};
use crate::codec::EventKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("patch targets unknown handle {0}")]
    UnknownTarget(Handle),

    #[error("anchor {before} is not a child of {parent}")]
    UnknownAnchor { parent: Handle, before: Handle },

    #[error("handle {0} is already live")]
    DuplicateHandle(Handle),

    #[error("handle {handle} is not {expected}")]
    WrongKind { handle: Handle, expected: &'static str },

    #[error("cannot move {0} under itself")]
    Cycle(Handle),
}

/// Structural view of a tree with handles erased.
///
/// Attributes are sorted by name so that two trees built through different
/// patch orders compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        listeners: Vec<EventKind>,
        children: Vec<Shape>,
    },
    Text(String),
}

impl Shape {
    pub fn of(nodes: &[VNode]) -> Vec<Shape> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                VNode::Element(element) => {
                    let mut attrs: Vec<(String, String)> = element
                        .attrs
                        .iter()
                        .map(|(name, value)| (name.to_string(), value.clone()))
                        .collect();
                    attrs.sort();
                    out.push(Shape::Element {
                        tag: element.tag.to_string(),
                        attrs,
                        listeners: element.listener_kinds(),
                        children: Shape::of(&element.children),
                    });
                }
                VNode::Text { text, .. } => out.push(Shape::Text(text.clone())),
                VNode::Fragment(children) => out.extend(Shape::of(children)),
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
enum Content {
    Element {
        tag: String,
        attrs: BTreeMap<String, String>,
        listeners: Vec<EventKind>,
        children: Vec<Handle>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct LiveNode {
    parent: Handle,
    content: Content,
}

#[derive(Debug, Clone, Default)]
pub struct LiveTree {
    nodes: HashMap<Handle, LiveNode>,
    roots: Vec<Handle>,
}

impl LiveTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.nodes.contains_key(&handle)
    }

    /// Children of `parent`, or the top-level nodes for the root.
    pub fn children(&self, parent: Handle) -> Option<&[Handle]> {
        if parent.is_root() {
            return Some(&self.roots);
        }
        match &self.nodes.get(&parent)?.content {
            Content::Element { children, .. } => Some(children),
            Content::Text(_) => None,
        }
    }

    pub fn text(&self, handle: Handle) -> Option<&str> {
        match &self.nodes.get(&handle)?.content {
            Content::Text(text) => Some(text),
            Content::Element { .. } => None,
        }
    }

    pub fn attr(&self, handle: Handle, name: &str) -> Option<&str> {
        match &self.nodes.get(&handle)?.content {
            Content::Element { attrs, .. } => attrs.get(name).map(String::as_str),
            Content::Text(_) => None,
        }
    }

    pub fn apply_all(&mut self, patches: &[Patch]) -> Result<(), ApplyError> {
        patches.iter().try_for_each(|patch| self.apply(patch))
    }

    pub fn apply(&mut self, patch: &Patch) -> Result<(), ApplyError> {
        match patch {
            Patch::Insert { parent, before, node } => {
                for handle in node.handles() {
                    if handle.is_root() || self.nodes.contains_key(&handle) {
                        return Err(ApplyError::DuplicateHandle(handle));
                    }
                }
                let index = self.anchor_index(*parent, *before)?;
                self.attach(*parent, index, node.handle())?;
                self.insert_spec(*parent, node);
                Ok(())
            }
            Patch::Remove { target } => {
                let parent = self.node(*target)?.parent;
                self.detach(parent, *target);
                self.drop_subtree(*target);
                Ok(())
            }
            Patch::Move { target, parent, before } => {
                let old_parent = self.node(*target)?.parent;
                if self.is_within(*parent, *target) {
                    return Err(ApplyError::Cycle(*target));
                }
                if before == target {
                    return Err(ApplyError::UnknownAnchor {
                        parent: *parent,
                        before: *before,
                    });
                }
                self.detach(old_parent, *target);
                let index = self.anchor_index(*parent, *before)?;
                self.attach(*parent, index, *target)?;
                if let Some(node) = self.nodes.get_mut(target) {
                    node.parent = *parent;
                }
                Ok(())
            }
            Patch::SetText { target, text } => match &mut self.node_mut(*target)?.content {
                Content::Text(current) => {
                    current.clone_from(text);
                    Ok(())
                }
                Content::Element { .. } => Err(wrong_kind(*target, "a text node")),
            },
            Patch::SetAttr { target, name, value } => {
                let attrs = self.attrs_mut(*target)?;
                attrs.insert(name.clone(), value.clone());
                Ok(())
            }
            Patch::RemoveAttr { target, name } => {
                let attrs = self.attrs_mut(*target)?;
                attrs.remove(name);
                Ok(())
            }
            Patch::SetListeners { target, kinds } => match &mut self.node_mut(*target)?.content {
                Content::Element { listeners, .. } => {
                    listeners.clone_from(kinds);
                    Ok(())
                }
                Content::Text(_) => Err(wrong_kind(*target, "an element")),
            },
            Patch::Reset => {
                self.nodes.clear();
                self.roots.clear();
                Ok(())
            }
            Patch::Extension { target, .. } => {
                if target.is_root() || self.nodes.contains_key(target) {
                    Ok(())
                } else {
                    Err(ApplyError::UnknownTarget(*target))
                }
            }
        }
    }

    /// The mirrored tree with handles erased.
    pub fn shape(&self) -> Vec<Shape> {
        self.roots.iter().filter_map(|handle| self.shape_of(*handle)).collect()
    }

    fn shape_of(&self, handle: Handle) -> Option<Shape> {
        let node = self.nodes.get(&handle)?;
        Some(match &node.content {
            Content::Text(text) => Shape::Text(text.clone()),
            Content::Element {
                tag,
                attrs,
                listeners,
                children,
            } => Shape::Element {
                tag: tag.clone(),
                attrs: attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                listeners: listeners.clone(),
                children: children.iter().filter_map(|child| self.shape_of(*child)).collect(),
            },
        })
    }

    fn node(&self, handle: Handle) -> Result<&LiveNode, ApplyError> {
        self.nodes.get(&handle).ok_or(ApplyError::UnknownTarget(handle))
    }

    fn node_mut(&mut self, handle: Handle) -> Result<&mut LiveNode, ApplyError> {
        self.nodes.get_mut(&handle).ok_or(ApplyError::UnknownTarget(handle))
    }

    fn attrs_mut(&mut self, handle: Handle) -> Result<&mut BTreeMap<String, String>, ApplyError> {
        match &mut self.node_mut(handle)?.content {
            Content::Element { attrs, .. } => Ok(attrs),
            Content::Text(_) => Err(wrong_kind(handle, "an element")),
        }
    }

    fn children_mut(&mut self, parent: Handle) -> Result<&mut Vec<Handle>, ApplyError> {
        if parent.is_root() {
            return Ok(&mut self.roots);
        }
        match &mut self.node_mut(parent)?.content {
            Content::Element { children, .. } => Ok(children),
            Content::Text(_) => Err(wrong_kind(parent, "an element")),
        }
    }

    fn anchor_index(&mut self, parent: Handle, before: Handle) -> Result<usize, ApplyError> {
        let children = self.children_mut(parent)?;
        if before.is_root() {
            return Ok(children.len());
        }
        children
            .iter()
            .position(|child| *child == before)
            .ok_or(ApplyError::UnknownAnchor { parent, before })
    }

    fn attach(&mut self, parent: Handle, index: usize, handle: Handle) -> Result<(), ApplyError> {
        self.children_mut(parent)?.insert(index, handle);
        Ok(())
    }

    fn detach(&mut self, parent: Handle, handle: Handle) {
        if let Ok(children) = self.children_mut(parent) {
            children.retain(|child| *child != handle);
        }
    }

    fn is_within(&self, mut handle: Handle, ancestor: Handle) -> bool {
        while !handle.is_root() {
            if handle == ancestor {
                return true;
            }
            match self.nodes.get(&handle) {
                Some(node) => handle = node.parent,
                None => return false,
            }
        }
        false
    }

    fn insert_spec(&mut self, parent: Handle, spec: &NodeSpec) {
        let content = match spec {
            NodeSpec::Text { text, .. } => Content::Text(text.clone()),
            NodeSpec::Element {
                handle,
                tag,
                attrs,
                listeners,
                children,
            } => {
                for child in children {
                    self.insert_spec(*handle, child);
                }
                Content::Element {
                    tag: tag.clone(),
                    attrs: attrs.iter().cloned().collect(),
                    listeners: listeners.clone(),
                    children: children.iter().map(NodeSpec::handle).collect(),
                }
            }
        };
        self.nodes.insert(spec.handle(), LiveNode { parent, content });
    }

    fn drop_subtree(&mut self, handle: Handle) {
        if let Some(node) = self.nodes.remove(&handle) {
            if let Content::Element { children, .. } = node.content {
                for child in children {
                    self.drop_subtree(child);
                }
            }
        }
    }
}

fn wrong_kind(handle: Handle, expected: &'static str) -> ApplyError {
    ApplyError::WrongKind { handle, expected }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;

    fn text_node(handle: u64, text: &str) -> NodeSpec {
        NodeSpec::Text {
            handle: Handle::new(handle),
            text: text.into(),
        }
    }

    fn list(handle: u64, children: Vec<NodeSpec>) -> NodeSpec {
        NodeSpec::Element {
            handle: Handle::new(handle),
            tag: "ul".into(),
            attrs: vec![],
            listeners: vec![],
            children,
        }
    }

    fn insert(parent: u64, before: u64, node: NodeSpec) -> Patch {
        Patch::Insert {
            parent: Handle::new(parent),
            before: Handle::new(before),
            node,
        }
    }

    #[test]
    fn insert_before_anchor_and_append() {
        let mut tree = LiveTree::new();
        tree.apply(&insert(0, 0, list(1, vec![text_node(2, "a")]))).unwrap();
        tree.apply(&insert(1, 2, text_node(3, "b"))).unwrap();
        tree.apply(&insert(1, 0, text_node(4, "c"))).unwrap();
        assert_eq!(
            tree.children(Handle::new(1)).unwrap(),
            &[Handle::new(3), Handle::new(2), Handle::new(4)]
        );
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn unknown_targets_are_rejected() {
        let mut tree = LiveTree::new();
        assert_eq!(
            tree.apply(&Patch::Remove { target: Handle::new(9) }),
            Err(ApplyError::UnknownTarget(Handle::new(9)))
        );
        assert_eq!(
            tree.apply(&insert(0, 5, text_node(1, "x"))),
            Err(ApplyError::UnknownAnchor {
                parent: Handle::ROOT,
                before: Handle::new(5)
            })
        );
        assert!(tree.is_empty());
    }

    #[test]
    fn duplicate_handles_are_rejected() {
        let mut tree = LiveTree::new();
        tree.apply(&insert(0, 0, text_node(1, "x"))).unwrap();
        assert_eq!(
            tree.apply(&insert(0, 0, text_node(1, "y"))),
            Err(ApplyError::DuplicateHandle(Handle::new(1)))
        );
    }

    #[test]
    fn remove_drops_whole_subtree() {
        let mut tree = LiveTree::new();
        tree.apply(&insert(0, 0, list(1, vec![text_node(2, "a"), text_node(3, "b")])))
            .unwrap();
        tree.apply(&Patch::Remove { target: Handle::new(1) }).unwrap();
        assert!(tree.is_empty());
        assert!(tree.children(Handle::ROOT).unwrap().is_empty());
    }

    #[test]
    fn move_reorders_and_rejects_cycles() {
        let mut tree = LiveTree::new();
        tree.apply(&insert(0, 0, list(1, vec![text_node(2, "a"), text_node(3, "b")])))
            .unwrap();
        tree.apply(&Patch::Move {
            target: Handle::new(3),
            parent: Handle::new(1),
            before: Handle::new(2),
        })
        .unwrap();
        assert_eq!(tree.children(Handle::new(1)).unwrap(), &[Handle::new(3), Handle::new(2)]);
        assert_eq!(
            tree.apply(&Patch::Move {
                target: Handle::new(1),
                parent: Handle::new(1),
                before: Handle::ROOT,
            }),
            Err(ApplyError::Cycle(Handle::new(1)))
        );
    }

    #[test]
    fn set_text_on_element_is_wrong_kind() {
        let mut tree = LiveTree::new();
        tree.apply(&insert(0, 0, list(1, vec![]))).unwrap();
        assert!(matches!(
            tree.apply(&Patch::SetText {
                target: Handle::new(1),
                text: "x".into()
            }),
            Err(ApplyError::WrongKind { .. })
        ));
    }

    #[test]
    fn reset_clears_everything() {
        let mut tree = LiveTree::new();
        tree.apply(&insert(0, 0, text_node(1, "x"))).unwrap();
        tree.apply(&Patch::Reset).unwrap();
        assert!(tree.is_empty());
        tree.apply(&insert(0, 0, text_node(2, "y"))).unwrap();
        assert_eq!(tree.text(Handle::new(2)), Some("y"));
    }
}
