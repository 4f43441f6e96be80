//! Patch operations.
//!
//! A patch batch transforms the renderer's live structure from one rendered
//! tree into the next. Patches are applied strictly in order; every handle a
//! patch names is either live before the batch or inserted by an earlier
//! patch in the same batch.

use super::vnode::{Handle, VNode};
use crate::codec::EventKind;

/// Closed registry of patch tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    Insert,
    Remove,
    Move,
    SetText,
    SetAttr,
    RemoveAttr,
    SetListeners,
    Reset,
    Extension,
}

impl PatchKind {
    pub const ALL: [PatchKind; 9] = [
        PatchKind::Insert,
        PatchKind::Remove,
        PatchKind::Move,
        PatchKind::SetText,
        PatchKind::SetAttr,
        PatchKind::RemoveAttr,
        PatchKind::SetListeners,
        PatchKind::Reset,
        PatchKind::Extension,
    ];

    pub fn code(self) -> u8 {
        match self {
            PatchKind::Insert => 1,
            PatchKind::Remove => 2,
            PatchKind::Move => 3,
            PatchKind::SetText => 4,
            PatchKind::SetAttr => 5,
            PatchKind::RemoveAttr => 6,
            PatchKind::SetListeners => 7,
            PatchKind::Reset => 8,
            PatchKind::Extension => 0xFF,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

/// A subtree shipped inline with an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSpec {
    Element {
        handle: Handle,
        tag: String,
        attrs: Vec<(String, String)>,
        listeners: Vec<EventKind>,
        children: Vec<NodeSpec>,
    },
    Text {
        handle: Handle,
        text: String,
    },
}

impl NodeSpec {
    pub fn handle(&self) -> Handle {
        match self {
            NodeSpec::Element { handle, .. } | NodeSpec::Text { handle, .. } => *handle,
        }
    }

    /// Wire form of a resolved node whose handles have been assigned.
    ///
    /// Returns `None` if any node in the subtree has no handle yet.
    pub fn from_vnode(node: &VNode) -> Option<Self> {
        match node {
            VNode::Element(element) => Some(NodeSpec::Element {
                handle: element.handle?,
                tag: element.tag.to_string(),
                attrs: element
                    .attrs
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.clone()))
                    .collect(),
                listeners: element.listener_kinds(),
                children: element
                    .children
                    .iter()
                    .map(Self::from_vnode)
                    .collect::<Option<Vec<_>>>()?,
            }),
            VNode::Text { handle, text } => Some(NodeSpec::Text {
                handle: (*handle)?,
                text: text.clone(),
            }),
            VNode::Fragment(_) => None,
        }
    }

    /// Every handle in the subtree, this node first.
    pub fn handles(&self) -> Vec<Handle> {
        let mut out = Vec::new();
        self.collect_handles(&mut out);
        out
    }

    fn collect_handles(&self, out: &mut Vec<Handle>) {
        out.push(self.handle());
        if let NodeSpec::Element { children, .. } = self {
            for child in children {
                child.collect_handles(out);
            }
        }
    }
}

/// One instruction against the live structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    /// Insert `node` under `parent` before sibling `before`; a `before` of
    /// handle 0 appends.
    Insert {
        parent: Handle,
        before: Handle,
        node: NodeSpec,
    },
    Remove {
        target: Handle,
    },
    /// Reposition a live node under `parent` before `before`.
    Move {
        target: Handle,
        parent: Handle,
        before: Handle,
    },
    SetText {
        target: Handle,
        text: String,
    },
    SetAttr {
        target: Handle,
        name: String,
        value: String,
    },
    RemoveAttr {
        target: Handle,
        name: String,
    },
    SetListeners {
        target: Handle,
        kinds: Vec<EventKind>,
    },
    /// Clear the root; the whole tree follows as inserts.
    Reset,
    Extension {
        target: Handle,
        subtype: u8,
        payload: Vec<u8>,
    },
}

impl Patch {
    pub fn kind(&self) -> PatchKind {
        match self {
            Patch::Insert { .. } => PatchKind::Insert,
            Patch::Remove { .. } => PatchKind::Remove,
            Patch::Move { .. } => PatchKind::Move,
            Patch::SetText { .. } => PatchKind::SetText,
            Patch::SetAttr { .. } => PatchKind::SetAttr,
            Patch::RemoveAttr { .. } => PatchKind::RemoveAttr,
            Patch::SetListeners { .. } => PatchKind::SetListeners,
            Patch::Reset => PatchKind::Reset,
            Patch::Extension { .. } => PatchKind::Extension,
        }
    }

    /// The handle written after the tag on the wire.
    pub fn target(&self) -> Handle {
        match self {
            Patch::Insert { parent, .. } => *parent,
            Patch::Remove { target }
            | Patch::Move { target, .. }
            | Patch::SetText { target, .. }
            | Patch::SetAttr { target, .. }
            | Patch::RemoveAttr { target, .. }
            | Patch::SetListeners { target, .. }
            | Patch::Extension { target, .. } => *target,
            Patch::Reset => Handle::ROOT,
        }
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_round_trip() {
        for kind in PatchKind::ALL {
            assert_eq!(PatchKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(PatchKind::from_code(0), None);
        assert_eq!(PatchKind::from_code(9), None);
    }

    #[test]
    fn node_spec_requires_assigned_handles() {
        assert_eq!(NodeSpec::from_vnode(&VNode::text("x")), None);
        let node = VNode::Text {
            handle: Some(Handle::new(3)),
            text: "x".into(),
        };
        assert_eq!(
            NodeSpec::from_vnode(&node).map(|spec| spec.handles()),
            Some(vec![Handle::new(3)])
        );
    }
}
