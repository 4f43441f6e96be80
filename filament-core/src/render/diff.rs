//! Tree Differ
//!
//! Turns the previously sent tree and a newly resolved tree into an ordered
//! patch batch, assigning handles to the new tree as it goes.
//!
//! # How Diffing Works
//!
//! 1. Siblings are matched first by key: a keyed new node takes the old
//!    sibling with the same key and tag. Unkeyed nodes fall back to the old
//!    sibling at the same index when that one is unkeyed, unclaimed and of
//!    the same kind. A matched node inherits the old handle; everything else
//!    gets a freshly minted one.
//!
//! 2. Among matched nodes, the longest run that kept its relative order
//!    (the longest increasing subsequence of old positions) stays put.
//!
//! 3. Siblings are emitted right to left, each anchored before its right
//!    neighbour: new nodes become inserts, matched nodes outside the stable
//!    run become moves. Matched pairs are then diffed recursively for text,
//!    attributes, listeners and children.
//!
//! 4. Removals of unmatched old nodes go at the very end of the batch, so no
//!    earlier patch can refer to a node that is already gone.
//!
//! Unkeyed lists are matched purely by position, so inserting into the
//! middle of one re-creates everything after the insertion point. Dynamic
//! lists should be keyed.
//!
//! The differ also tracks every handle it believes is live. An old node
//! without a live handle means the tree and the client have diverged; that
//! is reported as [`DiffError::Desync`] and the session answers with a full
//! resync.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::trace;

use super::patch::{NodeSpec, Patch};
use super::vnode::{Element, Handle, HandleAllocator, VNode};

/// Internal consistency failure; the session must resync.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("handle {handle} is not live ({context})")]
    Desync { handle: Handle, context: &'static str },

    #[error("previous tree contains a node without a handle under {parent}")]
    MissingHandle { parent: Handle },

    #[error("handle {0} was minted twice")]
    DuplicateHandle(Handle),
}

/// Stateful differ for one session.
#[derive(Debug, Default)]
pub struct Differ {
    alloc: HandleAllocator,
    live: HashSet<Handle>,
}

impl Differ {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles currently live.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.live.contains(&handle)
    }

    /// Diff the root's children and assign handles to `new`.
    ///
    /// `old` must be the tree returned by the previous call (or by
    /// [`resync`](Self::resync)).
    pub fn diff(&mut self, old: &[VNode], new: &mut Vec<VNode>) -> Result<Vec<Patch>, DiffError> {
        *new = VNode::flatten(std::mem::take(new));
        let mut batch = Batch::default();
        self.diff_children(Handle::ROOT, old, new, &mut batch)?;
        let Batch { mut patches, removals } = batch;
        patches.extend(removals);
        trace!(patches = patches.len(), live = self.live.len(), "diffed tree");
        Ok(patches)
    }

    /// Forget everything the client holds and send `tree` from scratch.
    ///
    /// Every node gets a new handle; handles from before the reset are
    /// never reused.
    pub fn resync(&mut self, tree: &mut Vec<VNode>) -> Result<Vec<Patch>, DiffError> {
        *tree = VNode::flatten(std::mem::take(tree));
        self.live.clear();
        let mut patches = Vec::with_capacity(tree.len() + 1);
        patches.push(Patch::Reset);
        for node in tree.iter_mut() {
            self.assign_fresh(node)?;
            patches.push(Patch::Insert {
                parent: Handle::ROOT,
                before: Handle::ROOT,
                node: spec(node, Handle::ROOT)?,
            });
        }
        Ok(patches)
    }

    fn diff_children(
        &mut self,
        parent: Handle,
        old: &[VNode],
        new: &mut [VNode],
        batch: &mut Batch,
    ) -> Result<(), DiffError> {
        for node in old {
            let handle = node.handle().ok_or(DiffError::MissingHandle { parent })?;
            if !self.live.contains(&handle) {
                return Err(DiffError::Desync {
                    handle,
                    context: "previous tree",
                });
            }
        }

        let sources = match_siblings(old, new);

        for (node, source) in new.iter_mut().zip(&sources) {
            match source {
                Some(i) => {
                    if let Some(handle) = old[*i].handle() {
                        node.set_handle(handle);
                    }
                }
                None => self.assign_fresh(node)?,
            }
        }

        let matched: Vec<usize> = sources.iter().flatten().copied().collect();
        let stable: HashSet<usize> = longest_increasing_subsequence(&matched)
            .into_iter()
            .map(|pos| matched[pos])
            .collect();

        let mut anchor = Handle::ROOT;
        for j in (0..new.len()).rev() {
            let handle = new[j].handle().ok_or(DiffError::MissingHandle { parent })?;
            match sources[j] {
                None => batch.patches.push(Patch::Insert {
                    parent,
                    before: anchor,
                    node: spec(&new[j], parent)?,
                }),
                Some(i) if !stable.contains(&i) => batch.patches.push(Patch::Move {
                    target: handle,
                    parent,
                    before: anchor,
                }),
                Some(_) => {}
            }
            anchor = handle;
        }

        for (j, source) in sources.iter().enumerate() {
            if let Some(i) = source {
                self.diff_node(&old[*i], &mut new[j], batch)?;
            }
        }

        let claimed: HashSet<usize> = matched.iter().copied().collect();
        for (i, node) in old.iter().enumerate() {
            if claimed.contains(&i) {
                continue;
            }
            if let Some(handle) = node.handle() {
                batch.removals.push(Patch::Remove { target: handle });
            }
            self.release(node);
        }
        Ok(())
    }

    fn diff_node(&mut self, old: &VNode, new: &mut VNode, batch: &mut Batch) -> Result<(), DiffError> {
        match (old, new) {
            (VNode::Text { text: before, .. }, VNode::Text { handle, text }) => {
                if before != text {
                    let target = handle.ok_or(DiffError::MissingHandle { parent: Handle::ROOT })?;
                    batch.patches.push(Patch::SetText {
                        target,
                        text: text.clone(),
                    });
                }
                Ok(())
            }
            (VNode::Element(before), VNode::Element(after)) => {
                let target = after.handle.ok_or(DiffError::MissingHandle { parent: Handle::ROOT })?;
                diff_attrs(target, before, after, batch);
                let kinds = after.listener_kinds();
                if before.listener_kinds() != kinds {
                    batch.patches.push(Patch::SetListeners { target, kinds });
                }
                self.diff_children(target, &before.children, &mut after.children, batch)
            }
            // Matching only pairs nodes of the same kind.
            _ => Ok(()),
        }
    }

    fn assign_fresh(&mut self, node: &mut VNode) -> Result<(), DiffError> {
        let handle = self.alloc.mint();
        if !self.live.insert(handle) {
            return Err(DiffError::DuplicateHandle(handle));
        }
        node.set_handle(handle);
        if let VNode::Element(element) = node {
            for child in &mut element.children {
                self.assign_fresh(child)?;
            }
        }
        Ok(())
    }

    fn release(&mut self, node: &VNode) {
        if let Some(handle) = node.handle() {
            self.live.remove(&handle);
        }
        if let VNode::Element(element) = node {
            for child in &element.children {
                self.release(child);
            }
        }
    }
}

#[derive(Default)]
struct Batch {
    patches: Vec<Patch>,
    removals: Vec<Patch>,
}

fn spec(node: &VNode, parent: Handle) -> Result<NodeSpec, DiffError> {
    NodeSpec::from_vnode(node).ok_or(DiffError::MissingHandle { parent })
}

fn diff_attrs(target: Handle, before: &Element, after: &Element, batch: &mut Batch) {
    for (name, value) in &after.attrs {
        if before.attrs.get(name) != Some(value) {
            batch.patches.push(Patch::SetAttr {
                target,
                name: name.to_string(),
                value: value.clone(),
            });
        }
    }
    for name in before.attrs.keys() {
        if !after.attrs.contains_key(name) {
            batch.patches.push(Patch::RemoveAttr {
                target,
                name: name.to_string(),
            });
        }
    }
}

fn compatible(old: &VNode, new: &VNode) -> bool {
    match (old, new) {
        (VNode::Text { .. }, VNode::Text { .. }) => true,
        (VNode::Element(a), VNode::Element(b)) => a.tag == b.tag && a.key == b.key,
        _ => false,
    }
}

/// For every new sibling, the index of the old sibling it continues.
fn match_siblings(old: &[VNode], new: &[VNode]) -> Vec<Option<usize>> {
    let mut keyed: HashMap<&str, usize> = HashMap::new();
    for (i, node) in old.iter().enumerate() {
        if let Some(key) = node.key() {
            keyed.entry(key).or_insert(i);
        }
    }

    let mut claimed = vec![false; old.len()];
    let mut sources = vec![None; new.len()];

    for (j, node) in new.iter().enumerate() {
        if let Some(key) = node.key() {
            if let Some(&i) = keyed.get(key) {
                if !claimed[i] && compatible(&old[i], node) {
                    claimed[i] = true;
                    sources[j] = Some(i);
                }
            }
        }
    }

    for (j, node) in new.iter().enumerate() {
        if node.key().is_some() {
            continue;
        }
        if let Some(candidate) = old.get(j) {
            if !claimed[j] && candidate.key().is_none() && compatible(candidate, node) {
                claimed[j] = true;
                sources[j] = Some(j);
            }
        }
    }
    sources
}

/// Positions (into `seq`) of one longest strictly increasing subsequence.
fn longest_increasing_subsequence(seq: &[usize]) -> Vec<usize> {
    // tails[k]: position of the smallest tail of an increasing run of length k+1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];

    for (pos, &value) in seq.iter().enumerate() {
        let k = tails.partition_point(|&t| seq[t] < value);
        if k > 0 {
            prev[pos] = Some(tails[k - 1]);
        }
        if k == tails.len() {
            tails.push(pos);
        } else {
            tails[k] = pos;
        }
    }

    let mut out = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(pos) = cursor {
        out.push(pos);
        cursor = prev[pos];
    }
    out.reverse();
    out
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::live::{LiveTree, Shape};
    use crate::render::{el, ElementView};

    fn node(view: ElementView) -> VNode {
        fn convert(view: ElementView) -> VNode {
            VNode::Element(Element {
                tag: view.tag,
                key: view.key,
                handle: None,
                attrs: view.attrs,
                listeners: view.listeners,
                children: view
                    .children
                    .into_iter()
                    .map(|child| match child {
                        crate::render::View::Element(element) => convert(element),
                        crate::render::View::Text(text) => VNode::text(text),
                        other => panic!("unsupported test view {other:?}"),
                    })
                    .collect(),
            })
        }
        convert(view)
    }

    fn keyed_list(keys: &[&'static str]) -> Vec<VNode> {
        vec![node(
            el("ul").children(keys.iter().map(|key| el("li").key(*key).text(key.to_string()))),
        )]
    }

    fn handles_of(tree: &[VNode]) -> Vec<Handle> {
        tree[0]
            .as_element()
            .unwrap()
            .children
            .iter()
            .filter_map(VNode::handle)
            .collect()
    }

    fn sync(differ: &mut Differ, live: &mut LiveTree, old: &[VNode], new: &mut Vec<VNode>) -> Vec<Patch> {
        let patches = differ.diff(old, new).unwrap();
        live.apply_all(&patches).unwrap();
        assert_eq!(live.shape(), Shape::of(new));
        patches
    }

    #[test]
    fn lis_finds_stable_run() {
        assert_eq!(longest_increasing_subsequence(&[1, 0, 2]).len(), 2);
        assert_eq!(longest_increasing_subsequence(&[0, 1, 2, 3]), vec![0, 1, 2, 3]);
        assert_eq!(longest_increasing_subsequence(&[3, 2, 1]).len(), 1);
        assert!(longest_increasing_subsequence(&[]).is_empty());
    }

    #[test]
    fn first_diff_inserts_everything() {
        let mut differ = Differ::new();
        let mut live = LiveTree::new();
        let mut tree = keyed_list(&["a", "b"]);
        let patches = sync(&mut differ, &mut live, &[], &mut tree);
        assert_eq!(patches.len(), 1);
        assert!(matches!(patches[0], Patch::Insert { parent: Handle::ROOT, .. }));
        assert_eq!(differ.live_count(), 5);
    }

    #[test]
    fn reorder_moves_exactly_one_node() {
        let mut differ = Differ::new();
        let mut live = LiveTree::new();
        let mut old = keyed_list(&["a", "b", "c"]);
        sync(&mut differ, &mut live, &[], &mut old);
        let before = handles_of(&old);

        let mut new = keyed_list(&["b", "a", "c"]);
        let patches = sync(&mut differ, &mut live, &old, &mut new);
        assert_eq!(patches.len(), 1);
        assert!(matches!(patches[0], Patch::Move { .. }));
        let after = handles_of(&new);
        assert_eq!(after, vec![before[1], before[0], before[2]]);
    }

    #[test]
    fn keyed_insert_is_one_patch() {
        let mut differ = Differ::new();
        let mut live = LiveTree::new();
        let mut old = keyed_list(&["a", "b", "c", "d"]);
        sync(&mut differ, &mut live, &[], &mut old);
        let before = handles_of(&old);

        let mut new = keyed_list(&["a", "b", "x", "c", "d"]);
        let patches = sync(&mut differ, &mut live, &old, &mut new);
        assert_eq!(patches.len(), 1);
        assert!(matches!(
            &patches[0],
            Patch::Insert { before, .. } if *before == handles_of(&old)[2]
        ));
        let after = handles_of(&new);
        assert_eq!([after[0], after[1], after[3], after[4]], [before[0], before[1], before[2], before[3]]);
        assert!(!before.contains(&after[2]));
    }

    #[test]
    fn removals_come_last() {
        let mut differ = Differ::new();
        let mut live = LiveTree::new();
        let mut old = keyed_list(&["a", "b", "c"]);
        sync(&mut differ, &mut live, &[], &mut old);

        let mut new = keyed_list(&["c", "d"]);
        let patches = sync(&mut differ, &mut live, &old, &mut new);
        let first_remove = patches
            .iter()
            .position(|patch| matches!(patch, Patch::Remove { .. }))
            .unwrap();
        assert!(patches[first_remove..]
            .iter()
            .all(|patch| matches!(patch, Patch::Remove { .. })));
        assert_eq!(patches.len() - first_remove, 2);
    }

    #[test]
    fn attribute_text_and_listener_updates() {
        let mut differ = Differ::new();
        let mut live = LiveTree::new();
        let mut old = vec![node(el("button").attr("class", "a").attr("title", "t").text("Count: 5"))];
        sync(&mut differ, &mut live, &[], &mut old);

        let mut new = vec![node(
            el("button")
                .attr("class", "b")
                .text("Count: 6")
                .on_click(|_| Ok(())),
        )];
        let patches = sync(&mut differ, &mut live, &old, &mut new);
        let button = old[0].handle().unwrap();
        assert!(patches.contains(&Patch::SetAttr {
            target: button,
            name: "class".into(),
            value: "b".into()
        }));
        assert!(patches.contains(&Patch::RemoveAttr {
            target: button,
            name: "title".into()
        }));
        assert!(patches.iter().any(|p| matches!(p, Patch::SetText { text, .. } if text == "Count: 6")));
        assert!(patches.iter().any(|p| matches!(p, Patch::SetListeners { .. })));
        assert_eq!(patches.len(), 4);
    }

    #[test]
    fn unchanged_tree_produces_nothing() {
        let mut differ = Differ::new();
        let mut live = LiveTree::new();
        let mut old = keyed_list(&["a", "b"]);
        sync(&mut differ, &mut live, &[], &mut old);
        let mut new = keyed_list(&["a", "b"]);
        assert!(sync(&mut differ, &mut live, &old, &mut new).is_empty());
    }

    #[test]
    fn tag_change_replaces_node() {
        let mut differ = Differ::new();
        let mut live = LiveTree::new();
        let mut old = vec![node(el("span").text("x"))];
        sync(&mut differ, &mut live, &[], &mut old);
        let mut new = vec![node(el("div").text("x"))];
        let patches = sync(&mut differ, &mut live, &old, &mut new);
        assert!(matches!(patches.as_slice(), [Patch::Insert { .. }, Patch::Remove { .. }]));
        assert_ne!(old[0].handle(), new[0].handle());
        assert_eq!(differ.live_count(), 2);
    }

    #[test]
    fn unknown_old_handle_is_desync() {
        let mut differ = Differ::new();
        let old = vec![VNode::Text {
            handle: Some(Handle::new(999)),
            text: "ghost".into(),
        }];
        let mut new = vec![VNode::text("x")];
        assert_eq!(
            differ.diff(&old, &mut new),
            Err(DiffError::Desync {
                handle: Handle::new(999),
                context: "previous tree"
            })
        );
    }

    #[test]
    fn resync_reissues_every_handle() {
        let mut differ = Differ::new();
        let mut old = keyed_list(&["a"]);
        differ.diff(&[], &mut old).unwrap();
        let mut tree = keyed_list(&["a"]);
        let patches = differ.resync(&mut tree).unwrap();
        assert_eq!(patches[0], Patch::Reset);
        assert_eq!(differ.live_count(), 3);
        assert!(handles_of(&tree)[0] > handles_of(&old)[0]);

        let mut live = LiveTree::new();
        live.apply_all(&patches).unwrap();
        assert_eq!(live.shape(), Shape::of(&tree));
    }
}
