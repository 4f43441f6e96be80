//! Patch batches.
//!
//! A batch is `{count: varint, patch...}`. Each patch is
//! `{tag: u8, target: varint handle, payload}`; for an insert the target is
//! the parent. Inserted subtrees are written inline: a node tag (0 element,
//! 1 text), its handle, then either tag name, attributes, listener kinds and
//! children, or the text.

use super::error::{DecodeError, EncodeError};
use super::event::EventKind;
use super::reader::Reader;
use super::writer::Writer;
use crate::config::CodecLimits;
use crate::render::{Handle, NodeSpec, Patch, PatchKind};

const NODE_ELEMENT: u8 = 0;
const NODE_TEXT: u8 = 1;

pub fn encode_patches(patches: &[Patch], limits: &CodecLimits) -> Result<Vec<u8>, EncodeError> {
    let mut w = Writer::new(limits);
    w.count("patch batch", patches.len(), limits.max_batch_len)?;
    for patch in patches {
        write_patch(&mut w, patch)?;
    }
    Ok(w.into_inner())
}

fn write_patch(w: &mut Writer<'_>, patch: &Patch) -> Result<(), EncodeError> {
    w.u8(patch.kind().code());
    w.handle(patch.target());
    match patch {
        Patch::Insert { before, node, .. } => {
            w.handle(*before);
            write_node(w, node)?;
        }
        Patch::Remove { .. } | Patch::Reset => {}
        Patch::Move { parent, before, .. } => {
            w.handle(*parent);
            w.handle(*before);
        }
        Patch::SetText { text, .. } => w.string("text", text)?,
        Patch::SetAttr { name, value, .. } => {
            w.string("attribute name", name)?;
            w.string("attribute value", value)?;
        }
        Patch::RemoveAttr { name, .. } => w.string("attribute name", name)?,
        Patch::SetListeners { kinds, .. } => write_kinds(w, kinds)?,
        Patch::Extension { subtype, payload, .. } => {
            w.u8(*subtype);
            w.bytes("extension payload", payload)?;
        }
    }
    Ok(())
}

fn write_kinds(w: &mut Writer<'_>, kinds: &[EventKind]) -> Result<(), EncodeError> {
    w.collection_len("listeners", kinds.len())?;
    for kind in kinds {
        w.u8(kind.code());
    }
    Ok(())
}

fn write_node(w: &mut Writer<'_>, node: &NodeSpec) -> Result<(), EncodeError> {
    w.descend()?;
    match node {
        NodeSpec::Element {
            handle,
            tag,
            attrs,
            listeners,
            children,
        } => {
            w.u8(NODE_ELEMENT);
            w.handle(*handle);
            w.string("tag", tag)?;
            w.collection_len("attributes", attrs.len())?;
            for (name, value) in attrs {
                w.string("attribute name", name)?;
                w.string("attribute value", value)?;
            }
            write_kinds(w, listeners)?;
            w.collection_len("children", children.len())?;
            for child in children {
                write_node(w, child)?;
            }
        }
        NodeSpec::Text { handle, text } => {
            w.u8(NODE_TEXT);
            w.handle(*handle);
            w.string("text", text)?;
        }
    }
    w.ascend();
    Ok(())
}

/// Decode one complete batch.
pub fn decode_patches(bytes: &[u8], limits: &CodecLimits) -> Result<Vec<Patch>, DecodeError> {
    let mut r = Reader::new(bytes, limits);
    let count = r.count("patch batch", limits.max_batch_len)?;
    let mut patches = Vec::with_capacity(count);
    for _ in 0..count {
        patches.push(read_patch(&mut r)?);
    }
    r.finish()?;
    Ok(patches)
}

fn read_patch(r: &mut Reader<'_>) -> Result<Patch, DecodeError> {
    let tag = r.u8()?;
    let kind = PatchKind::from_code(tag).ok_or(DecodeError::UnknownTag { what: "patch", tag })?;
    let target = r.handle()?;
    let patch = match kind {
        PatchKind::Insert => {
            let before = r.handle()?;
            let node = read_node(r)?;
            Patch::Insert {
                parent: target,
                before,
                node,
            }
        }
        PatchKind::Remove => Patch::Remove { target },
        PatchKind::Move => Patch::Move {
            target,
            parent: r.handle()?,
            before: r.handle()?,
        },
        PatchKind::SetText => Patch::SetText {
            target,
            text: r.string("text")?,
        },
        PatchKind::SetAttr => Patch::SetAttr {
            target,
            name: r.string("attribute name")?,
            value: r.string("attribute value")?,
        },
        PatchKind::RemoveAttr => Patch::RemoveAttr {
            target,
            name: r.string("attribute name")?,
        },
        PatchKind::SetListeners => Patch::SetListeners {
            target,
            kinds: read_kinds(r)?,
        },
        PatchKind::Reset if !target.is_root() => {
            return Err(DecodeError::UnexpectedTarget {
                what: "reset",
                target: target.get(),
            })
        }
        PatchKind::Reset => Patch::Reset,
        PatchKind::Extension => Patch::Extension {
            target,
            subtype: r.u8()?,
            payload: r.bytes("extension payload")?.to_vec(),
        },
    };
    Ok(patch)
}

fn read_kinds(r: &mut Reader<'_>) -> Result<Vec<EventKind>, DecodeError> {
    let len = r.collection_len("listeners")?;
    let mut kinds = Vec::with_capacity(len);
    for _ in 0..len {
        let tag = r.u8()?;
        kinds.push(EventKind::from_code(tag).ok_or(DecodeError::UnknownTag { what: "event", tag })?);
    }
    Ok(kinds)
}

fn read_node(r: &mut Reader<'_>) -> Result<NodeSpec, DecodeError> {
    r.descend()?;
    let tag = r.u8()?;
    let node = match tag {
        NODE_ELEMENT => {
            let handle = r.handle()?;
            let tag = r.string("tag")?;
            let len = r.collection_len("attributes")?;
            let mut attrs = Vec::with_capacity(len);
            for _ in 0..len {
                let name = r.string("attribute name")?;
                let value = r.string("attribute value")?;
                attrs.push((name, value));
            }
            let listeners = read_kinds(r)?;
            let len = r.collection_len("children")?;
            let mut children = Vec::with_capacity(len);
            for _ in 0..len {
                children.push(read_node(r)?);
            }
            NodeSpec::Element {
                handle,
                tag,
                attrs,
                listeners,
                children,
            }
        }
        NODE_TEXT => NodeSpec::Text {
            handle: r.handle()?,
            text: r.string("text")?,
        },
        tag => return Err(DecodeError::UnknownTag { what: "node", tag }),
    };
    r.ascend();
    Ok(node)
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn h(raw: u64) -> Handle {
        Handle::new(raw)
    }

    fn nested(depth: usize) -> NodeSpec {
        let mut node = NodeSpec::Text {
            handle: h(depth as u64 + 1),
            text: "leaf".into(),
        };
        for level in (0..depth).rev() {
            node = NodeSpec::Element {
                handle: h(level as u64 + 1),
                tag: "div".into(),
                attrs: Vec::new(),
                listeners: Vec::new(),
                children: vec![node],
            };
        }
        node
    }

    #[test]
    fn every_patch_kind_survives() {
        let limits = CodecLimits::default();
        let batch = vec![
            Patch::Reset,
            Patch::Insert {
                parent: Handle::ROOT,
                before: Handle::ROOT,
                node: NodeSpec::Element {
                    handle: h(1),
                    tag: "button".into(),
                    attrs: vec![("class".into(), "primary".into())],
                    listeners: vec![EventKind::Click],
                    children: vec![NodeSpec::Text {
                        handle: h(2),
                        text: "Count: 5".into(),
                    }],
                },
            },
            Patch::Move {
                target: h(1),
                parent: Handle::ROOT,
                before: h(7),
            },
            Patch::SetText {
                target: h(2),
                text: "Count: 6".into(),
            },
            Patch::SetAttr {
                target: h(1),
                name: "disabled".into(),
                value: "".into(),
            },
            Patch::RemoveAttr {
                target: h(1),
                name: "class".into(),
            },
            Patch::SetListeners {
                target: h(1),
                kinds: vec![EventKind::Click, EventKind::KeyDown],
            },
            Patch::Extension {
                target: h(1),
                subtype: 3,
                payload: vec![1, 2, 3],
            },
            Patch::Remove { target: h(1) },
        ];
        let bytes = encode_patches(&batch, &limits).unwrap();
        assert_eq!(decode_patches(&bytes, &limits).unwrap(), batch);
    }

    #[test]
    fn set_text_record_layout() {
        let limits = CodecLimits::default();
        let bytes = encode_patches(
            &[Patch::SetText {
                target: h(2),
                text: "6".into(),
            }],
            &limits,
        )
        .unwrap();
        assert_eq!(bytes, vec![1, 4, 2, 1, b'6']);
    }

    #[test]
    fn reset_with_a_target_is_rejected() {
        let limits = CodecLimits::default();
        let reset = PatchKind::Reset.code();
        assert_eq!(decode_patches(&[1, reset, 0], &limits).unwrap(), vec![Patch::Reset]);
        assert_eq!(
            decode_patches(&[1, reset, 5], &limits),
            Err(DecodeError::UnexpectedTarget {
                what: "reset",
                target: 5
            })
        );
    }

    #[test]
    fn depth_ceiling_applies_both_ways() {
        let limits = CodecLimits {
            max_depth: 4,
            ..CodecLimits::default()
        };
        let insert = |node| Patch::Insert {
            parent: Handle::ROOT,
            before: Handle::ROOT,
            node,
        };
        assert!(encode_patches(&[insert(nested(3))], &limits).is_ok());
        assert_eq!(
            encode_patches(&[insert(nested(4))], &limits),
            Err(EncodeError::TooDeep { limit: 4 })
        );

        let roomy = CodecLimits::default();
        let bytes = encode_patches(&[insert(nested(10))], &roomy).unwrap();
        assert_eq!(
            decode_patches(&bytes, &limits),
            Err(DecodeError::TooDeep { limit: 4 })
        );
    }

    #[test]
    fn inflated_batch_count_is_rejected() {
        let limits = CodecLimits::default();
        let mut bytes = Vec::new();
        crate::codec::varint::encode_varint(u32::MAX as u64, &mut bytes);
        assert!(matches!(
            decode_patches(&bytes, &limits),
            Err(DecodeError::TooLong { what: "patch batch", .. })
        ));
    }

    proptest! {
        #[test]
        fn decoding_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let limits = CodecLimits::default();
            let _ = decode_patches(&bytes, &limits);
        }

        #[test]
        fn truncation_is_always_an_error(cut in 0usize..40) {
            let limits = CodecLimits::default();
            let bytes = encode_patches(&[
                Patch::SetAttr { target: h(9), name: "title".into(), value: "filament".into() },
                Patch::SetText { target: h(10), text: "hello world".into() },
            ], &limits).unwrap();
            prop_assume!(cut < bytes.len());
            prop_assert!(decode_patches(&bytes[..cut], &limits).is_err());
        }
    }
}
