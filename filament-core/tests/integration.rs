//! Integration Tests for the Session Pipeline
//!
//! These tests drive whole sessions through the public API: events go in as
//! wire frames, patches come out as wire frames, and the assertions are made
//! on what a client would actually receive.

use std::sync::Arc;
use std::time::Duration;

use filament_core::codec::{decode_frame, decode_patches, encode_event, encode_frame, Event};
use filament_core::config::CodecLimits;
use filament_core::error::UsageError;
use filament_core::reactive::{GlobalSignals, HookOrderError};
use filament_core::render::{
    component, el, text, ComponentView, Differ, Handle, LiveTree, NodeSpec, Patch, RenderError, Shape, View, VNode,
};
use filament_core::session::{Session, SessionLoop};
use filament_core::transport::MemorySink;
use filament_core::{HandlerError, Runtime, RuntimeConfig};
use proptest::prelude::*;

fn batches(sink: &MemorySink) -> Vec<Vec<Patch>> {
    let limits = CodecLimits::default();
    sink.take()
        .iter()
        .map(|frame| decode_patches(decode_frame(frame, &limits).unwrap(), &limits).unwrap())
        .collect()
}

fn click_frame(target: Handle) -> Vec<u8> {
    let limits = CodecLimits::default();
    encode_frame(&encode_event(&Event::click(target), &limits).unwrap(), &limits).unwrap()
}

fn session_with(view: ComponentView) -> (Session, MemorySink) {
    let sink = MemorySink::new();
    let mut session = Session::new("it", &RuntimeConfig::default(), Box::new(sink.clone()));
    session.mount(view).unwrap();
    (session, sink)
}

fn list(items: Vec<&'static str>) -> ComponentView {
    component("list", move |cx| {
        let init = items.clone();
        let order = cx.session_signal("order", move || init)?;
        let order = cx.get(order);
        Ok(el("ul")
            .children(order.into_iter().map(|item| el("li").key(item).text(item)))
            .into())
    })
}

fn component_list(items: Vec<&'static str>) -> ComponentView {
    component("rows", move |cx| {
        let init = items.clone();
        let order = cx.session_signal("order", move || init)?;
        let order = cx.get(order);
        Ok(el("ul")
            .children(
                order
                    .into_iter()
                    .map(|item| component("row", move |_| Ok(el("li").text(item).into())).key(item)),
            )
            .into())
    })
}

fn set_order(session: &mut Session, order: Vec<&'static str>) {
    session
        .run_unit("reorder", move |rt| {
            let signal = rt.session_signal("order", Vec::<&'static str>::new)?;
            rt.set(signal, order)?;
            Ok(())
        })
        .unwrap();
}

fn item_handle(session: &Session, index: usize) -> Handle {
    session.tree()[0].as_element().unwrap().children[index].handle().unwrap()
}

/// Test that a click on a counter produces exactly one render pass and a
/// single text update.
#[test]
fn counter_click_sends_one_text_update() {
    let (mut session, sink) = session_with(component("counter", |cx| {
        let count = cx.use_signal(|| 5i32)?;
        let value = cx.get(count);
        Ok(el("button")
            .text(value.to_string())
            .on_click(move |rt| {
                rt.update(count, |n| *n += 1)?;
                Ok(())
            })
            .into())
    }));
    sink.take();
    let passes = session.stats().render_passes;

    let button = session.tree()[0].handle().unwrap();
    session.handle_frame(&click_frame(button)).unwrap();

    let sent = batches(&sink);
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].as_slice(), [Patch::SetText { text, .. }] if text == "6"));
    assert_eq!(session.stats().render_passes, passes + 1);
}

/// Test that swapping two keyed items repositions exactly one of them and
/// leaves the third untouched.
#[test]
fn keyed_swap_is_a_single_move() {
    let (mut session, sink) = session_with(list(vec!["a", "b", "c"]));
    sink.take();
    let (a, b, c) = (item_handle(&session, 0), item_handle(&session, 1), item_handle(&session, 2));

    set_order(&mut session, vec!["b", "a", "c"]);

    let sent = batches(&sink);
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].as_slice(), [Patch::Move { target, .. }] if *target == a || *target == b));
    assert_eq!(item_handle(&session, 2), c);
}

/// Test that rotating a keyed list moves only the item that left the
/// longest run of preserved order.
#[test]
fn keyed_rotation_is_a_single_move() {
    let (mut session, sink) = session_with(list(vec!["a", "b", "c"]));
    sink.take();
    let c = item_handle(&session, 2);

    set_order(&mut session, vec!["c", "a", "b"]);

    let sent = batches(&sink);
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].as_slice(), [Patch::Move { target, .. }] if *target == c));
    assert_eq!(item_handle(&session, 0), c);
}

/// Test that inserting into a keyed list is a single insert and leaves the
/// other items alone.
#[test]
fn keyed_insert_is_a_single_insert() {
    let (mut session, sink) = session_with(list(vec!["a", "b", "c"]));
    sink.take();
    let b = item_handle(&session, 1);

    set_order(&mut session, vec!["a", "x", "b", "c"]);

    let sent = batches(&sink);
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        sent[0].as_slice(),
        [Patch::Insert { before, node: NodeSpec::Element { tag, .. }, .. }] if *before == b && tag == "li"
    ));
}

/// Test that a failed handler leaves no trace and a successful one applies
/// all of its writes in one frame.
#[test]
fn handlers_commit_all_or_nothing() {
    let (mut session, sink) = session_with(component("pair", |cx| {
        let a = cx.session_signal("a", || 0u32)?;
        let b = cx.session_signal("b", || 0u32)?;
        let (a, b) = (cx.get(a), cx.get(b));
        Ok(el("p").text(format!("{a}/{b}")).into())
    }));
    sink.take();

    let write_both = |fail: bool| {
        move |rt: &mut Runtime| {
            let a = rt.session_signal("a", || 0u32)?;
            let b = rt.session_signal("b", || 0u32)?;
            rt.update(a, |n| *n += 1)?;
            rt.update(b, |n| *n += 1)?;
            if fail {
                return Err(HandlerError::msg("rejected"));
            }
            Ok(())
        }
    };

    session.run_unit("fails", write_both(true)).unwrap();
    assert!(sink.is_empty());
    assert_eq!(session.stats().aborted_transactions, 1);

    session.run_unit("succeeds", write_both(false)).unwrap();
    let sent = batches(&sink);
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].as_slice(), [Patch::SetText { text, .. }] if text == "1/1"));
}

/// Test that two effects feeding each other are cut off and the session
/// keeps serving events afterwards.
#[test]
fn effect_ping_pong_is_bounded() {
    let config = RuntimeConfig {
        max_commit_cycles: 6,
        ..RuntimeConfig::default()
    };
    let sink = MemorySink::new();
    let mut session = Session::new("it", &config, Box::new(sink.clone()));
    session
        .mount(component("pingpong", |cx| {
            let a = cx.use_signal(|| 0u64)?;
            let b = cx.use_signal(|| 0u64)?;
            cx.use_effect(move |rt| {
                let next = rt.get(a) + 1;
                let _ = rt.set(b, next);
                None
            })?;
            cx.use_effect(move |rt| {
                let next = rt.get(b) + 1;
                let _ = rt.set(a, next);
                None
            })?;
            let tick = cx.use_signal(|| 0u32)?;
            let value = cx.get(tick);
            Ok(el("button")
                .text(value.to_string())
                .on_click(move |rt| {
                    rt.update(tick, |n| *n += 1)?;
                    Ok(())
                })
                .into())
        }))
        .unwrap();

    assert_eq!(session.stats().overruns, 1);
    let overrun = session.last_overrun().unwrap();
    assert_eq!(overrun.cycles, 6);
    assert!(!overrun.chain.is_empty());

    sink.take();
    let button = session.tree()[0].handle().unwrap();
    session.handle_frame(&click_frame(button)).unwrap();
    let sent = batches(&sink);
    assert!(sent.iter().flatten().any(|patch| matches!(patch, Patch::SetText { text, .. } if text == "1")));
}

/// Test that reordering keyed components moves their nodes instead of
/// rewriting them in place.
#[test]
fn keyed_component_swap_is_a_single_move() {
    let (mut session, sink) = session_with(component_list(vec!["a", "b", "c"]));
    sink.take();
    let (a, b, c) = (item_handle(&session, 0), item_handle(&session, 1), item_handle(&session, 2));

    set_order(&mut session, vec!["b", "a", "c"]);
    let sent = batches(&sink);
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].as_slice(), [Patch::Move { target, .. }] if *target == a || *target == b));
    assert_eq!(item_handle(&session, 0), b);
    assert_eq!(item_handle(&session, 1), a);
    assert_eq!(item_handle(&session, 2), c);
}

/// Test that a root whose first render failed renders once the signal it
/// was waiting on changes.
#[test]
fn failed_root_recovers_when_its_input_changes() {
    let (mut session, sink) = session_with(component("gate", |cx| {
        let ready = cx.session_signal("ready", || false)?;
        if !cx.get(ready) {
            return Err(RenderError::msg("still loading"));
        }
        Ok(el("p").text("ready").into())
    }));
    assert!(session.tree().is_empty());
    assert!(batches(&sink).is_empty());

    session
        .run_unit("load", |rt| {
            let ready = rt.session_signal("ready", || false)?;
            rt.set(ready, true)?;
            Ok(())
        })
        .unwrap();

    let sent = batches(&sink);
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        sent[0].as_slice(),
        [Patch::Insert { node: NodeSpec::Element { tag, .. }, .. }] if tag == "p"
    ));
    assert_eq!(session.tree().len(), 1);
}

/// Test that a hook-order violation is reported and the previous output
/// stays on the client.
#[test]
fn conditional_hook_keeps_previous_output() {
    let (mut session, sink) = session_with(component("panel", |cx| {
        let flag = cx.session_signal("flag", || true)?;
        if cx.get(flag) {
            let _extra = cx.use_signal(|| 1u8)?;
        }
        let label = cx.use_signal(|| "label".to_string())?;
        let label = cx.get(label);
        Ok(text(label))
    }));
    sink.take();

    session
        .run_unit("toggle", |rt| {
            let flag = rt.session_signal("flag", || true)?;
            rt.set(flag, false)?;
            Ok(())
        })
        .unwrap();

    assert!(sink.is_empty());
    assert!(matches!(
        session.runtime().diagnostics(),
        [UsageError::HookOrder(HookOrderError::TypeMismatch { .. })]
    ));
    assert!(matches!(&session.tree()[0], VNode::Text { text, .. } if text == "label"));
}

/// Test that garbage on the wire is answered with a full resync and the
/// session keeps working under the new handles.
#[test]
fn undecodable_frame_resyncs_the_client() {
    let (mut session, sink) = session_with(list(vec!["a", "b"]));
    sink.take();

    session.handle_frame(&[0xFF, 0xFF, 0xFF]).unwrap();
    let sent = batches(&sink);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0][0], Patch::Reset);

    let mut client = LiveTree::new();
    client.apply_all(&sent[0]).unwrap();
    assert_eq!(client.shape(), Shape::of(session.tree()));
}

/// Test that a global signal written in one session reaches another
/// session's client.
#[tokio::test]
async fn global_signals_reach_other_sessions() {
    let globals = Arc::new(GlobalSignals::new());
    let banner = || {
        component("banner", |cx| {
            let banner = cx.global_signal("banner", || "hello".to_string())?;
            let value = cx.get(banner);
            Ok(el("h1").text(value).into())
        })
    };
    let config = RuntimeConfig::default();

    let writer = Session::new("writer", &config, Box::new(MemorySink::new())).with_globals(globals.clone());
    let (writer_loop, writer) = SessionLoop::new(writer, banner());
    let writer_task = writer_loop.spawn();

    let reader_sink = MemorySink::new();
    let reader = Session::new("reader", &config, Box::new(reader_sink.clone())).with_globals(globals.clone());
    let (reader_loop, reader) = SessionLoop::new(reader, banner());
    let reader_task = reader_loop.spawn();

    for _ in 0..200 {
        if reader_sink.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    writer
        .enqueue(|rt| {
            let banner = rt.global_signal("banner", || "hello".to_string())?;
            rt.set(banner, "news".to_string())?;
            Ok(())
        })
        .unwrap();
    for _ in 0..200 {
        if reader_sink.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let sent = batches(&reader_sink);
    assert_eq!(sent.len(), 2);
    assert!(matches!(sent[1].as_slice(), [Patch::SetText { text, .. }] if text == "news"));
    assert_eq!(globals.get::<String>("banner").as_deref(), Some("news"));

    writer.close();
    reader.close();
    writer_task.await.unwrap();
    reader_task.await.unwrap();
}

/// A keyed list, either of plain elements or of keyed components each
/// rendering one element.
fn keyed_view(items: Vec<(u8, bool)>, as_components: bool) -> ComponentView {
    component("items", move |_| {
        let children = items.iter().map(move |&(key, flagged)| -> View {
            let row = move || {
                let item = el("li").text(format!("item {key}"));
                if flagged {
                    item.attr("class", "flagged")
                } else {
                    item
                }
            };
            if as_components {
                component("row", move |_| Ok(row().into())).key(format!("k{key}")).into()
            } else {
                row().key(format!("k{key}")).into()
            }
        });
        Ok(el("ul").children(children).into())
    })
}

fn resolve(items: Vec<(u8, bool)>, as_components: bool) -> Vec<VNode> {
    let mut rt = Runtime::default();
    let root = rt.mount_root(keyed_view(items, as_components));
    rt.render_root(root).unwrap()
}

fn keyed_list() -> impl Strategy<Value = Vec<(u8, bool)>> {
    proptest::sample::subsequence((0u8..10).collect::<Vec<_>>(), 0..=10)
        .prop_shuffle()
        .prop_flat_map(|keys| {
            let len = keys.len();
            (Just(keys), proptest::collection::vec(any::<bool>(), len))
        })
        .prop_map(|(keys, flags)| keys.into_iter().zip(flags).collect())
}

proptest! {
    /// Applying the differ's patches to the client's tree always yields the
    /// newly rendered tree, and retained keys keep their handles, whether the
    /// keys sit on elements or on components.
    #[test]
    fn diff_patches_reproduce_the_new_tree(
        before in keyed_list(),
        after in keyed_list(),
        as_components in any::<bool>(),
    ) {
        let mut differ = Differ::new();
        let mut client = LiveTree::new();

        let mut old = resolve(before, as_components);
        client.apply_all(&differ.diff(&[], &mut old).unwrap()).unwrap();

        let mut new = resolve(after, as_components);
        let patches = differ.diff(&old, &mut new).unwrap();
        client.apply_all(&patches).unwrap();

        prop_assert_eq!(client.shape(), Shape::of(&new));

        let handles = |tree: &[VNode]| -> Vec<(String, Handle)> {
            tree[0]
                .as_element()
                .map(|ul| {
                    ul.children
                        .iter()
                        .filter_map(|child| Some((child.key()?.to_string(), child.handle()?)))
                        .collect()
                })
                .unwrap_or_default()
        };
        let kept = handles(&old);
        for (key, handle) in handles(&new) {
            if let Some((_, previous)) = kept.iter().find(|(k, _)| *k == key) {
                prop_assert_eq!(*previous, handle);
            }
        }
    }
}
