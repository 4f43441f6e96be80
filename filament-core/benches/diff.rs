//! Benchmark: keyed list reconciliation

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use filament_core::codec::encode_patches;
use filament_core::config::CodecLimits;
use filament_core::render::{component, el, Differ, VNode};
use filament_core::Runtime;

fn resolve(keys: Vec<usize>) -> Vec<VNode> {
    let mut rt = Runtime::default();
    let root = rt.mount_root(component("rows", move |_| {
        let rows = keys.iter().map(|key| {
            el("tr")
                .key(format!("row-{key}"))
                .attr("data-id", key.to_string())
                .child(el("td").text(format!("row {key}")))
        });
        Ok(el("table").children(rows).into())
    }));
    rt.render_root(root).unwrap_or_default()
}

/// Old tree with handles assigned, plus an unresolved new tree.
fn fixture(old: Vec<usize>, new: Vec<usize>) -> (Differ, Vec<VNode>, Vec<VNode>) {
    let mut differ = Differ::new();
    let mut before = resolve(old);
    let _ = differ.diff(&[], &mut before);
    (differ, before, resolve(new))
}

fn bench_reorders(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    for size in [100usize, 1_000] {
        let base: Vec<usize> = (0..size).collect();

        let mut reversed = base.clone();
        reversed.reverse();

        let mut rotated = base.clone();
        rotated.rotate_right(1);

        let mut swapped = base.clone();
        swapped.swap(1, size - 2);

        for (name, next) in [("reverse", reversed), ("rotate", rotated), ("swap", swapped)] {
            group.bench_with_input(BenchmarkId::new(name, size), &next, |b, next| {
                b.iter_batched(
                    || fixture(base.clone(), next.clone()),
                    |(mut differ, before, mut after)| black_box(differ.diff(&before, &mut after)),
                    BatchSize::SmallInput,
                );
            });
        }
    }
    group.finish();
}

fn bench_initial_render(c: &mut Criterion) {
    let limits = CodecLimits::default();
    let tree = resolve((0..1_000).collect());
    c.bench_function("initial_render_encode_1000", |b| {
        b.iter_batched(
            || tree.clone(),
            |mut tree| {
                let patches = Differ::new().diff(&[], &mut tree).unwrap_or_default();
                black_box(encode_patches(&patches, &limits))
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_reorders, bench_initial_render);
criterion_main!(benches);
