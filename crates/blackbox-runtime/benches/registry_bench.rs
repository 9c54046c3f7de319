//! Benchmarks for registry passes and boundary pruning.
//!
//! Run with: cargo bench -p blackbox-runtime --bench registry_bench

use blackbox_runtime::{
    Boundary, BoundaryOptions, Capabilities, ConsumerId, Mapping, ProviderConfig, Registry,
    RegistryHandle, StateSelector, Value,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

/// A state with `keys` integer entries, `changed` of them bumped.
fn make_state(keys: usize, changed: usize) -> Mapping {
    Mapping::from_entries((0..keys).map(|i| {
        let bump = i64::from(i < changed);
        (format!("k{i}"), Value::Int(i as i64 + bump))
    }))
}

fn slice(key: String) -> StateSelector {
    StateSelector::from_source(move |state: &Mapping| {
        Value::Map(Mapping::from_entries([(
            key.as_str(),
            state.get(&key).cloned().unwrap_or_default(),
        )]))
    })
}

fn populated(slots: usize) -> RegistryHandle {
    let registry = RegistryHandle::new(Registry::default());
    for i in 0..slots {
        registry.set_derivation(ConsumerId::new(i as u64), slice(format!("k{i}")), Mapping::new());
    }
    registry
}

fn bench_pass_unchanged(c: &mut Criterion) {
    let mut group = c.benchmark_group("pass/unchanged");

    for slots in [16, 256, 4096] {
        group.throughput(Throughput::Elements(slots as u64));
        let registry = populated(slots);
        let state = make_state(slots, 0);
        let _ = registry.recompute_all(&state);
        group.bench_with_input(BenchmarkId::new("recompute_all", slots), &(), |b, _| {
            b.iter(|| black_box(registry.recompute_all(&state)))
        });
    }

    group.finish();
}

fn bench_pass_alternating(c: &mut Criterion) {
    let mut group = c.benchmark_group("pass/alternating_10pct");

    for slots in [16, 256, 4096] {
        group.throughput(Throughput::Elements(slots as u64));
        let registry = populated(slots);
        let states = [make_state(slots, 0), make_state(slots, slots / 10)];
        let mut flip = 0;
        group.bench_with_input(BenchmarkId::new("recompute_all", slots), &(), |b, _| {
            b.iter(|| {
                flip ^= 1;
                black_box(registry.recompute_all(&states[flip]))
            })
        });
    }

    group.finish();
}

fn bench_boundary_prune(c: &mut Criterion) {
    let mut group = c.benchmark_group("boundary/should_propagate");

    for tracked in [8, 128, 2048] {
        group.throughput(Throughput::Elements(tracked as u64));
        let caps = Capabilities::new(&ProviderConfig::default());
        let boundary = Boundary::mount(&caps, &Mapping::new(), BoundaryOptions::default());
        let registry = caps.registry();
        let ids: Vec<ConsumerId> = (0..tracked).map(|_| caps.ids().next_id()).collect();
        for (i, id) in ids.iter().enumerate() {
            registry.set_derivation(*id, slice(format!("k{i}")), Mapping::new());
        }
        boundary.scope().register(&ids);
        let state = make_state(tracked, 0);
        let _ = registry.recompute_all(&state);
        let Ok(snapshot) = registry.recompute_all(&state) else {
            continue;
        };
        let props = Mapping::new();
        group.bench_with_input(BenchmarkId::new("all_facsimile", tracked), &(), |b, _| {
            b.iter(|| black_box(boundary.should_propagate(&snapshot, &props)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_pass_unchanged,
    bench_pass_alternating,
    bench_boundary_prune,
);
criterion_main!(benches);
