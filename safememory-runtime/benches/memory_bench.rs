//! Reference and allocator benchmarks using criterion.
//!
//! Run with: cargo bench --bench memory_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use safememory_runtime::{ControlBlock, Heap, RawOwning, INLINE_SLOTS};
use std::alloc::Layout;
use std::time::{Duration, Instant};

/// Time `iters` runs of `f` against a fresh heap, leaving its zombies out of
/// the measurement.
fn on_fresh_heap(iters: u64, mut f: impl FnMut(&Heap)) -> Duration {
    let heap = Heap::new();
    let start = Instant::now();
    for _ in 0..iters {
        f(&heap);
    }
    start.elapsed()
}

fn bench_owning_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("owning_lifecycle");

    group.bench_function("make_owning_and_reset", |b| {
        b.iter_custom(|iters| {
            on_fresh_heap(iters, |heap| {
                let mut owner = heap.make_owning(black_box(42u64));
                owner.reset();
            })
        });
    });

    group.bench_function("raw_owning_and_reset", |b| {
        b.iter_custom(|iters| {
            on_fresh_heap(iters, |heap| {
                let mut owner = RawOwning::new_in(heap, black_box(42u64));
                owner.reset();
            })
        });
    });

    group.bench_function("get", |b| {
        let heap = Heap::new();
        let owner = heap.make_owning(7u64);
        b.iter(|| black_box(owner.get().is_ok()));
    });

    group.finish();
}

fn bench_soft_references(c: &mut Criterion) {
    let mut group = c.benchmark_group("soft_references");

    let heap = Heap::new();
    let owner = heap.make_owning(String::from("target"));
    let soft = owner.soft();

    group.bench_function("clone_and_drop", |b| {
        b.iter(|| black_box(soft.clone()));
    });

    group.bench_function("with", |b| {
        b.iter(|| black_box(soft.with(|s| s.len())));
    });

    group.bench_function("take", |b| {
        let mut held = owner.soft();
        b.iter(|| {
            let moved = held.take();
            held = black_box(moved);
        });
    });

    // Registrations beyond the inline slots live in the overflow table.
    let extra: Vec<_> = (0..INLINE_SLOTS * 2).map(|_| owner.soft()).collect();
    group.bench_function("clone_and_drop_overflow", |b| {
        b.iter(|| black_box(soft.clone()));
    });
    drop(extra);

    group.finish();
}

fn bench_invalidation_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("invalidation_sweep");

    for n in [0usize, INLINE_SLOTS, 64, 1024] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_custom(|iters| {
                let heap = Heap::new();
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let mut owner = heap.make_owning(0u32);
                    let softs: Vec<_> = (0..n).map(|_| owner.soft()).collect();
                    let start = Instant::now();
                    owner.reset();
                    total += start.elapsed();
                    drop(black_box(softs));
                }
                total
            });
        });
    }

    group.finish();
}

fn bench_zombie_detector(c: &mut Criterion) {
    let mut group = c.benchmark_group("zombie_detector");
    let layout = Layout::from_size_align(64, 8).unwrap();

    for zombies in [16usize, 1024, 16384] {
        let heap = Heap::new();
        let live = heap.zombie_allocate(layout);
        for _ in 0..zombies {
            let block = heap.zombie_allocate(layout);
            unsafe { heap.zombie_deallocate(block) };
        }

        group.bench_with_input(BenchmarkId::new("dezombiefy_live", zombies), &live, |b, live| {
            b.iter(|| black_box(heap.dezombiefy(live.as_ptr() as *const u8)));
        });

        unsafe { heap.zombie_deallocate(live) };
        group.bench_with_input(BenchmarkId::new("dezombiefy_zombie", zombies), &live, |b, live| {
            b.iter(|| black_box(heap.dezombiefy(live.as_ptr() as *const u8)));
        });
    }

    group.bench_function("zombie_allocate_deallocate", |b| {
        b.iter_custom(|iters| {
            on_fresh_heap(iters, |heap| {
                let block = heap.zombie_allocate(black_box(layout));
                unsafe { heap.zombie_deallocate(block) };
            })
        });
    });

    group.finish();
}

fn bench_control_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_block");

    group.bench_function("insert_remove_inline", |b| {
        let mut cb = ControlBlock::new();
        b.iter(|| {
            let token = cb.mint_token();
            let slot = cb.insert(token);
            cb.remove(black_box(slot));
        });
    });

    group.bench_function("insert_remove_overflow", |b| {
        let mut cb = ControlBlock::new();
        for _ in 0..INLINE_SLOTS {
            let token = cb.mint_token();
            cb.insert(token);
        }
        b.iter(|| {
            let token = cb.mint_token();
            let slot = cb.insert(token);
            cb.remove(black_box(slot));
        });
    });

    group.bench_function("grow_to_256", |b| {
        b.iter(|| {
            let mut cb = ControlBlock::new();
            for _ in 0..256 {
                let token = cb.mint_token();
                cb.insert(token);
            }
            black_box(cb.capacity())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_owning_lifecycle,
    bench_soft_references,
    bench_invalidation_sweep,
    bench_zombie_detector,
    bench_control_block,
);

criterion_main!(benches);
