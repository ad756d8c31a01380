//! Performance benchmarks for the JIT backend
//!
//! Run with: cargo bench
//!
//! These benchmarks measure the read paths that sit on the compiled-code
//! hot path (guard checks, equivalence membership) and the per-compile
//! costs (snapshot flattening, wire framing).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quickjit::guards::{guard_word_passes, read_guard_word, EquivalenceSet, GuardCell};
use quickjit::host::ShapeId;
use quickjit::protocol::wire;

/// Benchmark: the guard check generated code performs at every
/// speculation point
fn bench_guard_check(c: &mut Criterion) {
    let cell = GuardCell::with_value(0x7000_0000);
    let addr = cell.code_word_addr();

    c.bench_function("guard_check", |b| {
        b.iter(|| {
            let word = unsafe { read_guard_word(black_box(addr)) };
            black_box(guard_word_passes(word))
        })
    });
}

/// Benchmark: equivalence-set membership at different set sizes
fn bench_equivalence_contains(c: &mut Criterion) {
    let mut group = c.benchmark_group("equivalence_contains");
    for size in [2usize, 8, 32] {
        let shapes: Vec<ShapeId> = (0..size).map(|i| ShapeId(0x1000 + i * 0x40)).collect();
        let set = EquivalenceSet::new(shapes);
        set.normalized();

        group.bench_with_input(BenchmarkId::from_parameter(size), &set, |b, set| {
            b.iter(|| set.contains(black_box(ShapeId(0x1000 + (size / 2) * 0x40))))
        });
    }
    group.finish();
}

/// Benchmark: subset test over two ascending sequences
fn bench_equivalence_subset(c: &mut Criterion) {
    let small = EquivalenceSet::new((0..4).map(|i| ShapeId(0x1000 + i * 0x80)).collect());
    let large = EquivalenceSet::new((0..32).map(|i| ShapeId(0x1000 + i * 0x40)).collect());
    small.normalized();
    large.normalized();

    c.bench_function("equivalence_subset", |b| {
        b.iter(|| black_box(&small).is_subset_of(black_box(&large)))
    });
}

/// Benchmark: wire framing of a protocol message
fn bench_wire_framing(c: &mut Criterion) {
    let payload: Vec<u64> = (0..256).collect();
    let frame = wire::encode_frame(&payload).unwrap();

    let mut group = c.benchmark_group("wire");
    group.bench_function("encode", |b| {
        b.iter(|| wire::encode_frame(black_box(&payload)).unwrap())
    });
    group.bench_function("decode", |b| {
        b.iter(|| wire::decode_frame::<Vec<u64>>(black_box(&frame)).unwrap())
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_guard_check,
    bench_equivalence_contains,
    bench_equivalence_subset,
    bench_wire_framing
);
criterion_main!(benches);
