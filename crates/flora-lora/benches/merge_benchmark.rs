//! Benchmarks for delta computation and merging.
//!
//! Run with: cargo bench -p flora-lora

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flora_core::Device;
use flora_lora::{dense_delta, merge_split_weights, split_dense_weights, BaseLayer};
use mlx_rs::Array;

/// Deterministic test data.
fn generate_test_data(shape: &[i32]) -> Array {
    let size: i32 = shape.iter().product();
    let data: Vec<f32> = (0..size)
        .map(|i| (i as f32 * 1.234567).sin() * 0.1)
        .collect();
    Array::from_slice(&data, shape)
}

/// Dense delta for linear layers of increasing width.
fn bench_linear_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("linear_delta");
    let rank = 16;

    for dim in [256, 1024, 3072].iter() {
        let up = generate_test_data(&[*dim, rank]);
        let down = generate_test_data(&[rank, *dim]);

        group.throughput(Throughput::Elements((*dim as u64) * (*dim as u64)));
        group.bench_with_input(BenchmarkId::new("up_matmul_down", dim), dim, |b, _| {
            b.iter(|| {
                let delta = dense_delta(black_box(&up), black_box(&down), Device::Cpu).unwrap();
                delta.eval().unwrap();
            });
        });
    }

    group.finish();
}

/// 3x3 convolution delta.
fn bench_conv_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv_delta");
    let rank = 8;

    for channels in [64, 256].iter() {
        let up = generate_test_data(&[*channels, rank, 1, 1]);
        let down = generate_test_data(&[rank, *channels, 3, 3]);

        group.bench_with_input(BenchmarkId::new("3x3", channels), channels, |b, _| {
            b.iter(|| {
                let delta = dense_delta(black_box(&up), black_box(&down), Device::Cpu).unwrap();
                delta.eval().unwrap();
            });
        });
    }

    group.finish();
}

/// Folding a delta into a base weight.
fn bench_merge_into_layer(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_into_layer");
    let dim = 1024;
    let delta = generate_test_data(&[dim, dim]);

    group.throughput(Throughput::Elements((dim as u64) * (dim as u64)));
    group.bench_function("linear_1024", |b| {
        let mut layer = BaseLayer::linear(generate_test_data(&[dim, dim]), None).unwrap();
        b.iter(|| {
            layer.merge_delta(black_box(&delta), None).unwrap();
            layer.weight().eval().unwrap();
        });
    });

    group.finish();
}

/// Split-QKV fold and unfold at Flux block sizes.
fn bench_split_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_qkv");
    let rank = 16;
    let split_dims = [3072, 3072, 3072];

    let downs: Vec<Array> = split_dims
        .iter()
        .map(|_| generate_test_data(&[rank, 3072]))
        .collect();
    let ups: Vec<Array> = split_dims
        .iter()
        .map(|&d| generate_test_data(&[d, rank]))
        .collect();

    group.bench_function("merge", |b| {
        b.iter(|| {
            let (down, up) =
                merge_split_weights(black_box(&downs), black_box(&ups), &split_dims).unwrap();
            up.eval().unwrap();
            down.eval().unwrap();
        });
    });

    let (down, up) = merge_split_weights(&downs, &ups, &split_dims).unwrap();
    group.bench_function("split", |b| {
        b.iter(|| {
            let (downs, ups) =
                split_dense_weights(black_box(&down), black_box(&up), &split_dims).unwrap();
            for a in downs.iter().chain(&ups) {
                a.eval().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_linear_delta,
    bench_conv_delta,
    bench_merge_into_layer,
    bench_split_roundtrip,
);
criterion_main!(benches);
