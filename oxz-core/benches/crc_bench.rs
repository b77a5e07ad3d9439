//! CRC throughput benchmarks.

use criterion::{Criterion, criterion_group, criterion_main};
use oxz_core::crc::{Crc32, Crc64};
use std::hint::black_box;

fn bench_crc(c: &mut Criterion) {
    let data: Vec<u8> = (0..1 << 20).map(|i| (i * 131) as u8).collect();

    c.bench_function("crc32_1mib", |b| {
        b.iter(|| Crc32::compute(black_box(&data)))
    });

    c.bench_function("crc64_1mib", |b| {
        b.iter(|| Crc64::compute(black_box(&data)))
    });

    c.bench_function("crc32_small", |b| {
        b.iter(|| Crc32::compute(black_box(&data[..13])))
    });
}

criterion_group!(benches, bench_crc);
criterion_main!(benches);
