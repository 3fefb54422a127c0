use cairn_chunker::*;
use criterion::*;
use rand::prelude::*;
use std::io::Read;
use std::time::Duration;

const SIZE: usize = 16_000_000;

// Returns (zeros, random)
fn get_test_data(size: usize) -> (Vec<u8>, Vec<u8>) {
    let mut vec = vec![0_u8; size];
    rand::thread_rng().fill_bytes(&mut vec);
    (vec![0_u8; size], vec)
}

fn chunk_boxed(read: impl Read + Send + 'static, chunker: impl Chunker) {
    let iterator = chunker.chunk_boxed(Box::new(read));
    for chunk in iterator {
        black_box(chunk).unwrap();
    }
}

fn bench_buzhash(c: &mut Criterion) {
    let (zeros, random) = get_test_data(SIZE);
    // Intentionally leak zeros and random to get an &'static
    let zeros: &'static [u8] = Box::leak(Box::new(zeros));
    let random: &'static [u8] = Box::leak(Box::new(random));
    let mut group = c.benchmark_group("buzhash");

    let chunker = BuzHash::with_mask_bits(0, 14);

    group.throughput(Throughput::Bytes(SIZE as u64));
    group.measurement_time(Duration::new(60, 0));
    group.sample_size(30);

    group.bench_function("zeros", |b| {
        b.iter(|| chunk_boxed(black_box(zeros), chunker))
    });

    group.bench_function("random", |b| {
        b.iter(|| chunk_boxed(black_box(random), chunker))
    });

    group.finish();
}

fn bench_static_size(c: &mut Criterion) {
    let (zeros, random) = get_test_data(SIZE);
    let zeros: &'static [u8] = Box::leak(Box::new(zeros));
    let random: &'static [u8] = Box::leak(Box::new(random));
    let mut group = c.benchmark_group("static-size");

    group.throughput(Throughput::Bytes(SIZE as u64));
    group.sample_size(30);

    group.bench_function("zeros", |b| {
        b.iter(|| chunk_boxed(black_box(zeros), StaticSize::default()))
    });

    group.bench_function("random", |b| {
        b.iter(|| chunk_boxed(black_box(random), StaticSize::default()))
    });

    group.finish();
}

criterion_group!(benches, bench_buzhash, bench_static_size);
criterion_main!(benches);
