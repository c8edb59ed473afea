use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rfcapture::encode::encode_png;
use rfcapture::{FramePool, FrameWriter};
use std::time::Duration;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const FRAMES: u64 = 30;

fn frame() -> Vec<u8> {
    (0..(WIDTH * HEIGHT) as usize)
        .flat_map(|i| [(i % 251) as u8, 64, (i % 13) as u8, 255])
        .collect()
}

// Submit a second's worth of 720p frames and wait for them to hit disk.
fn bench_raw_writer(c: &mut Criterion) {
    let data = frame();
    let mut group = c.benchmark_group("raw_writer");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(data.len() as u64 * FRAMES));

    for threads in [1usize, 2, 3] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let dir = tempfile::tempdir().unwrap();
            let pool = FramePool::new(threads * 2 + 2, data.len()).unwrap();
            let writer = FrameWriter::new(dir.path(), pool, threads).unwrap();
            b.iter(|| {
                for seq in 0..FRAMES {
                    writer.submit_copy(seq, &data, Duration::from_secs(5)).unwrap();
                }
                writer.flush();
            });
        });
    }
    group.finish();
}

fn bench_png_encode(c: &mut Criterion) {
    let data = frame();
    let mut group = c.benchmark_group("png_encode");
    group.sample_size(10);
    group.bench_function("720p", |b| {
        b.iter(|| encode_png(&data, WIDTH, HEIGHT).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_raw_writer, bench_png_encode);
criterion_main!(benches);
