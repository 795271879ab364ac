use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use shmring::{RingConfig, RingReader, RingWriter};
use tokio::runtime::Runtime;

const CAPACITY: usize = 1024 * 1024;

fn bench_key(slot: u32) -> u32 {
    let key = 0x0B00_0000 | ((std::process::id() & 0xFFFF) << 4) | slot;
    shmring::cleanup(key).unwrap();
    key
}

fn benchmark_ring_write(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("ring_write");

    let sizes = [
        (1024, "1KB"),
        (16 * 1024, "16KB"),
        (256 * 1024, "256KB"),
    ];

    for (slot, (size, label)) in sizes.iter().enumerate() {
        // No readers: wraparounds release immediately
        let mut writer = RingWriter::create(RingConfig::new(bench_key(slot as u32), CAPACITY)).unwrap();
        let data = vec![0u8; *size];

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("write", label), size, |b, _| {
            b.iter(|| {
                runtime.block_on(writer.write(black_box(&data))).unwrap();
            });
        });

        writer.deinit().unwrap();
    }

    group.finish();
}

fn benchmark_write_read_roundtrip(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("ring_roundtrip");

    let sizes = [(4 * 1024, "4KB"), (64 * 1024, "64KB"), (512 * 1024, "512KB")];

    for (slot, (size, label)) in sizes.iter().enumerate() {
        let config = RingConfig::new(bench_key(8 + slot as u32), CAPACITY);
        let mut writer = RingWriter::create(config.clone()).unwrap();
        let mut reader = RingReader::attach(config).unwrap();
        let data = vec![128u8; *size];

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("write_read_cycle", label), size, |b, _| {
            b.iter(|| {
                // Polled together: a wraparound needs the reader's acknowledgement
                runtime.block_on(async {
                    let (written, chunk) =
                        futures::join!(writer.write(black_box(&data)), reader.read(*size));
                    written.unwrap();
                    black_box(chunk.unwrap());
                });
            });
        });

        reader.deinit().unwrap();
        writer.deinit().unwrap();
    }

    group.finish();
}

criterion_group!(benches, benchmark_ring_write, benchmark_write_read_roundtrip);
criterion_main!(benches);
