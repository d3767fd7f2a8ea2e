use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

use streambed::core::{Epoch, Message};
use streambed::storage::{CommitLog, LogConfig};

fn benchmark_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");

    for size in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let log = CommitLog::open(dir.path().to_path_buf(), LogConfig::default()).unwrap();
            let payload = Bytes::from(vec![0u8; size]);

            b.iter(|| {
                let message = Message::new(None, payload.clone());
                black_box(log.append_batch(Epoch::new(1), vec![message]).unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");

    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path().to_path_buf(), LogConfig::default()).unwrap();
    for _ in 0..1000 {
        let message = Message::new(None, Bytes::from(vec![0u8; 1000]));
        log.append_batch(Epoch::new(1), vec![message]).unwrap();
    }

    group.bench_function("read_1kb_batches", |b| {
        b.iter(|| {
            black_box(log.read_from(0, 64 * 1024, 1000).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_append, benchmark_read);
criterion_main!(benches);
