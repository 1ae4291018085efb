//! Batch submission benchmarks.
//!
//! Run with: `cargo bench -p ringbatch`
//!
//! Measures the per-batch overhead of queue setup, submission and completion
//! harvesting at different batch sizes, against the in-memory facility and
//! (when the kernel allows it) io_uring.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ringbatch::memory::MemoryFacility;
use ringbatch::{BatchExecutor, ReadRequest, WriteRequest};
use std::os::fd::AsFd;

const BLOCK_SIZE: usize = 4096;

fn write_requests(data: &[u8]) -> Vec<WriteRequest<'_>> {
    data.chunks(BLOCK_SIZE)
        .enumerate()
        .map(|(i, block)| WriteRequest::new(block, (i * BLOCK_SIZE) as i64))
        .collect()
}

fn bench_memory_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_batch_write");

    for blocks in [1usize, 16, 256, 1024] {
        let data = vec![0xA5u8; blocks * BLOCK_SIZE];
        let exec = BatchExecutor::new(MemoryFacility::new());
        let file = exec.facility().create_file(&[]).unwrap();
        let requests = write_requests(&data);

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("blocks", blocks), &blocks, |b, _| {
            b.iter(|| {
                let outcome = exec.batch_write(black_box(&requests), file.as_fd()).unwrap();
                black_box(outcome.total());
            });
        });
    }

    group.finish();
}

fn bench_memory_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_batch_read");

    for blocks in [1usize, 16, 256, 1024] {
        let exec = BatchExecutor::new(MemoryFacility::new());
        let file = exec
            .facility()
            .create_file(&vec![0x5Au8; blocks * BLOCK_SIZE])
            .unwrap();
        let mut bufs = vec![vec![0u8; BLOCK_SIZE]; blocks];

        group.throughput(Throughput::Bytes((blocks * BLOCK_SIZE) as u64));
        group.bench_with_input(BenchmarkId::new("blocks", blocks), &blocks, |b, _| {
            b.iter(|| {
                let mut requests: Vec<_> = bufs
                    .iter_mut()
                    .enumerate()
                    .map(|(i, buf)| ReadRequest::new(buf, (i * BLOCK_SIZE) as i64))
                    .collect();
                let outcome = exec.batch_read(&mut requests, file.as_fd()).unwrap();
                black_box(outcome.total());
            });
        });
    }

    group.finish();
}

#[cfg(target_os = "linux")]
fn bench_uring_write(c: &mut Criterion) {
    use ringbatch::uring::UringFacility;

    if !UringFacility::is_available() {
        eprintln!("io_uring unavailable, skipping uring benchmarks");
        return;
    }

    let mut group = c.benchmark_group("uring_batch_write");
    let temp = tempfile::NamedTempFile::new().unwrap();
    let exec = BatchExecutor::new(UringFacility::new());

    for blocks in [1usize, 16, 256] {
        let data = vec![0xC3u8; blocks * BLOCK_SIZE];
        let requests = write_requests(&data);

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("blocks", blocks), &blocks, |b, _| {
            b.iter(|| {
                let outcome = exec.batch_write(&requests, temp.as_file().as_fd()).unwrap();
                black_box(outcome.total());
            });
        });
    }

    group.finish();
}

#[cfg(not(target_os = "linux"))]
fn bench_uring_write(_c: &mut Criterion) {}

criterion_group!(
    benches,
    bench_memory_write,
    bench_memory_read,
    bench_uring_write
);
criterion_main!(benches);
