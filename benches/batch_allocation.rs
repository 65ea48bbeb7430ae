//! Batch allocation benchmarks against the in-process fake kernel.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use dmabuf_gralloc::prelude::*;
use dmabuf_gralloc::testing::FakeIonKernel;
use std::sync::Arc;

fn bench_independent(c: &mut Criterion) {
    let mut group = c.benchmark_group("independent_batch");
    let kernel = Arc::new(FakeIonKernel::modern("bench_independent"));
    let alloc = Allocator::with_kernel(AllocatorConfig::default(), kernel).unwrap();
    alloc.open().unwrap();

    for count in [1, 2, 4] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                // Distinct usages keep the batch off the shared path.
                let mut descs: Vec<_> = (0..count)
                    .map(|i| {
                        let usage = if i % 2 == 0 {
                            UsageBits::GPU_TEXTURE
                        } else {
                            UsageBits::CPU_READ_OFTEN
                        };
                        BufferDescriptor::rgba(256, 256, usage)
                    })
                    .collect();
                let mut a = alloc.allocate(&mut descs).unwrap();
                alloc.free(&mut a.buffers).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_shared(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_batch");
    let kernel = Arc::new(FakeIonKernel::modern("bench_shared"));
    let alloc = Allocator::with_kernel(AllocatorConfig::default(), kernel).unwrap();
    alloc.open().unwrap();

    for count in [2, 4, 8] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut descs =
                    vec![BufferDescriptor::nv12(640, 480, UsageBits::VIDEO_DECODER); count];
                let mut a = alloc.allocate(&mut descs).unwrap();
                alloc.free(&mut a.buffers).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_hfr_container(c: &mut Criterion) {
    let mut group = c.benchmark_group("hfr_container");
    let kernel = Arc::new(FakeIonKernel::modern("bench_hfr"));
    let alloc = Allocator::with_kernel(AllocatorConfig::default(), kernel).unwrap();
    alloc.open().unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("nv12_720p", |b| {
        b.iter(|| {
            let mut descs = [BufferDescriptor::nv12(
                1280,
                720,
                UsageBits::CAMERA | UsageBits::HFR_MODE,
            )];
            let mut a = alloc.allocate(&mut descs).unwrap();
            alloc.free(&mut a.buffers).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_independent, bench_shared, bench_hfr_container);
criterion_main!(benches);
