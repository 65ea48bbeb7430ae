//! Batch allocation through the public allocator against the fake device.

use dmabuf_gralloc::batch::{can_share, representative};
use dmabuf_gralloc::prelude::*;
use dmabuf_gralloc::testing::FakeIonKernel;
use std::collections::HashSet;
use std::sync::Arc;

fn allocator_with(kernel: &Arc<FakeIonKernel>, config: AllocatorConfig) -> Allocator {
    Allocator::with_kernel(config, kernel.clone()).unwrap()
}

fn allocator(kernel: &Arc<FakeIonKernel>) -> Allocator {
    allocator_with(kernel, AllocatorConfig::default())
}

fn display_config() -> AllocatorConfig {
    AllocatorConfig {
        platform: PlatformConfig {
            display_heap: Some(DisplayHeap::Dma),
            ..PlatformConfig::default()
        },
        ..AllocatorConfig::default()
    }
}

#[test]
fn test_rgba_composer_end_to_end() {
    let kernel = Arc::new(FakeIonKernel::modern("it_rgba"));
    let alloc = allocator_with(&kernel, display_config());
    let mut descs = [BufferDescriptor::rgba(1920, 1080, UsageBits::COMPOSER)];

    let mut a = alloc.allocate(&mut descs).unwrap();
    assert!(!a.shared);
    assert_eq!(a.buffers.len(), 1);
    assert_eq!(descs[0].fd_count, 1);

    let buf = &mut a.buffers[0];
    assert_eq!(buf.heap(), HeapType::Dma);
    assert!(buf.flags().contains(PrivateFlags::DMA_HEAP));
    assert_eq!(buf.fd_count(), 1);
    assert!(buf.fd(0) >= 0);
    assert_eq!(kernel.allocation_log()[0].heap, "ion_dma_heap");
    assert_eq!(buf.min_page_size(), 1920 * 1080 * 4);

    assert_eq!(alloc.map(buf).unwrap(), MapStatus::Mapped);
    buf.plane_slice_mut(0).unwrap()[0] = 0x7f;
    alloc.sync_start(buf, true, true).unwrap();
    alloc.sync_end(buf, true, true).unwrap();
    assert!(kernel.syncs().is_empty());

    alloc.free(&mut a.buffers).unwrap();
    assert_eq!(a.buffers[0].fd(0), -1);
    assert_eq!(kernel.live_buffer_fds(), 0);
}

#[test]
fn test_identical_yuv_descriptors_share() {
    let kernel = Arc::new(FakeIonKernel::modern("it_yuv_share"));
    let alloc = allocator(&kernel);
    let usage = UsageBits::VIDEO_DECODER | UsageBits::GPU_TEXTURE;
    let mut descs = [
        BufferDescriptor::nv12(1280, 720, usage),
        BufferDescriptor::nv12(1280, 720, usage),
    ];

    let a = alloc.allocate(&mut descs).unwrap();
    assert!(a.shared);
    // The representative's two planes are the only kernel allocations.
    assert_eq!(kernel.allocations(), 2);

    let first = a.buffers[0].plane_fd(0).unwrap();
    let second = a.buffers[1].plane_fd(0).unwrap();
    assert_ne!(a.buffers[0].fd(0), a.buffers[1].fd(0));
    let st_first = rustix::fs::fstat(first).unwrap();
    let st_second = rustix::fs::fstat(second).unwrap();
    assert_eq!(st_first.st_ino, st_second.st_ino);
    assert_eq!(alloc.stats().shared_batches, 1);
}

#[test]
fn test_batch_fds_are_distinct() {
    let kernel = Arc::new(FakeIonKernel::modern("it_distinct"));
    let alloc = allocator(&kernel);
    let mut descs = [
        BufferDescriptor::rgba(64, 64, UsageBits::GPU_TEXTURE),
        BufferDescriptor::nv12(64, 64, UsageBits::CPU_READ_OFTEN | UsageBits::VIDEO_PRIVATE_DATA),
        BufferDescriptor::nv12(32, 32, UsageBits::CAMERA_RESERVED),
    ];

    let a = alloc.allocate(&mut descs).unwrap();
    let fds: Vec<_> = a.buffers.iter().flat_map(|b| b.fds()).collect();
    assert_eq!(fds.len(), 1 + 3 + 2);
    assert!(fds.iter().all(|&fd| fd >= 0));
    let unique: HashSet<_> = fds.iter().collect();
    assert_eq!(unique.len(), fds.len());
}

#[test]
fn test_hfr_two_planes_yield_two_containers() {
    let kernel = Arc::new(FakeIonKernel::modern("it_hfr"));
    let alloc = allocator(&kernel);
    let mut descs = [BufferDescriptor::nv12(
        64,
        64,
        UsageBits::CAMERA_RESERVED | UsageBits::HFR_MODE,
    )];

    let mut a = alloc.allocate(&mut descs).unwrap();
    let batch = alloc.config().hfr_batch_size;
    assert_eq!(kernel.allocations(), 2 * batch);
    assert_eq!(kernel.merges(), 2);
    assert_eq!(kernel.live_buffer_fds(), 2);

    let buf = &mut a.buffers[0];
    assert_eq!(buf.fd_count(), 2);
    assert!(buf.flags().contains(PrivateFlags::HFR_MODE));
    assert_eq!(buf.plane_size(0), 64 * 64 * batch);
    assert_eq!(kernel.size_of(buf.plane_fd(1).unwrap()), Some(64 * 32 * batch));
    assert_eq!(buf.map().unwrap(), MapStatus::Omitted);
    assert_eq!(alloc.stats().containers, 1);
}

#[test]
fn test_fallback_recorded_on_buffer() {
    let kernel = Arc::new(FakeIonKernel::modern("it_fallback"));
    kernel.fail_heap("ion_dma_heap");
    let alloc = allocator_with(&kernel, display_config());
    let mut descs = [BufferDescriptor::rgba(256, 256, UsageBits::COMPOSER)];

    let a = alloc.allocate(&mut descs).unwrap();
    let buf = &a.buffers[0];
    assert_eq!(buf.heap(), HeapType::System);
    assert!(buf.flags().contains(PrivateFlags::SYSTEM_FALLBACK));
    assert!(!buf.flags().contains(PrivateFlags::DMA_HEAP));
    assert_eq!(alloc.stats().fallbacks, 1);
}

#[test]
fn test_secure_heap_failure_is_hard() {
    let kernel = Arc::new(FakeIonKernel::modern("it_secure"));
    kernel.fail_heap("vframe_heap");
    let alloc = allocator(&kernel);
    let mut descs = [BufferDescriptor::nv12(64, 64, UsageBits::PROTECTED)];

    let err = alloc.allocate(&mut descs).unwrap_err();
    assert!(matches!(err, Error::AllocationFailed(_)));
    assert_eq!(kernel.allocations(), 0);
    assert_eq!(kernel.live_buffer_fds(), 0);
    assert_eq!(alloc.stats().failures, 1);
}

#[test]
fn test_protected_without_secure_heaps() {
    let kernel = Arc::new(FakeIonKernel::modern("it_no_secure"));
    let config = AllocatorConfig {
        platform: PlatformConfig::generic(),
        ..AllocatorConfig::default()
    };
    let alloc = allocator_with(&kernel, config);
    let mut descs = [BufferDescriptor::nv12(64, 64, UsageBits::PROTECTED)];

    assert!(matches!(
        alloc.allocate(&mut descs),
        Err(Error::HeapUnavailable(_))
    ));
}

#[test]
fn test_alloc_failure_at_every_step_leaks_nothing() {
    let descs = || {
        [
            BufferDescriptor::rgba(64, 64, UsageBits::GPU_TEXTURE),
            BufferDescriptor::nv12(64, 64, UsageBits::CPU_READ_OFTEN | UsageBits::VIDEO_PRIVATE_DATA),
            BufferDescriptor::nv12(32, 32, UsageBits::CAMERA_RESERVED),
        ]
    };
    // 1 + (2 + aux) + 2 kernel allocations.
    for step in 0..6 {
        let kernel = Arc::new(FakeIonKernel::modern(&format!("it_leak_alloc_{step}")));
        kernel.fail_alloc_at(step);
        let alloc = allocator(&kernel);
        let mut batch = descs();

        let before = kernel.live_buffer_fds();
        let result = alloc.allocate(&mut batch);
        if step == 4 || step == 5 {
            // Camera planes fall back to the system heap.
            let a = result.unwrap();
            assert!(a.buffers[2].flags().contains(PrivateFlags::SYSTEM_FALLBACK));
            continue;
        }
        assert!(result.is_err(), "step {step}");
        assert_eq!(kernel.live_buffer_fds(), before, "step {step}");
    }
}

#[test]
fn test_merge_failure_leaks_nothing() {
    for step in 0..2 {
        let kernel = Arc::new(FakeIonKernel::modern(&format!("it_leak_merge_{step}")));
        kernel.fail_merge_at(step);
        let alloc = allocator(&kernel);
        let mut descs = [BufferDescriptor::nv12(
            64,
            64,
            UsageBits::CAMERA_RESERVED | UsageBits::HFR_MODE,
        )];

        let err = alloc.allocate(&mut descs).unwrap_err();
        assert!(matches!(err, Error::MergeFailed(_)), "step {step}");
        assert_eq!(kernel.live_buffer_fds(), 0, "step {step}");
    }
}

#[test]
fn test_dup_failure_leaks_nothing() {
    for step in 0..3 {
        let kernel = Arc::new(FakeIonKernel::modern(&format!("it_leak_dup_{step}")));
        kernel.fail_dup_at(step);
        let alloc = allocator(&kernel);
        let mut descs: Vec<_> = (0..4)
            .map(|_| BufferDescriptor::nv12(64, 64, UsageBits::VIDEO_DECODER))
            .collect();

        let err = alloc.allocate(&mut descs).unwrap_err();
        assert!(matches!(err, Error::DuplicationFailed(_)), "step {step}");
        assert_eq!(kernel.live_buffer_fds(), 0, "step {step}");
    }
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for perm in permutations(n - 1) {
        for pos in 0..=perm.len() {
            let mut p = perm.clone();
            p.insert(pos, n - 1);
            out.push(p);
        }
    }
    out
}

#[test]
fn test_can_share_is_order_independent() {
    let platform = PlatformConfig::default();
    let usage = UsageBits::VIDEO_DECODER;
    let originals = [
        BufferDescriptor::nv12(32, 32, usage),
        BufferDescriptor::nv12(64, 64, usage),
        BufferDescriptor::nv12(16, 16, usage),
        BufferDescriptor::nv12(64, 64, usage),
    ];
    let max = originals.iter().map(|d| d.total_size()).max().unwrap();

    for perm in permutations(originals.len()) {
        let permuted: Vec<_> = perm.iter().map(|&i| originals[i].clone()).collect();
        assert!(can_share(&permuted, &platform));

        let rep = representative(&permuted).unwrap();
        assert_eq!(permuted[rep].total_size(), max);
        // First occurrence of the largest size in this order.
        let first_largest = perm
            .iter()
            .copied()
            .find(|&i| originals[i].total_size() == max)
            .unwrap();
        assert_eq!(perm[rep], first_largest);
    }

    let mixed = [
        BufferDescriptor::nv12(32, 32, usage),
        BufferDescriptor::nv12(32, 32, usage | UsageBits::CPU_READ_OFTEN),
        BufferDescriptor::nv12(32, 32, usage),
    ];
    for perm in permutations(mixed.len()) {
        let permuted: Vec<_> = perm.iter().map(|&i| mixed[i].clone()).collect();
        assert!(!can_share(&permuted, &platform));
    }
}

#[test]
fn test_protected_content_off_secure_heaps_is_not_cpu_mapped() {
    let kernel = Arc::new(FakeIonKernel::modern("it_protected_nonsecure"));
    let alloc = allocator_with(
        &kernel,
        AllocatorConfig {
            platform: PlatformConfig {
                crypto_composer_protected: true,
                ..PlatformConfig::default()
            },
            ..AllocatorConfig::default()
        },
    );
    let mut descs = [
        BufferDescriptor::nv12(64, 64, UsageBits::PROTECTED | UsageBits::PRIVATE_NONSECURE),
        BufferDescriptor::rgba(64, 64, UsageBits::PRIVATE_NONSECURE | UsageBits::COMPOSER),
    ];

    let mut a = alloc.allocate(&mut descs).unwrap();
    for buf in a.buffers.iter_mut() {
        assert_eq!(buf.heap(), HeapType::System);
        assert!(buf.alloc_flags().contains(AllocFlags::PROTECTED));
        assert_eq!(alloc.map(buf).unwrap(), MapStatus::Omitted);
    }
    assert_eq!(kernel.mmaps(), 0);
    alloc.free(&mut a.buffers).unwrap();
}

#[test]
fn test_double_free_is_noop() {
    let kernel = Arc::new(FakeIonKernel::modern("it_double_free"));
    let alloc = allocator(&kernel);
    let mut descs = [BufferDescriptor::nv12(64, 64, UsageBits::CPU_READ_OFTEN)];

    let mut a = alloc.allocate(&mut descs).unwrap();
    alloc.free(&mut a.buffers).unwrap();
    alloc.free(&mut a.buffers).unwrap();
    assert_eq!(a.buffers[0].fds(), vec![-1, -1]);
    assert_eq!(a.buffers[0].state(), BufferState::Freed);
    assert_eq!(alloc.stats().frees, 1);
    drop(a);
    assert_eq!(kernel.live_buffer_fds(), 0);
}

#[test]
fn test_invalid_descriptors_rejected() {
    let kernel = Arc::new(FakeIonKernel::modern("it_invalid"));
    let alloc = allocator(&kernel);

    assert!(matches!(
        alloc.allocate(&mut []),
        Err(Error::InvalidArgument(_))
    ));
    let mut zero = [BufferDescriptor::new(
        PixelFormat::Blob,
        0,
        0,
        UsageBits::empty(),
        &[0],
    )];
    assert!(matches!(
        alloc.allocate(&mut zero),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(kernel.allocations(), 0);
}
