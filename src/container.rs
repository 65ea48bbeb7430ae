//! HFR buffer containers.
//!
//! High frame rate capture hands the camera a batch of frames per plane
//! through a single fd. Each frame is allocated separately and the batch is
//! merged by `DMA_BUF_IOCTL_MERGE`, issued on the first frame with the rest
//! passed as an array. The per-frame fds are closed once the container
//! exists; the container holds its own references.

use crate::catalog::Session;
use crate::engine::{self, PlaneAllocation};
use crate::error::{Error, Result};
use crate::heap::{AllocFlags, HeapType};
use crate::kernel::PlaneFd;
use crate::kernel::ioctl::{DMA_BUF_IOCTL_MERGE, DmaBufMerge};
use crate::usage::UsageBits;
use rustix::fd::{AsFd, FromRawFd, OwnedFd};

/// Allocate `batch` frames of `size` bytes and merge them into one container.
///
/// The returned allocation reports the heap of the first frame and is
/// marked as fallen back if any frame was.
pub fn allocate_container(
    session: &Session,
    usage: UsageBits,
    size: usize,
    heap: HeapType,
    flags: AllocFlags,
    batch: usize,
) -> Result<PlaneAllocation> {
    if batch == 0 {
        return Err(Error::InvalidArgument("HFR batch size is 0".into()));
    }

    let mut frames = Vec::with_capacity(batch);
    let mut fell_back = false;
    let mut used_heap = heap;
    for i in 0..batch {
        let frame = engine::allocate(session, usage, size, heap, flags)?;
        if i == 0 {
            used_heap = frame.heap;
        }
        fell_back |= frame.fell_back;
        frames.push(frame.fd);
    }

    let fd = merge(session, frames)?;
    Ok(PlaneAllocation {
        fd,
        heap: used_heap,
        min_page_size: used_heap.min_page_size(size),
        fell_back,
    })
}

/// Merge `frames` into a container fd, consuming them.
///
/// A single frame is returned as is. The frames are closed whether or not
/// the merge succeeds.
pub fn merge(session: &Session, frames: Vec<PlaneFd>) -> Result<PlaneFd> {
    if frames.len() <= 1 {
        return frames
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidArgument("no frames to merge".into()));
    }

    let (base, rest) = (&frames[0], &frames[1..]);
    let others: Vec<i32> = rest.iter().map(PlaneFd::raw).collect();
    let count = i32::try_from(others.len())
        .map_err(|_| Error::InvalidArgument(format!("{} frames in one container", frames.len())))?;
    let mut data = DmaBufMerge {
        dma_bufs: others.as_ptr() as u64,
        count,
        dmabuf_container: -1,
        reserved: [0; 2],
    };

    // SAFETY: `data` is the argument type of DMA_BUF_IOCTL_MERGE and
    // `dma_bufs` points to `count` fds that outlive the call.
    unsafe {
        session
            .kernel()
            .ioctl(
                base.as_fd(),
                DMA_BUF_IOCTL_MERGE,
                (&mut data as *mut DmaBufMerge).cast(),
            )
            .map_err(|e| {
                Error::MergeFailed(format!("merging {} frames: {}", frames.len(), e))
            })?;
    }
    if data.dmabuf_container < 0 {
        return Err(Error::MergeFailed(format!(
            "merge returned fd {}",
            data.dmabuf_container
        )));
    }

    // SAFETY: on success the merge returns a new fd owned by the caller.
    let container = PlaneFd::new(unsafe { OwnedFd::from_raw_fd(data.dmabuf_container) });
    tracing::debug!(frames = frames.len(), fd = container.raw(), "merged HFR container");
    drop(frames);
    Ok(container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::HeapCatalog;
    use crate::config::AllocatorConfig;
    use crate::testing::FakeIonKernel;
    use std::sync::Arc;

    fn session(kernel: &Arc<FakeIonKernel>) -> Session {
        HeapCatalog::new(AllocatorConfig::default(), kernel.clone())
            .session()
            .unwrap()
    }

    #[test]
    fn test_container_replaces_frames() {
        let kernel = Arc::new(FakeIonKernel::modern("ctr_ok"));
        let s = session(&kernel);

        let c = allocate_container(
            &s,
            UsageBits::HFR_MODE,
            4096,
            HeapType::System,
            AllocFlags::empty(),
            8,
        )
        .unwrap();

        assert_eq!(kernel.allocations(), 8);
        assert_eq!(kernel.merges(), 1);
        assert_eq!(kernel.live_buffer_fds(), 1);
        assert_eq!(kernel.size_of(&c.fd), Some(8 * 4096));
        assert_eq!(c.heap, HeapType::System);
    }

    #[test]
    fn test_single_frame_skips_merge() {
        let kernel = Arc::new(FakeIonKernel::modern("ctr_single"));
        let s = session(&kernel);

        let c = allocate_container(
            &s,
            UsageBits::HFR_MODE,
            4096,
            HeapType::System,
            AllocFlags::empty(),
            1,
        )
        .unwrap();
        assert_eq!(kernel.merges(), 0);
        assert_eq!(kernel.size_of(&c.fd), Some(4096));
    }

    #[test]
    fn test_merge_failure_closes_frames() {
        let kernel = Arc::new(FakeIonKernel::modern("ctr_merge_fail"));
        kernel.fail_merge_at(0);
        let s = session(&kernel);

        let err = allocate_container(
            &s,
            UsageBits::HFR_MODE,
            4096,
            HeapType::System,
            AllocFlags::empty(),
            4,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MergeFailed(_)));
        assert_eq!(kernel.live_buffer_fds(), 0);
    }

    #[test]
    fn test_frame_failure_closes_earlier_frames() {
        let kernel = Arc::new(FakeIonKernel::modern("ctr_frame_fail"));
        kernel.fail_alloc_at(3);
        let s = session(&kernel);

        let err = allocate_container(
            &s,
            UsageBits::HFR_MODE,
            4096,
            HeapType::System,
            AllocFlags::empty(),
            8,
        )
        .unwrap_err();
        assert!(err.is_allocation_failure());
        assert_eq!(kernel.merges(), 0);
        assert_eq!(kernel.live_buffer_fds(), 0);
    }

    #[test]
    fn test_zero_batch_rejected() {
        let kernel = Arc::new(FakeIonKernel::modern("ctr_zero"));
        let s = session(&kernel);
        let err = allocate_container(
            &s,
            UsageBits::HFR_MODE,
            4096,
            HeapType::System,
            AllocFlags::empty(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
