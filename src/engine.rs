//! Single-plane allocation with heap fallback.
//!
//! One kernel allocation per call. A failure on the preferred heap may be
//! retried: protected decoder picture buffers get one more try on the video
//! frame heap, and non-secure heaps drop to the system heap. A heap the
//! kernel does not expose at all (empty mask) is never retried.

use crate::catalog::Session;
use crate::error::{Error, Result};
use crate::heap::{AllocFlags, HeapType};
use crate::kernel::PlaneFd;
use crate::policy;
use crate::usage::UsageBits;

/// Outcome of one engine allocation.
#[derive(Debug)]
pub struct PlaneAllocation {
    /// The dma-buf fd.
    pub fd: PlaneFd,
    /// Heap that actually satisfied the request.
    pub heap: HeapType,
    /// Page granularity of that heap for this size.
    pub min_page_size: usize,
    /// Whether the system-heap fallback was taken.
    pub fell_back: bool,
}

/// Allocate `size` bytes from `heap`, falling back as the heap allows.
pub fn allocate(
    session: &Session,
    usage: UsageBits,
    size: usize,
    heap: HeapType,
    flags: AllocFlags,
) -> Result<PlaneAllocation> {
    if size == 0 {
        return Err(Error::InvalidArgument("allocation size is 0".into()));
    }

    let mut err = match try_heap(session, size, heap, flags) {
        Ok(fd) => return Ok(plane(fd, heap, size, false)),
        Err(e) if e.is_allocation_failure() => e,
        Err(e) => return Err(e),
    };

    if usage.contains(UsageBits::PROTECTED_DPB) && heap != HeapType::VideoFrame {
        tracing::debug!(size, heap = %heap, error = %err, "retrying DPB on video frame heap");
        match try_heap(session, size, HeapType::VideoFrame, flags) {
            Ok(fd) => return Ok(plane(fd, HeapType::VideoFrame, size, false)),
            Err(e) if e.is_allocation_failure() => err = e,
            Err(e) => return Err(e),
        }
    }

    if !policy::allows_system_fallback(heap, flags) {
        return Err(Error::AllocationFailed(format!(
            "{} bytes on {} heap: {}",
            size, heap, err
        )));
    }

    let system_flags = policy::alloc_flags(usage, &session.config().platform);
    tracing::warn!(size, heap = %heap, error = %err, "falling back to system heap");
    match try_heap(session, size, HeapType::System, system_flags) {
        Ok(fd) => Ok(plane(fd, HeapType::System, size, true)),
        Err(e) => Err(Error::AllocationFailed(format!(
            "{} bytes on {} heap, system fallback also failed: {}",
            size, heap, e
        ))),
    }
}

fn try_heap(session: &Session, size: usize, heap: HeapType, flags: AllocFlags) -> Result<PlaneFd> {
    let mask = session.heap_mask(heap);
    if mask == 0 {
        return Err(Error::HeapUnavailable(format!(
            "{} heap is not exposed by the kernel",
            heap
        )));
    }

    let fd = session
        .backend()
        .allocate(session.device(), size, mask, flags)?;
    tracing::debug!(size, heap = %heap, fd = fd.raw(), flags = flags.bits(), "allocated plane");
    Ok(fd)
}

fn plane(fd: PlaneFd, heap: HeapType, size: usize, fell_back: bool) -> PlaneAllocation {
    PlaneAllocation {
        fd,
        heap,
        min_page_size: heap.min_page_size(size),
        fell_back,
    }
}
