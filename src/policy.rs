//! Heap and flag selection policy.
//!
//! A pure mapping from [`UsageBits`] to the heap, kernel allocation flags and
//! private bookkeeping flags of a buffer. The heap mask is not computed here
//! because it depends on the protocol generation; see
//! [`Session::heap_mask`](crate::catalog::Session::heap_mask).

use crate::config::PlatformConfig;
use crate::error::{Error, Result};
use crate::heap::{AllocFlags, HeapType, PrivateFlags};
use crate::usage::UsageBits;

/// Result of running the selection policy over one usage combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSelection {
    /// Heap to allocate from.
    pub heap: HeapType,
    /// Flags passed to the kernel.
    pub alloc_flags: AllocFlags,
    /// Flags recorded on the resulting buffer.
    pub private_flags: PrivateFlags,
}

impl HeapSelection {
    /// Whether two selections would produce interchangeable allocations.
    #[inline]
    pub fn is_compatible(&self, other: &HeapSelection) -> bool {
        self.heap == other.heap && self.alloc_flags == other.alloc_flags
    }
}

/// Run the full policy for one usage combination.
pub fn select(usage: UsageBits, platform: &PlatformConfig) -> Result<HeapSelection> {
    let heap = heap_type(usage, platform)?;
    Ok(HeapSelection {
        heap,
        alloc_flags: alloc_flags(usage, platform),
        private_flags: private_flags(usage, heap),
    })
}

/// Pick the heap for a usage combination. First match wins.
pub fn heap_type(usage: UsageBits, platform: &PlatformConfig) -> Result<HeapType> {
    if usage.is_protected() {
        if !platform.has_secure_heaps {
            return Err(Error::HeapUnavailable(
                "protected content requested but the platform has no secure heap".into(),
            ));
        }
        if usage.contains(UsageBits::PRIVATE_NONSECURE) && platform.allow_private_nonsecure {
            return Ok(HeapType::System);
        }
        if usage.contains(UsageBits::VIDEO_STREAM) {
            return Ok(HeapType::VideoStream);
        }
        if usage.contains(UsageBits::COMPOSER) && !usage.is_gpu() {
            return Ok(HeapType::VideoScaler);
        }
        return Ok(HeapType::VideoFrame);
    }

    if usage.contains(UsageBits::CAMERA_RESERVED) {
        if usage.contains(UsageBits::SECURE_CAMERA_RESERVED) {
            return Ok(HeapType::SecureCamera);
        }
        return Ok(HeapType::Camera);
    }

    if !usage.contains(UsageBits::VIDEO_ENCODER)
        && usage.intersects(UsageBits::FRAMEBUFFER | UsageBits::COMPOSER)
    {
        if let Some(display) = platform.display_heap {
            return Ok(display.heap_type());
        }
    }

    Ok(HeapType::System)
}

/// Kernel allocation flags. Independent of the heap choice.
pub fn alloc_flags(usage: UsageBits, platform: &PlatformConfig) -> AllocFlags {
    let mut flags = AllocFlags::empty();

    if usage.contains(UsageBits::CPU_READ_OFTEN) {
        flags |= AllocFlags::CACHED | AllocFlags::CACHED_NEEDS_SYNC;
    }
    if usage.contains(UsageBits::GPU_RENDER_TARGET) {
        flags |= AllocFlags::MAY_HWRENDER;
    }
    if usage.contains(UsageBits::NO_ZERO_FILL) {
        flags |= AllocFlags::NOZEROED;
    }
    if usage.is_protected() || usage.contains(UsageBits::SECURE_CAMERA_RESERVED) {
        flags |= AllocFlags::PROTECTED;
    }
    if platform.crypto_composer_protected
        && usage.contains(UsageBits::PRIVATE_NONSECURE | UsageBits::COMPOSER)
    {
        flags |= AllocFlags::PROTECTED;
    }

    flags
}

/// Private bookkeeping flags for a buffer allocated from `heap`.
pub fn private_flags(usage: UsageBits, heap: HeapType) -> PrivateFlags {
    let mut flags = PrivateFlags::empty();

    if heap.is_secure() {
        flags |= PrivateFlags::PROTECTED_HEAP;
    }
    if heap.is_display() {
        flags |= PrivateFlags::DMA_HEAP;
    }
    if usage.contains(UsageBits::SECURE_CAMERA_RESERVED) {
        flags |= PrivateFlags::SECURE_CAMERA;
    }
    if usage.contains(UsageBits::HFR_MODE) {
        flags |= PrivateFlags::HFR_MODE;
    }
    if usage.contains(UsageBits::VIDEO_PRIVATE_DATA) {
        flags |= PrivateFlags::VIDEO_PRIVATE_DATA;
    }

    flags
}

/// Whether a failed allocation on `heap` may be retried on the system heap.
///
/// Secure heaps and protected allocations never downgrade, and the system
/// heap is already the fallback target.
pub fn allows_system_fallback(heap: HeapType, flags: AllocFlags) -> bool {
    heap != HeapType::System && !heap.is_secure() && !flags.contains(AllocFlags::PROTECTED)
}
