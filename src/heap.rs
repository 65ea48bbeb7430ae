//! Heap identities and the flag sets attached to allocations.

use bitflags::bitflags;

/// 4 KiB, the granularity of system and vendor (custom) heaps.
pub const SMALL_PAGE_SIZE: usize = 4 * 1024;

/// 2 MiB, the granularity of the compound-page heap.
pub const COMPOUND_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Logical heap the selection policy can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeapType {
    /// Generic system memory. Also the fallback target.
    System,
    /// Secure heap for protected compressed video streams.
    VideoStream,
    /// Secure heap for protected buffers consumed by the display scaler.
    VideoScaler,
    /// Secure heap for protected decoded pictures.
    VideoFrame,
    /// Reserved camera memory.
    Camera,
    /// Reserved secure camera memory.
    SecureCamera,
    /// DMA (CMA-backed) heap, preferred for zero-copy display on some builds.
    Dma,
    /// Physically contiguous system heap.
    Contiguous,
    /// Compound-page heap backed by 2 MiB pages.
    CompoundPage,
}

impl HeapType {
    /// All heap types, in declaration order.
    pub const ALL: [HeapType; 9] = [
        HeapType::System,
        HeapType::VideoStream,
        HeapType::VideoScaler,
        HeapType::VideoFrame,
        HeapType::Camera,
        HeapType::SecureCamera,
        HeapType::Dma,
        HeapType::Contiguous,
        HeapType::CompoundPage,
    ];

    /// Secure heaps hold protected content and never fall back to
    /// unprotected memory.
    #[inline]
    pub fn is_secure(self) -> bool {
        matches!(
            self,
            HeapType::VideoStream
                | HeapType::VideoScaler
                | HeapType::VideoFrame
                | HeapType::SecureCamera
        )
    }

    /// Heaps that back the zero-copy display path.
    #[inline]
    pub fn is_display(self) -> bool {
        matches!(
            self,
            HeapType::Dma | HeapType::Contiguous | HeapType::CompoundPage
        )
    }

    /// Minimum page granularity of an allocation of `size` bytes on this heap.
    ///
    /// Advisory only: it is recorded on the buffer, not enforced.
    pub fn min_page_size(self, size: usize) -> usize {
        match self {
            HeapType::Dma | HeapType::Contiguous => size,
            HeapType::CompoundPage => COMPOUND_PAGE_SIZE,
            _ => SMALL_PAGE_SIZE,
        }
    }

    /// Short name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            HeapType::System => "system",
            HeapType::VideoStream => "video_stream",
            HeapType::VideoScaler => "video_scaler",
            HeapType::VideoFrame => "video_frame",
            HeapType::Camera => "camera",
            HeapType::SecureCamera => "secure_camera",
            HeapType::Dma => "dma",
            HeapType::Contiguous => "contiguous",
            HeapType::CompoundPage => "compound_page",
        }
    }
}

impl std::fmt::Display for HeapType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel-side heap type as reported by the heap query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KernelHeapType {
    /// Page allocator backed.
    System = 0,
    /// kmalloc backed, physically contiguous.
    SystemContig = 1,
    /// Reserved carveout region.
    Carveout = 2,
    /// Chunk allocator.
    Chunk = 3,
    /// CMA / DMA coherent.
    Dma = 4,
    /// Vendor-defined.
    Custom = 16,
}

impl TryFrom<u32> for KernelHeapType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::System),
            1 => Ok(Self::SystemContig),
            2 => Ok(Self::Carveout),
            3 => Ok(Self::Chunk),
            4 => Ok(Self::Dma),
            16.. => Ok(Self::Custom),
            other => Err(other),
        }
    }
}

bitflags! {
    /// Flags passed to the kernel with each allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// CPU mappings are cached.
        const CACHED = 1 << 0;
        /// Cached mappings need explicit sync around CPU access.
        const CACHED_NEEDS_SYNC = 1 << 1;
        /// Skip zero-filling the allocation.
        const NOZEROED = 1 << 3;
        /// Content is protected; memory must not be CPU-accessible.
        const PROTECTED = 1 << 4;
        /// The GPU may render into this buffer.
        const MAY_HWRENDER = 1 << 5;
    }
}

bitflags! {
    /// Bookkeeping attached to a buffer recording how it was produced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PrivateFlags: u32 {
        /// Backed by a secure heap.
        const PROTECTED_HEAP = 1 << 0;
        /// Backed by the zero-copy display heap.
        const DMA_HEAP = 1 << 1;
        /// The preferred heap failed and the system heap was used instead.
        const SYSTEM_FALLBACK = 1 << 2;
        /// Secure camera buffer.
        const SECURE_CAMERA = 1 << 3;
        /// Planes are HFR container fds.
        const HFR_MODE = 1 << 4;
        /// Carries a private per-frame metadata plane.
        const VIDEO_PRIVATE_DATA = 1 << 5;
        /// Auxiliary plane sits at plane index 1.
        const AUX_PLANE_1 = 1 << 6;
        /// Auxiliary plane sits at plane index 2.
        const AUX_PLANE_2 = 1 << 7;
        /// Memory is owned by the framebuffer device.
        const FRAMEBUFFER = 1 << 8;
        /// Backing allocation is shared with sibling buffers of the same batch.
        const SHARED = 1 << 9;
        /// Wraps fds received from elsewhere.
        const IMPORTED = 1 << 10;
    }
}

impl PrivateFlags {
    /// Buffers with these flags must never be CPU-mapped.
    pub const UNMAPPABLE: PrivateFlags = PrivateFlags::PROTECTED_HEAP
        .union(PrivateFlags::SECURE_CAMERA)
        .union(PrivateFlags::HFR_MODE);

    /// Flag recording an auxiliary plane at `index`.
    pub fn aux_plane(index: usize) -> PrivateFlags {
        match index {
            1 => PrivateFlags::AUX_PLANE_1,
            2 => PrivateFlags::AUX_PLANE_2,
            _ => PrivateFlags::empty(),
        }
    }
}
