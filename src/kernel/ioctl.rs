//! ioctl numbers and argument layouts for both ION generations and dma-buf.

/// ION ioctl magic.
pub const ION_IOC_MAGIC: u8 = b'I';

/// dma-buf ioctl magic.
pub const DMA_BUF_BASE: u8 = b'b';

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

/// `_IOWR(ty, nr, T)`
pub const fn iowr<T>(ty: u8, nr: u8) -> u32 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

/// `_IOW(ty, nr, T)`
pub const fn iow<T>(ty: u8, nr: u8) -> u32 {
    ioc(IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

// ----------------------------------------------------------------------------
// Legacy ION (per-client handles)
// ----------------------------------------------------------------------------

/// Legacy `ion_allocation_data`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct LegacyAllocationData {
    /// Requested size.
    pub len: usize,
    /// Alignment, 0 for page alignment.
    pub align: usize,
    /// Heaps the allocation may come from.
    pub heap_id_mask: u32,
    /// Allocation flags.
    pub flags: u32,
    /// OUTPUT: client-local handle.
    pub handle: i32,
}

/// Legacy `ion_handle_data`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct LegacyHandleData {
    /// Client-local handle.
    pub handle: i32,
}

/// Legacy `ion_fd_data`, used by share, import and sync.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct LegacyFdData {
    /// Client-local handle.
    pub handle: i32,
    /// dma-buf fd.
    pub fd: i32,
}

/// Allocate a buffer and return a handle.
pub const ION_IOC_ALLOC_LEGACY: u32 = iowr::<LegacyAllocationData>(ION_IOC_MAGIC, 0);
/// Release a handle.
pub const ION_IOC_FREE: u32 = iowr::<LegacyHandleData>(ION_IOC_MAGIC, 1);
/// Export a handle as a dma-buf fd.
pub const ION_IOC_SHARE: u32 = iowr::<LegacyFdData>(ION_IOC_MAGIC, 4);
/// Import a dma-buf fd as a handle.
pub const ION_IOC_IMPORT: u32 = iowr::<LegacyFdData>(ION_IOC_MAGIC, 5);
/// Flush CPU caches for a dma-buf fd.
pub const ION_IOC_SYNC: u32 = iowr::<LegacyFdData>(ION_IOC_MAGIC, 7);

// ----------------------------------------------------------------------------
// Modern ION (fd-returning allocation, heap query)
// ----------------------------------------------------------------------------

/// Maximum length of a heap name, including the terminator.
pub const MAX_HEAP_NAME: usize = 32;

/// Modern `ion_allocation_data`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AllocationData {
    /// Requested size.
    pub len: u64,
    /// Heaps the allocation may come from.
    pub heap_id_mask: u32,
    /// Allocation flags.
    pub flags: u32,
    /// OUTPUT: dma-buf fd.
    pub fd: u32,
    /// Unused.
    pub unused: u32,
}

/// `ion_heap_data`, one entry of a heap query.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct HeapData {
    /// NUL-terminated heap name.
    pub name: [u8; MAX_HEAP_NAME],
    /// Kernel heap type.
    pub type_: u32,
    /// Heap id, the bit position in a heap mask.
    pub heap_id: u32,
    /// Reserved.
    pub reserved0: u32,
    /// Reserved.
    pub reserved1: u32,
    /// Reserved.
    pub reserved2: u32,
}

impl Default for HeapData {
    fn default() -> Self {
        Self {
            name: [0; MAX_HEAP_NAME],
            type_: 0,
            heap_id: 0,
            reserved0: 0,
            reserved1: 0,
            reserved2: 0,
        }
    }
}

impl HeapData {
    /// Heap name up to the first NUL.
    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_HEAP_NAME);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Store `name`, truncated to fit with a terminator.
    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_HEAP_NAME - 1);
        self.name = [0; MAX_HEAP_NAME];
        self.name[..len].copy_from_slice(&bytes[..len]);
    }
}

/// `ion_heap_query`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct HeapQuery {
    /// IN: capacity of `heaps`; OUT: number of heaps.
    pub cnt: u32,
    /// Reserved.
    pub reserved0: u32,
    /// User pointer to an array of `HeapData`, or 0 to query the count.
    pub heaps: u64,
    /// Reserved.
    pub reserved1: u32,
    /// Reserved.
    pub reserved2: u32,
}

/// Allocate a buffer and return a dma-buf fd.
pub const ION_IOC_ALLOC: u32 = iowr::<AllocationData>(ION_IOC_MAGIC, 0);
/// Enumerate heaps.
pub const ION_IOC_HEAP_QUERY: u32 = iowr::<HeapQuery>(ION_IOC_MAGIC, 8);

// ----------------------------------------------------------------------------
// dma-buf
// ----------------------------------------------------------------------------

/// `dma_buf_sync`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DmaBufSync {
    /// `DMA_BUF_SYNC_*` bits.
    pub flags: u64,
}

/// CPU will read.
pub const DMA_BUF_SYNC_READ: u64 = 1 << 0;
/// CPU will write.
pub const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
/// Begin CPU access.
pub const DMA_BUF_SYNC_START: u64 = 0;
/// End CPU access.
pub const DMA_BUF_SYNC_END: u64 = 1 << 2;

/// Bracket CPU access to a dma-buf.
pub const DMA_BUF_IOCTL_SYNC: u32 = iow::<DmaBufSync>(DMA_BUF_BASE, 0);

/// `dma_buf_merge`: merge several dma-bufs into one container.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DmaBufMerge {
    /// User pointer to an array of `i32` fds, excluding the base fd.
    pub dma_bufs: u64,
    /// Number of entries in `dma_bufs`.
    pub count: i32,
    /// OUTPUT: container fd.
    pub dmabuf_container: i32,
    /// Reserved.
    pub reserved: [u32; 2],
}

/// Merge dma-bufs into a container. Issued on the base fd.
pub const DMA_BUF_IOCTL_MERGE: u32 = iowr::<DmaBufMerge>(DMA_BUF_BASE, 13);
