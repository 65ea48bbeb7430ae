//! In-process stand-in for the ION device.
//!
//! [`FakeIonKernel`] implements [`KernelOps`] by decoding the same ioctl
//! requests the real driver serves, for either protocol generation. Buffers
//! are memfds named `"{tag}-buf"`, so a test can count how many of its
//! buffers are still open with [`FakeIonKernel::live_buffer_fds`].
//!
//! Faults can be injected per heap, per allocation attempt, and for merge,
//! dup, mmap and munmap.
//!
//! ```rust,ignore
//! let kernel = Arc::new(FakeIonKernel::modern("my_test"));
//! kernel.fail_heap("ion_dma_heap");
//! let allocator = Allocator::with_kernel(AllocatorConfig::default(), kernel.clone());
//! ```

use crate::config::PlatformConfig;
use crate::kernel::ioctl::{
    AllocationData, DMA_BUF_IOCTL_MERGE, DMA_BUF_IOCTL_SYNC, DmaBufMerge, DmaBufSync, HeapData,
    HeapQuery, ION_IOC_ALLOC, ION_IOC_ALLOC_LEGACY, ION_IOC_FREE, ION_IOC_HEAP_QUERY,
    ION_IOC_IMPORT, ION_IOC_SHARE, ION_IOC_SYNC, LegacyAllocationData, LegacyFdData,
    LegacyHandleData,
};
use crate::kernel::{KernelOps, Protocol};
use crate::heap::{HeapType, KernelHeapType};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use rustix::io::Errno;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One heap exposed by the fake device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeHeap {
    /// Id in the active protocol's numbering.
    pub id: u32,
    /// Kernel heap name.
    pub name: String,
    /// Raw kernel heap type.
    pub kernel_type: u32,
}

/// One successful kernel allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRecord {
    /// Heap that served it.
    pub heap: String,
    /// Requested length.
    pub len: usize,
    /// Raw allocation flags.
    pub flags: u32,
}

/// One cache-sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRecord {
    /// Buffer fd the sync referred to.
    pub fd: RawFd,
    /// `DMA_BUF_SYNC_*` flags; `None` for the legacy ioctl, which has none.
    pub flags: Option<u64>,
}

#[derive(Default)]
struct FakeState {
    heaps: Vec<FakeHeap>,
    failing_heaps: HashSet<String>,
    fail_open: bool,
    fail_alloc_at: Option<usize>,
    fail_merge_at: Option<usize>,
    fail_dup_at: Option<usize>,
    fail_mmap_at: Option<usize>,
    fail_munmap: bool,
    handles: HashMap<i32, OwnedFd>,
    next_handle: i32,
    alloc_log: Vec<AllocRecord>,
    syncs: Vec<SyncRecord>,
}

/// memfd-backed ION device for tests and benchmarks.
pub struct FakeIonKernel {
    tag: String,
    protocol: Protocol,
    state: Mutex<FakeState>,
    opens: AtomicUsize,
    heap_queries: AtomicUsize,
    alloc_attempts: AtomicUsize,
    merges: AtomicUsize,
    dups: AtomicUsize,
    mmaps: AtomicUsize,
    munmaps: AtomicUsize,
}

impl FakeIonKernel {
    /// Fake speaking the modern (fd-returning, heap query) protocol.
    ///
    /// Heap ids are assigned in reverse table order so they never coincide
    /// with the legacy ids, which makes missing name translation visible.
    pub fn modern(tag: &str) -> Self {
        let table = PlatformConfig::default().heaps;
        let count = table.len() as u32;
        let heaps = table
            .iter()
            .enumerate()
            .map(|(i, entry)| FakeHeap {
                id: count - 1 - i as u32,
                name: entry.name.clone(),
                kernel_type: kernel_type_of(entry.heap) as u32,
            })
            .collect();
        Self::with_heaps(tag, Protocol::Modern, heaps)
    }

    /// Fake speaking the legacy (handle-based) protocol. Heap ids are the
    /// legacy ids.
    pub fn legacy(tag: &str) -> Self {
        let heaps = PlatformConfig::default()
            .heaps
            .iter()
            .map(|entry| FakeHeap {
                id: entry.legacy_id,
                name: entry.name.clone(),
                kernel_type: kernel_type_of(entry.heap) as u32,
            })
            .collect();
        Self::with_heaps(tag, Protocol::Legacy, heaps)
    }

    /// Fake with an explicit heap list.
    pub fn with_heaps(tag: &str, protocol: Protocol, heaps: Vec<FakeHeap>) -> Self {
        Self {
            tag: tag.to_string(),
            protocol,
            state: Mutex::new(FakeState {
                heaps,
                next_handle: 1,
                ..FakeState::default()
            }),
            opens: AtomicUsize::new(0),
            heap_queries: AtomicUsize::new(0),
            alloc_attempts: AtomicUsize::new(0),
            merges: AtomicUsize::new(0),
            dups: AtomicUsize::new(0),
            mmaps: AtomicUsize::new(0),
            munmaps: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Protocol this fake speaks.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    // ---- fault injection ----

    /// Make `open_device` fail with `ENOENT`.
    pub fn fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// Make every allocation on the named heap fail with `ENOMEM`.
    pub fn fail_heap(&self, name: &str) {
        self.state().failing_heaps.insert(name.to_string());
    }

    /// Drop a heap from the device. Only visible to catalogs probed after.
    pub fn remove_heap(&self, name: &str) {
        self.state().heaps.retain(|h| h.name != name);
    }

    /// Fail the allocation attempt with this zero-based index, counted from
    /// creation of the fake.
    pub fn fail_alloc_at(&self, attempt: usize) {
        self.state().fail_alloc_at = Some(attempt);
    }

    /// Fail the merge with this zero-based index.
    pub fn fail_merge_at(&self, merge: usize) {
        self.state().fail_merge_at = Some(merge);
    }

    /// Fail the dup with this zero-based index.
    pub fn fail_dup_at(&self, dup: usize) {
        self.state().fail_dup_at = Some(dup);
    }

    /// Fail the mmap with this zero-based index.
    pub fn fail_mmap_at(&self, mmap: usize) {
        self.state().fail_mmap_at = Some(mmap);
    }

    /// Make every munmap report failure (the mapping is left in place).
    pub fn fail_munmap(&self, fail: bool) {
        self.state().fail_munmap = fail;
    }

    // ---- inspection ----

    /// Number of successful device opens.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    /// Number of heap query ioctls served.
    pub fn heap_queries(&self) -> usize {
        self.heap_queries.load(Ordering::Relaxed)
    }

    /// Number of successful allocations.
    pub fn allocations(&self) -> usize {
        self.state().alloc_log.len()
    }

    /// Every successful allocation, in order.
    pub fn allocation_log(&self) -> Vec<AllocRecord> {
        self.state().alloc_log.clone()
    }

    /// Number of merge ioctls attempted.
    pub fn merges(&self) -> usize {
        self.merges.load(Ordering::Relaxed)
    }

    /// Number of dup calls attempted.
    pub fn dups(&self) -> usize {
        self.dups.load(Ordering::Relaxed)
    }

    /// Number of mmap calls attempted.
    pub fn mmaps(&self) -> usize {
        self.mmaps.load(Ordering::Relaxed)
    }

    /// Number of munmap calls attempted.
    pub fn munmaps(&self) -> usize {
        self.munmaps.load(Ordering::Relaxed)
    }

    /// Cache-sync requests seen so far.
    pub fn syncs(&self) -> Vec<SyncRecord> {
        self.state().syncs.clone()
    }

    /// Legacy client handles currently outstanding.
    pub fn open_handles(&self) -> usize {
        self.state().handles.len()
    }

    /// Id of the named heap in this fake's numbering.
    pub fn heap_id(&self, name: &str) -> Option<u32> {
        self.state()
            .heaps
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.id)
    }

    /// Size of the memfd behind `fd`.
    pub fn size_of(&self, fd: impl AsFd) -> Option<usize> {
        rustix::fs::fstat(fd).ok().map(|st| st.st_size as usize)
    }

    /// Count this process's open fds that refer to buffers from this fake.
    ///
    /// Legacy client handles hold a reference too, so they count.
    pub fn live_buffer_fds(&self) -> usize {
        let needle = format!("memfd:{}-buf", self.tag);
        let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| std::fs::read_link(e.path()).ok())
            .filter(|target| target.to_string_lossy().contains(&needle))
            .count()
    }

    fn new_buffer(&self, len: usize) -> rustix::io::Result<OwnedFd> {
        let name = format!("{}-buf", self.tag);
        let fd = rustix::fs::memfd_create(name.as_str(), rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, len as u64)?;
        Ok(fd)
    }

    fn allocate(&self, len: usize, heap_mask: u32, flags: u32) -> rustix::io::Result<OwnedFd> {
        let attempt = self.alloc_attempts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        if state.fail_alloc_at == Some(attempt) {
            return Err(Errno::NOMEM);
        }
        if len == 0 {
            return Err(Errno::INVAL);
        }

        let heap = state
            .heaps
            .iter()
            .find(|h| h.id < 32 && heap_mask & (1 << h.id) != 0)
            .map(|h| h.name.clone())
            .ok_or(Errno::NODEV)?;
        if state.failing_heaps.contains(&heap) {
            return Err(Errno::NOMEM);
        }

        let fd = self.new_buffer(len)?;
        state.alloc_log.push(AllocRecord { heap, len, flags });
        Ok(fd)
    }

    fn insert_handle(&self, fd: OwnedFd) -> i32 {
        let mut state = self.state();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(handle, fd);
        handle
    }

    // SAFETY (all handlers): the caller of `ioctl` guarantees `arg` points
    // to the argument type of the request being served.

    unsafe fn legacy_ioctl(&self, request: u32, arg: *mut c_void) -> rustix::io::Result<()> {
        match request {
            ION_IOC_ALLOC_LEGACY => {
                let data = unsafe { &mut *arg.cast::<LegacyAllocationData>() };
                let fd = self.allocate(data.len, data.heap_id_mask, data.flags)?;
                data.handle = self.insert_handle(fd);
                Ok(())
            }
            ION_IOC_FREE => {
                let data = unsafe { &*arg.cast::<LegacyHandleData>() };
                self.state()
                    .handles
                    .remove(&data.handle)
                    .map(drop)
                    .ok_or(Errno::INVAL)
            }
            ION_IOC_SHARE => {
                let data = unsafe { &mut *arg.cast::<LegacyFdData>() };
                let state = self.state();
                let fd = state.handles.get(&data.handle).ok_or(Errno::INVAL)?;
                data.fd = rustix::io::fcntl_dupfd_cloexec(fd, 0)?.into_raw_fd();
                Ok(())
            }
            ION_IOC_IMPORT => {
                let data = unsafe { &mut *arg.cast::<LegacyFdData>() };
                // SAFETY: the fd is borrowed only for the dup.
                let fd = unsafe { BorrowedFd::borrow_raw(data.fd) };
                let dup = rustix::io::fcntl_dupfd_cloexec(fd, 0)?;
                data.handle = self.insert_handle(dup);
                Ok(())
            }
            ION_IOC_SYNC => {
                let data = unsafe { &*arg.cast::<LegacyFdData>() };
                self.state().syncs.push(SyncRecord {
                    fd: data.fd,
                    flags: None,
                });
                Ok(())
            }
            _ => Err(Errno::NOTTY),
        }
    }

    unsafe fn modern_ioctl(&self, request: u32, arg: *mut c_void) -> rustix::io::Result<()> {
        match request {
            ION_IOC_ALLOC => {
                let data = unsafe { &mut *arg.cast::<AllocationData>() };
                let len = usize::try_from(data.len).map_err(|_| Errno::INVAL)?;
                let fd = self.allocate(len, data.heap_id_mask, data.flags)?;
                data.fd = fd.into_raw_fd() as u32;
                Ok(())
            }
            ION_IOC_HEAP_QUERY => {
                self.heap_queries.fetch_add(1, Ordering::Relaxed);
                let query = unsafe { &mut *arg.cast::<HeapQuery>() };
                let state = self.state();
                if query.heaps == 0 {
                    query.cnt = state.heaps.len() as u32;
                    return Ok(());
                }

                let count = (query.cnt as usize).min(state.heaps.len());
                let out = unsafe {
                    std::slice::from_raw_parts_mut(query.heaps as *mut HeapData, count)
                };
                for (slot, heap) in out.iter_mut().zip(&state.heaps) {
                    *slot = HeapData::default();
                    slot.set_name(&heap.name);
                    slot.type_ = heap.kernel_type;
                    slot.heap_id = heap.id;
                }
                query.cnt = count as u32;
                Ok(())
            }
            _ => Err(Errno::NOTTY),
        }
    }

    unsafe fn dma_buf_ioctl(
        &self,
        fd: BorrowedFd<'_>,
        request: u32,
        arg: *mut c_void,
    ) -> rustix::io::Result<()> {
        match request {
            DMA_BUF_IOCTL_SYNC => {
                let data = unsafe { &*arg.cast::<DmaBufSync>() };
                self.state().syncs.push(SyncRecord {
                    fd: fd.as_raw_fd(),
                    flags: Some(data.flags),
                });
                Ok(())
            }
            DMA_BUF_IOCTL_MERGE => {
                let merge = self.merges.fetch_add(1, Ordering::Relaxed);
                if self.state().fail_merge_at == Some(merge) {
                    return Err(Errno::NOMEM);
                }

                let data = unsafe { &mut *arg.cast::<DmaBufMerge>() };
                let count = usize::try_from(data.count).map_err(|_| Errno::INVAL)?;
                let others = if count == 0 {
                    &[][..]
                } else {
                    unsafe { std::slice::from_raw_parts(data.dma_bufs as *const i32, count) }
                };

                let mut total = rustix::fs::fstat(fd)?.st_size as usize;
                for &raw in others {
                    // SAFETY: the fds are borrowed only for the fstat.
                    let other = unsafe { BorrowedFd::borrow_raw(raw) };
                    total += rustix::fs::fstat(other)?.st_size as usize;
                }
                data.dmabuf_container = self.new_buffer(total)?.into_raw_fd();
                Ok(())
            }
            _ => Err(Errno::NOTTY),
        }
    }
}

fn kernel_type_of(heap: HeapType) -> KernelHeapType {
    match heap {
        HeapType::System => KernelHeapType::System,
        HeapType::Contiguous => KernelHeapType::SystemContig,
        HeapType::Dma => KernelHeapType::Dma,
        _ => KernelHeapType::Custom,
    }
}

impl KernelOps for FakeIonKernel {
    fn open_device(&self, _path: &Path) -> rustix::io::Result<OwnedFd> {
        if self.state().fail_open {
            return Err(Errno::NOENT);
        }
        let name = format!("{}-dev", self.tag);
        let fd = rustix::fs::memfd_create(name.as_str(), rustix::fs::MemfdFlags::CLOEXEC)?;
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(fd)
    }

    unsafe fn ioctl(
        &self,
        fd: BorrowedFd<'_>,
        request: u32,
        arg: *mut c_void,
    ) -> rustix::io::Result<()> {
        if request == DMA_BUF_IOCTL_SYNC || request == DMA_BUF_IOCTL_MERGE {
            return unsafe { self.dma_buf_ioctl(fd, request, arg) };
        }
        match self.protocol {
            Protocol::Legacy => unsafe { self.legacy_ioctl(request, arg) },
            Protocol::Modern => unsafe { self.modern_ioctl(request, arg) },
        }
    }

    fn dup(&self, fd: BorrowedFd<'_>) -> rustix::io::Result<OwnedFd> {
        let dup = self.dups.fetch_add(1, Ordering::Relaxed);
        if self.state().fail_dup_at == Some(dup) {
            return Err(Errno::MFILE);
        }
        rustix::io::fcntl_dupfd_cloexec(fd, 0)
    }

    fn mmap(&self, fd: BorrowedFd<'_>, len: usize) -> rustix::io::Result<NonNull<u8>> {
        let mmap = self.mmaps.fetch_add(1, Ordering::Relaxed);
        if self.state().fail_mmap_at == Some(mmap) {
            return Err(Errno::NOMEM);
        }
        // SAFETY: a fresh mapping at a kernel-chosen address aliases no
        // existing Rust object.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::SHARED,
                fd,
                0,
            )?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(Errno::FAULT)
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> rustix::io::Result<()> {
        self.munmaps.fetch_add(1, Ordering::Relaxed);
        if self.state().fail_munmap {
            return Err(Errno::INVAL);
        }
        // SAFETY: guaranteed by the caller.
        unsafe { rustix::mm::munmap(ptr.as_ptr().cast(), len) }
    }
}

impl std::fmt::Debug for FakeIonKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeIonKernel")
            .field("tag", &self.tag)
            .field("protocol", &self.protocol)
            .finish()
    }
}
