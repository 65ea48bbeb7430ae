//! Caller-facing allocator.
//!
//! Ties the catalog, the batch paths and the buffer lifecycle together and
//! keeps running counters.
//!
//! # Example
//!
//! ```rust,ignore
//! use dmabuf_gralloc::prelude::*;
//!
//! let allocator = Allocator::new(AllocatorConfig::default())?;
//! let mut descs = [BufferDescriptor::rgba(1920, 1080, UsageBits::COMPOSER)];
//! let mut allocation = allocator.allocate(&mut descs)?;
//! let fd = allocation.buffers[0].fd(0);
//! allocator.free(&mut allocation.buffers)?;
//! ```

use crate::batch::{self, Allocation};
use crate::buffer::{AllocatedBuffer, BufferState, MapStatus};
use crate::catalog::HeapCatalog;
use crate::config::AllocatorConfig;
use crate::descriptor::BufferDescriptor;
use crate::error::{Error, Result};
use crate::heap::PrivateFlags;
use crate::kernel::{KernelOps, LinuxKernel, PlaneFd};
use rustix::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Buffers handed out by `allocate`.
    pub buffers: u64,
    /// Successful `allocate` calls.
    pub batches: u64,
    /// Batches served by one shared allocation.
    pub shared_batches: u64,
    /// Buffers whose planes are HFR containers.
    pub containers: u64,
    /// Buffers that ended up on the system heap after a failure.
    pub fallbacks: u64,
    /// `allocate` calls that failed.
    pub failures: u64,
    /// Foreign buffers wrapped by `import`.
    pub imports: u64,
    /// Buffers released by `free`.
    pub frees: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    buffers: AtomicU64,
    batches: AtomicU64,
    shared_batches: AtomicU64,
    containers: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
    imports: AtomicU64,
    frees: AtomicU64,
}

/// DMA-buffer allocator for graphics buffers.
#[derive(Debug)]
pub struct Allocator {
    catalog: Arc<HeapCatalog>,
    stats: StatsInner,
}

impl Allocator {
    /// Allocator over the running kernel's ION device.
    pub fn new(config: AllocatorConfig) -> Result<Self> {
        Self::with_kernel(config, Arc::new(LinuxKernel::new()))
    }

    /// Allocator issuing syscalls through `kernel`.
    pub fn with_kernel(config: AllocatorConfig, kernel: Arc<dyn KernelOps>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            catalog: Arc::new(HeapCatalog::new(config, kernel)),
            stats: StatsInner::default(),
        })
    }

    /// Heap catalog backing this allocator.
    pub fn catalog(&self) -> &Arc<HeapCatalog> {
        &self.catalog
    }

    /// Configuration in effect.
    pub fn config(&self) -> &AllocatorConfig {
        self.catalog.config()
    }

    /// Open the allocator device ahead of the first allocation.
    pub fn open(&self) -> Result<()> {
        self.catalog.open()
    }

    /// Release the device handle. Live buffers are unaffected.
    pub fn close(&self) {
        self.catalog.close()
    }

    /// Allocate one buffer per descriptor.
    ///
    /// Descriptors that all resolve to the same heap and flags share one
    /// backing allocation. On failure nothing allocated by this call stays
    /// open.
    pub fn allocate(&self, descriptors: &mut [BufferDescriptor]) -> Result<Allocation> {
        let result = self
            .catalog
            .session()
            .and_then(|session| batch::allocate(&session, descriptors));

        let allocation = match result {
            Ok(a) => a,
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(count = descriptors.len(), error = %e, "batch allocation failed");
                return Err(e);
            }
        };

        let count = |flag| {
            allocation
                .buffers
                .iter()
                .filter(|b| b.flags().contains(flag))
                .count() as u64
        };
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .buffers
            .fetch_add(allocation.buffers.len() as u64, Ordering::Relaxed);
        self.stats
            .containers
            .fetch_add(count(PrivateFlags::HFR_MODE), Ordering::Relaxed);
        self.stats
            .fallbacks
            .fetch_add(count(PrivateFlags::SYSTEM_FALLBACK), Ordering::Relaxed);
        if allocation.shared {
            self.stats.shared_batches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(allocation)
    }

    /// Free every buffer. Already freed and framebuffer buffers are skipped.
    pub fn free(&self, buffers: &mut [AllocatedBuffer]) -> Result<()> {
        for buffer in buffers {
            let releases = buffer.state() != BufferState::Freed
                && !buffer.flags().contains(PrivateFlags::FRAMEBUFFER);
            buffer.free()?;
            if releases {
                self.stats.frees.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Map a buffer for CPU access.
    pub fn map(&self, buffer: &mut AllocatedBuffer) -> Result<MapStatus> {
        buffer.map()
    }

    /// Unmap a buffer.
    pub fn unmap(&self, buffer: &mut AllocatedBuffer) -> Result<()> {
        buffer.unmap()
    }

    /// Begin CPU access.
    pub fn sync_start(&self, buffer: &mut AllocatedBuffer, read: bool, write: bool) -> Result<()> {
        buffer.sync_start(read, write)
    }

    /// End CPU access.
    pub fn sync_end(&self, buffer: &mut AllocatedBuffer, read: bool, write: bool) -> Result<()> {
        buffer.sync_end(read, write)
    }

    /// Wrap a dma-buf received from elsewhere.
    ///
    /// The fd is duplicated, so the caller keeps ownership of `fd`. Passing
    /// [`PrivateFlags::FRAMEBUFFER`] marks the buffer as owned by the
    /// framebuffer device: `free` leaves it alone and only dropping it
    /// closes the duplicate.
    pub fn import(
        &self,
        fd: BorrowedFd<'_>,
        size: usize,
        flags: PrivateFlags,
    ) -> Result<AllocatedBuffer> {
        if size == 0 {
            return Err(Error::InvalidArgument("import size is 0".into()));
        }
        let session = self.catalog.session()?;
        let owned = session
            .kernel()
            .dup(fd)
            .map_err(|e| Error::DuplicationFailed(format!("import: {}", e)))?;
        let plane = PlaneFd::new(owned);
        let handle = session.backend().import(session.device(), plane.as_fd())?;
        tracing::debug!(fd = plane.raw(), handle = handle.raw(), size, "imported buffer");

        self.stats.imports.fetch_add(1, Ordering::Relaxed);
        Ok(AllocatedBuffer::imported(session, plane, size, flags, handle))
    }

    /// Current counters.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            buffers: self.stats.buffers.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            shared_batches: self.stats.shared_batches.load(Ordering::Relaxed),
            containers: self.stats.containers.load(Ordering::Relaxed),
            fallbacks: self.stats.fallbacks.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            imports: self.stats.imports.load(Ordering::Relaxed),
            frees: self.stats.frees.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeIonKernel;
    use crate::usage::UsageBits;

    fn allocator(kernel: &Arc<FakeIonKernel>) -> Allocator {
        Allocator::with_kernel(AllocatorConfig::default(), kernel.clone()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let kernel = Arc::new(FakeIonKernel::modern("alloc_cfg"));
        let config = AllocatorConfig {
            hfr_batch_size: 0,
            ..AllocatorConfig::default()
        };
        assert!(Allocator::with_kernel(config, kernel).is_err());
    }

    #[test]
    fn test_stats_track_batches() {
        let kernel = Arc::new(FakeIonKernel::modern("alloc_stats"));
        let alloc = allocator(&kernel);

        let mut descs = [
            BufferDescriptor::nv12(64, 64, UsageBits::VIDEO_DECODER),
            BufferDescriptor::nv12(64, 64, UsageBits::VIDEO_DECODER),
        ];
        let mut a = alloc.allocate(&mut descs).unwrap();
        alloc.free(&mut a.buffers).unwrap();
        alloc.free(&mut a.buffers).unwrap();

        let stats = alloc.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.shared_batches, 1);
        assert_eq!(stats.buffers, 2);
        assert_eq!(stats.frees, 2);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn test_import_keeps_caller_fd() {
        let kernel = Arc::new(FakeIonKernel::legacy("alloc_import"));
        let alloc = allocator(&kernel);
        let foreign =
            rustix::fs::memfd_create("alloc_import-buf", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&foreign, 4096).unwrap();

        let mut buf = alloc.import(foreign.as_fd(), 4096, PrivateFlags::empty()).unwrap();
        assert!(buf.flags().contains(PrivateFlags::IMPORTED));
        assert!(buf.import_handle(0).is_some());
        assert_eq!(kernel.open_handles(), 1);

        alloc.free(std::slice::from_mut(&mut buf)).unwrap();
        assert_eq!(kernel.open_handles(), 0);
        // Only the caller's original remains.
        assert_eq!(kernel.live_buffer_fds(), 1);
        assert_eq!(alloc.stats().imports, 1);
    }

    #[test]
    fn test_import_zero_size_rejected() {
        let kernel = Arc::new(FakeIonKernel::modern("alloc_import_zero"));
        let alloc = allocator(&kernel);
        let fd = rustix::fs::memfd_create("x", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        assert!(matches!(
            alloc.import(fd.as_fd(), 0, PrivateFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
    }
}
