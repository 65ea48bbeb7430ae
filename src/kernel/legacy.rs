//! Legacy ION protocol: allocate a client handle, share it as a dma-buf fd,
//! then drop the handle.

use super::ioctl::{
    ION_IOC_ALLOC_LEGACY, ION_IOC_FREE, ION_IOC_IMPORT, ION_IOC_SHARE, ION_IOC_SYNC,
    LegacyAllocationData, LegacyFdData, LegacyHandleData,
};
use super::{AllocBackend, CpuAccess, HeapInfo, ImportHandle, KernelOps, PlaneFd, Protocol, SyncPhase};
use crate::error::{Error, Result};
use crate::heap::AllocFlags;
use rustix::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

/// Backend for kernels exposing the handle-based ION ABI.
pub struct LegacyBackend {
    kernel: Arc<dyn KernelOps>,
}

impl LegacyBackend {
    /// Create a legacy backend issuing ioctls through `kernel`.
    pub fn new(kernel: Arc<dyn KernelOps>) -> Self {
        Self { kernel }
    }

    /// Whether the device understands the legacy-only `ION_IOC_FREE`.
    ///
    /// Freeing handle 0 fails with `EINVAL` on legacy kernels and `ENOTTY`
    /// on modern ones.
    pub fn probe(kernel: &dyn KernelOps, device: BorrowedFd<'_>) -> bool {
        let mut data = LegacyHandleData { handle: 0 };
        // SAFETY: `data` is the argument type of ION_IOC_FREE.
        let ret = unsafe {
            kernel.ioctl(
                device,
                ION_IOC_FREE,
                (&mut data as *mut LegacyHandleData).cast(),
            )
        };
        !matches!(ret, Err(rustix::io::Errno::NOTTY))
    }

    fn free_handle(&self, device: BorrowedFd<'_>, handle: i32) -> rustix::io::Result<()> {
        let mut data = LegacyHandleData { handle };
        // SAFETY: `data` is the argument type of ION_IOC_FREE.
        unsafe {
            self.kernel.ioctl(
                device,
                ION_IOC_FREE,
                (&mut data as *mut LegacyHandleData).cast(),
            )
        }
    }
}

/// Client handle released when dropped.
struct HandleGuard<'a> {
    backend: &'a LegacyBackend,
    device: BorrowedFd<'a>,
    handle: i32,
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.free_handle(self.device, self.handle) {
            tracing::warn!(handle = self.handle, error = %e, "failed to free ION handle");
        }
    }
}

impl AllocBackend for LegacyBackend {
    fn protocol(&self) -> Protocol {
        Protocol::Legacy
    }

    fn heaps(&self) -> &[HeapInfo] {
        &[]
    }

    fn heap_mask(&self, legacy_id: u32) -> u32 {
        1u32.checked_shl(legacy_id).unwrap_or(0)
    }

    fn allocate(
        &self,
        device: BorrowedFd<'_>,
        len: usize,
        heap_mask: u32,
        flags: AllocFlags,
    ) -> Result<PlaneFd> {
        let mut alloc = LegacyAllocationData {
            len,
            align: 0,
            heap_id_mask: heap_mask,
            flags: flags.bits(),
            handle: 0,
        };
        // SAFETY: `alloc` is the argument type of the legacy ION_IOC_ALLOC.
        unsafe {
            self.kernel.ioctl(
                device,
                ION_IOC_ALLOC_LEGACY,
                (&mut alloc as *mut LegacyAllocationData).cast(),
            )?;
        }

        let handle = HandleGuard {
            backend: self,
            device,
            handle: alloc.handle,
        };

        let mut share = LegacyFdData {
            handle: handle.handle,
            fd: -1,
        };
        // SAFETY: `share` is the argument type of ION_IOC_SHARE.
        unsafe {
            self.kernel.ioctl(
                device,
                ION_IOC_SHARE,
                (&mut share as *mut LegacyFdData).cast(),
            )?;
        }
        if share.fd < 0 {
            return Err(Error::AllocationFailed(format!(
                "ION_IOC_SHARE returned fd {}",
                share.fd
            )));
        }

        // SAFETY: on success ION_IOC_SHARE returns a new fd owned by the caller.
        let fd = unsafe { OwnedFd::from_raw_fd(share.fd) };
        // The dma-buf holds its own reference; the client handle goes now.
        drop(handle);
        Ok(PlaneFd::new(fd))
    }

    fn import(&self, device: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<ImportHandle> {
        let mut data = LegacyFdData {
            handle: 0,
            fd: fd.as_raw_fd(),
        };
        // SAFETY: `data` is the argument type of ION_IOC_IMPORT.
        unsafe {
            self.kernel.ioctl(
                device,
                ION_IOC_IMPORT,
                (&mut data as *mut LegacyFdData).cast(),
            )?;
        }
        Ok(ImportHandle::new(data.handle, Protocol::Legacy))
    }

    fn release(&self, device: BorrowedFd<'_>, handle: ImportHandle) -> Result<()> {
        if handle.protocol() != Protocol::Legacy {
            return Err(Error::InvalidArgument(
                "import handle was not issued by the legacy protocol".into(),
            ));
        }
        self.free_handle(device, handle.raw())?;
        Ok(())
    }

    fn sync(
        &self,
        device: BorrowedFd<'_>,
        fd: BorrowedFd<'_>,
        phase: SyncPhase,
        access: CpuAccess,
    ) -> Result<()> {
        // Invalidate before CPU reads, clean after CPU writes.
        let needed = match phase {
            SyncPhase::Start => access.read,
            SyncPhase::End => access.write,
        };
        if !needed {
            return Ok(());
        }

        let mut data = LegacyFdData {
            handle: 0,
            fd: fd.as_raw_fd(),
        };
        // SAFETY: `data` is the argument type of ION_IOC_SYNC.
        unsafe {
            self.kernel.ioctl(
                device,
                ION_IOC_SYNC,
                (&mut data as *mut LegacyFdData).cast(),
            )?;
        }
        Ok(())
    }
}
