//! Modern ION protocol: allocation returns a dma-buf fd directly and heap ids
//! are discovered with a heap query.

use super::ioctl::{
    AllocationData, DMA_BUF_IOCTL_SYNC, DMA_BUF_SYNC_END, DMA_BUF_SYNC_READ, DMA_BUF_SYNC_START,
    DMA_BUF_SYNC_WRITE, DmaBufSync, HeapData, HeapQuery, ION_IOC_ALLOC, ION_IOC_HEAP_QUERY,
};
use super::{AllocBackend, CpuAccess, HeapInfo, ImportHandle, KernelOps, PlaneFd, Protocol, SyncPhase};
use crate::error::{Error, Result};
use crate::heap::AllocFlags;
use rustix::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

/// Backend for kernels exposing the fd-returning ION ABI.
pub struct ModernBackend {
    kernel: Arc<dyn KernelOps>,
    heaps: Vec<HeapInfo>,
    /// Legacy id → kernel heap name, from the platform heap table.
    legacy_names: Vec<(u32, String)>,
}

impl ModernBackend {
    /// Query the heap list and build the backend.
    pub fn probe(
        kernel: Arc<dyn KernelOps>,
        device: BorrowedFd<'_>,
        legacy_names: Vec<(u32, String)>,
    ) -> Result<Self> {
        let heaps = query_heaps(kernel.as_ref(), device)?;
        for heap in &heaps {
            tracing::debug!(id = heap.id, name = %heap.name, kind = ?heap.heap_type(), "found heap");
        }
        Ok(Self {
            kernel,
            heaps,
            legacy_names,
        })
    }
}

fn query_heaps(kernel: &dyn KernelOps, device: BorrowedFd<'_>) -> Result<Vec<HeapInfo>> {
    let mut query = HeapQuery::default();
    // SAFETY: `query` is the argument type of ION_IOC_HEAP_QUERY; a zero
    // `heaps` pointer asks for the count only.
    unsafe {
        kernel.ioctl(
            device,
            ION_IOC_HEAP_QUERY,
            (&mut query as *mut HeapQuery).cast(),
        )?;
    }
    if query.cnt == 0 {
        return Ok(Vec::new());
    }

    let mut data = vec![HeapData::default(); query.cnt as usize];
    query.heaps = data.as_mut_ptr() as u64;
    // SAFETY: `heaps` points to `cnt` writable HeapData entries that outlive
    // the call.
    unsafe {
        kernel.ioctl(
            device,
            ION_IOC_HEAP_QUERY,
            (&mut query as *mut HeapQuery).cast(),
        )?;
    }
    data.truncate((query.cnt as usize).min(data.len()));

    Ok(data
        .iter()
        .map(|d| HeapInfo {
            id: d.heap_id,
            name: d.name().to_string(),
            kernel_type: d.type_,
        })
        .collect())
}

impl AllocBackend for ModernBackend {
    fn protocol(&self) -> Protocol {
        Protocol::Modern
    }

    fn heaps(&self) -> &[HeapInfo] {
        &self.heaps
    }

    fn heap_mask(&self, legacy_id: u32) -> u32 {
        let Some((_, name)) = self.legacy_names.iter().find(|(id, _)| *id == legacy_id) else {
            return 0;
        };
        self.heaps
            .iter()
            .find(|h| h.name == *name)
            .and_then(|h| 1u32.checked_shl(h.id))
            .unwrap_or(0)
    }

    fn allocate(
        &self,
        device: BorrowedFd<'_>,
        len: usize,
        heap_mask: u32,
        flags: AllocFlags,
    ) -> Result<PlaneFd> {
        let mut alloc = AllocationData {
            len: len as u64,
            heap_id_mask: heap_mask,
            flags: flags.bits(),
            fd: 0,
            unused: 0,
        };
        // SAFETY: `alloc` is the argument type of ION_IOC_ALLOC.
        unsafe {
            self.kernel.ioctl(
                device,
                ION_IOC_ALLOC,
                (&mut alloc as *mut AllocationData).cast(),
            )?;
        }
        let raw = i32::try_from(alloc.fd).map_err(|_| {
            Error::AllocationFailed(format!("ION_IOC_ALLOC returned fd {}", alloc.fd))
        })?;
        // SAFETY: on success ION_IOC_ALLOC returns a new fd owned by the caller.
        Ok(PlaneFd::new(unsafe { OwnedFd::from_raw_fd(raw) }))
    }

    fn import(&self, _device: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<ImportHandle> {
        // The fd is the handle under this protocol.
        Ok(ImportHandle::new(fd.as_raw_fd(), Protocol::Modern))
    }

    fn release(&self, _device: BorrowedFd<'_>, handle: ImportHandle) -> Result<()> {
        if handle.protocol() != Protocol::Modern {
            return Err(Error::InvalidArgument(
                "import handle was not issued by the modern protocol".into(),
            ));
        }
        Ok(())
    }

    fn sync(
        &self,
        _device: BorrowedFd<'_>,
        fd: BorrowedFd<'_>,
        phase: SyncPhase,
        access: CpuAccess,
    ) -> Result<()> {
        if access.is_none() {
            return Ok(());
        }
        let mut flags = match phase {
            SyncPhase::Start => DMA_BUF_SYNC_START,
            SyncPhase::End => DMA_BUF_SYNC_END,
        };
        if access.read {
            flags |= DMA_BUF_SYNC_READ;
        }
        if access.write {
            flags |= DMA_BUF_SYNC_WRITE;
        }

        let mut sync = DmaBufSync { flags };
        // SAFETY: `sync` is the argument type of DMA_BUF_IOCTL_SYNC.
        unsafe {
            self.kernel.ioctl(
                fd,
                DMA_BUF_IOCTL_SYNC,
                (&mut sync as *mut DmaBufSync).cast(),
            )?;
        }
        Ok(())
    }
}
