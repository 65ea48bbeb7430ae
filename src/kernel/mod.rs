//! Kernel interface.
//!
//! Two layers:
//!
//! - [`KernelOps`]: the raw syscall seam (device open, ioctl, dup, mmap,
//!   munmap). [`LinuxKernel`] issues real syscalls; tests substitute
//!   [`FakeIonKernel`](crate::testing::FakeIonKernel).
//! - [`AllocBackend`]: one implementation per ION protocol generation,
//!   selected once by the [`HeapCatalog`](crate::catalog::HeapCatalog) so call
//!   sites never branch on the generation.

pub mod ioctl;
mod legacy;
mod linux;
mod modern;

pub use legacy::LegacyBackend;
pub use linux::LinuxKernel;
pub use modern::ModernBackend;

use crate::error::Result;
use crate::heap::{AllocFlags, KernelHeapType};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::c_void;
use std::path::Path;
use std::ptr::NonNull;

/// Raw kernel operations used by the engine.
///
/// Only `open_device` and `ioctl` are required; fd duplication and memory
/// mapping default to the plain syscalls.
pub trait KernelOps: Send + Sync {
    /// Open the allocator device node.
    fn open_device(&self, path: &Path) -> rustix::io::Result<OwnedFd>;

    /// Issue an ioctl.
    ///
    /// # Safety
    ///
    /// `arg` must point to a live, properly initialised value of the type
    /// encoded in `request`.
    unsafe fn ioctl(
        &self,
        fd: BorrowedFd<'_>,
        request: u32,
        arg: *mut c_void,
    ) -> rustix::io::Result<()>;

    /// Duplicate an fd (close-on-exec).
    fn dup(&self, fd: BorrowedFd<'_>) -> rustix::io::Result<OwnedFd> {
        rustix::io::fcntl_dupfd_cloexec(fd, 0)
    }

    /// Map `len` bytes of `fd` shared, read/write.
    fn mmap(&self, fd: BorrowedFd<'_>, len: usize) -> rustix::io::Result<NonNull<u8>> {
        // SAFETY: a fresh mapping at a kernel-chosen address aliases no
        // existing Rust object.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(rustix::io::Errno::FAULT)
    }

    /// Unmap a region returned by [`mmap`](Self::mmap).
    ///
    /// # Safety
    ///
    /// `ptr`/`len` must describe a live mapping with no outstanding borrows.
    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> rustix::io::Result<()> {
        // SAFETY: guaranteed by the caller.
        unsafe { rustix::mm::munmap(ptr.as_ptr().cast(), len) }
    }
}

/// Allocation protocol generation exposed by the running kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Allocation returns a client handle which is then shared as an fd.
    Legacy,
    /// Allocation returns an fd directly; heaps are discovered by query.
    Modern,
}

/// One heap reported by the modern heap query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapInfo {
    /// Bit position in the modern heap mask.
    pub id: u32,
    /// Kernel heap name.
    pub name: String,
    /// Raw kernel heap type.
    pub kernel_type: u32,
}

impl HeapInfo {
    /// Kernel heap type, if it is one the engine knows.
    pub fn heap_type(&self) -> Option<KernelHeapType> {
        KernelHeapType::try_from(self.kernel_type).ok()
    }
}

/// An owned dma-buf fd backing one plane.
///
/// Closed exactly once, when dropped.
#[derive(Debug)]
pub struct PlaneFd(OwnedFd);

impl PlaneFd {
    /// Take ownership of an fd.
    pub fn new(fd: OwnedFd) -> Self {
        Self(fd)
    }

    /// Raw fd number.
    #[inline]
    pub fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for PlaneFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// A kernel-side reference obtained by importing a dma-buf.
///
/// Not interchangeable with [`PlaneFd`]: under the modern protocol it carries
/// the same integer as the imported fd but owns nothing, while under the
/// legacy protocol it must be released through the backend that issued it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "import handles must be released through their backend"]
pub struct ImportHandle {
    raw: i32,
    protocol: Protocol,
}

impl ImportHandle {
    pub(crate) fn new(raw: i32, protocol: Protocol) -> Self {
        Self { raw, protocol }
    }

    /// Raw handle value.
    #[inline]
    pub fn raw(&self) -> i32 {
        self.raw
    }

    /// Generation that issued this handle.
    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

/// Direction of a cache-sync call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Before CPU access.
    Start,
    /// After CPU access.
    End,
}

/// CPU access declared around a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuAccess {
    /// CPU reads.
    pub read: bool,
    /// CPU writes.
    pub write: bool,
}

impl CpuAccess {
    /// Build from flags.
    pub fn new(read: bool, write: bool) -> Self {
        Self { read, write }
    }

    /// No access declared.
    #[inline]
    pub fn is_none(&self) -> bool {
        !self.read && !self.write
    }
}

/// Allocation operations that differ between protocol generations.
pub trait AllocBackend: Send + Sync {
    /// Generation this backend speaks.
    fn protocol(&self) -> Protocol;

    /// Heaps discovered at probe time (empty for the legacy protocol).
    fn heaps(&self) -> &[HeapInfo];

    /// Translate a legacy heap id into this generation's heap mask.
    ///
    /// Returns 0 when the heap does not exist.
    fn heap_mask(&self, legacy_id: u32) -> u32;

    /// Allocate `len` bytes and return the dma-buf fd.
    fn allocate(
        &self,
        device: BorrowedFd<'_>,
        len: usize,
        heap_mask: u32,
        flags: AllocFlags,
    ) -> Result<PlaneFd>;

    /// Obtain a kernel reference for a dma-buf fd.
    fn import(&self, device: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<ImportHandle>;

    /// Release a reference obtained from [`import`](Self::import).
    fn release(&self, device: BorrowedFd<'_>, handle: ImportHandle) -> Result<()>;

    /// Cache maintenance around CPU access.
    fn sync(
        &self,
        device: BorrowedFd<'_>,
        fd: BorrowedFd<'_>,
        phase: SyncPhase,
        access: CpuAccess,
    ) -> Result<()>;
}
