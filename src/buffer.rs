//! Allocated buffers and their lifecycle.
//!
//! An [`AllocatedBuffer`] owns one fd per plane (image planes first, then the
//! auxiliary plane if any), the CPU mappings of those planes, and the import
//! handles of wrapped foreign buffers. Its state moves
//! `Allocated -> Mapped <-> Allocated -> Freed`; once freed, every operation
//! other than [`free`](AllocatedBuffer::free) fails with
//! [`Error::InvalidArgument`].
//!
//! Every fd is closed exactly once: by `free`, or by `Drop` for buffers that
//! are never freed.

use crate::catalog::Session;
use crate::descriptor::{AuxPlane, AuxPlaneKind, PixelFormat};
use crate::error::{Error, Result};
use crate::heap::{AllocFlags, HeapType, PrivateFlags};
use crate::kernel::{CpuAccess, ImportHandle, PlaneFd, SyncPhase};
use crate::usage::UsageBits;
use rustix::fd::{AsFd, BorrowedFd, RawFd};
use std::ptr::NonNull;

/// Result of [`AllocatedBuffer::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStatus {
    /// Every plane is CPU-mapped.
    Mapped,
    /// Image planes were deliberately left unmapped (compressed or
    /// CPU-inaccessible memory); only the private metadata plane, if any,
    /// is mapped.
    Omitted,
}

/// Lifecycle state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Fds open, nothing mapped.
    Allocated,
    /// At least one plane mapped.
    Mapped,
    /// Released. Terminal.
    Freed,
}

#[derive(Debug)]
struct Plane {
    fd: Option<PlaneFd>,
    size: usize,
    mapping: Option<NonNull<u8>>,
    import: Option<ImportHandle>,
}

impl Plane {
    fn new(fd: PlaneFd, size: usize) -> Self {
        Self {
            fd: Some(fd),
            size,
            mapping: None,
            import: None,
        }
    }
}

/// Everything the allocation paths know about a finished buffer.
#[derive(Debug)]
pub(crate) struct BufferParts {
    pub planes: Vec<(PlaneFd, usize)>,
    pub aux: Option<(AuxPlane, PlaneFd)>,
    pub flags: PrivateFlags,
    pub alloc_flags: AllocFlags,
    pub heap: HeapType,
    pub min_page_size: usize,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub layer_count: u32,
    pub usage: UsageBits,
}

/// A set of dma-buf planes owned by one logical graphics buffer.
pub struct AllocatedBuffer {
    session: Session,
    planes: Vec<Plane>,
    aux: Option<AuxPlane>,
    flags: PrivateFlags,
    alloc_flags: AllocFlags,
    heap: HeapType,
    min_page_size: usize,
    compressible: bool,
    format: PixelFormat,
    width: u32,
    height: u32,
    layer_count: u32,
    usage: UsageBits,
    cpu_access: CpuAccess,
    freed: bool,
}

// SAFETY: the mapping pointers are only dereferenced through &self / &mut
// self, and fds and import handles are plain kernel references.
unsafe impl Send for AllocatedBuffer {}
// SAFETY: shared access only hands out shared slices.
unsafe impl Sync for AllocatedBuffer {}

impl AllocatedBuffer {
    pub(crate) fn from_parts(session: Session, parts: BufferParts) -> Self {
        let mut planes: Vec<Plane> = parts
            .planes
            .into_iter()
            .map(|(fd, size)| Plane::new(fd, size))
            .collect();
        let mut flags = parts.flags;
        let aux = parts.aux.map(|(aux, fd)| {
            planes.push(Plane::new(fd, aux.size));
            flags |= PrivateFlags::aux_plane(aux.index);
            aux
        });

        Self {
            session,
            planes,
            aux,
            flags,
            alloc_flags: parts.alloc_flags,
            heap: parts.heap,
            min_page_size: parts.min_page_size,
            compressible: parts.format.is_compressed(),
            format: parts.format,
            width: parts.width,
            height: parts.height,
            layer_count: parts.layer_count,
            usage: parts.usage,
            cpu_access: CpuAccess::default(),
            freed: false,
        }
    }

    /// Wrap a foreign fd. The import handle is released on free.
    pub(crate) fn imported(
        session: Session,
        fd: PlaneFd,
        size: usize,
        flags: PrivateFlags,
        import: ImportHandle,
    ) -> Self {
        let mut plane = Plane::new(fd, size);
        plane.import = Some(import);
        Self {
            session,
            planes: vec![plane],
            aux: None,
            flags: flags | PrivateFlags::IMPORTED,
            alloc_flags: AllocFlags::empty(),
            heap: HeapType::System,
            min_page_size: HeapType::System.min_page_size(size),
            compressible: false,
            format: PixelFormat::Blob,
            width: 0,
            height: 0,
            layer_count: 1,
            usage: UsageBits::empty(),
            cpu_access: CpuAccess::default(),
            freed: false,
        }
    }

    fn ensure_live(&self, op: &str) -> Result<()> {
        if self.freed {
            return Err(Error::InvalidArgument(format!("{} on a freed buffer", op)));
        }
        Ok(())
    }

    /// Whether the image planes must stay CPU-inaccessible.
    ///
    /// Protected content counts even when it landed on a non-secure heap.
    pub fn is_unmappable(&self) -> bool {
        self.compressible
            || self.flags.intersects(PrivateFlags::UNMAPPABLE)
            || self.alloc_flags.contains(AllocFlags::PROTECTED)
    }

    /// Map the buffer for CPU access.
    ///
    /// Compressed and protected buffers map only their private metadata
    /// plane and report [`MapStatus::Omitted`]. Otherwise every unmapped
    /// plane is mapped; if any mapping fails, the planes mapped by this call
    /// are unmapped again.
    pub fn map(&mut self) -> Result<MapStatus> {
        self.ensure_live("map")?;

        if self.is_unmappable() {
            if let Some(aux) = self.aux.filter(|a| a.kind == AuxPlaneKind::Metadata) {
                if self.planes[aux.index].mapping.is_none() {
                    self.map_plane(aux.index)?;
                }
            }
            return Ok(MapStatus::Omitted);
        }

        let mut mapped = Vec::with_capacity(self.planes.len());
        for i in 0..self.planes.len() {
            if self.planes[i].mapping.is_some() {
                continue;
            }
            if let Err(e) = self.map_plane(i) {
                for j in mapped {
                    if let Err(unmap) = self.unmap_plane(j) {
                        tracing::warn!(plane = j, error = %unmap, "rollback unmap failed");
                    }
                }
                return Err(e);
            }
            mapped.push(i);
        }
        Ok(MapStatus::Mapped)
    }

    fn map_plane(&mut self, index: usize) -> Result<()> {
        let plane = &mut self.planes[index];
        let Some(fd) = &plane.fd else {
            return Err(Error::InvalidArgument(format!("plane {} has no fd", index)));
        };
        let ptr = self
            .session
            .kernel()
            .mmap(fd.as_fd(), plane.size)
            .map_err(|e| {
                Error::MappingFailed(format!("plane {} (fd {}): {}", index, fd.raw(), e))
            })?;
        tracing::debug!(plane = index, fd = fd.raw(), size = plane.size, "mapped plane");
        plane.mapping = Some(ptr);
        Ok(())
    }

    fn unmap_plane(&mut self, index: usize) -> Result<()> {
        let plane = &mut self.planes[index];
        let Some(ptr) = plane.mapping else {
            return Ok(());
        };
        // SAFETY: `ptr` came from mmap of `size` bytes, and every slice
        // handed out borrows `self`, so none outlives this call.
        unsafe { self.session.kernel().munmap(ptr, plane.size) }
            .map_err(|e| Error::MappingFailed(format!("unmap plane {}: {}", index, e)))?;
        plane.mapping = None;
        Ok(())
    }

    /// Unmap every mapped plane.
    ///
    /// The cached CPU intent is cleared only if every unmap succeeded.
    pub fn unmap(&mut self) -> Result<()> {
        self.ensure_live("unmap")?;

        let mut first_err = None;
        for i in 0..self.planes.len() {
            if let Err(e) = self.unmap_plane(i) {
                tracing::warn!(plane = i, error = %e, "unmap failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                self.cpu_access = CpuAccess::default();
                Ok(())
            }
        }
    }

    /// Release the buffer: unmap, release import handles and close every fd.
    ///
    /// A no-op on framebuffer-backed buffers and on buffers already freed.
    pub fn free(&mut self) -> Result<()> {
        if self.freed || self.flags.contains(PrivateFlags::FRAMEBUFFER) {
            return Ok(());
        }

        for i in 0..self.planes.len() {
            if let Err(e) = self.unmap_plane(i) {
                tracing::warn!(plane = i, error = %e, "unmap during free failed");
                // The mapping is abandoned rather than retried on drop.
                self.planes[i].mapping = None;
            }
        }
        self.release_imports();
        for plane in &mut self.planes {
            plane.fd = None;
            plane.size = 0;
        }

        self.aux = None;
        self.cpu_access = CpuAccess::default();
        self.min_page_size = 0;
        self.freed = true;
        Ok(())
    }

    fn release_imports(&mut self) {
        for plane in &mut self.planes {
            if let Some(handle) = plane.import.take() {
                if let Err(e) = self
                    .session
                    .backend()
                    .release(self.session.device(), handle)
                {
                    tracing::warn!(error = %e, "failed to release import handle");
                }
            }
        }
    }

    fn sync(&self, phase: SyncPhase, access: CpuAccess) -> Result<()> {
        if !self.alloc_flags.contains(AllocFlags::CACHED) {
            return Ok(());
        }
        for plane in &self.planes {
            if let Some(fd) = &plane.fd {
                self.session
                    .backend()
                    .sync(self.session.device(), fd.as_fd(), phase, access)?;
            }
        }
        Ok(())
    }

    /// Prepare for CPU access and record the declared intent.
    ///
    /// Cache maintenance runs only for cached buffers.
    pub fn sync_start(&mut self, read: bool, write: bool) -> Result<()> {
        self.ensure_live("sync_start")?;
        let access = CpuAccess::new(read, write);
        self.cpu_access = access;
        self.sync(SyncPhase::Start, access)
    }

    /// Finish CPU access, flushing writes from cached mappings.
    pub fn sync_end(&mut self, read: bool, write: bool) -> Result<()> {
        self.ensure_live("sync_end")?;
        self.sync(SyncPhase::End, CpuAccess::new(read, write))
    }

    /// Bytes of a mapped plane.
    pub fn plane_slice(&self, index: usize) -> Option<&[u8]> {
        let plane = self.planes.get(index)?;
        let ptr = plane.mapping?;
        // SAFETY: the mapping is live for `size` bytes while `self` is
        // borrowed.
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), plane.size) })
    }

    /// Mutable bytes of a mapped plane.
    pub fn plane_slice_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let plane = self.planes.get(index)?;
        let ptr = plane.mapping?;
        // SAFETY: as above, and `&mut self` rules out other slices.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), plane.size) })
    }

    /// Raw fd of a plane, `-1` if absent or freed.
    pub fn fd(&self, index: usize) -> RawFd {
        self.planes
            .get(index)
            .and_then(|p| p.fd.as_ref())
            .map_or(-1, PlaneFd::raw)
    }

    /// Raw fds of every plane, auxiliary plane last.
    pub fn fds(&self) -> Vec<RawFd> {
        (0..self.planes.len()).map(|i| self.fd(i)).collect()
    }

    /// Borrow a plane fd.
    pub fn plane_fd(&self, index: usize) -> Option<BorrowedFd<'_>> {
        self.planes.get(index)?.fd.as_ref().map(AsFd::as_fd)
    }

    /// Number of fds, auxiliary plane included.
    pub fn fd_count(&self) -> usize {
        self.planes.len()
    }

    /// Size of a plane in bytes, 0 after free.
    pub fn plane_size(&self, index: usize) -> usize {
        self.planes.get(index).map_or(0, |p| p.size)
    }

    /// Import handle of a wrapped foreign plane.
    pub fn import_handle(&self, index: usize) -> Option<&ImportHandle> {
        self.planes.get(index)?.import.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BufferState {
        if self.freed {
            BufferState::Freed
        } else if self.planes.iter().any(|p| p.mapping.is_some()) {
            BufferState::Mapped
        } else {
            BufferState::Allocated
        }
    }

    /// Auxiliary plane, if one was allocated.
    pub fn aux_plane(&self) -> Option<AuxPlane> {
        self.aux
    }

    /// Bookkeeping flags.
    pub fn flags(&self) -> PrivateFlags {
        self.flags
    }

    /// Kernel allocation flags used.
    pub fn alloc_flags(&self) -> AllocFlags {
        self.alloc_flags
    }

    /// Heap backing the image planes.
    pub fn heap(&self) -> HeapType {
        self.heap
    }

    /// Page granularity of the backing heap.
    pub fn min_page_size(&self) -> usize {
        self.min_page_size
    }

    /// Whether the pixel data is compressed.
    pub fn is_compressible(&self) -> bool {
        self.compressible
    }

    /// Pixel format.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Layer count.
    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    /// Usage the buffer was allocated for.
    pub fn usage(&self) -> UsageBits {
        self.usage
    }

    /// CPU access recorded by the last `sync_start`.
    pub fn cpu_access(&self) -> CpuAccess {
        self.cpu_access
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        for i in 0..self.planes.len() {
            if let Err(e) = self.unmap_plane(i) {
                tracing::warn!(plane = i, error = %e, "unmap during drop failed");
            }
        }
        self.release_imports();
        // Plane fds close when `planes` drops.
    }
}

impl std::fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("fds", &self.fds())
            .field("heap", &self.heap)
            .field("flags", &self.flags)
            .field("format", &self.format)
            .field("state", &self.state())
            .finish()
    }
}
