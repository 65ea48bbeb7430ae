//! AFBC header initialisation.
//!
//! An AFBC plane starts with a header of one 16-byte entry per 16x16
//! superblock, followed by the payload at a 1 KiB aligned offset. Producers
//! expect every entry to point at the payload with an empty block, so a
//! freshly allocated plane has its header written once from the CPU.

use crate::catalog::Session;
use crate::error::{Error, Result};
use crate::kernel::PlaneFd;
use rustix::fd::AsFd;

/// Superblock edge in pixels.
pub const SUPERBLOCK_SIZE: u32 = 16;

/// Bytes per header entry.
pub const HEADER_ENTRY_SIZE: usize = 16;

/// Alignment of the payload following the header.
pub const BODY_ALIGN: usize = 1024;

/// Header bytes for one layer of `width` x `height` pixels.
pub fn header_size(width: u32, height: u32) -> usize {
    let cols = width.div_ceil(SUPERBLOCK_SIZE) as usize;
    let rows = height.div_ceil(SUPERBLOCK_SIZE) as usize;
    cols * rows * HEADER_ENTRY_SIZE
}

/// Offset of the payload from the start of a layer.
pub fn body_offset(width: u32, height: u32) -> usize {
    header_size(width, height).next_multiple_of(BODY_ALIGN)
}

/// Write the empty-block header of every layer in `plane`.
///
/// Layers are laid out back to back, each `plane.len() / layers` bytes.
pub fn write_header(plane: &mut [u8], width: u32, height: u32, layers: u32) -> Result<()> {
    let layers = layers.max(1) as usize;
    let stride = plane.len() / layers;
    let header = header_size(width, height);
    if header > stride {
        return Err(Error::InvalidArgument(format!(
            "AFBC header of {} bytes does not fit a {} byte layer",
            header, stride
        )));
    }

    let offset = u32::try_from(body_offset(width, height))
        .map_err(|_| Error::InvalidArgument("AFBC body offset overflows u32".into()))?;
    for layer in plane.chunks_exact_mut(stride).take(layers) {
        for entry in layer[..header].chunks_exact_mut(HEADER_ENTRY_SIZE) {
            entry[..4].copy_from_slice(&offset.to_le_bytes());
            entry[4..].fill(0);
        }
    }
    Ok(())
}

/// Map `fd`, write the header and unmap again.
pub fn init_plane(
    session: &Session,
    fd: &PlaneFd,
    size: usize,
    width: u32,
    height: u32,
    layers: u32,
) -> Result<()> {
    let kernel = session.kernel();
    let ptr = kernel
        .mmap(fd.as_fd(), size)
        .map_err(|e| Error::MappingFailed(format!("AFBC header map of fd {}: {}", fd.raw(), e)))?;

    // SAFETY: `ptr` is a fresh mapping of `size` bytes with no other users.
    let plane = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size) };
    let written = write_header(plane, width, height, layers);

    // SAFETY: `plane` is not used past this point.
    let unmapped = unsafe { kernel.munmap(ptr, size) };
    written?;
    unmapped
        .map_err(|e| Error::MappingFailed(format!("AFBC header unmap of fd {}: {}", fd.raw(), e)))?;

    tracing::debug!(fd = fd.raw(), width, height, "initialised AFBC header");
    Ok(())
}
