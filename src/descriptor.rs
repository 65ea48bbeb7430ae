//! Validated buffer requests.
//!
//! Plane layout is computed upstream; a [`BufferDescriptor`] arrives with its
//! per-plane byte counts already fixed. The engine only appends derived
//! fields: the auxiliary plane it allocates and the final fd count.

use crate::config::{AllocatorConfig, FLAG_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::usage::UsageBits;

/// Maximum number of fds (image planes plus auxiliary plane) per buffer.
pub const MAX_PLANES: usize = 3;

/// Pixel formats the engine needs to distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 32-bit RGBA.
    Rgba8888,
    /// 32-bit RGBX.
    Rgbx8888,
    /// 32-bit BGRA.
    Bgra8888,
    /// 16-bit RGB.
    Rgb565,
    /// 32-bit RGBA, AFBC block-compressed.
    Rgba8888Afbc,
    /// Semi-planar YUV 4:2:0.
    Nv12,
    /// Semi-planar YUV 4:2:0, CrCb order.
    Nv21,
    /// Planar YUV 4:2:0.
    Yv12,
    /// 10-bit semi-planar YUV 4:2:0.
    P010,
    /// Semi-planar YUV 4:2:0, AFBC block-compressed.
    Nv12Afbc,
    /// Semi-planar YUV 4:2:0, bandwidth-compressed with a flag page.
    Nv12Sbwc,
    /// Opaque blob (codec bitstreams, metadata).
    Blob,
}

impl PixelFormat {
    /// AFBC formats carry a per-plane header written at allocation time.
    #[inline]
    pub fn is_afbc(self) -> bool {
        matches!(self, PixelFormat::Rgba8888Afbc | PixelFormat::Nv12Afbc)
    }

    /// Formats that need a separate compression flag page.
    #[inline]
    pub fn requires_flag_page(self) -> bool {
        matches!(self, PixelFormat::Nv12Sbwc)
    }

    /// Any compressed layout; the CPU cannot read or write the body directly.
    #[inline]
    pub fn is_compressed(self) -> bool {
        self.is_afbc() || self.requires_flag_page()
    }
}

/// Kind of auxiliary plane appended after the image planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxPlaneKind {
    /// Private per-frame video metadata. Always CPU-mapped.
    Metadata,
    /// Compression flag page.
    FlagPage,
}

/// Auxiliary plane recorded on a descriptor by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxPlane {
    /// What the plane holds.
    pub kind: AuxPlaneKind,
    /// Plane index (equal to the image plane count).
    pub index: usize,
    /// Size in bytes.
    pub size: usize,
}

/// One logical buffer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Byte size of each image plane.
    pub plane_sizes: Vec<usize>,
    /// Pixel format.
    pub format: PixelFormat,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Number of layers.
    pub layer_count: u32,
    /// Producer/consumer usage.
    pub usage: UsageBits,
    /// Allocate a private per-frame metadata plane.
    pub needs_private_metadata: bool,
    /// High frame rate capture: each plane becomes a multi-frame container.
    pub is_hfr: bool,
    /// Set by the engine: auxiliary plane allocated for this descriptor.
    pub aux_plane: Option<AuxPlane>,
    /// Set by the engine: total number of fds in the resulting buffer.
    pub fd_count: usize,
}

impl BufferDescriptor {
    /// Create a descriptor with the given plane sizes.
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        usage: UsageBits,
        plane_sizes: &[usize],
    ) -> Self {
        Self {
            plane_sizes: plane_sizes.to_vec(),
            format,
            width,
            height,
            layer_count: 1,
            is_hfr: usage.contains(UsageBits::HFR_MODE),
            needs_private_metadata: usage.contains(UsageBits::VIDEO_PRIVATE_DATA),
            usage,
            aux_plane: None,
            fd_count: 0,
        }
    }

    /// Single-plane RGBA descriptor, tightly packed.
    pub fn rgba(width: u32, height: u32, usage: UsageBits) -> Self {
        let size = width as usize * height as usize * 4;
        Self::new(PixelFormat::Rgba8888, width, height, usage, &[size])
    }

    /// Two-plane NV12 descriptor, tightly packed.
    pub fn nv12(width: u32, height: u32, usage: UsageBits) -> Self {
        let luma = width as usize * height as usize;
        Self::new(PixelFormat::Nv12, width, height, usage, &[luma, luma / 2])
    }

    /// Number of image planes requested.
    #[inline]
    pub fn plane_count(&self) -> usize {
        self.plane_sizes.len()
    }

    /// Sum of the image plane sizes.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.plane_sizes.iter().sum()
    }

    /// Auxiliary plane this descriptor needs, if any, before allocation.
    pub fn required_aux_plane(&self, config: &AllocatorConfig) -> Option<AuxPlane> {
        let index = self.plane_count();
        if self.needs_private_metadata {
            Some(AuxPlane {
                kind: AuxPlaneKind::Metadata,
                index,
                size: config.private_metadata_size,
            })
        } else if self.format.requires_flag_page() {
            Some(AuxPlane {
                kind: AuxPlaneKind::FlagPage,
                index,
                size: FLAG_PAGE_SIZE,
            })
        } else {
            None
        }
    }

    /// Reject descriptors the engine cannot allocate.
    pub fn validate(&self, config: &AllocatorConfig) -> Result<()> {
        let planes = self.plane_count();
        if planes == 0 || planes > MAX_PLANES {
            return Err(Error::InvalidArgument(format!(
                "plane count {} outside 1..={}",
                planes, MAX_PLANES
            )));
        }
        if let Some(i) = self.plane_sizes.iter().position(|&s| s == 0) {
            return Err(Error::InvalidArgument(format!("plane {} has size 0", i)));
        }
        if self.layer_count == 0 {
            return Err(Error::InvalidArgument("layer count is 0".into()));
        }
        if self.required_aux_plane(config).is_some() && planes == MAX_PLANES {
            return Err(Error::InvalidArgument(format!(
                "no room for an auxiliary plane after {} image planes",
                planes
            )));
        }
        Ok(())
    }
}
