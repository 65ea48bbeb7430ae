//! Allocator and platform configuration.
//!
//! Platform policy differs between SoC builds: whether secure heaps exist,
//! which heap backs the zero-copy display path, and the legacy numeric id and
//! name of every heap. [`AllocatorConfig::default`] describes a typical
//! Exynos-style layout; tests and other platforms build their own.
//!
//! # Example
//!
//! ```rust,ignore
//! use dmabuf_gralloc::config::{AllocatorConfig, DisplayHeap, PlatformConfig};
//!
//! let config = AllocatorConfig {
//!     platform: PlatformConfig {
//!         display_heap: Some(DisplayHeap::CompoundPage),
//!         ..PlatformConfig::default()
//!     },
//!     ..AllocatorConfig::default()
//! };
//! ```

use crate::error::{Error, Result};
use crate::heap::HeapType;
use std::path::PathBuf;

/// Default allocator device node.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/ion";

/// Number of single-frame buffers merged into one HFR container.
pub const HFR_BATCH_SIZE: usize = 8;

/// Size of the private per-frame video metadata plane.
pub const PRIVATE_METADATA_SIZE: usize = 4096;

/// Size of the compression flag page: one machine word.
pub const FLAG_PAGE_SIZE: usize = std::mem::size_of::<usize>();

/// Heap used for zero-copy display buffers on this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayHeap {
    /// CMA-backed DMA heap.
    Dma,
    /// Physically contiguous heap.
    Contiguous,
    /// 2 MiB compound-page heap.
    CompoundPage,
}

impl DisplayHeap {
    /// The logical heap this maps to.
    pub fn heap_type(self) -> HeapType {
        match self {
            DisplayHeap::Dma => HeapType::Dma,
            DisplayHeap::Contiguous => HeapType::Contiguous,
            DisplayHeap::CompoundPage => HeapType::CompoundPage,
        }
    }
}

/// Legacy id and kernel name of one heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapEntry {
    /// Logical heap.
    pub heap: HeapType,
    /// Numeric id under the legacy protocol (mask bit).
    pub legacy_id: u32,
    /// Name reported by the modern heap query.
    pub name: String,
}

impl HeapEntry {
    /// Create a heap entry.
    pub fn new(heap: HeapType, legacy_id: u32, name: &str) -> Self {
        Self {
            heap,
            legacy_id,
            name: name.to_string(),
        }
    }
}

/// Platform-specific heap policy.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// The platform has secure heaps for protected content.
    pub has_secure_heaps: bool,
    /// Protected + private-non-secure content may use the system heap.
    pub allow_private_nonsecure: bool,
    /// Private-non-secure content consumed by the composer is allocated
    /// with the protected flag.
    pub crypto_composer_protected: bool,
    /// Heap preferred for framebuffer/composer targets, if any.
    pub display_heap: Option<DisplayHeap>,
    /// Legacy id and kernel name of every heap.
    pub heaps: Vec<HeapEntry>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            has_secure_heaps: true,
            allow_private_nonsecure: true,
            crypto_composer_protected: false,
            display_heap: None,
            heaps: default_heap_table(),
        }
    }
}

impl PlatformConfig {
    /// A platform without secure heaps or a display heap.
    pub fn generic() -> Self {
        Self {
            has_secure_heaps: false,
            allow_private_nonsecure: false,
            crypto_composer_protected: false,
            display_heap: None,
            heaps: default_heap_table(),
        }
    }

    /// Look up the entry for a logical heap.
    pub fn entry(&self, heap: HeapType) -> Option<&HeapEntry> {
        self.heaps.iter().find(|s| s.heap == heap)
    }

    /// Legacy numeric id of a logical heap.
    pub fn legacy_id(&self, heap: HeapType) -> Option<u32> {
        self.entry(heap).map(|s| s.legacy_id)
    }

    /// Kernel name registered for a legacy id.
    pub fn name_for_legacy_id(&self, legacy_id: u32) -> Option<&str> {
        self.heaps
            .iter()
            .find(|s| s.legacy_id == legacy_id)
            .map(|s| s.name.as_str())
    }
}

fn default_heap_table() -> Vec<HeapEntry> {
    vec![
        HeapEntry::new(HeapType::System, 0, "ion_system_heap"),
        HeapEntry::new(HeapType::VideoStream, 3, "vstream_heap"),
        HeapEntry::new(HeapType::Contiguous, 4, "ion_contig_heap"),
        HeapEntry::new(HeapType::VideoFrame, 5, "vframe_heap"),
        HeapEntry::new(HeapType::VideoScaler, 6, "vscaler_heap"),
        HeapEntry::new(HeapType::Camera, 7, "camera_heap"),
        HeapEntry::new(HeapType::CompoundPage, 9, "ion_compound_page_heap"),
        HeapEntry::new(HeapType::Dma, 10, "ion_dma_heap"),
        HeapEntry::new(HeapType::SecureCamera, 11, "secure_camera_heap"),
    ]
}

/// Configuration for an [`Allocator`](crate::allocator::Allocator).
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Allocator device node.
    pub device_path: PathBuf,
    /// Frames per HFR container.
    pub hfr_batch_size: usize,
    /// Size of the private metadata plane.
    pub private_metadata_size: usize,
    /// Platform heap policy.
    pub platform: PlatformConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            hfr_batch_size: HFR_BATCH_SIZE,
            private_metadata_size: PRIVATE_METADATA_SIZE,
            platform: PlatformConfig::default(),
        }
    }
}

impl AllocatorConfig {
    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.hfr_batch_size == 0 {
            return Err(Error::InvalidArgument(
                "hfr_batch_size must be greater than 0".into(),
            ));
        }
        if self.private_metadata_size == 0 {
            return Err(Error::InvalidArgument(
                "private_metadata_size must be greater than 0".into(),
            ));
        }
        for (i, entry) in self.platform.heaps.iter().enumerate() {
            if entry.legacy_id >= u32::BITS {
                return Err(Error::InvalidArgument(format!(
                    "legacy id {} of heap {} does not fit a heap mask",
                    entry.legacy_id, entry.heap
                )));
            }
            if self.platform.heaps[..i].iter().any(|s| s.heap == entry.heap) {
                return Err(Error::InvalidArgument(format!(
                    "heap {} listed twice",
                    entry.heap
                )));
            }
        }
        if self.platform.entry(HeapType::System).is_none() {
            return Err(Error::InvalidArgument(
                "platform must define the system heap".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AllocatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.device_path, PathBuf::from("/dev/ion"));
        assert_eq!(config.hfr_batch_size, HFR_BATCH_SIZE);
    }

    #[test]
    fn test_every_heap_has_an_entry() {
        let platform = PlatformConfig::default();
        for heap in HeapType::ALL {
            assert!(platform.entry(heap).is_some(), "missing {heap}");
        }
        assert_eq!(platform.legacy_id(HeapType::System), Some(0));
        assert_eq!(platform.name_for_legacy_id(5), Some("vframe_heap"));
        assert_eq!(platform.name_for_legacy_id(31), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = AllocatorConfig {
            hfr_batch_size: 0,
            ..AllocatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let mut config = AllocatorConfig::default();
        config.platform.heaps.push(HeapEntry::new(HeapType::Camera, 40, "x"));
        assert!(config.validate().is_err());

        let mut config = AllocatorConfig::default();
        config.platform.heaps.retain(|s| s.heap != HeapType::System);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_display_heap_mapping() {
        assert_eq!(DisplayHeap::Dma.heap_type(), HeapType::Dma);
        assert_eq!(DisplayHeap::CompoundPage.heap_type(), HeapType::CompoundPage);
    }
}
