//! # dmabuf-gralloc
//!
//! DMA-BUF allocation engine for a graphics buffer allocator.
//!
//! Given buffer geometry and usage flags, the engine picks a kernel memory
//! heap, allocates from it (falling back to the system heap where allowed),
//! optionally backs a whole batch of buffers with one allocation, merges
//! frames into multi-frame containers for high frame rate capture, and owns
//! the resulting dma-buf fds and CPU mappings until they are freed.
//!
//! ## Features
//!
//! - **Dual ION protocol**: legacy handle-based and modern fd-returning ABIs
//!   behind one [`AllocBackend`](kernel::AllocBackend), detected once
//! - **Heap policy**: protected, camera and display heaps from usage bits
//! - **Leak-free failure paths**: every fd is an `OwnedFd`, so rollback is
//!   ordinary drop
//! - **Testable without hardware**: [`testing::FakeIonKernel`] serves the
//!   same ioctls from memfds
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dmabuf_gralloc::prelude::*;
//!
//! let allocator = Allocator::new(AllocatorConfig::default())?;
//! let mut descs = [BufferDescriptor::rgba(1920, 1080, UsageBits::COMPOSER)];
//! let mut allocation = allocator.allocate(&mut descs)?;
//!
//! let buffer = &mut allocation.buffers[0];
//! if buffer.map()? == MapStatus::Mapped {
//!     buffer.plane_slice_mut(0).unwrap().fill(0);
//! }
//! allocator.free(&mut allocation.buffers)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod afbc;
pub mod allocator;
pub mod batch;
pub mod buffer;
pub mod catalog;
pub mod config;
pub mod container;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod heap;
pub mod kernel;
pub mod policy;
pub mod testing;
pub mod usage;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::allocator::{Allocator, AllocatorStats};
    pub use crate::batch::Allocation;
    pub use crate::buffer::{AllocatedBuffer, BufferState, MapStatus};
    pub use crate::config::{AllocatorConfig, DisplayHeap, PlatformConfig};
    pub use crate::descriptor::{BufferDescriptor, PixelFormat};
    pub use crate::error::{Error, Result};
    pub use crate::heap::{AllocFlags, HeapType, PrivateFlags};
    pub use crate::usage::UsageBits;
}

pub use error::{Error, Result};
