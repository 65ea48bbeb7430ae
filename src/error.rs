//! Error types for the allocation engine.

use thiserror::Error;

/// Result type alias using the crate's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for allocation, mapping and release operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The allocator device could not be opened or re-opened.
    #[error("allocator device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Zero size, malformed descriptor, or an operation on a freed buffer.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested heap does not exist on this platform.
    #[error("heap unavailable: {0}")]
    HeapUnavailable(String),

    /// The kernel allocation failed after any applicable fallback.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// Building an HFR container fd failed.
    #[error("container merge failed: {0}")]
    MergeFailed(String),

    /// mmap or munmap failed.
    #[error("mapping failed: {0}")]
    MappingFailed(String),

    /// Duplicating a plane fd for a shared allocation failed.
    #[error("fd duplication failed: {0}")]
    DuplicationFailed(String),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether this error came out of the kernel allocator itself, as opposed
    /// to argument validation or policy.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, Error::AllocationFailed(_) | Error::System(_))
    }
}
