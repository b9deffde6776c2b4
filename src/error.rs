//! Error types for fastmem.

use thiserror::Error;

/// Result type alias using fastmem's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when constructing or using a host memory arena.
///
/// Arena construction failures are the one *expected* failure mode:
/// [`HostMemory::new`](crate::HostMemory::new) consumes them internally and
/// degrades to fallback mode. Contract violations (misaligned offsets,
/// mapping an occupied range, unsupported permission combinations) are not
/// errors; they panic.
#[derive(Error, Debug)]
pub enum Error {
    // Arena construction errors
    #[error("fastmem arena not supported on this platform")]
    Unsupported,

    #[error("host page size {0:#x} is incompatible with 4 KiB paging")]
    IncompatiblePageSize(i64),

    #[error("failed to allocate {size} bytes of backing memory: {source}")]
    BackingAllocation { size: usize, source: std::io::Error },

    #[error("failed to reserve {size} bytes of virtual address space: {source}")]
    ArenaReservation { size: usize, source: std::io::Error },

    // Mapping request errors (try_map)
    #[error("no fastmem arena is active (fallback mode)")]
    ArenaInactive,

    #[error("offset {0:#x} is not page-aligned")]
    MisalignedOffset(usize),

    #[error("length {0:#x} is not page-aligned")]
    MisalignedLength(usize),

    #[error("range [{offset:#x}, +{length:#x}) exceeds bound {bound:#x}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        bound: usize,
    },
}
