//! # fastmem
//!
//! A page-granular host memory arena for emulator fastmem.
//!
//! `fastmem` gives an emulation core a large virtual address window whose
//! sub-ranges can be mapped, unmapped, and re-protected onto a fixed backing
//! buffer at runtime. Guest memory accesses then become ordinary host loads
//! and stores through stable pointers instead of going through an
//! address-translation layer on every access.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fastmem::{HostMemory, MemoryPermission, PAGE_SIZE};
//!
//! fn main() -> fastmem::Result<()> {
//!     let mem = HostMemory::new(64 * 1024 * 1024, 1 << 30)?;
//!
//!     // Bring 16 pages of guest memory online at virtual offset 0.
//!     mem.map(0, 0, 16 * PAGE_SIZE, MemoryPermission::READ_WRITE);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux / FreeBSD**: memfd-backed arena with fixed-address remapping
//! - **Windows**: placeholder-based arena (`VirtualAlloc2` + `MapViewOfFile3`)
//! - **Other platforms**: fallback buffer only, fastmem disabled

pub mod backend;
mod error;
mod fallback;
mod host_memory;
mod perms;
pub mod tracker;
mod util;

// Re-exports
pub use error::{Error, Result};
pub use fallback::FallbackBuffer;
pub use host_memory::HostMemory;
pub use perms::MemoryPermission;
pub use util::{HUGE_PAGE_SIZE, PAGE_SIZE};

/// Check if the current platform has a fastmem arena implementation.
///
/// Returns `true` when arena construction can be attempted at all. Creation
/// can still fail at runtime, in which case [`HostMemory`] runs in fallback
/// mode.
pub fn fastmem_supported() -> bool {
    backend::supported()
}
