//! Platform arena backends.
//!
//! Each supported platform provides an `Arena` type exposing the same
//! operations: construct, map a view of the backing store, unmap back to a
//! placeholder, change protection, clear backing pages, and switch to
//! direct-mapped addressing. The platform is fixed per binary, so selection
//! happens at compile time rather than through runtime polymorphism.

// Platform-specific backend modules
#[cfg(any(target_os = "linux", target_os = "freebsd"))]
mod unix;
#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub use unix::Arena;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::Arena;

#[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "windows")))]
mod generic;
#[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "windows")))]
pub use generic::Arena;

/// Whether this build carries a real fastmem arena implementation.
///
/// Even on a supported platform, arena construction can still fail at
/// runtime; `HostMemory` then degrades to fallback mode.
pub fn supported() -> bool {
    cfg!(any(
        target_os = "linux",
        target_os = "freebsd",
        target_os = "windows"
    ))
}
