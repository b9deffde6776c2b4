//! Fallback buffer used when no fastmem arena is available.

use crate::error::{Error, Result};
use crate::util::{align_up, PAGE_SIZE};

/// A plain, page-aligned, zero-filled allocation standing in for the arena
/// backing store.
///
/// With a fallback buffer there is no virtual arena: fastmem is disabled and
/// the emulation core must route every guest access through its own
/// translation path. Map/unmap/protect have nothing to maintain and become
/// no-ops at the [`HostMemory`](crate::HostMemory) level.
pub struct FallbackBuffer {
    #[cfg(target_os = "windows")]
    ptr: *mut std::ffi::c_void,

    #[cfg(not(target_os = "windows"))]
    ptr: *mut u8,

    size: usize,
}

// Safety: FallbackBuffer owns its allocation and can be sent between threads
unsafe impl Send for FallbackBuffer {}
unsafe impl Sync for FallbackBuffer {}

impl FallbackBuffer {
    /// Allocate a new zero-filled buffer of at least `size` bytes.
    #[cfg(target_os = "windows")]
    pub fn new(size: usize) -> Result<Self> {
        use windows::Win32::System::Memory::{
            VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
        };

        let size = align_up(size.max(1), PAGE_SIZE);
        unsafe {
            let ptr = VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
            if ptr.is_null() {
                return Err(Error::BackingAllocation {
                    size,
                    source: std::io::Error::last_os_error(),
                });
            }
            Ok(Self { ptr, size })
        }
    }

    #[cfg(not(target_os = "windows"))]
    pub fn new(size: usize) -> Result<Self> {
        let size = align_up(size.max(1), PAGE_SIZE);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::BackingAllocation {
                size,
                source: std::io::Error::last_os_error(),
            });
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    /// Get a raw pointer to the buffer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    /// Get the size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for FallbackBuffer {
    fn drop(&mut self) {
        #[cfg(target_os = "windows")]
        unsafe {
            use windows::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
            if !self.ptr.is_null() {
                let _ = VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }

        #[cfg(not(target_os = "windows"))]
        unsafe {
            if !self.ptr.is_null() {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_zeroed() {
        let buffer = FallbackBuffer::new(2 * PAGE_SIZE).unwrap();
        assert!(!buffer.as_ptr().is_null());
        assert_eq!(buffer.size(), 2 * PAGE_SIZE);

        let bytes = unsafe { std::slice::from_raw_parts(buffer.as_ptr(), buffer.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_size_rounds_up_to_page() {
        let buffer = FallbackBuffer::new(100).unwrap();
        assert_eq!(buffer.size(), PAGE_SIZE);
    }
}
