//! Linux/FreeBSD arena backend.
//!
//! The backing store is an anonymous memfd; the virtual arena is one large
//! `MAP_NORESERVE` anonymous reservation that is never touched while free.
//! Sub-ranges come online by mmapping the memfd over them at fixed addresses
//! and go offline again by mmapping fresh anonymous memory over them, which
//! also merges the kernel VMAs back together. A free-region tracker mirrors
//! which parts of the reservation are placeholders so that partial unmaps can
//! hand the kernel one maximally-merged range per call.

use std::io;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::perms::MemoryPermission;
use crate::tracker::FreeRegionTracker;
use crate::util::PAGE_SIZE;

#[cfg(target_arch = "aarch64")]
use crate::util::HUGE_PAGE_SIZE;

/// Mutable arena state, guarded by one lock per instance.
struct State {
    /// Effective base for offset translation. Null once direct-mapped
    /// addressing is enabled; offsets are then absolute host addresses.
    virtual_base: *mut u8,
    free: FreeRegionTracker,
}

/// Fastmem arena backed by a shared memory file descriptor.
pub struct Arena {
    backing_size: usize,
    virtual_size: usize,
    fd: libc::c_int,
    backing_base: *mut u8,
    /// Start of the reservation, kept for the final munmap even after
    /// direct-mapped addressing nulls the effective base.
    virtual_map_base: *mut u8,
    state: Mutex<State>,
}

// Safety: the raw pointers refer to mappings owned by this arena for its
// whole lifetime, and all mutable bookkeeping sits behind the state mutex.
// Concurrent access to the mapped bytes themselves is the caller's
// responsibility, the same as on real hardware.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Allocate the backing store and reserve the virtual arena.
    ///
    /// On failure every partially-acquired resource is released before the
    /// error is returned; the caller is expected to fall back to a plain
    /// buffer.
    pub fn new(backing_size: usize, virtual_size: usize) -> Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size != PAGE_SIZE as libc::c_long {
            return Err(Error::IncompatiblePageSize(page_size as i64));
        }

        // memfd_create gives an anonymous shared memory file; ftruncate
        // extends it with zeros.
        let fd = unsafe { libc::memfd_create(b"fastmem\0".as_ptr().cast(), 0) };
        if fd < 0 {
            return Err(Error::BackingAllocation {
                size: backing_size,
                source: io::Error::last_os_error(),
            });
        }

        if unsafe { libc::ftruncate(fd, backing_size as libc::off_t) } != 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::BackingAllocation {
                size: backing_size,
                source,
            });
        }

        let backing_base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                backing_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if backing_base == libc::MAP_FAILED {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::BackingAllocation {
                size: backing_size,
                source,
            });
        }
        let backing_base = backing_base as *mut u8;

        let virtual_map_base = choose_virtual_base(virtual_size);
        if virtual_map_base as *mut libc::c_void == libc::MAP_FAILED {
            let source = io::Error::last_os_error();
            unsafe {
                libc::munmap(backing_base as *mut libc::c_void, backing_size);
                libc::close(fd);
            }
            return Err(Error::ArenaReservation {
                size: virtual_size,
                source,
            });
        }

        #[cfg(target_os = "linux")]
        unsafe {
            libc::madvise(
                virtual_map_base as *mut libc::c_void,
                virtual_size,
                libc::MADV_HUGEPAGE,
            );
        }

        let mut free = FreeRegionTracker::new();
        free.set_address_space(virtual_map_base as usize, virtual_size);

        Ok(Self {
            backing_size,
            virtual_size,
            fd,
            backing_base,
            virtual_map_base,
            state: Mutex::new(State {
                virtual_base: virtual_map_base,
                free,
            }),
        })
    }

    /// Alias `[virtual_offset, +length)` of the arena to
    /// `[host_offset, +length)` of the backing store.
    ///
    /// The target range must currently be free; mapping over an occupied
    /// range panics. A failed OS call leaves the range unmapped and restores
    /// the placeholder.
    pub fn map(
        &self,
        virtual_offset: usize,
        host_offset: usize,
        length: usize,
        perms: MemoryPermission,
    ) {
        let mut state = self.state.lock().unwrap();
        let (virtual_offset, length) = self.adjust_range(&state, virtual_offset, length);
        if length == 0 {
            return;
        }
        let addr = state.virtual_base as usize + virtual_offset;

        // The range leaves the free set before the view goes in.
        state.free.allocate_block(addr, length);

        let mut prot = libc::PROT_NONE;
        if perms.contains(MemoryPermission::READ) {
            prot |= libc::PROT_READ;
        }
        if perms.contains(MemoryPermission::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        #[cfg(target_arch = "aarch64")]
        if perms.contains(MemoryPermission::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }

        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                length,
                prot,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.fd,
                host_offset as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            log::error!("mmap failed: {}", io::Error::last_os_error());
            // Re-establish the placeholder so the tracker and the address
            // space stay in agreement.
            let placeholder = unsafe {
                libc::mmap(
                    addr as *mut libc::c_void,
                    length,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if placeholder == libc::MAP_FAILED {
                // Both the view mapping and the recovery mapping failed; the
                // tracker can no longer describe the address space.
                panic!(
                    "failed to restore placeholder at {addr:#x}: {}",
                    io::Error::last_os_error()
                );
            }
            state.free.free_block(addr, length);
        }
    }

    /// Return `[virtual_offset, +length)` to placeholder state.
    pub fn unmap(&self, virtual_offset: usize, length: usize) {
        let mut state = self.state.lock().unwrap();
        let (virtual_offset, length) = self.adjust_range(&state, virtual_offset, length);
        if length == 0 {
            return;
        }
        let addr = state.virtual_base as usize + virtual_offset;

        // Merge with any adjacent placeholders and replace the whole merged
        // run with one fresh anonymous mapping, collapsing the kernel VMAs.
        let (merged_addr, merged_size) = state.free.free_block(addr, length);
        let ret = unsafe {
            libc::mmap(
                merged_addr as *mut libc::c_void,
                merged_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            log::error!("mmap failed during unmap: {}", io::Error::last_os_error());
            // The backing views are still live; take the range back out of
            // the free set.
            state.free.allocate_block(addr, length);
        }
    }

    /// Change the access rights of `[virtual_offset, +length)` in place.
    pub fn protect(
        &self,
        virtual_offset: usize,
        length: usize,
        read: bool,
        write: bool,
        execute: bool,
    ) {
        let state = self.state.lock().unwrap();
        let (virtual_offset, length) = self.adjust_range(&state, virtual_offset, length);
        if length == 0 {
            return;
        }
        let addr = state.virtual_base as usize + virtual_offset;

        let mut prot = libc::PROT_NONE;
        if read {
            prot |= libc::PROT_READ;
        }
        if write {
            prot |= libc::PROT_WRITE;
        }
        #[cfg(target_arch = "aarch64")]
        if execute {
            prot |= libc::PROT_EXEC;
        }
        #[cfg(not(target_arch = "aarch64"))]
        let _ = execute;

        let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, length, prot) };
        if ret != 0 {
            log::error!("mprotect failed: {}", io::Error::last_os_error());
        }
    }

    /// Zero a sub-range of the backing store through the kernel, dropping
    /// any committed pages. Returns false where no such primitive exists.
    pub fn clear_backing_region(&self, physical_offset: usize, length: usize) -> bool {
        #[cfg(target_os = "linux")]
        {
            // MADV_REMOVE punches a hole in the memfd: the range reads back
            // as zeros through every view of it.
            let ret = unsafe {
                libc::madvise(
                    self.backing_base.add(physical_offset) as *mut libc::c_void,
                    length,
                    libc::MADV_REMOVE,
                )
            };
            if ret != 0 {
                log::error!("madvise(MADV_REMOVE) failed: {}", io::Error::last_os_error());
                return false;
            }
            true
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (physical_offset, length);
            false
        }
    }

    /// Drop the virtual reservation from offset translation: offsets become
    /// absolute host addresses, clamped to the reservation's window.
    pub fn enable_direct_mapped_address(&self) {
        self.state.lock().unwrap().virtual_base = std::ptr::null_mut();
    }

    pub fn is_direct_mapping_enabled(&self) -> bool {
        self.state.lock().unwrap().virtual_base.is_null()
    }

    pub fn is_valid_mapping(&self, offset: usize, length: usize) -> bool {
        offset + length <= self.backing_size
    }

    pub fn backing_base(&self) -> *mut u8 {
        self.backing_base
    }

    pub fn virtual_base(&self) -> *mut u8 {
        self.virtual_map_base
    }

    /// Clamp a request against the reservation's absolute address window
    /// when running in direct-mapped mode. No-op otherwise.
    fn adjust_range(&self, state: &State, virtual_offset: usize, length: usize) -> (usize, usize) {
        if !state.virtual_base.is_null() {
            return (virtual_offset, length);
        }

        let intended_start = virtual_offset;
        let intended_end = virtual_offset + length;
        let window_start = self.virtual_map_base as usize;
        let window_end = window_start + self.virtual_size;

        if window_start > intended_end || intended_start > window_end {
            (0, 0)
        } else {
            let start = intended_start.max(window_start);
            let end = intended_end.min(window_end);
            (start, end - start)
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Reverse dependency order: the reservation, the backing view, then
        // the backing fd.
        unsafe {
            if libc::munmap(self.virtual_map_base as *mut libc::c_void, self.virtual_size) != 0 {
                log::error!("munmap failed: {}", io::Error::last_os_error());
            }
            if libc::munmap(self.backing_base as *mut libc::c_void, self.backing_size) != 0 {
                log::error!("munmap failed: {}", io::Error::last_os_error());
            }
            if libc::close(self.fd) != 0 {
                log::error!("close failed: {}", io::Error::last_os_error());
            }
        }
    }
}

/// Reserve the virtual arena.
///
/// On aarch64 the reservation must sit above 36 bits (a constraint imposed
/// by Qualcomm devices) and on a 2 MiB boundary, so up to 64 randomized
/// placements are attempted before giving up.
#[cfg(target_arch = "aarch64")]
fn choose_virtual_base(virtual_size: usize) -> *mut u8 {
    use rand::Rng;

    const MAP_36_BIT_SIZE: usize = 1 << 36;
    const MAP_39_BIT_SIZE: usize = 1 << 39;

    // The reservation has to fit between the two bounds at all.
    if virtual_size >= MAP_39_BIT_SIZE - MAP_36_BIT_SIZE {
        return libc::MAP_FAILED as *mut u8;
    }

    // Not a cryptographic application, the placements just need to spread.
    let mut rng = rand::thread_rng();
    let lower = MAP_36_BIT_SIZE / HUGE_PAGE_SIZE;
    let upper = (MAP_39_BIT_SIZE - virtual_size) / HUGE_PAGE_SIZE;

    for _ in 0..64 {
        let hint = rng.gen_range(lower..upper) * HUGE_PAGE_SIZE;
        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                virtual_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr as usize == hint {
            return ptr as *mut u8;
        }
        // The kernel placed us somewhere else; undo and retry.
        if ptr != libc::MAP_FAILED {
            unsafe { libc::munmap(ptr, virtual_size) };
        }
    }

    libc::MAP_FAILED as *mut u8
}

#[cfg(not(target_arch = "aarch64"))]
fn choose_virtual_base(virtual_size: usize) -> *mut u8 {
    // FreeBSD can ask for super-page alignment directly.
    #[cfg(target_os = "freebsd")]
    {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                virtual_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | libc::MAP_NORESERVE
                    | libc::MAP_ALIGNED_SUPER,
                -1,
                0,
            )
        };
        if ptr != libc::MAP_FAILED {
            return ptr as *mut u8;
        }
    }

    unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            virtual_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        ) as *mut u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKING: usize = 64 * PAGE_SIZE;
    const VIRTUAL: usize = 1024 * PAGE_SIZE;

    #[test]
    fn test_map_aliases_backing() {
        let arena = Arena::new(BACKING, VIRTUAL).unwrap();
        arena.map(0, 0, PAGE_SIZE, MemoryPermission::READ_WRITE);

        unsafe {
            std::ptr::write_bytes(arena.backing_base(), 0x5A, PAGE_SIZE);
            let through_arena = std::slice::from_raw_parts(arena.virtual_base(), PAGE_SIZE);
            assert!(through_arena.iter().all(|&b| b == 0x5A));
        }

        arena.unmap(0, PAGE_SIZE);
    }

    #[test]
    fn test_unmap_merges_back_to_one_run() {
        let arena = Arena::new(BACKING, VIRTUAL).unwrap();
        arena.map(0, 0, 4 * PAGE_SIZE, MemoryPermission::READ_WRITE);
        arena.map(8 * PAGE_SIZE, 4 * PAGE_SIZE, 4 * PAGE_SIZE, MemoryPermission::READ_WRITE);
        arena.unmap(0, 4 * PAGE_SIZE);
        arena.unmap(8 * PAGE_SIZE, 4 * PAGE_SIZE);

        let state = arena.state.lock().unwrap();
        assert_eq!(state.free.free_runs().count(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_clear_backing_region_zeroes() {
        let arena = Arena::new(BACKING, VIRTUAL).unwrap();
        unsafe {
            std::ptr::write_bytes(arena.backing_base(), 0xFF, 2 * PAGE_SIZE);
        }
        assert!(arena.clear_backing_region(0, 2 * PAGE_SIZE));
        let bytes = unsafe { std::slice::from_raw_parts(arena.backing_base(), 2 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
