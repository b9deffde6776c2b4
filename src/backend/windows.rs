//! Windows arena backend.
//!
//! Windows has no fixed-address remapping: a reserved range must be split
//! into placeholders with `VirtualFreeEx(MEM_PRESERVE_PLACEHOLDER)`, each
//! placeholder individually replaced with a section view via
//! `MapViewOfFile3(MEM_REPLACE_PLACEHOLDER)`, and adjacent placeholders glued
//! back together with `MEM_COALESCE_PLACEHOLDERS`. A placeholder tracker
//! mirrors every live view together with the backing offset it aliases so
//! that partial unmaps can re-map the untouched remainder.
//!
//! The placeholder entry points live in kernelbase and are bound directly;
//! the rest goes through windows-rs.

use std::ffi::c_void;
use std::io;
use std::sync::{Mutex, MutexGuard};

use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::Memory::{
    VirtualFree, VirtualProtect, MEM_RELEASE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY,
    PAGE_READWRITE,
};
use windows::Win32::System::Threading::GetCurrentProcess;

use crate::error::{Error, Result};
use crate::perms::MemoryPermission;
use crate::tracker::PlaceholderTracker;

// Flag values spelled out locally: the generated bindings disagree on their
// wrapper types across windows-rs releases.
const FILE_MAP_WRITE: u32 = 0x0002;
const FILE_MAP_READ: u32 = 0x0004;
const SEC_COMMIT: u32 = 0x0800_0000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RESERVE_PLACEHOLDER: u32 = 0x0004_0000;
const MEM_REPLACE_PLACEHOLDER: u32 = 0x0000_4000;
const MEM_COALESCE_PLACEHOLDERS: u32 = 0x0000_0001;
const MEM_PRESERVE_PLACEHOLDER: u32 = 0x0000_0002;

// Placeholder entry points from kernelbase.
#[link(name = "kernelbase")]
extern "system" {
    fn CreateFileMapping2(
        file: HANDLE,
        security_attributes: *const c_void,
        desired_access: u32,
        page_protection: u32,
        allocation_attributes: u32,
        maximum_size: u64,
        name: *const u16,
        extended_parameters: *mut c_void,
        parameter_count: u32,
    ) -> HANDLE;

    fn VirtualAlloc2(
        process: HANDLE,
        base_address: *mut c_void,
        size: usize,
        allocation_type: u32,
        page_protection: u32,
        extended_parameters: *mut c_void,
        parameter_count: u32,
    ) -> *mut c_void;

    fn MapViewOfFile3(
        file_mapping: HANDLE,
        process: HANDLE,
        base_address: *mut c_void,
        offset: u64,
        view_size: usize,
        allocation_type: u32,
        page_protection: u32,
        extended_parameters: *mut c_void,
        parameter_count: u32,
    ) -> *mut c_void;

    fn UnmapViewOfFile2(process: HANDLE, base_address: *mut c_void, unmap_flags: u32) -> i32;

    fn VirtualFreeEx(
        process: HANDLE,
        address: *mut c_void,
        size: usize,
        free_type: u32,
    ) -> i32;
}

struct State {
    tracker: PlaceholderTracker,
}

/// Fastmem arena backed by a pagefile section and placeholder reservations.
pub struct Arena {
    backing_size: usize,
    virtual_size: usize,
    process: HANDLE,
    backing_handle: HANDLE,
    backing_base: *mut u8,
    virtual_base: *mut u8,
    state: Mutex<State>,
}

// Safety: the raw pointers refer to reservations owned by this arena for its
// whole lifetime, and all mutable bookkeeping sits behind the state mutex.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Allocate the backing section and reserve the virtual arena as one
    /// placeholder.
    pub fn new(backing_size: usize, virtual_size: usize) -> Result<Self> {
        let process = unsafe { GetCurrentProcess() };

        // Anonymous pagefile-backed section holding guest memory.
        let backing_handle = unsafe {
            CreateFileMapping2(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                FILE_MAP_WRITE | FILE_MAP_READ,
                PAGE_READWRITE.0,
                SEC_COMMIT,
                backing_size as u64,
                std::ptr::null(),
                std::ptr::null_mut(),
                0,
            )
        };
        if backing_handle.is_invalid() {
            return Err(Error::BackingAllocation {
                size: backing_size,
                source: io::Error::last_os_error(),
            });
        }

        // Reserve a placeholder for the backing view and replace it with the
        // read-write view of the whole section.
        let backing_base = unsafe {
            VirtualAlloc2(
                process,
                std::ptr::null_mut(),
                backing_size,
                MEM_RESERVE | MEM_RESERVE_PLACEHOLDER,
                PAGE_NOACCESS.0,
                std::ptr::null_mut(),
                0,
            )
        };
        if backing_base.is_null() {
            let source = io::Error::last_os_error();
            unsafe {
                let _ = CloseHandle(backing_handle);
            }
            return Err(Error::BackingAllocation {
                size: backing_size,
                source,
            });
        }

        let view = unsafe {
            MapViewOfFile3(
                backing_handle,
                process,
                backing_base,
                0,
                backing_size,
                MEM_REPLACE_PLACEHOLDER,
                PAGE_READWRITE.0,
                std::ptr::null_mut(),
                0,
            )
        };
        if view != backing_base {
            let source = io::Error::last_os_error();
            unsafe {
                VirtualFreeEx(process, backing_base, 0, MEM_RELEASE.0);
                let _ = CloseHandle(backing_handle);
            }
            return Err(Error::BackingAllocation {
                size: backing_size,
                source,
            });
        }

        // Reserve the virtual arena as a single unmapped placeholder.
        let virtual_base = unsafe {
            VirtualAlloc2(
                process,
                std::ptr::null_mut(),
                virtual_size,
                MEM_RESERVE | MEM_RESERVE_PLACEHOLDER,
                PAGE_NOACCESS.0,
                std::ptr::null_mut(),
                0,
            )
        };
        if virtual_base.is_null() {
            let source = io::Error::last_os_error();
            unsafe {
                UnmapViewOfFile2(process, backing_base, MEM_PRESERVE_PLACEHOLDER);
                VirtualFreeEx(process, backing_base, 0, MEM_RELEASE.0);
                let _ = CloseHandle(backing_handle);
            }
            return Err(Error::ArenaReservation {
                size: virtual_size,
                source,
            });
        }

        Ok(Self {
            backing_size,
            virtual_size,
            process,
            backing_handle,
            backing_base: backing_base as *mut u8,
            virtual_base: virtual_base as *mut u8,
            state: Mutex::new(State {
                tracker: PlaceholderTracker::new(),
            }),
        })
    }

    /// Alias `[virtual_offset, +length)` of the arena to
    /// `[host_offset, +length)` of the backing section.
    ///
    /// Rights are applied afterwards via [`Arena::protect`]; the view itself
    /// is always created read-write.
    pub fn map(
        &self,
        virtual_offset: usize,
        host_offset: usize,
        length: usize,
        _perms: MemoryPermission,
    ) {
        let mut state = self.state.lock().unwrap();
        if !state.tracker.is_niche(virtual_offset, virtual_offset + length) {
            self.split(virtual_offset, length);
        }
        assert!(
            !state.tracker.overlaps(virtual_offset, virtual_offset + length),
            "mapping over an occupied range [{virtual_offset:#x}, +{length:#x})"
        );
        state
            .tracker
            .insert(virtual_offset, virtual_offset + length, host_offset);

        if !self.map_view(virtual_offset, host_offset, length) {
            // The placeholder is still free; dropping the entry keeps the
            // tracker and the address space in agreement.
            state.tracker.remove(virtual_offset);
        }
    }

    /// Return `[virtual_offset, +length)` to placeholder state. One call may
    /// tear down several previously independent views.
    pub fn unmap(&self, virtual_offset: usize, length: usize) {
        let mut state = self.state.lock().unwrap();

        // Unmap until there are no more views in the range.
        while self.unmap_one_placeholder(&mut state, virtual_offset, length) {}
    }

    /// Change the access rights of every view intersecting
    /// `[virtual_offset, +length)`.
    pub fn protect(
        &self,
        virtual_offset: usize,
        length: usize,
        read: bool,
        write: bool,
        _execute: bool,
    ) {
        let new_flags = match (read, write) {
            (true, true) => PAGE_READWRITE,
            (true, false) => PAGE_READONLY,
            (false, false) => PAGE_NOACCESS,
            (false, true) => {
                unreachable!("write-only protection is not representable on Windows")
            }
        };
        let virtual_end = virtual_offset + length;

        let state = self.state.lock().unwrap();
        for (lower, placeholder) in state.tracker.overlapping(virtual_offset, virtual_end) {
            let offset = lower.max(virtual_offset);
            let protect_length = placeholder.upper.min(virtual_end) - offset;
            let mut old_flags = PAGE_PROTECTION_FLAGS::default();
            let ret = unsafe {
                VirtualProtect(
                    self.virtual_base.add(offset) as *mut c_void,
                    protect_length,
                    new_flags,
                    &mut old_flags,
                )
            };
            if ret.is_err() {
                log::error!("VirtualProtect failed: {}", io::Error::last_os_error());
            }
        }
    }

    /// Windows has no deallocate-and-zero primitive for section memory; the
    /// caller falls back to a plain fill.
    pub fn clear_backing_region(&self, _physical_offset: usize, _length: usize) -> bool {
        false
    }

    pub fn enable_direct_mapped_address(&self) {
        unreachable!("direct mapped addressing is not supported on Windows");
    }

    pub fn is_direct_mapping_enabled(&self) -> bool {
        false
    }

    pub fn is_valid_mapping(&self, offset: usize, length: usize) -> bool {
        offset + length <= self.backing_size
    }

    pub fn backing_base(&self) -> *mut u8 {
        self.backing_base
    }

    pub fn virtual_base(&self) -> *mut u8 {
        self.virtual_base
    }

    /// Tear down one view intersecting `[virtual_offset, +length)`, carving
    /// out exactly the requested sub-range and re-mapping any remainder at
    /// its original backing offset. Returns false once no view intersects.
    fn unmap_one_placeholder(
        &self,
        state: &mut MutexGuard<'_, State>,
        virtual_offset: usize,
        length: usize,
    ) -> bool {
        let Some((placeholder_begin, placeholder)) = state
            .tracker
            .find_overlap(virtual_offset, virtual_offset + length)
        else {
            return false;
        };
        let placeholder_end = placeholder.upper;
        let host_offset = placeholder.host_offset;

        let unmap_begin = virtual_offset.max(placeholder_begin);
        let unmap_end = (virtual_offset + length).min(placeholder_end);
        debug_assert!(unmap_begin >= placeholder_begin && unmap_begin < placeholder_end);
        debug_assert!(unmap_end <= placeholder_end && unmap_end > placeholder_begin);

        let split_left = unmap_begin > placeholder_begin;
        let split_right = unmap_end < placeholder_end;

        self.unmap_view(placeholder_begin);
        // Partial unmaps have to remap the remainder, and Windows cannot
        // remap without unmapping first: until the MapViewOfFile3 calls
        // below complete, concurrent readers can observe the remainder
        // missing. Keep this window free of any extra work.
        if split_left || split_right {
            self.split(unmap_begin, unmap_end - unmap_begin);
        }
        if split_left {
            self.map_view(placeholder_begin, host_offset, unmap_begin - placeholder_begin);
        }
        if split_right {
            self.map_view(
                unmap_end,
                host_offset + (unmap_end - placeholder_begin),
                placeholder_end - unmap_end,
            );
        }
        // End of the racy window.

        let mut coalesce_begin = unmap_begin;
        if !split_left {
            // Merge with the free gap to the left.
            coalesce_begin = state.tracker.prev_upper(placeholder_begin).unwrap_or(0);
            if coalesce_begin != placeholder_begin {
                self.coalesce(coalesce_begin, unmap_end - coalesce_begin);
            }
        }
        if !split_right {
            // Merge with the free gap to the right.
            let next_begin = state
                .tracker
                .next_lower(placeholder_end)
                .unwrap_or(self.virtual_size);
            if placeholder_end != next_begin {
                self.coalesce(coalesce_begin, next_begin - coalesce_begin);
            }
        }

        state.tracker.remove(placeholder_begin);
        if split_left {
            state
                .tracker
                .insert(placeholder_begin, unmap_begin, host_offset);
        }
        if split_right {
            state.tracker.insert(
                unmap_end,
                placeholder_end,
                host_offset + (unmap_end - placeholder_begin),
            );
        }
        true
    }

    /// Replace the placeholder at `virtual_offset` with a section view.
    fn map_view(&self, virtual_offset: usize, host_offset: usize, length: usize) -> bool {
        let ret = unsafe {
            MapViewOfFile3(
                self.backing_handle,
                self.process,
                self.virtual_base.add(virtual_offset) as *mut c_void,
                host_offset as u64,
                length,
                MEM_REPLACE_PLACEHOLDER,
                PAGE_READWRITE.0,
                std::ptr::null_mut(),
                0,
            )
        };
        if ret.is_null() {
            log::error!("MapViewOfFile3 failed: {}", io::Error::last_os_error());
            return false;
        }
        true
    }

    /// Unmap the view at `virtual_offset`, preserving the placeholder.
    fn unmap_view(&self, virtual_offset: usize) {
        let ret = unsafe {
            UnmapViewOfFile2(
                self.process,
                self.virtual_base.add(virtual_offset) as *mut c_void,
                MEM_PRESERVE_PLACEHOLDER,
            )
        };
        if ret == 0 {
            log::error!("UnmapViewOfFile2 failed: {}", io::Error::last_os_error());
        }
    }

    /// Split the enclosing placeholder so `[virtual_offset, +length)` becomes
    /// a placeholder of its own.
    fn split(&self, virtual_offset: usize, length: usize) {
        let ret = unsafe {
            VirtualFreeEx(
                self.process,
                self.virtual_base.add(virtual_offset) as *mut c_void,
                length,
                MEM_RELEASE.0 | MEM_PRESERVE_PLACEHOLDER,
            )
        };
        if ret == 0 {
            log::error!("failed to split placeholder: {}", io::Error::last_os_error());
        }
    }

    /// Merge the placeholders covering `[virtual_offset, +length)` into one.
    fn coalesce(&self, virtual_offset: usize, length: usize) {
        let ret = unsafe {
            VirtualFreeEx(
                self.process,
                self.virtual_base.add(virtual_offset) as *mut c_void,
                length,
                MEM_RELEASE.0 | MEM_COALESCE_PLACEHOLDERS,
            )
        };
        if ret == 0 {
            log::error!("failed to coalesce placeholders: {}", io::Error::last_os_error());
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap();
        if !state.tracker.is_empty() {
            for (lower, _) in state.tracker.iter() {
                self.unmap_view(lower);
            }
            self.coalesce(0, self.virtual_size);
        }
        unsafe {
            if VirtualFree(self.virtual_base as *mut c_void, 0, MEM_RELEASE).is_err() {
                log::error!("VirtualFree failed: {}", io::Error::last_os_error());
            }
            if UnmapViewOfFile2(
                self.process,
                self.backing_base as *mut c_void,
                MEM_PRESERVE_PLACEHOLDER,
            ) == 0
            {
                log::error!("UnmapViewOfFile2 failed: {}", io::Error::last_os_error());
            }
            if VirtualFreeEx(self.process, self.backing_base as *mut c_void, 0, MEM_RELEASE.0) == 0
            {
                log::error!("VirtualFreeEx failed: {}", io::Error::last_os_error());
            }
            if CloseHandle(self.backing_handle).is_err() {
                log::error!("CloseHandle failed: {}", io::Error::last_os_error());
            }
        }
    }
}
