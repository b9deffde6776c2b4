//! Stub arena for platforms without a fastmem implementation.
//!
//! Construction always fails, which sends `HostMemory` down its fallback
//! path: a plain buffer with fastmem disabled.

use crate::error::{Error, Result};
use crate::perms::MemoryPermission;

pub struct Arena;

impl Arena {
    pub fn new(_backing_size: usize, _virtual_size: usize) -> Result<Self> {
        Err(Error::Unsupported)
    }

    pub fn map(
        &self,
        _virtual_offset: usize,
        _host_offset: usize,
        _length: usize,
        _perms: MemoryPermission,
    ) {
    }

    pub fn unmap(&self, _virtual_offset: usize, _length: usize) {}

    pub fn protect(
        &self,
        _virtual_offset: usize,
        _length: usize,
        _read: bool,
        _write: bool,
        _execute: bool,
    ) {
    }

    pub fn clear_backing_region(&self, _physical_offset: usize, _length: usize) -> bool {
        false
    }

    pub fn enable_direct_mapped_address(&self) {}

    pub fn is_direct_mapping_enabled(&self) -> bool {
        false
    }

    pub fn is_valid_mapping(&self, _offset: usize, _length: usize) -> bool {
        false
    }

    pub fn backing_base(&self) -> *mut u8 {
        std::ptr::null_mut()
    }

    pub fn virtual_base(&self) -> *mut u8 {
        std::ptr::null_mut()
    }
}
