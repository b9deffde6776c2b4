//! The externally visible host memory handle.
//!
//! `HostMemory` owns either a fastmem arena (backing store, virtual
//! reservation, occupancy tracking) or, when the arena cannot be created, a
//! plain fallback buffer with fastmem disabled. Callers hold stable host
//! pointers into both: `backing_base` for guest physical memory and
//! `virtual_base` for the remappable arena window.

use crate::backend;
use crate::error::{Error, Result};
use crate::fallback::FallbackBuffer;
use crate::perms::MemoryPermission;
use crate::util::{align_up, is_aligned, HUGE_PAGE_SIZE, PAGE_SIZE};

/// Largest chunk [`HostMemory::try_map`] hands to the arena in one call.
const MAX_MAP_CHUNK: usize = 0x4000_0000;

/// A page-granular host memory arena for emulator fastmem.
///
/// The handle is move-only and releases the backing store, the virtual
/// reservation, and all outstanding mappings together when dropped.
///
/// # Example
///
/// ```rust,no_run
/// use fastmem::{HostMemory, MemoryPermission, PAGE_SIZE};
///
/// let mem = HostMemory::new(64 * 1024 * 1024, 1 << 30)?;
/// mem.map(0, 0, 16 * PAGE_SIZE, MemoryPermission::READ_WRITE);
/// # Ok::<(), fastmem::Error>(())
/// ```
pub struct HostMemory {
    backing_size: usize,
    virtual_size: usize,
    arena: Option<backend::Arena>,
    fallback: Option<FallbackBuffer>,
    backing_base: *mut u8,
    virtual_base: *mut u8,
    virtual_base_offset: usize,
    direct_mapped: bool,
}

// Safety: HostMemory is thread-safe because:
// - The pointers refer to allocations owned by the handle for its lifetime
// - All arena bookkeeping is serialized behind the backend's mutex
// - Concurrent access to the mapped bytes themselves is the emulation
//   core's responsibility, the same as on a real memory bus
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Create a host memory arena of `backing_size` bytes of guest memory
    /// and a `virtual_size`-byte remappable window onto it.
    ///
    /// Sizes are rounded up to 4 KiB pages; the virtual reservation gets one
    /// extra 2 MiB large page of slack so the exposed base can be aligned.
    /// If the arena cannot be created the handle degrades to fallback mode:
    /// [`virtual_base`](Self::virtual_base) is null and fastmem is disabled.
    /// Only a failure to allocate even the fallback buffer is returned as an
    /// error.
    pub fn new(backing_size: usize, virtual_size: usize) -> Result<Self> {
        let backing_size = align_up(backing_size, PAGE_SIZE);
        let virtual_size = align_up(virtual_size, PAGE_SIZE);

        match backend::Arena::new(backing_size, virtual_size + HUGE_PAGE_SIZE) {
            Ok(arena) => {
                let backing_base = arena.backing_base();
                let raw_base = arena.virtual_base() as usize;
                // Align the exposed base to the large page size and remember
                // the slack so offsets can be rebased on every call.
                let virtual_base = align_up(raw_base, HUGE_PAGE_SIZE);
                Ok(Self {
                    backing_size,
                    virtual_size,
                    arena: Some(arena),
                    fallback: None,
                    backing_base,
                    virtual_base: virtual_base as *mut u8,
                    virtual_base_offset: virtual_base - raw_base,
                    direct_mapped: false,
                })
            }
            Err(err) => {
                log::error!("fastmem unavailable, falling back to a plain buffer: {err}");
                let fallback = FallbackBuffer::new(backing_size)?;
                let backing_base = fallback.as_ptr();
                Ok(Self {
                    backing_size,
                    virtual_size,
                    arena: None,
                    fallback: Some(fallback),
                    backing_base,
                    virtual_base: std::ptr::null_mut(),
                    virtual_base_offset: 0,
                    direct_mapped: false,
                })
            }
        }
    }

    /// Alias `[virtual_offset, +length)` of the arena to
    /// `[host_offset, +length)` of the backing store with the given rights.
    ///
    /// After a successful call, host loads and stores through
    /// `virtual_base + virtual_offset` observe and mutate the backing bytes
    /// at `host_offset`. In fallback mode this is a no-op.
    ///
    /// # Panics
    ///
    /// Panics on misaligned offsets or length, out-of-bounds ranges,
    /// write-without-read permissions, or when the target range is already
    /// mapped. These are caller contract violations, not runtime errors.
    pub fn map(
        &self,
        virtual_offset: usize,
        host_offset: usize,
        length: usize,
        perms: MemoryPermission,
    ) {
        log::debug!("map: virtual={virtual_offset:#x} host={host_offset:#x} length={length:#x}");
        self.check_virtual_range(virtual_offset, length);
        assert!(
            is_aligned(host_offset, PAGE_SIZE),
            "host offset {host_offset:#x} is not page-aligned"
        );
        assert!(
            host_offset
                .checked_add(length)
                .is_some_and(|end| end <= self.backing_size),
            "backing range [{host_offset:#x}, +{length:#x}) exceeds backing size {:#x}",
            self.backing_size
        );
        check_permission(perms);

        let Some(arena) = &self.arena else { return };
        if length == 0 {
            return;
        }
        arena.map(
            virtual_offset + self.virtual_base_offset,
            host_offset,
            length,
            perms,
        );
    }

    /// Return `[virtual_offset, +length)` to unmapped placeholder state.
    ///
    /// Views only partially covered by the range are split; the untouched
    /// remainder stays mapped at its original backing offset. In fallback
    /// mode this is a no-op.
    ///
    /// # Panics
    ///
    /// Panics on misaligned or out-of-bounds ranges.
    pub fn unmap(&self, virtual_offset: usize, length: usize) {
        log::debug!("unmap: virtual={virtual_offset:#x} length={length:#x}");
        self.check_virtual_range(virtual_offset, length);

        let Some(arena) = &self.arena else { return };
        if length == 0 {
            return;
        }
        arena.unmap(virtual_offset + self.virtual_base_offset, length);
    }

    /// Change the access rights of every mapped region intersecting
    /// `[virtual_offset, +length)` without altering the mapping topology.
    ///
    /// # Panics
    ///
    /// Panics on misaligned or out-of-bounds ranges and on
    /// write-without-read permissions.
    pub fn protect(&self, virtual_offset: usize, length: usize, perms: MemoryPermission) {
        self.check_virtual_range(virtual_offset, length);
        check_permission(perms);

        let Some(arena) = &self.arena else { return };
        if length == 0 {
            return;
        }
        let read = perms.contains(MemoryPermission::READ);
        let write = perms.contains(MemoryPermission::WRITE);
        let execute = perms.contains(MemoryPermission::EXECUTE);
        arena.protect(
            virtual_offset + self.virtual_base_offset,
            length,
            read,
            write,
            execute,
        );
    }

    /// Set `length` bytes of the backing store at `physical_offset` to
    /// `fill_value`.
    ///
    /// Zero fills use the platform's deallocate-and-zero primitive when it
    /// has one; everything else is a plain fill, which is always correct.
    pub fn clear_backing_region(&self, physical_offset: usize, length: usize, fill_value: u8) {
        assert!(
            physical_offset
                .checked_add(length)
                .is_some_and(|end| end <= self.backing_size),
            "backing range [{physical_offset:#x}, +{length:#x}) exceeds backing size {:#x}",
            self.backing_size
        );

        let cleared = fill_value == 0
            && self
                .arena
                .as_ref()
                .is_some_and(|arena| arena.clear_backing_region(physical_offset, length));
        if !cleared {
            // Safety: the range was bounds-checked against the backing
            // store, which stays committed for the handle's lifetime.
            unsafe {
                std::ptr::write_bytes(self.backing_base.add(physical_offset), fill_value, length);
            }
        }
    }

    /// Switch to direct-mapped addressing: guest addresses become backing
    /// store addresses with no virtual reservation in between.
    ///
    /// Subsequent map/unmap/protect offsets are treated as absolute host
    /// addresses and clamped against the arena's address window. Only
    /// supported on Linux/FreeBSD builds; elsewhere this configuration is
    /// unreachable.
    pub fn enable_direct_mapped_address(&mut self) {
        let Some(arena) = &self.arena else {
            log::error!("cannot enable direct mapped addressing without an arena");
            return;
        };
        arena.enable_direct_mapped_address();

        if arena.is_direct_mapping_enabled() {
            // Offsets are absolute addresses from here on; grow the bound so
            // the range checks keep admitting them.
            self.virtual_size += self.virtual_base as usize;
            self.direct_mapped = true;
        } else {
            log::error!("failed to enable direct mapped addressing");
        }
    }

    /// Base of the guest memory backing store.
    pub fn backing_base(&self) -> *mut u8 {
        self.backing_base
    }

    /// Base of the virtual arena, or null in fallback or direct-mapped mode.
    pub fn virtual_base(&self) -> *mut u8 {
        if self.direct_mapped {
            std::ptr::null_mut()
        } else {
            self.virtual_base
        }
    }

    /// Size of the backing store in bytes, rounded up to page size.
    pub fn backing_size(&self) -> usize {
        self.backing_size
    }

    /// Size of the virtual arena in bytes.
    pub fn virtual_size(&self) -> usize {
        self.virtual_size
    }

    /// Whether `[offset, +length)` lies within the backing store.
    pub fn is_valid_mapping(&self, offset: usize, length: usize) -> bool {
        self.arena
            .as_ref()
            .is_some_and(|arena| arena.is_valid_mapping(offset, length))
    }

    pub fn is_direct_mapping_enabled(&self) -> bool {
        self.direct_mapped
    }

    /// Whether the handle runs on the fallback buffer instead of an arena.
    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Validating variant of [`map`](Self::map): rejects bad requests with an
    /// error instead of panicking, and splits very large mappings into 1 GiB
    /// chunks.
    pub fn try_map(
        &self,
        virtual_offset: usize,
        host_offset: usize,
        length: usize,
        perms: MemoryPermission,
    ) -> Result<()> {
        if self.arena.is_none() {
            return Err(Error::ArenaInactive);
        }
        if !is_aligned(virtual_offset, PAGE_SIZE) {
            return Err(Error::MisalignedOffset(virtual_offset));
        }
        if !is_aligned(host_offset, PAGE_SIZE) {
            return Err(Error::MisalignedOffset(host_offset));
        }
        if !is_aligned(length, PAGE_SIZE) {
            return Err(Error::MisalignedLength(length));
        }
        if !virtual_offset
            .checked_add(length)
            .is_some_and(|end| end <= self.virtual_size)
        {
            return Err(Error::OutOfBounds {
                offset: virtual_offset,
                length,
                bound: self.virtual_size,
            });
        }
        if !host_offset
            .checked_add(length)
            .is_some_and(|end| end <= self.backing_size)
        {
            return Err(Error::OutOfBounds {
                offset: host_offset,
                length,
                bound: self.backing_size,
            });
        }

        let mut virtual_offset = virtual_offset;
        let mut host_offset = host_offset;
        let mut remaining = length;
        while remaining > 0 {
            let chunk = remaining.min(MAX_MAP_CHUNK);
            self.map(virtual_offset, host_offset, chunk, perms);
            virtual_offset += chunk;
            host_offset += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    fn check_virtual_range(&self, virtual_offset: usize, length: usize) {
        assert!(
            is_aligned(virtual_offset, PAGE_SIZE),
            "virtual offset {virtual_offset:#x} is not page-aligned"
        );
        assert!(
            is_aligned(length, PAGE_SIZE),
            "length {length:#x} is not page-aligned"
        );
        assert!(
            virtual_offset
                .checked_add(length)
                .is_some_and(|end| end <= self.virtual_size),
            "virtual range [{virtual_offset:#x}, +{length:#x}) exceeds arena size {:#x}",
            self.virtual_size
        );
    }
}

/// Write access without read access is not representable on every host
/// platform; requesting it is a contract violation.
fn check_permission(perms: MemoryPermission) {
    assert!(
        perms.contains(MemoryPermission::READ) || !perms.contains(MemoryPermission::WRITE),
        "unsupported permission combination {perms}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKING: usize = 4 * 1024 * 1024;
    const VIRTUAL: usize = 64 * 1024 * 1024;

    fn make() -> HostMemory {
        HostMemory::new(BACKING, VIRTUAL).expect("failed to create HostMemory")
    }

    /// A handle forced into fallback mode by an impossible reservation size.
    fn make_fallback() -> HostMemory {
        HostMemory::new(BACKING, 1 << 52).expect("fallback allocation should succeed")
    }

    unsafe fn virtual_slice(mem: &HostMemory, offset: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(mem.virtual_base().add(offset), len)
    }

    unsafe fn backing_slice_mut(mem: &HostMemory, offset: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(mem.backing_base().add(offset), len)
    }

    // -- Size rounding -------------------------------------------------------

    #[test]
    fn test_sizes_round_up_to_pages() {
        let mem = HostMemory::new(BACKING + 1, VIRTUAL + 1).unwrap();
        assert_eq!(mem.backing_size(), BACKING + PAGE_SIZE);
        assert_eq!(mem.virtual_size(), VIRTUAL + PAGE_SIZE);
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    #[test]
    fn test_virtual_base_is_huge_page_aligned() {
        let mem = make();
        assert!(is_aligned(mem.virtual_base() as usize, HUGE_PAGE_SIZE));
    }

    // -- Fastmem aliasing ----------------------------------------------------

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    #[test]
    fn test_backing_visible_through_mapping() {
        let mem = make();

        unsafe { backing_slice_mut(&mem, 0, PAGE_SIZE).fill(0xAA) };
        mem.map(0, 0, PAGE_SIZE, MemoryPermission::READ_WRITE);

        let seen = unsafe { virtual_slice(&mem, 0, PAGE_SIZE) };
        assert!(seen.iter().all(|&b| b == 0xAA));
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    #[test]
    fn test_writes_through_mapping_reach_backing() {
        let mem = make();
        mem.map(2 * PAGE_SIZE, 8 * PAGE_SIZE, PAGE_SIZE, MemoryPermission::READ_WRITE);

        unsafe {
            std::ptr::write_bytes(mem.virtual_base().add(2 * PAGE_SIZE), 0x42, PAGE_SIZE);
        }
        let backing = unsafe { backing_slice_mut(&mem, 8 * PAGE_SIZE, PAGE_SIZE) };
        assert!(backing.iter().all(|&b| b == 0x42));
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    #[test]
    fn test_map_unmap_roundtrip_restores_occupancy() {
        let mem = make();

        mem.map(0, 0, 4 * PAGE_SIZE, MemoryPermission::READ_WRITE);
        mem.unmap(0, 4 * PAGE_SIZE);
        // The exact same range must be free again; re-mapping panics if not.
        mem.map(0, 0, 4 * PAGE_SIZE, MemoryPermission::READ_WRITE);
        mem.unmap(0, 4 * PAGE_SIZE);
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    #[test]
    fn test_unmapping_one_region_leaves_others_intact() {
        let mem = make();
        let region_a = 0;
        let region_b = 16 * PAGE_SIZE;

        mem.map(region_a, 0, 4 * PAGE_SIZE, MemoryPermission::READ_WRITE);
        mem.map(region_b, 32 * PAGE_SIZE, 4 * PAGE_SIZE, MemoryPermission::READ_WRITE);

        unsafe {
            std::ptr::write_bytes(mem.virtual_base().add(region_a), 0x11, 4 * PAGE_SIZE);
            std::ptr::write_bytes(mem.virtual_base().add(region_b), 0x22, 4 * PAGE_SIZE);
        }

        mem.unmap(region_a, 4 * PAGE_SIZE);

        let bytes = unsafe { virtual_slice(&mem, region_b, 4 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0x22));
        // The survivor must still be writable.
        unsafe {
            std::ptr::write_bytes(mem.virtual_base().add(region_b), 0x33, PAGE_SIZE);
        }
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    #[test]
    fn test_partial_unmap_preserves_remainder() {
        let mem = make();
        mem.map(0, 0, 4 * PAGE_SIZE, MemoryPermission::READ_WRITE);

        unsafe {
            std::ptr::write_bytes(mem.virtual_base(), 0xA1, 2 * PAGE_SIZE);
            std::ptr::write_bytes(mem.virtual_base().add(2 * PAGE_SIZE), 0xB2, 2 * PAGE_SIZE);
        }

        // Carve out the first half; the second half must stay live.
        mem.unmap(0, 2 * PAGE_SIZE);

        let remainder = unsafe { virtual_slice(&mem, 2 * PAGE_SIZE, 2 * PAGE_SIZE) };
        assert!(remainder.iter().all(|&b| b == 0xB2));
        // The unmapped half's bytes survive in the backing store.
        let backing = unsafe { backing_slice_mut(&mem, 0, 2 * PAGE_SIZE) };
        assert!(backing.iter().all(|&b| b == 0xA1));
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    #[test]
    fn test_interleaved_map_unmap_occupancy() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        const WINDOW_PAGES: usize = 256;

        let mem = make();
        let mut rng = StdRng::seed_from_u64(0xFA57);
        let mut live: Vec<(usize, usize)> = Vec::new();

        for _ in 0..300 {
            if live.is_empty() || rng.gen_bool(0.5) {
                let offset = rng.gen_range(0..WINDOW_PAGES) * PAGE_SIZE;
                let length = rng.gen_range(1..=4) * PAGE_SIZE;
                let end = offset + length;
                let disjoint = end <= WINDOW_PAGES * PAGE_SIZE
                    && live.iter().all(|&(s, e)| end <= s || e <= offset);
                if disjoint {
                    mem.map(offset, offset, length, MemoryPermission::READ_WRITE);
                    live.push((offset, end));
                }
            } else {
                let index = rng.gen_range(0..live.len());
                let (start, end) = live.swap_remove(index);
                mem.unmap(start, end - start);
            }
        }

        for (start, end) in live.drain(..) {
            mem.unmap(start, end - start);
        }
        // Everything freed: mapping the whole window must succeed.
        mem.map(0, 0, WINDOW_PAGES * PAGE_SIZE, MemoryPermission::READ_WRITE);
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    #[test]
    fn test_concurrent_map_unmap_disjoint_ranges() {
        let mem = std::sync::Arc::new(make());

        std::thread::scope(|scope| {
            for thread in 0..4usize {
                let mem = std::sync::Arc::clone(&mem);
                scope.spawn(move || {
                    let offset = thread * 64 * PAGE_SIZE;
                    for _ in 0..50 {
                        mem.map(offset, offset, 4 * PAGE_SIZE, MemoryPermission::READ_WRITE);
                        unsafe {
                            std::ptr::write_bytes(
                                mem.virtual_base().add(offset),
                                thread as u8,
                                4 * PAGE_SIZE,
                            );
                        }
                        mem.unmap(offset, 4 * PAGE_SIZE);
                    }
                });
            }
        });
    }

    // -- Protect -------------------------------------------------------------

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    #[test]
    fn test_protect_toggles_rights_in_place() {
        let mem = make();
        mem.map(0, 0, 2 * PAGE_SIZE, MemoryPermission::READ_WRITE);

        mem.protect(0, 2 * PAGE_SIZE, MemoryPermission::READ);
        let bytes = unsafe { virtual_slice(&mem, 0, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));

        mem.protect(0, 2 * PAGE_SIZE, MemoryPermission::READ_WRITE);
        unsafe {
            std::ptr::write_bytes(mem.virtual_base(), 0x77, PAGE_SIZE);
        }
        assert_eq!(unsafe { virtual_slice(&mem, 0, 1) }[0], 0x77);
    }

    #[test]
    #[should_panic(expected = "unsupported permission combination")]
    fn test_write_only_permission_panics() {
        let mem = make();
        mem.protect(0, PAGE_SIZE, MemoryPermission::WRITE);
    }

    #[test]
    #[should_panic(expected = "not page-aligned")]
    fn test_misaligned_map_panics() {
        let mem = make();
        mem.map(0x10, 0, PAGE_SIZE, MemoryPermission::READ_WRITE);
    }

    #[test]
    #[should_panic(expected = "exceeds arena size")]
    fn test_out_of_bounds_map_panics() {
        let mem = make();
        mem.map(VIRTUAL, 0, 2 * PAGE_SIZE, MemoryPermission::READ_WRITE);
    }

    // -- ClearBackingRegion --------------------------------------------------

    #[test]
    fn test_clear_backing_region_zeroes() {
        let mem = make();
        unsafe { backing_slice_mut(&mem, 0, 4 * PAGE_SIZE).fill(0xCC) };

        mem.clear_backing_region(0, 4 * PAGE_SIZE, 0);

        let bytes = unsafe { backing_slice_mut(&mem, 0, 4 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_clear_backing_region_nonzero_fill() {
        let mem = make();
        mem.clear_backing_region(PAGE_SIZE, PAGE_SIZE, 0x55);

        let bytes = unsafe { backing_slice_mut(&mem, PAGE_SIZE, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0x55));
        // Neighboring pages are untouched.
        let before = unsafe { backing_slice_mut(&mem, 0, PAGE_SIZE) };
        assert!(before.iter().all(|&b| b == 0));
    }

    // -- Fallback mode -------------------------------------------------------

    #[test]
    fn test_fallback_mode_properties() {
        let mem = make_fallback();
        assert!(mem.is_fallback());
        assert!(mem.virtual_base().is_null());
        assert!(!mem.backing_base().is_null());
        assert_eq!(mem.backing_size(), BACKING);
        assert!(!mem.is_valid_mapping(0, PAGE_SIZE));
    }

    #[test]
    fn test_fallback_ops_are_noops() {
        let mem = make_fallback();
        mem.map(0, 0, 4 * PAGE_SIZE, MemoryPermission::READ_WRITE);
        mem.unmap(0, 4 * PAGE_SIZE);
        mem.protect(0, 4 * PAGE_SIZE, MemoryPermission::READ);
        mem.clear_backing_region(0, PAGE_SIZE, 0);
    }

    #[test]
    fn test_fallback_buffer_is_writable() {
        let mem = make_fallback();
        unsafe { backing_slice_mut(&mem, BACKING - PAGE_SIZE, PAGE_SIZE).fill(0x99) };
        let bytes = unsafe { backing_slice_mut(&mem, BACKING - PAGE_SIZE, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0x99));
    }

    // -- try_map -------------------------------------------------------------

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    #[test]
    fn test_try_map_validates_and_maps() {
        let mem = make();

        assert!(matches!(
            mem.try_map(0x10, 0, PAGE_SIZE, MemoryPermission::READ_WRITE),
            Err(Error::MisalignedOffset(_))
        ));
        assert!(matches!(
            mem.try_map(0, 0, PAGE_SIZE + 1, MemoryPermission::READ_WRITE),
            Err(Error::MisalignedLength(_))
        ));
        assert!(matches!(
            mem.try_map(0, BACKING, PAGE_SIZE, MemoryPermission::READ_WRITE),
            Err(Error::OutOfBounds { .. })
        ));

        mem.try_map(0, 0, 2 * PAGE_SIZE, MemoryPermission::READ_WRITE)
            .unwrap();
        unsafe {
            std::ptr::write_bytes(mem.virtual_base(), 0x66, PAGE_SIZE);
        }
        assert_eq!(unsafe { backing_slice_mut(&mem, 0, 1) }[0], 0x66);
    }

    #[test]
    fn test_try_map_fails_in_fallback_mode() {
        let mem = make_fallback();
        assert!(matches!(
            mem.try_map(0, 0, PAGE_SIZE, MemoryPermission::READ_WRITE),
            Err(Error::ArenaInactive)
        ));
    }
}
