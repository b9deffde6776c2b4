//! Memory permission flags for mapped arena regions.

use bitflags::bitflags;

bitflags! {
    /// Access rights requested for a mapped region of the arena.
    ///
    /// Write access without read access is not representable on every host
    /// platform and is rejected as a contract violation by [`HostMemory`]
    /// (see [`HostMemory::map`]).
    ///
    /// [`HostMemory`]: crate::HostMemory
    /// [`HostMemory::map`]: crate::HostMemory::map
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const READ_WRITE_EXECUTE =
            Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl std::fmt::Display for MemoryPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = if self.contains(Self::READ) { 'R' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'W' } else { '-' };
        let x = if self.contains(Self::EXECUTE) { 'X' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(MemoryPermission::READ_WRITE.to_string(), "RW-");
        assert_eq!(MemoryPermission::READ_EXECUTE.to_string(), "R-X");
        assert_eq!(MemoryPermission::empty().to_string(), "---");
    }
}
