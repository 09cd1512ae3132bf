//! Architecture-specific MMU control.
//!
//! This module conditionally selects either the real CP15-based
//! implementation or a software model based on the target architecture
//! and enabled features.

use core::fmt;

use crate::PhysicalAddress;

// Use the hardware implementation when building for ARM and not testing or
// emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "arm")]
mod armv7a;
#[cfg(all(target_arch = "arm", not(test), not(feature = "software-emulation")))]
pub use armv7a::*;

// Use the software model when:
// - Building for a non-ARM host, OR
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
mod software;
#[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
pub use software::*;

/// The value loaded into the translation-table base register.
///
/// Besides the 16 KiB aligned physical base of a first-level table, the
/// register carries the cacheability attributes the table walker uses:
/// inner and outer write-back, write-allocate walks.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TableRoot(u32);

impl TableRoot {
    const BASE_MASK: u32 = 0xFFFF_C000;

    /// Inner write-back walk (IRGN=0b01) and outer write-back walk (RGN=0b01).
    const WALK_FLAGS: u32 = (1 << 6) | (1 << 3);

    /// Creates a table root value for a first-level table at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not 16 KiB aligned.
    pub fn new(base: PhysicalAddress) -> Self {
        assert!(
            base.is_aligned(16 * 1024),
            "first-level table must be 16 KiB aligned"
        );
        Self(base.as_u32() | Self::WALK_FLAGS)
    }

    /// Reconstructs a table root from a raw register value.
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the physical base of the first-level table.
    pub fn base(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & Self::BASE_MASK) as usize)
    }

    /// Returns the raw register value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TableRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableRoot({:#010x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_root_encoding() {
        let root = TableRoot::new(PhysicalAddress::new(0x4008_0000));
        assert_eq!(root.raw(), 0x4008_0048);
        assert_eq!(root.base(), PhysicalAddress::new(0x4008_0000));
    }

    #[test]
    #[should_panic(expected = "first-level table must be 16 KiB aligned")]
    fn table_root_rejects_unaligned_base() {
        TableRoot::new(PhysicalAddress::new(0x4008_1000));
    }

    #[test]
    fn table_root_raw_round_trip() {
        let root = TableRoot::new(PhysicalAddress::new(0x4400_C000));
        let rebuilt = TableRoot::from_raw(root.raw());
        assert_eq!(rebuilt, root);
        assert_eq!(rebuilt.base(), PhysicalAddress::new(0x4400_C000));
    }
}
