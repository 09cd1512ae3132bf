//! Page attribute encoding for the short-descriptor translation format.
//!
//! Attributes are stored in the bit positions they occupy in a second-level
//! small-page descriptor. First-level section descriptors scatter the same
//! fields across different positions; [`PageAttributes::section_bits`] and
//! [`PageAttributes::from_section_bits`] translate between the two layouts.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// Access permission and memory-type attributes for one mapping.
///
/// The AP[2:0] field selects privileged/user access: AP2 makes the mapping
/// read-only to the kernel, AP1 grants user read access, and AP1+AP0 grants
/// user write access. TEX[2:0] with C and B select the memory type; TEX2 set
/// marks normal memory with TEX[1:0] as the outer and C/B as the inner cache
/// policy (absence of cache bits means non-cacheable).
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageAttributes(u32);

impl PageAttributes {
    const XN: u32 = 1 << 0;
    const B: u32 = 1 << 2;
    const C: u32 = 1 << 3;
    const AP0: u32 = 1 << 4;
    const AP1: u32 = 1 << 5;
    const TEX0: u32 = 1 << 6;
    const TEX1: u32 = 1 << 7;
    const TEX2: u32 = 1 << 8;
    const AP2: u32 = 1 << 9;
    const S: u32 = 1 << 10;
    const NG: u32 = 1 << 11;

    /// All attribute bits of a small-page descriptor (everything except the
    /// type bit at position 1).
    const SMALL_PAGE_MASK: u32 = 0xFFD;

    /// Instruction fetches from the mapping fault.
    pub const EXECUTE_NEVER: Self = Self(Self::XN);

    /// The mapping is private to one address space and survives only while
    /// that space's table root is installed.
    pub const NOT_GLOBAL: Self = Self(Self::NG);

    /// Shareable device memory.
    pub const DEVICE_SHAREABLE: Self = Self(Self::B);
    /// Non-shareable device memory.
    pub const DEVICE_NONSHAREABLE: Self = Self(Self::TEX1);
    /// Shareable normal memory, non-cacheable unless cache bits are added.
    pub const NORMAL_SHAREABLE: Self = Self(Self::TEX2 | Self::S);
    /// Non-shareable normal memory.
    pub const NORMAL_NONSHAREABLE: Self = Self(Self::TEX2);

    /// Inner write-back, write-allocate caching.
    pub const CACHE_INNER_WBWA: Self = Self(Self::TEX0);
    /// Inner write-through caching.
    pub const CACHE_INNER_WT: Self = Self(Self::TEX1);
    /// Inner write-back caching.
    pub const CACHE_INNER_WB: Self = Self(Self::TEX1 | Self::TEX0);
    /// Outer write-back, write-allocate caching.
    pub const CACHE_OUTER_WBWA: Self = Self(Self::B);
    /// Outer write-through caching.
    pub const CACHE_OUTER_WT: Self = Self(Self::C);
    /// Outer write-back caching.
    pub const CACHE_OUTER_WB: Self = Self(Self::C | Self::B);

    /// Kernel read-write, no user access (AP=0b001).
    pub const KERNEL_RW: Self = Self(Self::AP0);
    /// Kernel read-write, user read-only (AP=0b010).
    pub const USER_RO: Self = Self(Self::AP1);
    /// Kernel read-write, user read-write (AP=0b011).
    pub const USER_RW: Self = Self(Self::AP1 | Self::AP0);
    /// Kernel read-only, no user access (AP=0b101).
    pub const KERNEL_RO: Self = Self(Self::AP2 | Self::AP0);

    /// Default attributes for kernel data: cached normal memory, kernel
    /// read-write, never executed.
    pub const KERNEL_DATA: Self = Self(
        Self::NORMAL_SHAREABLE.0
            | Self::CACHE_INNER_WB.0
            | Self::CACHE_OUTER_WB.0
            | Self::KERNEL_RW.0
            | Self::XN,
    );

    /// Default attributes for kernel code: cached normal memory, kernel
    /// read-only, executable.
    pub const KERNEL_CODE: Self = Self(
        Self::NORMAL_SHAREABLE.0
            | Self::CACHE_INNER_WB.0
            | Self::CACHE_OUTER_WB.0
            | Self::KERNEL_RO.0,
    );

    /// Default attributes for kernel device mappings.
    pub const KERNEL_DEVICE: Self = Self(Self::DEVICE_SHAREABLE.0 | Self::KERNEL_RW.0 | Self::XN);

    /// Default attributes for user data and stacks: user read-write, never
    /// executed, private to the owning address space.
    pub const USER_DATA: Self =
        Self(Self::NORMAL_SHAREABLE.0 | Self::USER_RW.0 | Self::XN | Self::NG);

    /// Default attributes for user code: user read-only, executable, private
    /// to the owning address space.
    pub const USER_CODE: Self = Self(Self::NORMAL_SHAREABLE.0 | Self::USER_RO.0 | Self::NG);

    /// Creates an empty attribute set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Combines two attribute sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns true if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if user-mode reads are permitted.
    pub const fn user_readable(self) -> bool {
        self.0 & Self::AP1 != 0
    }

    /// Returns true if user-mode writes are permitted.
    pub const fn user_writable(self) -> bool {
        self.0 & Self::AP2 == 0 && self.0 & (Self::AP1 | Self::AP0) == (Self::AP1 | Self::AP0)
    }

    /// Returns true if kernel-mode writes are permitted.
    pub const fn kernel_writable(self) -> bool {
        self.0 & Self::AP2 == 0 && self.0 & (Self::AP1 | Self::AP0) != 0
    }

    /// Returns true if kernel-mode reads are permitted.
    pub const fn kernel_readable(self) -> bool {
        self.0 & (Self::AP2 | Self::AP1 | Self::AP0) != 0
    }

    /// Returns true if instruction fetches are permitted.
    pub const fn executable(self) -> bool {
        self.0 & Self::XN == 0
    }

    /// Returns true if the mapping is private to one address space.
    pub const fn is_not_global(self) -> bool {
        self.0 & Self::NG != 0
    }

    /// Returns true if the mapping targets device rather than normal memory.
    pub const fn is_device(self) -> bool {
        self.0 & Self::TEX2 == 0
    }

    /// Returns the attribute bits in small-page descriptor positions.
    pub const fn small_page_bits(self) -> u32 {
        self.0 & Self::SMALL_PAGE_MASK
    }

    /// Reconstructs attributes from a small-page descriptor's raw bits.
    pub const fn from_small_page_bits(bits: u32) -> Self {
        Self(bits & Self::SMALL_PAGE_MASK)
    }

    /// Returns the attribute bits in section descriptor positions.
    ///
    /// Sections carry the same fields at different offsets: XN at bit 4,
    /// AP[1:0] at bits 10-11, TEX at bits 12-14, AP2 at bit 15, S at bit 16
    /// and nG at bit 17. C and B keep their positions.
    pub const fn section_bits(self) -> u32 {
        let mut bits = self.0 & (Self::C | Self::B);
        if self.0 & Self::XN != 0 {
            bits |= 1 << 4;
        }
        if self.0 & Self::AP0 != 0 {
            bits |= 1 << 10;
        }
        if self.0 & Self::AP1 != 0 {
            bits |= 1 << 11;
        }
        if self.0 & Self::TEX0 != 0 {
            bits |= 1 << 12;
        }
        if self.0 & Self::TEX1 != 0 {
            bits |= 1 << 13;
        }
        if self.0 & Self::TEX2 != 0 {
            bits |= 1 << 14;
        }
        if self.0 & Self::AP2 != 0 {
            bits |= 1 << 15;
        }
        if self.0 & Self::S != 0 {
            bits |= 1 << 16;
        }
        if self.0 & Self::NG != 0 {
            bits |= 1 << 17;
        }
        bits
    }

    /// Reconstructs attributes from a section descriptor's raw bits.
    pub const fn from_section_bits(bits: u32) -> Self {
        let mut attrs = bits & (Self::C | Self::B);
        if bits & (1 << 4) != 0 {
            attrs |= Self::XN;
        }
        if bits & (1 << 10) != 0 {
            attrs |= Self::AP0;
        }
        if bits & (1 << 11) != 0 {
            attrs |= Self::AP1;
        }
        if bits & (1 << 12) != 0 {
            attrs |= Self::TEX0;
        }
        if bits & (1 << 13) != 0 {
            attrs |= Self::TEX1;
        }
        if bits & (1 << 14) != 0 {
            attrs |= Self::TEX2;
        }
        if bits & (1 << 15) != 0 {
            attrs |= Self::AP2;
        }
        if bits & (1 << 16) != 0 {
            attrs |= Self::S;
        }
        if bits & (1 << 17) != 0 {
            attrs |= Self::NG;
        }
        Self(attrs)
    }
}

impl BitOr for PageAttributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitOrAssign for PageAttributes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PageAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ap = ((self.0 & Self::AP2) >> 7) | ((self.0 >> 4) & 0x3);
        let tex = (self.0 >> 6) & 0x7;
        write!(
            f,
            "PageAttributes(ap={ap:03b}, tex={tex:03b}, c={}, b={}, s={}, ng={}, xn={})",
            (self.0 >> 3) & 1,
            (self.0 >> 2) & 1,
            (self.0 >> 10) & 1,
            (self.0 >> 11) & 1,
            self.0 & 1,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_encodings_match_hardware_layout() {
        assert_eq!(PageAttributes::KERNEL_DATA.small_page_bits(), 0x5DD);
        assert_eq!(PageAttributes::KERNEL_CODE.small_page_bits(), 0x7DC);
        assert_eq!(PageAttributes::USER_DATA.small_page_bits(), 0xD31);
        assert_eq!(PageAttributes::USER_CODE.small_page_bits(), 0xD20);
        assert_eq!(PageAttributes::KERNEL_DEVICE.small_page_bits(), 0x015);
    }

    #[test]
    fn kernel_permissions() {
        let data = PageAttributes::KERNEL_DATA;
        assert!(data.kernel_readable());
        assert!(data.kernel_writable());
        assert!(!data.user_readable());
        assert!(!data.user_writable());
        assert!(!data.executable());
        assert!(!data.is_not_global());

        let code = PageAttributes::KERNEL_CODE;
        assert!(code.kernel_readable());
        assert!(!code.kernel_writable());
        assert!(!code.user_readable());
        assert!(code.executable());
    }

    #[test]
    fn user_permissions() {
        let data = PageAttributes::USER_DATA;
        assert!(data.kernel_writable());
        assert!(data.user_readable());
        assert!(data.user_writable());
        assert!(!data.executable());
        assert!(data.is_not_global());

        let code = PageAttributes::USER_CODE;
        assert!(code.user_readable());
        assert!(!code.user_writable());
        assert!(code.executable());
        assert!(code.is_not_global());
    }

    #[test]
    fn memory_types() {
        assert!(PageAttributes::KERNEL_DEVICE.is_device());
        assert!(!PageAttributes::KERNEL_DATA.is_device());
        assert!(!PageAttributes::USER_DATA.is_device());
    }

    #[test]
    fn section_bit_translation() {
        assert_eq!(PageAttributes::KERNEL_DATA.section_bits(), 0x1_741C);

        for attrs in [
            PageAttributes::KERNEL_DATA,
            PageAttributes::KERNEL_CODE,
            PageAttributes::KERNEL_DEVICE,
            PageAttributes::USER_DATA,
            PageAttributes::USER_CODE,
        ] {
            let round_tripped = PageAttributes::from_section_bits(attrs.section_bits());
            assert_eq!(round_tripped, attrs);
        }
    }

    #[test]
    fn small_page_bits_round_trip() {
        for attrs in [
            PageAttributes::KERNEL_DATA,
            PageAttributes::USER_CODE,
            PageAttributes::KERNEL_DEVICE,
        ] {
            assert_eq!(
                PageAttributes::from_small_page_bits(attrs.small_page_bits()),
                attrs
            );
        }
    }

    #[test]
    fn union_and_contains() {
        let attrs = PageAttributes::NORMAL_SHAREABLE | PageAttributes::USER_RW;
        assert!(attrs.contains(PageAttributes::NORMAL_SHAREABLE));
        assert!(attrs.contains(PageAttributes::USER_RW));
        assert!(!attrs.contains(PageAttributes::EXECUTE_NEVER));
    }
}
