//! Hardware translation-table descriptors.
//!
//! First- and second-level descriptors are 32-bit values whose low two bits
//! select the mapping type. The wrappers here keep the exact hardware bit
//! layout while exposing the type discipline through [`FirstLevelKind`] and
//! [`SecondLevelKind`] instead of raw bit tests.

use core::fmt;

use crate::{PAGE_SIZE, PageAttributes, PhysicalAddress, SECTION_SIZE};

/// Size of a second-level (coarse) table in bytes: 256 word descriptors.
pub(crate) const SECOND_LEVEL_TABLE_SIZE: usize = 1024;

/// Decoded form of a first-level descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstLevelKind {
    /// No translation; any access faults.
    Unmapped,
    /// Points at a second-level table covering this 1 MiB region.
    Coarse { table: PhysicalAddress },
    /// Directly maps the whole 1 MiB region.
    Section {
        base: PhysicalAddress,
        attrs: PageAttributes,
    },
}

/// A single first-level translation-table descriptor.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct FirstLevelDescriptor(u32);

impl FirstLevelDescriptor {
    const TYPE_MASK: u32 = 0x3;
    const TYPE_COARSE: u32 = 0x1;
    const TYPE_SECTION: u32 = 0x2;

    /// Physical base mask for a coarse descriptor (1 KiB aligned table).
    const COARSE_BASE_MASK: u32 = 0xFFFF_FC00;

    /// Physical base mask for a section descriptor (1 MiB aligned region).
    const SECTION_BASE_MASK: u32 = 0xFFF0_0000;

    /// Creates an unmapped descriptor.
    pub const fn unmapped() -> Self {
        Self(0)
    }

    /// Creates a descriptor pointing at a second-level table.
    ///
    /// The table address must be aligned to the second-level table size.
    pub fn coarse(table: PhysicalAddress) -> Self {
        debug_assert!(
            table.is_aligned(SECOND_LEVEL_TABLE_SIZE),
            "second-level table must be 1 KiB aligned"
        );
        Self((table.as_u32() & Self::COARSE_BASE_MASK) | Self::TYPE_COARSE)
    }

    /// Creates a descriptor mapping a full 1 MiB section.
    ///
    /// The physical base must be section aligned.
    pub fn section(base: PhysicalAddress, attrs: PageAttributes) -> Self {
        debug_assert!(
            base.is_aligned(SECTION_SIZE),
            "section base must be 1 MiB aligned"
        );
        Self((base.as_u32() & Self::SECTION_BASE_MASK) | attrs.section_bits() | Self::TYPE_SECTION)
    }

    /// Decodes this descriptor.
    ///
    /// The reserved type pattern (0b11) never appears in tables built by
    /// this crate and decodes as unmapped.
    pub fn kind(self) -> FirstLevelKind {
        match self.0 & Self::TYPE_MASK {
            Self::TYPE_COARSE => FirstLevelKind::Coarse {
                table: PhysicalAddress::new((self.0 & Self::COARSE_BASE_MASK) as usize),
            },
            Self::TYPE_SECTION => FirstLevelKind::Section {
                base: PhysicalAddress::new((self.0 & Self::SECTION_BASE_MASK) as usize),
                attrs: PageAttributes::from_section_bits(self.0 & !Self::SECTION_BASE_MASK),
            },
            _ => FirstLevelKind::Unmapped,
        }
    }

    /// Returns true if this descriptor provides no translation.
    pub const fn is_unmapped(self) -> bool {
        self.0 & Self::TYPE_MASK == 0
    }

    /// Clears this descriptor back to unmapped.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw 32-bit descriptor value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for FirstLevelDescriptor {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Default for FirstLevelDescriptor {
    fn default() -> Self {
        Self::unmapped()
    }
}

impl fmt::Debug for FirstLevelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FirstLevelDescriptor({:#010x}, {:?})", self.0, self.kind())
    }
}

/// Decoded form of a second-level descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondLevelKind {
    /// No translation; any access faults.
    Unmapped,
    /// Maps one small page.
    Small {
        base: PhysicalAddress,
        attrs: PageAttributes,
    },
}

/// A single second-level translation-table descriptor.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SecondLevelDescriptor(u32);

impl SecondLevelDescriptor {
    /// Bit 1 set marks a small page; bit 0 is then the execute-never bit.
    const TYPE_SMALL: u32 = 0x2;

    /// Physical base mask for a small-page descriptor.
    const SMALL_BASE_MASK: u32 = 0xFFFF_F000;

    /// Creates an unmapped descriptor.
    pub const fn unmapped() -> Self {
        Self(0)
    }

    /// Creates a descriptor mapping one small page.
    ///
    /// The physical base must be page aligned.
    pub fn small(base: PhysicalAddress, attrs: PageAttributes) -> Self {
        debug_assert!(base.is_aligned(PAGE_SIZE), "page base must be page aligned");
        Self((base.as_u32() & Self::SMALL_BASE_MASK) | attrs.small_page_bits() | Self::TYPE_SMALL)
    }

    /// Decodes this descriptor.
    ///
    /// Large-page descriptors (bit 1 clear, bit 0 set) are never produced
    /// by this crate and decode as unmapped.
    pub fn kind(self) -> SecondLevelKind {
        if self.0 & Self::TYPE_SMALL == 0 {
            return SecondLevelKind::Unmapped;
        }
        SecondLevelKind::Small {
            base: PhysicalAddress::new((self.0 & Self::SMALL_BASE_MASK) as usize),
            attrs: PageAttributes::from_small_page_bits(self.0 & !Self::SMALL_BASE_MASK),
        }
    }

    /// Returns true if this descriptor provides no translation.
    pub const fn is_unmapped(self) -> bool {
        self.0 & Self::TYPE_SMALL == 0
    }

    /// Clears this descriptor back to unmapped.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw 32-bit descriptor value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for SecondLevelDescriptor {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Default for SecondLevelDescriptor {
    fn default() -> Self {
        Self::unmapped()
    }
}

impl fmt::Debug for SecondLevelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecondLevelDescriptor({:#010x}, {:?})", self.0, self.kind())
    }
}
