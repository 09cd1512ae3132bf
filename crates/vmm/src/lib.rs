#![cfg_attr(
    all(target_arch = "arm", not(test), not(feature = "software-emulation")),
    no_std
)]

//! # Vega Memory Manager (VMM)
//!
//! The Vega Memory Manager (VMM) is the memory core of the Vega kernel. It
//! provides:
//!
//! - Physical page-frame allocation and accounting.
//! - Per-address-space virtual range allocation.
//! - ARMv7-A short-descriptor page tables (two levels: sections and small
//!   pages) with kernel-held shadow mirrors of every second-level table.
//! - TLB maintenance, either against the real CP15 interface or against a
//!   software MMU model for testing on a development host.
//!
//! The crate performs no heap allocation of its own, so it is usable from the
//! moment the boot code hands it a memory map, before the kernel heap exists.

mod address;
mod address_space;
mod arch;
mod attrs;
mod descriptor;
mod layout;
mod numbers;
mod page_alloc;
mod table;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, MapError, SpaceKind, UnmapError, UserAccessError};
pub use arch::{
    TableRoot, barrier, current_table_root, invalidate_all, invalidate_page, set_table_root,
};
pub use attrs::PageAttributes;
pub use descriptor::{FirstLevelDescriptor, FirstLevelKind, SecondLevelDescriptor, SecondLevelKind};
pub use layout::{KernelImage, MemoryLayout};
pub use numbers::{FrameNumber, PageNumber};
pub use page_alloc::{AllocError, FrameAllocator, PageSpan, VirtualRangeAllocator};

#[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
pub use arch::{AccessFault, EmulatedMemory, mmu_read, mmu_write};

/// Size of a small page, the allocation granule for all memory in the system.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`], for converting between addresses and page numbers.
pub const PAGE_SHIFT: usize = 12;

/// Size of the region covered by one first-level descriptor (a "section").
pub const SECTION_SIZE: usize = 1 << 20;

/// Number of descriptors in a first-level translation table.
pub const FIRST_LEVEL_ENTRIES: usize = 4096;

/// Number of descriptors in a second-level (coarse) translation table.
pub const SECOND_LEVEL_ENTRIES: usize = 256;

/// Pages spanned by one section.
pub const PAGES_PER_SECTION: usize = SECTION_SIZE / PAGE_SIZE;
