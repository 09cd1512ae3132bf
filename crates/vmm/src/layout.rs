//! Board memory layout description.
//!
//! The layout fixes where physical RAM sits, where the kernel's direct map
//! of it lives, which virtual window the kernel hands out dynamically, and
//! which range belongs to user mappings. Address-space construction is
//! driven entirely from this description.

use crate::{PAGE_SIZE, PageAttributes, PhysicalAddress, VirtualAddress};

/// Static memory picture of the machine.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    /// First physical address of RAM.
    pub ram_base: PhysicalAddress,
    /// Size of RAM in bytes.
    pub ram_size: usize,
    /// Virtual address at which `ram_base` is direct-mapped.
    pub kernel_base: VirtualAddress,
    /// Base of the kernel's dynamic virtual window (device remaps and
    /// other kernel-chosen mappings).
    pub kernel_window_base: VirtualAddress,
    /// Size of the dynamic kernel window in bytes.
    pub kernel_window_size: usize,
    /// Lowest virtual address available to user mappings.
    pub user_base: VirtualAddress,
    /// Size of the user range in bytes.
    pub user_size: usize,
}

impl MemoryLayout {
    /// Returns the offset added to a physical address to reach its
    /// direct-mapped virtual address.
    pub fn direct_map_offset(&self) -> usize {
        self.kernel_base.as_usize().wrapping_sub(self.ram_base.as_usize())
    }

    /// Returns the first physical address past RAM.
    pub fn ram_end(&self) -> PhysicalAddress {
        self.ram_base + self.ram_size
    }

    /// Returns the first-level index at which kernel-owned entries begin.
    ///
    /// Every first-level entry at or above this index is shared between the
    /// kernel table and all process tables.
    pub fn kernel_split_index(&self) -> usize {
        self.kernel_base.first_level_index()
    }

    /// Returns the first virtual address past the user range.
    pub fn user_end(&self) -> VirtualAddress {
        self.user_base + self.user_size
    }
}

/// Physical footprint of the loaded kernel image.
///
/// Used while building the kernel address space so the kernel's own code
/// and data get accurate permissions instead of the blanket RAM mapping.
#[derive(Debug, Clone, Copy)]
pub struct KernelImage {
    text_base: PhysicalAddress,
    text_size: usize,
    data_base: PhysicalAddress,
    data_size: usize,
}

impl KernelImage {
    /// Describes a kernel image by its text and data extents.
    ///
    /// # Panics
    ///
    /// Panics if any extent is not page aligned.
    pub fn new(
        text_base: PhysicalAddress,
        text_size: usize,
        data_base: PhysicalAddress,
        data_size: usize,
    ) -> Self {
        assert!(text_base.is_aligned(PAGE_SIZE), "text base must be page aligned");
        assert!(text_size % PAGE_SIZE == 0, "text size must be page aligned");
        assert!(data_base.is_aligned(PAGE_SIZE), "data base must be page aligned");
        assert!(data_size % PAGE_SIZE == 0, "data size must be page aligned");

        Self {
            text_base,
            text_size,
            data_base,
            data_size,
        }
    }

    /// Returns the first physical address of the image.
    pub fn start(&self) -> PhysicalAddress {
        if self.text_base < self.data_base {
            self.text_base
        } else {
            self.data_base
        }
    }

    /// Returns the first physical address past the image.
    pub fn end(&self) -> PhysicalAddress {
        let text_end = self.text_base + self.text_size;
        let data_end = self.data_base + self.data_size;
        if text_end > data_end { text_end } else { data_end }
    }

    /// Returns the total image size in bytes.
    pub fn size(&self) -> usize {
        self.end() - self.start()
    }

    /// Returns the attributes a given physical page of the image requires,
    /// or None if the page is not part of the image.
    pub fn attrs_for(&self, page: PhysicalAddress) -> Option<PageAttributes> {
        let addr = page.as_usize();
        if addr >= self.text_base.as_usize() && addr < (self.text_base + self.text_size).as_usize()
        {
            return Some(PageAttributes::KERNEL_CODE);
        }
        if addr >= self.data_base.as_usize() && addr < (self.data_base + self.data_size).as_usize()
        {
            return Some(PageAttributes::KERNEL_DATA);
        }
        None
    }

    /// Returns true if any page of the image falls within `[base, base + len)`.
    pub fn overlaps(&self, base: PhysicalAddress, len: usize) -> bool {
        self.start().as_usize() < base.as_usize() + len && base < self.end()
    }
}
