//! Address spaces: table ownership, mapping, translation, and teardown.
//!
//! An [`AddressSpace`] owns one 16 KiB first-level table plus every
//! second-level table reachable from it below the kernel split. The kernel
//! space direct-maps all of RAM with section descriptors (breaking the MiBs
//! that hold the kernel image into small pages so text can be read-only) and
//! manages a dynamic window for device remaps. User spaces share the kernel
//! half of the first-level table by copying its entries once at creation.
//!
//! Alongside the hardware tables, each space keeps a shadow array holding the
//! kernel-visible address of every second-level table, so walks never have to
//! translate a table's physical base at lookup time.

use core::fmt;
use core::num::NonZeroUsize;

use crate::arch;
use crate::table::{FirstLevelTable, SecondLevelTable, TablePool};
use crate::{
    AddressTranslator, AllocError, FIRST_LEVEL_ENTRIES, FirstLevelDescriptor, FirstLevelKind,
    FrameAllocator, KernelImage, MemoryLayout, PAGE_SIZE, PAGES_PER_SECTION, PageAttributes,
    PhysicalAddress, SECTION_SIZE, SecondLevelDescriptor, SecondLevelKind, TableRoot,
    VirtualAddress, VirtualRangeAllocator,
};

/// Frames occupied by a first-level table (16 KiB).
const ROOT_FRAMES: usize = 4;

/// An error returned when establishing a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Part of the requested virtual range is already mapped.
    AlreadyMapped,
    /// No memory is available for a required second-level table.
    OutOfTableMemory,
    /// The dynamic kernel window has no room left for the request.
    WindowExhausted,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "virtual range is already mapped"),
            Self::OutOfTableMemory => write!(f, "out of memory for second-level tables"),
            Self::WindowExhausted => write!(f, "kernel window exhausted"),
        }
    }
}

/// An error returned when removing a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The range does not match a live mapping.
    NotMapped,
}

impl fmt::Display for UnmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMapped => write!(f, "virtual range is not mapped"),
        }
    }
}

/// An error returned by a validated copy into or out of user memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAccessError {
    /// The range touches a page with no translation.
    Unmapped(VirtualAddress),
    /// The range touches a page user code may not access this way.
    Forbidden(VirtualAddress),
}

impl fmt::Display for UserAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmapped(addr) => write!(f, "user range unmapped at {addr}"),
            Self::Forbidden(addr) => write!(f, "user access forbidden at {addr}"),
        }
    }
}

/// Whether a space is the single shared kernel space or a per-process one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// One translation context: a first-level table and everything it owns.
pub struct AddressSpace {
    kind: SpaceKind,
    /// Physical base of the 16 KiB first-level table.
    root: PhysicalAddress,
    /// Kernel-visible address of the second-level table for each first-level
    /// slot, or `None` where no coarse descriptor is installed.
    ///
    /// Entries at or above the kernel split are shared with the kernel
    /// space; only the kernel space writes through them.
    shadow: [Option<NonZeroUsize>; FIRST_LEVEL_ENTRIES],
    /// Pool backing the second-level tables this space allocated itself.
    tables: TablePool,
    /// Reservation ledger for the range this space hands out (the kernel
    /// window, or the whole user range).
    vmem: VirtualRangeAllocator,
}

impl AddressSpace {
    /// Builds the kernel address space.
    ///
    /// All of RAM is direct-mapped at `layout.kernel_base` with section
    /// descriptors; MiBs overlapping `image` are instead mapped with small
    /// pages so the image's text is read-only and executable while its data
    /// stays writable. The dynamic kernel window is registered with its
    /// second-level tables allocated up front: user roots copy the kernel
    /// first-level entries once at creation, so tables installed later would
    /// not be visible to them.
    pub fn new_kernel(
        frames: &mut FrameAllocator,
        layout: &MemoryLayout,
        image: Option<&KernelImage>,
    ) -> Result<Self, AllocError> {
        assert!(
            layout.ram_size % SECTION_SIZE == 0,
            "RAM size must be a whole number of sections"
        );
        assert!(
            layout.kernel_window_size % SECTION_SIZE == 0,
            "kernel window must be a whole number of sections"
        );

        let root = frames.alloc_pages(ROOT_FRAMES, ROOT_FRAMES)?;
        let mut space = Self {
            kind: SpaceKind::Kernel,
            root,
            shadow: [None; FIRST_LEVEL_ENTRIES],
            tables: TablePool::new(),
            vmem: VirtualRangeAllocator::new(),
        };

        let translator = AddressTranslator::current();
        // SAFETY: the root frames were just allocated for this table and are
        // not aliased.
        unsafe { (*translator.phys_to_ptr::<FirstLevelTable>(root.as_usize())).zero() };

        for section in 0..layout.ram_size / SECTION_SIZE {
            let virt = layout.kernel_base + section * SECTION_SIZE;
            let phys = layout.ram_base + section * SECTION_SIZE;
            let index = virt.first_level_index();

            match image {
                Some(img) if img.overlaps(phys, SECTION_SIZE) => {
                    space.ensure_table(frames, index)?;
                    let table = space.second_level(index).expect("table installed above");
                    // SAFETY: the table was just allocated for this slot and
                    // nothing else references it yet.
                    let table = unsafe { &mut *table };
                    for page in 0..PAGES_PER_SECTION {
                        let page_phys = phys + page * PAGE_SIZE;
                        let attrs = img
                            .attrs_for(page_phys)
                            .unwrap_or(PageAttributes::KERNEL_DATA);
                        *table.entry_mut(page) = SecondLevelDescriptor::small(page_phys, attrs);
                    }
                }
                _ => {
                    // SAFETY: root points at this space's live first-level
                    // table.
                    unsafe {
                        *(*space.first_level()).entry_mut(index) =
                            FirstLevelDescriptor::section(phys, PageAttributes::KERNEL_DATA);
                    }
                }
            }
        }

        space
            .vmem
            .add_range(layout.kernel_window_base, layout.kernel_window_size)?;

        let window_start = layout.kernel_window_base.first_level_index();
        for index in window_start..window_start + layout.kernel_window_size / SECTION_SIZE {
            space.ensure_table(frames, index)?;
        }

        arch::barrier();
        log::debug!(
            "kernel space ready: {} RAM sections, {} window tables",
            layout.ram_size / SECTION_SIZE,
            layout.kernel_window_size / SECTION_SIZE
        );
        Ok(space)
    }

    /// Builds a user address space sharing `kernel`'s upper half.
    ///
    /// First-level entries from the kernel split upward are copied verbatim,
    /// so kernel mappings resolve identically through every root. The user
    /// half starts empty.
    pub fn new_user(
        frames: &mut FrameAllocator,
        kernel: &AddressSpace,
        layout: &MemoryLayout,
    ) -> Result<Self, AllocError> {
        debug_assert_eq!(kernel.kind, SpaceKind::Kernel);

        let root = frames.alloc_pages(ROOT_FRAMES, ROOT_FRAMES)?;
        let mut space = Self {
            kind: SpaceKind::User,
            root,
            shadow: [None; FIRST_LEVEL_ENTRIES],
            tables: TablePool::new(),
            vmem: VirtualRangeAllocator::new(),
        };

        let translator = AddressTranslator::current();
        let first = translator.phys_to_ptr::<FirstLevelTable>(root.as_usize());
        let split = layout.kernel_split_index();
        // SAFETY: the new root was just allocated and is not aliased; the
        // kernel root is only read.
        unsafe {
            (*first).zero();
            let kernel_first =
                &*translator.phys_to_ptr::<FirstLevelTable>(kernel.root.as_usize());
            for index in split..FIRST_LEVEL_ENTRIES {
                *(*first).entry_mut(index) = kernel_first.entry(index);
            }
        }
        space.shadow[split..].copy_from_slice(&kernel.shadow[split..]);

        space.vmem.add_range(layout.user_base, layout.user_size)?;

        arch::barrier();
        Ok(space)
    }

    /// Returns the value to load into the translation-table base register to
    /// activate this space.
    pub fn table_root(&self) -> TableRoot {
        TableRoot::new(self.root)
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Maps `size` bytes of physically contiguous memory at `virt`.
    ///
    /// The whole range is reserved before any descriptor is written and any
    /// missing second-level tables are allocated first, so a failed call
    /// leaves every page of the range unmapped.
    pub fn map_pages(
        &mut self,
        frames: &mut FrameAllocator,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: usize,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        debug_assert!(virt.is_aligned(PAGE_SIZE));
        debug_assert!(phys.is_aligned(PAGE_SIZE));
        debug_assert!(size > 0 && size % PAGE_SIZE == 0);

        self.vmem
            .reserve(virt, size)
            .map_err(|_| MapError::AlreadyMapped)?;

        if let Err(err) = self.install_pages(frames, virt, phys, size, attrs) {
            self.vmem
                .release(virt, size)
                .expect("fresh reservation must release");
            return Err(err);
        }
        Ok(())
    }

    /// Maps a device region into the kernel window and returns the virtual
    /// address corresponding to `phys`.
    ///
    /// The base may be unaligned; the containing pages are mapped with
    /// device attributes and the returned address carries the same page
    /// offset as `phys`.
    pub fn map_device(
        &mut self,
        frames: &mut FrameAllocator,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, MapError> {
        debug_assert_eq!(self.kind, SpaceKind::Kernel);
        debug_assert!(size > 0);

        let base = phys.align_down(PAGE_SIZE);
        let offset = phys.as_usize() - base.as_usize();
        let map_size = (offset + size).next_multiple_of(PAGE_SIZE);

        let virt = self
            .vmem
            .allocate(map_size / PAGE_SIZE)
            .map_err(|_| MapError::WindowExhausted)?;

        if let Err(err) =
            self.install_pages(frames, virt, base, map_size, PageAttributes::KERNEL_DEVICE)
        {
            self.vmem
                .release(virt, map_size)
                .expect("fresh reservation must release");
            return Err(err);
        }

        log::debug!("device {phys} ({size} bytes) mapped at {}", virt + offset);
        Ok(virt + offset)
    }

    /// Removes the mapping previously established at `virt`.
    ///
    /// The range must exactly match one earlier [`map_pages`] call. Every
    /// descriptor is cleared and its translation invalidated before this
    /// returns, so the caller may immediately release the backing frames.
    /// Returns the physical base the range was mapped to.
    ///
    /// [`map_pages`]: Self::map_pages
    pub fn unmap_pages(
        &mut self,
        virt: VirtualAddress,
        size: usize,
    ) -> Result<PhysicalAddress, UnmapError> {
        debug_assert!(virt.is_aligned(PAGE_SIZE));
        debug_assert!(size > 0 && size % PAGE_SIZE == 0);

        let phys = match self.lookup_phys(virt) {
            Some(phys) => phys,
            None => return Err(UnmapError::NotMapped),
        };
        self.vmem
            .release(virt, size)
            .map_err(|_| UnmapError::NotMapped)?;

        self.clear_range(virt, size);
        arch::barrier();
        Ok(phys)
    }

    /// Resolves a virtual address through this space's tables.
    ///
    /// Returns the exact physical address `virt` translates to, or `None`
    /// where no translation exists.
    pub fn lookup_phys(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate_page(virt).map(|(phys, _)| phys)
    }

    /// Copies `buf.len()` bytes of user memory starting at `virt` into `buf`.
    ///
    /// Every page of the range is checked for a user-readable mapping before
    /// any byte moves, so a failure leaves `buf` untouched.
    pub fn user_read(
        &self,
        virt: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), UserAccessError> {
        self.check_user_range(virt, buf.len(), false)?;

        let translator = AddressTranslator::current();
        let mut addr = virt;
        let mut copied = 0;
        while copied < buf.len() {
            let (phys, _) = self
                .translate_page(addr)
                .ok_or(UserAccessError::Unmapped(addr))?;
            let chunk = (buf.len() - copied).min(PAGE_SIZE - addr.page_offset());
            let src = translator.phys_to_ptr::<u8>(phys.as_usize());
            // SAFETY: phys came from a live descriptor over allocator-owned
            // RAM and the chunk stays inside one page.
            unsafe { core::ptr::copy_nonoverlapping(src, buf[copied..].as_mut_ptr(), chunk) };
            copied += chunk;
            if copied < buf.len() {
                addr = addr + chunk;
            }
        }
        Ok(())
    }

    /// Copies `buf` into user memory starting at `virt`.
    ///
    /// Every page of the range is checked for a user-writable mapping before
    /// any byte moves, so a failure leaves user memory untouched.
    pub fn user_write(&mut self, virt: VirtualAddress, buf: &[u8]) -> Result<(), UserAccessError> {
        self.check_user_range(virt, buf.len(), true)?;

        let translator = AddressTranslator::current();
        let mut addr = virt;
        let mut copied = 0;
        while copied < buf.len() {
            let (phys, _) = self
                .translate_page(addr)
                .ok_or(UserAccessError::Unmapped(addr))?;
            let chunk = (buf.len() - copied).min(PAGE_SIZE - addr.page_offset());
            let dst = translator.phys_to_ptr::<u8>(phys.as_usize());
            // SAFETY: phys came from a live descriptor over allocator-owned
            // RAM and the chunk stays inside one page.
            unsafe { core::ptr::copy_nonoverlapping(buf[copied..].as_ptr(), dst, chunk) };
            copied += chunk;
            if copied < buf.len() {
                addr = addr + chunk;
            }
        }
        Ok(())
    }

    /// Tears down a user space, returning every resource to `frames`.
    ///
    /// Each mapped range is cleared from the tables and invalidated before
    /// its backing frames are freed, then the second-level tables and the
    /// first-level table itself are released.
    ///
    /// # Panics
    ///
    /// Panics if called on the kernel space.
    pub fn destroy(mut self, frames: &mut FrameAllocator) -> Result<(), AllocError> {
        assert_eq!(
            self.kind,
            SpaceKind::User,
            "the kernel space is never destroyed"
        );

        while let Some((virt, size)) = self.vmem.take_first_reservation() {
            let phys = self.lookup_phys(virt);
            self.clear_range(virt, size);
            if let Some(phys) = phys {
                frames.free_pages(phys, size / PAGE_SIZE)?;
            }
        }
        arch::barrier();

        self.tables.release_frames(frames)?;
        frames.free_pages(self.root, ROOT_FRAMES)?;
        Ok(())
    }

    /// Returns the number of live mapped ranges.
    pub fn mapped_range_count(&self) -> usize {
        self.vmem.reservation_count()
    }

    /// Returns the number of second-level tables this space owns.
    pub fn table_count(&self) -> usize {
        self.tables.allocated_tables()
    }

    fn first_level(&self) -> *mut FirstLevelTable {
        AddressTranslator::current().phys_to_ptr::<FirstLevelTable>(self.root.as_usize())
    }

    fn second_level(&self, index: usize) -> Option<*mut SecondLevelTable> {
        self.shadow[index].map(|va| va.get() as *mut SecondLevelTable)
    }

    /// Installs a second-level table for first-level slot `index` if none is
    /// present yet.
    fn ensure_table(
        &mut self,
        frames: &mut FrameAllocator,
        index: usize,
    ) -> Result<(), AllocError> {
        if self.shadow[index].is_some() {
            return Ok(());
        }

        let table_phys = self.tables.allocate_table(frames)?;
        let translator = AddressTranslator::current();
        let table_va = translator.phys_to_ptr::<SecondLevelTable>(table_phys.as_usize()) as usize;
        self.shadow[index] = NonZeroUsize::new(table_va);

        // SAFETY: root points at this space's live first-level table.
        let first = unsafe { &mut *self.first_level() };
        debug_assert!(first.entry(index).is_unmapped());
        *first.entry_mut(index) = FirstLevelDescriptor::coarse(table_phys);
        Ok(())
    }

    /// Writes small-page descriptors for `[virt, virt + size)`.
    ///
    /// All required second-level tables are put in place before any
    /// descriptor is written, so a failure leaves the range unmapped.
    fn install_pages(
        &mut self,
        frames: &mut FrameAllocator,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: usize,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        let first_index = virt.first_level_index();
        let last_index = (virt + (size - 1)).first_level_index();
        for index in first_index..=last_index {
            self.ensure_table(frames, index)
                .map_err(|_| MapError::OutOfTableMemory)?;
        }

        for page in 0..size / PAGE_SIZE {
            let va = virt + page * PAGE_SIZE;
            let table = self
                .second_level(va.first_level_index())
                .expect("second-level table ensured above");
            // SAFETY: the shadow entry points at a table owned by this space
            // and we hold the only mutable handle on the space.
            let table = unsafe { &mut *table };
            let entry = table.entry_mut(va.second_level_index());
            debug_assert!(entry.is_unmapped(), "reserved range must be unmapped");
            *entry = SecondLevelDescriptor::small(phys + page * PAGE_SIZE, attrs);
        }

        arch::barrier();
        Ok(())
    }

    /// Clears every small-page descriptor in the range and invalidates its
    /// translation.
    fn clear_range(&mut self, virt: VirtualAddress, size: usize) {
        for page in 0..size / PAGE_SIZE {
            let va = virt + page * PAGE_SIZE;
            if let Some(table) = self.second_level(va.first_level_index()) {
                // SAFETY: the shadow entry points at a table owned by this
                // space and we hold the only mutable handle on the space.
                let table = unsafe { &mut *table };
                table.entry_mut(va.second_level_index()).clear();
            }
            arch::invalidate_page(va);
        }
    }

    /// Walks the tables for the page containing `virt`, returning the exact
    /// physical address and the page's attributes.
    fn translate_page(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, PageAttributes)> {
        let index = virt.first_level_index();
        // SAFETY: root points at this space's live first-level table.
        let first = unsafe { &*self.first_level() };
        match first.entry(index).kind() {
            FirstLevelKind::Unmapped => None,
            FirstLevelKind::Section { base, attrs } => {
                Some((base + virt.section_offset(), attrs))
            }
            FirstLevelKind::Coarse { .. } => {
                let table = self.second_level(index)?;
                // SAFETY: shadow tracks every second-level table this root
                // references.
                let table = unsafe { &*table };
                match table.entry(virt.second_level_index()).kind() {
                    SecondLevelKind::Unmapped => None,
                    SecondLevelKind::Small { base, attrs } => {
                        Some((base + virt.page_offset(), attrs))
                    }
                }
            }
        }
    }

    /// Checks that every page of `[virt, virt + len)` is mapped with the
    /// required user permission.
    fn check_user_range(
        &self,
        virt: VirtualAddress,
        len: usize,
        write: bool,
    ) -> Result<(), UserAccessError> {
        let mut addr = virt;
        let mut remaining = len;
        while remaining > 0 {
            let (_, attrs) = self
                .translate_page(addr)
                .ok_or(UserAccessError::Unmapped(addr))?;
            let permitted = if write {
                attrs.user_writable()
            } else {
                attrs.user_readable()
            };
            if !permitted {
                return Err(UserAccessError::Forbidden(addr));
            }

            let chunk = remaining.min(PAGE_SIZE - addr.page_offset());
            remaining -= chunk;
            if remaining > 0 {
                addr = addr + chunk;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("kind", &self.kind)
            .field("root", &self.root)
            .field("mapped_ranges", &self.vmem.reservation_count())
            .field("tables", &self.tables.allocated_tables())
            .finish()
    }
}
