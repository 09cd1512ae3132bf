//! Software model of the ARMv7-A MMU for testing and development.
//!
//! The model performs real short-descriptor table walks over an emulated
//! physical memory buffer and keeps a translation cache with the same
//! observable behavior as the hardware TLB: entries survive a table-root
//! change and descriptor rewrites until they are explicitly invalidated.
//! A mapping change without the matching invalidation therefore shows up
//! in tests as a stale translation, exactly as it would on the machine.

use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::BTreeMap;

use super::TableRoot;
use crate::{
    AddressTranslator, FirstLevelDescriptor, FirstLevelKind, PAGE_SIZE, PageAttributes,
    SECTION_SIZE, SecondLevelDescriptor, SecondLevelKind, VirtualAddress,
};

/// Alignment granule of the emulated memory buffer.
///
/// First-level tables require 16 KiB alignment; backing the buffer with
/// blocks of that alignment means any guest-aligned object is also
/// host-aligned, so typed references into the buffer are valid.
const BLOCK_SIZE: usize = 16 * 1024;

#[repr(C, align(16384))]
struct AlignedBlock([u8; BLOCK_SIZE]);

/// Emulated physical memory for software simulation.
///
/// This provides a simulated physical memory space for testing table
/// operations without requiring actual hardware. Guest physical addresses
/// start at `base`, matching a board whose RAM does not begin at zero.
pub struct EmulatedMemory {
    /// Guest physical address of the first buffer byte.
    base: usize,
    /// The underlying memory buffer.
    memory: Vec<AlignedBlock>,
    /// Next allocation offset (simple bump allocator).
    next_alloc: AtomicUsize,
}

impl EmulatedMemory {
    /// Creates a new emulated memory region of (at least) the specified
    /// size, with guest physical addresses starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not aligned to the buffer granule.
    pub fn new(base: usize, size: usize) -> Self {
        assert!(
            base % BLOCK_SIZE == 0,
            "emulated memory base must be 16 KiB aligned"
        );

        let blocks = size.div_ceil(BLOCK_SIZE);
        let mut memory = Vec::with_capacity(blocks);
        memory.resize_with(blocks, || AlignedBlock([0; BLOCK_SIZE]));

        Self {
            base,
            memory,
            next_alloc: AtomicUsize::new(0),
        }
    }

    /// Returns the guest physical address of the first buffer byte.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.memory.len() * BLOCK_SIZE
    }

    /// Allocates a block of memory from the emulated space.
    ///
    /// Returns the guest physical address of the allocated block, or None
    /// if there's not enough space. The alignment applies to the guest
    /// physical address.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);

            // Align the guest physical address, not the buffer offset
            let aligned = (self.base + current + align - 1) & !(align - 1);
            let offset = aligned - self.base;
            let end = offset + size;

            if end > self.size() {
                return None;
            }

            // Try to claim this allocation
            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Translates a guest physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys >= self.base, "physical address below emulated memory");
        let offset = phys - self.base;
        assert!(offset < self.size(), "physical address out of bounds");
        // SAFETY: offset is within the buffer.
        unsafe { (self.memory.as_ptr() as *const u8).add(offset) as *mut u8 }
    }

    /// Translates a pointer into the buffer back to a guest physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = unsafe { ptr.offset_from(self.memory.as_ptr() as *const u8) };
        assert!(offset >= 0, "pointer not within emulated memory");
        assert!(
            (offset as usize) < self.size(),
            "pointer not within emulated memory"
        );
        self.base + offset as usize
    }
}

/// A fault produced by an emulated memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// No translation exists for the address.
    Translation(VirtualAddress),
    /// A translation exists but forbids the access.
    Permission(VirtualAddress),
}

impl fmt::Display for AccessFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Translation(addr) => write!(f, "translation fault at {addr}"),
            Self::Permission(addr) => write!(f, "permission fault at {addr}"),
        }
    }
}

/// One cached translation: a page's physical frame and its attributes.
#[derive(Clone, Copy, Debug)]
struct TlbEntry {
    frame: usize,
    attrs: PageAttributes,
}

struct MmuState {
    root: Option<TableRoot>,
    tlb: BTreeMap<usize, TlbEntry>,
}

std::thread_local! {
    static MMU: RefCell<MmuState> = RefCell::new(MmuState {
        root: None,
        tlb: BTreeMap::new(),
    });
}

/// Installs `root` as the active translation-table base.
///
/// Cached translations are NOT invalidated; like the hardware, the model
/// keeps them until they are explicitly invalidated.
pub fn set_table_root(root: TableRoot) {
    MMU.with(|mmu| mmu.borrow_mut().root = Some(root));
}

/// Returns the active translation-table base register value.
pub fn current_table_root() -> Option<TableRoot> {
    MMU.with(|mmu| mmu.borrow().root)
}

/// Invalidates every cached translation.
pub fn invalidate_all() {
    MMU.with(|mmu| mmu.borrow_mut().tlb.clear());
}

/// Invalidates any cached translation for the page containing `virt`.
pub fn invalidate_page(virt: VirtualAddress) {
    let page = virt.as_usize() & !(PAGE_SIZE - 1);
    MMU.with(|mmu| {
        mmu.borrow_mut().tlb.remove(&page);
    });
}

/// Orders table writes before translation. A no-op in the model, which has
/// no write buffering.
pub fn barrier() {}

fn read_phys_u32(phys: usize) -> u32 {
    let translator = AddressTranslator::current();
    let ptr = translator.phys_to_ptr::<u32>(phys);
    // SAFETY: the walk only reaches addresses inside emulated memory;
    // translate() bounds-checks them.
    unsafe { core::ptr::read_unaligned(ptr) }
}

/// Walks the active tables for the page containing `virt`.
fn walk(root: TableRoot, virt: usize) -> Option<TlbEntry> {
    let fld_phys = root.base().as_usize() + (virt >> 20) * 4;
    let fld = FirstLevelDescriptor::from(read_phys_u32(fld_phys));

    match fld.kind() {
        FirstLevelKind::Unmapped => None,
        FirstLevelKind::Coarse { table } => {
            let sld_phys = table.as_usize() + ((virt >> 12) & 0xFF) * 4;
            let sld = SecondLevelDescriptor::from(read_phys_u32(sld_phys));
            match sld.kind() {
                SecondLevelKind::Unmapped => None,
                SecondLevelKind::Small { base, attrs } => Some(TlbEntry {
                    frame: base.as_usize(),
                    attrs,
                }),
            }
        }
        FirstLevelKind::Section { base, attrs } => {
            let frame = base.as_usize() + (virt & (SECTION_SIZE - 1) & !(PAGE_SIZE - 1));
            Some(TlbEntry { frame, attrs })
        }
    }
}

/// Resolves `virt` via the cache, filling it from a table walk on a miss.
fn lookup(virt: usize) -> Option<TlbEntry> {
    let page = virt & !(PAGE_SIZE - 1);
    MMU.with(|mmu| {
        let mut mmu = mmu.borrow_mut();
        if let Some(entry) = mmu.tlb.get(&page) {
            return Some(*entry);
        }
        let root = mmu.root?;
        let entry = walk(root, page)?;
        mmu.tlb.insert(page, entry);
        Some(entry)
    })
}

/// Reads `buf.len()` bytes starting at `virt` through the modeled MMU,
/// performing a kernel-privilege access.
pub fn mmu_read(virt: VirtualAddress, buf: &mut [u8]) -> Result<(), AccessFault> {
    let mut addr = virt.as_usize();
    let mut copied = 0;

    while copied < buf.len() {
        let page_end = (addr & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        let chunk = (buf.len() - copied).min(page_end - addr);

        let fault_addr = VirtualAddress::new(addr);
        let entry = lookup(addr).ok_or(AccessFault::Translation(fault_addr))?;
        if !entry.attrs.kernel_readable() {
            return Err(AccessFault::Permission(fault_addr));
        }

        let phys = entry.frame + (addr & (PAGE_SIZE - 1));
        let translator = AddressTranslator::current();
        let src = translator.phys_to_ptr::<u8>(phys);
        // SAFETY: src points at `chunk` in-bounds bytes of emulated memory,
        // disjoint from `buf`.
        unsafe { core::ptr::copy_nonoverlapping(src, buf[copied..].as_mut_ptr(), chunk) };

        copied += chunk;
        addr += chunk;
    }

    Ok(())
}

/// Writes `buf` starting at `virt` through the modeled MMU, performing a
/// kernel-privilege access.
pub fn mmu_write(virt: VirtualAddress, buf: &[u8]) -> Result<(), AccessFault> {
    let mut addr = virt.as_usize();
    let mut copied = 0;

    while copied < buf.len() {
        let page_end = (addr & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        let chunk = (buf.len() - copied).min(page_end - addr);

        let fault_addr = VirtualAddress::new(addr);
        let entry = lookup(addr).ok_or(AccessFault::Translation(fault_addr))?;
        if !entry.attrs.kernel_writable() {
            return Err(AccessFault::Permission(fault_addr));
        }

        let phys = entry.frame + (addr & (PAGE_SIZE - 1));
        let translator = AddressTranslator::current();
        let dst = translator.phys_to_ptr::<u8>(phys);
        // SAFETY: dst points at `chunk` in-bounds bytes of emulated memory,
        // disjoint from `buf`.
        unsafe { core::ptr::copy_nonoverlapping(buf[copied..].as_ptr(), dst, chunk) };

        copied += chunk;
        addr += chunk;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PhysicalAddress;

    fn setup_translator() {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(0x4000_0000, 256 * 1024));
        }
    }

    fn write_phys_u32(phys: usize, value: u32) {
        let translator = AddressTranslator::current();
        let ptr = translator.phys_to_ptr::<u32>(phys);
        unsafe { core::ptr::write_unaligned(ptr, value) };
    }

    /// Builds a root with one small page mapped at `virt`, returning
    /// (root, table phys, data frame phys).
    fn build_single_mapping(virt: usize, attrs: PageAttributes) -> (TableRoot, usize, usize) {
        let translator = AddressTranslator::current();
        let root_phys = translator.allocate(16 * 1024, 16 * 1024).unwrap();
        let table_phys = translator.allocate(1024, 1024).unwrap();
        let frame_phys = translator.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();

        let fld = FirstLevelDescriptor::coarse(PhysicalAddress::new(table_phys));
        write_phys_u32(root_phys + (virt >> 20) * 4, fld.raw());

        let sld = SecondLevelDescriptor::small(PhysicalAddress::new(frame_phys), attrs);
        write_phys_u32(table_phys + ((virt >> 12) & 0xFF) * 4, sld.raw());

        (
            TableRoot::new(PhysicalAddress::new(root_phys)),
            table_phys,
            frame_phys,
        )
    }

    mod emulated_memory {
        use super::*;

        #[test]
        fn allocation_respects_guest_alignment() {
            let mem = EmulatedMemory::new(0x4000_0000, 64 * 1024);

            let a = mem.allocate(100, 16).unwrap();
            let b = mem.allocate(1024, 1024).unwrap();

            assert_eq!(a % 16, 0);
            assert_eq!(b % 1024, 0);
            assert!(b >= a + 100);
        }

        #[test]
        fn allocation_fails_when_exhausted() {
            let mem = EmulatedMemory::new(0x4000_0000, 16 * 1024);
            assert!(mem.allocate(17 * 1024, 16).is_none());
        }

        #[test]
        fn translate_round_trip() {
            let mem = EmulatedMemory::new(0x4000_0000, 64 * 1024);
            let phys = mem.allocate(64, 16).unwrap();

            let ptr = mem.translate(phys);
            assert_eq!(mem.ptr_to_phys(ptr), phys);
        }

        #[test]
        fn buffer_is_table_aligned() {
            let mem = EmulatedMemory::new(0x4000_0000, 64 * 1024);
            let phys = mem.allocate(16 * 1024, 16 * 1024).unwrap();
            assert_eq!(mem.translate(phys) as usize % (16 * 1024), 0);
        }
    }

    mod mmu_model {
        use super::*;

        #[test]
        fn unmapped_address_faults() {
            setup_translator();
            let translator = AddressTranslator::current();
            let root_phys = translator.allocate(16 * 1024, 16 * 1024).unwrap();
            set_table_root(TableRoot::new(PhysicalAddress::new(root_phys)));

            let mut buf = [0u8; 4];
            assert_eq!(
                mmu_read(VirtualAddress::new(0x0010_0000), &mut buf),
                Err(AccessFault::Translation(VirtualAddress::new(0x0010_0000)))
            );
        }

        #[test]
        fn mapped_page_reads_through_translation() {
            setup_translator();
            let virt = 0x0010_0000;
            let (root, _, frame_phys) = build_single_mapping(virt, PageAttributes::USER_DATA);
            set_table_root(root);

            let translator = AddressTranslator::current();
            unsafe {
                core::ptr::copy_nonoverlapping(
                    b"hello".as_ptr(),
                    translator.phys_to_ptr::<u8>(frame_phys),
                    5,
                );
            }

            let mut buf = [0u8; 5];
            mmu_read(VirtualAddress::new(virt), &mut buf).unwrap();
            assert_eq!(&buf, b"hello");
        }

        #[test]
        fn write_to_read_only_page_faults() {
            setup_translator();
            let virt = 0x0020_0000;
            let (root, _, _) = build_single_mapping(virt, PageAttributes::KERNEL_CODE);
            set_table_root(root);

            assert_eq!(
                mmu_write(VirtualAddress::new(virt), b"x"),
                Err(AccessFault::Permission(VirtualAddress::new(virt)))
            );
        }

        #[test]
        fn stale_translation_persists_until_invalidated() {
            setup_translator();
            let virt = 0x0030_0000;
            let (root, table_phys, frame_phys) =
                build_single_mapping(virt, PageAttributes::USER_DATA);
            set_table_root(root);

            mmu_write(VirtualAddress::new(virt), b"stale").unwrap();

            // Clear the descriptor without invalidating: the cached
            // translation keeps working, as it would on hardware.
            write_phys_u32(table_phys + ((virt >> 12) & 0xFF) * 4, 0);
            let mut buf = [0u8; 5];
            mmu_read(VirtualAddress::new(virt), &mut buf).unwrap();
            assert_eq!(&buf, b"stale");
            let _ = frame_phys;

            invalidate_page(VirtualAddress::new(virt));
            assert_eq!(
                mmu_read(VirtualAddress::new(virt), &mut buf),
                Err(AccessFault::Translation(VirtualAddress::new(virt)))
            );
        }

        #[test]
        fn root_switch_does_not_flush() {
            setup_translator();
            let virt = 0x0040_0000;
            let (root_a, _, _) = build_single_mapping(virt, PageAttributes::USER_DATA);
            set_table_root(root_a);

            mmu_write(VirtualAddress::new(virt), b"a").unwrap();

            // An empty root with no invalidation: the old translation is
            // still cached.
            let translator = AddressTranslator::current();
            let empty_root = translator.allocate(16 * 1024, 16 * 1024).unwrap();
            set_table_root(TableRoot::new(PhysicalAddress::new(empty_root)));

            let mut buf = [0u8; 1];
            mmu_read(VirtualAddress::new(virt), &mut buf).unwrap();
            assert_eq!(&buf, b"a");

            invalidate_all();
            assert_eq!(
                mmu_read(VirtualAddress::new(virt), &mut buf),
                Err(AccessFault::Translation(VirtualAddress::new(virt)))
            );
        }

        #[test]
        fn reads_span_page_boundaries() {
            setup_translator();
            let translator = AddressTranslator::current();
            let root_phys = translator.allocate(16 * 1024, 16 * 1024).unwrap();
            let table_phys = translator.allocate(1024, 1024).unwrap();
            let frames = translator.allocate(2 * PAGE_SIZE, PAGE_SIZE).unwrap();

            let virt = 0x0050_0000;
            let fld = FirstLevelDescriptor::coarse(PhysicalAddress::new(table_phys));
            write_phys_u32(root_phys + (virt >> 20) * 4, fld.raw());
            for page in 0..2 {
                let sld = SecondLevelDescriptor::small(
                    PhysicalAddress::new(frames + page * PAGE_SIZE),
                    PageAttributes::USER_DATA,
                );
                write_phys_u32(table_phys + page * 4, sld.raw());
            }
            set_table_root(TableRoot::new(PhysicalAddress::new(root_phys)));

            let pattern: Vec<u8> = (0..=255).collect();
            let write_at = VirtualAddress::new(virt + PAGE_SIZE - 128);
            mmu_write(write_at, &pattern).unwrap();

            let mut readback = vec![0u8; pattern.len()];
            mmu_read(write_at, &mut readback).unwrap();
            assert_eq!(readback, pattern);
        }
    }
}
