//! Address types for physical and virtual memory management.
//!
//! This module provides wrappers around physical and virtual addresses, with
//! methods to manipulate them for page table operations. Both address kinds
//! are 32 bits wide on the target; the wrappers hold `usize` so the same code
//! runs unchanged on a 64-bit development host.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PAGE_SIZE, PageNumber, SECTION_SIZE};

#[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Converts between physical addresses and kernel-usable pointers.
///
/// On the target the kernel direct-maps all of RAM at a fixed offset, so the
/// conversion is one addition. On the host the `Emulated` variant stands in
/// with a heap-backed buffer playing the part of physical memory.
pub enum AddressTranslator {
    /// Fixed-offset direct map.
    Hardware { direct_map_offset: usize },
    /// Simulated physical memory for host-side tests.
    #[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a translator backed by `size` bytes of simulated physical
    /// memory starting at physical address `base`.
    #[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
    pub fn emulated(base: usize, size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(base, size))
    }

    /// Installs the translator. Happens once, early in boot; tests install a
    /// translator per thread.
    ///
    /// # Panics
    ///
    /// Panics if a translator is already installed.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(all(target_arch = "arm", not(test), not(feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns the installed translator.
    ///
    /// # Panics
    ///
    /// Panics if no translator has been installed yet.
    pub fn current() -> &'static AddressTranslator {
        #[cfg(all(target_arch = "arm", not(test), not(feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get().expect("address translator not set")
        }

        #[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                let translator = t.get().expect("address translator not set");
                // SAFETY: the Once is write-once and the thread-local is never
                // dropped before the thread ends, so extending the borrow to
                // 'static never leaves it dangling.
                unsafe { &*(translator as *const AddressTranslator) }
            })
        }
    }

    /// Returns the installed translator, or `None` before installation.
    #[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
    pub fn try_current() -> Option<&'static AddressTranslator> {
        ADDRESS_TRANSLATOR.with(|t| {
            t.get().map(|translator| {
                // SAFETY: as in current(); the Once is write-once and outlives
                // the borrow.
                unsafe { &*(translator as *const AddressTranslator) }
            })
        })
    }

    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(virt as *const u8),
        }
    }

    /// Returns a kernel pointer to the given physical address.
    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }

    /// Carves a block out of the simulated physical memory.
    ///
    /// Test fixtures use this to place tables and frames; on the target the
    /// frame allocator owns placement and this does not exist.
    #[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        match self {
            Self::Hardware { .. } => {
                panic!("cannot allocate from hardware translator")
            }
            Self::Emulated(mem) => mem.allocate(size, align),
        }
    }
}

// One translator per boot on the target. Each test thread gets its own so
// emulated memories never alias across tests.
#[cfg(all(target_arch = "arm", not(test), not(feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// Checks that an address fits the 32-bit address space of the target.
#[inline]
const fn fits_address_space(addr: usize) -> bool {
    addr as u64 <= u32::MAX as u64
}

macro_rules! address_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the address as the 32-bit value the hardware sees.
            ///
            /// # Panics
            ///
            /// Panics if the value does not fit in 32 bits; that can only
            /// happen for emulated-mode host pointers, which must never be
            /// fed into descriptor encodings.
            #[inline]
            pub const fn as_u32(self) -> u32 {
                assert!(
                    fits_address_space(self.0),
                    "address does not fit the 32-bit address space"
                );
                self.0 as u32
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

address_newtype!(
    /// An address in physical memory, as the bus sees it.
    PhysicalAddress
);

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if the address exceeds the 32-bit physical address space.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            fits_address_space(addr),
            "physical address exceeds the 32-bit address space"
        );
        Self(addr)
    }

    /// Recovers the physical address behind a direct-mapped virtual address.
    ///
    /// # Panics
    ///
    /// Panics if no translator is installed.
    #[inline]
    pub fn from_direct_mapped(virt: VirtualAddress) -> Self {
        let translator = AddressTranslator::current();
        Self::new(translator.virt_to_phys(virt.as_usize()))
    }

    /// The frame containing this address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

address_newtype!(
    /// An address in some virtual address space.
    ///
    /// Carries the page-table decomposition methods: a 32-bit virtual address
    /// splits into a first-level index (bits 20-31), a second-level index
    /// (bits 12-19) and a page offset (bits 0-11).
    VirtualAddress
);

impl VirtualAddress {
    /// # Panics
    ///
    /// Panics if the address exceeds the 32-bit virtual address space.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            fits_address_space(addr),
            "virtual address exceeds the 32-bit address space"
        );
        Self(addr)
    }

    /// Returns the kernel's direct-mapped view of a physical address.
    ///
    /// # Panics
    ///
    /// Panics if no translator is installed.
    #[inline]
    pub fn direct_mapped(phys: PhysicalAddress) -> Self {
        let translator = AddressTranslator::current();
        let virt = translator.phys_to_virt(phys.as_usize());

        // In emulated mode, phys_to_virt returns a host pointer which doesn't
        // fit the guest's 32-bit space. Bypass the validity check there.
        #[cfg(any(not(target_arch = "arm"), test, feature = "software-emulation"))]
        if matches!(translator, AddressTranslator::Emulated(_)) {
            return Self(virt);
        }

        Self::new(virt)
    }

    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Byte offset within the containing small page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Byte offset within the containing 1 MiB section.
    #[inline]
    pub const fn section_offset(self) -> usize {
        self.0 & (SECTION_SIZE - 1)
    }

    /// Index into the first-level translation table.
    #[inline]
    pub const fn first_level_index(self) -> usize {
        self.0 >> 20
    }

    /// Index into a second-level translation table.
    #[inline]
    pub const fn second_level_index(self) -> usize {
        (self.0 >> 12) & 0xFF
    }

    /// The page containing this address.
    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn holds_32_bit_values() {
            assert_eq!(PhysicalAddress::new(0).as_usize(), 0);
            assert_eq!(PhysicalAddress::new(0x4000_0100).as_usize(), 0x4000_0100);
            assert_eq!(PhysicalAddress::new(0xFFFF_FFFF).as_usize(), 0xFFFF_FFFF);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds the 32-bit address space")]
        #[cfg(target_pointer_width = "64")]
        fn rejects_values_past_32_bits() {
            PhysicalAddress::new(0x1_0000_0000);
        }

        #[test]
        fn alignment_predicates() {
            let addr = PhysicalAddress::new(PAGE_SIZE * 4);
            assert!(addr.is_aligned(PAGE_SIZE));
            assert!(addr.is_aligned(1));
            assert!(!addr.is_aligned(PAGE_SIZE * 8));

            let unaligned = PhysicalAddress::new(0x1124);
            assert_eq!(unaligned.align_down(PAGE_SIZE).as_usize(), 0x1000);
            assert_eq!(unaligned.align_up(PAGE_SIZE).as_usize(), 0x2000);
            assert_eq!(unaligned.align_up(4), unaligned);
        }

        #[test]
        fn offset_arithmetic() {
            let addr = PhysicalAddress::new(0x4000_0100);
            assert_eq!((addr + 0x50).as_usize(), 0x4000_0150);
            assert_eq!((addr - 0x50).as_usize(), 0x4000_00B0);
            assert_eq!(PhysicalAddress::new(0x4000_0150) - addr, 0x50);
        }

        #[test]
        fn narrows_to_the_hardware_width() {
            let addr = PhysicalAddress::new(0x4123_4000);
            assert_eq!(addr.as_u32(), 0x4123_4000u32);
        }

        #[test]
        fn formats_as_hex() {
            let addr = PhysicalAddress::new(0x0100);
            assert!(format!("{addr:?}").contains("PhysicalAddress"));
            assert_eq!(format!("{addr}"), "0x100");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn holds_kernel_half_addresses() {
            let addr = VirtualAddress::new(0xC000_0000);
            assert_eq!(addr.as_usize(), 0xC000_0000);
        }

        #[test]
        #[should_panic(expected = "virtual address exceeds the 32-bit address space")]
        #[cfg(target_pointer_width = "64")]
        fn rejects_values_past_32_bits() {
            VirtualAddress::new(0x1_0000_0000);
        }

        #[test]
        fn splits_into_table_indices_and_offsets() {
            let addr = VirtualAddress::new(0xC012_3456);
            assert_eq!(addr.first_level_index(), 0xC01);
            assert_eq!(addr.second_level_index(), 0x23);
            assert_eq!(addr.page_offset(), 0x456);
            assert_eq!(addr.section_offset(), 0x2_3456);
        }

        #[test]
        fn index_decomposition_covers_the_address() {
            let addr = VirtualAddress::new(0x8234_5678);
            let rebuilt = (addr.first_level_index() << 20)
                | (addr.second_level_index() << 12)
                | addr.page_offset();
            assert_eq!(rebuilt, addr.as_usize());
        }

        #[test]
        fn edge_indices() {
            assert_eq!(VirtualAddress::new(0).first_level_index(), 0);
            assert_eq!(VirtualAddress::new(0xFFF0_0000).first_level_index(), 0xFFF);
            assert_eq!(VirtualAddress::new(0x000F_F000).second_level_index(), 0xFF);
            assert_eq!(VirtualAddress::new(0x0010_0000).second_level_index(), 0);
        }

        #[test]
        fn converts_to_pointers() {
            let addr = VirtualAddress::new(0x0100);
            assert_eq!(addr.as_ptr::<u8>() as usize, 0x0100);
            assert_eq!(addr.as_mut_ptr::<u8>() as usize, 0x0100);
        }
    }

    mod direct_mapping {
        use super::*;

        fn install_offset_translator() {
            // Thread-local, so each test thread installs its own.
            if AddressTranslator::try_current().is_none() {
                AddressTranslator::set_current(AddressTranslator::hardware(0x8000_0000));
            }
        }

        #[test]
        fn physical_maps_up_and_virtual_maps_back() {
            install_offset_translator();
            let phys = PhysicalAddress::new(0x4000_0100);
            let virt = VirtualAddress::direct_mapped(phys);
            assert_eq!(virt.as_usize(), 0xC000_0100);
            assert_eq!(PhysicalAddress::from_direct_mapped(virt), phys);
        }

        #[test]
        #[should_panic(expected = "address translator already set")]
        fn rejects_a_second_translator() {
            AddressTranslator::set_current(AddressTranslator::hardware(0x8000_0000));
            AddressTranslator::set_current(AddressTranslator::hardware(0x9000_0000));
        }
    }
}
