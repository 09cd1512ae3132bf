//! Page-granule index types.
//!
//! A [`FrameNumber`] counts 4 KiB frames of physical memory from physical
//! zero; a [`PageNumber`] counts 4 KiB pages of a virtual address space.
//! Keeping them distinct from byte addresses (and from each other) stops the
//! allocator ledger and the table arena from mixing the two spaces up.

use crate::{
    PAGE_SIZE,
    address::{PhysicalAddress, VirtualAddress},
};

macro_rules! page_index {
    ($(#[$doc:meta])* $name:ident over $addr:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(index: usize) -> Self {
                Self(index)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Address of the first byte in this granule.
            #[inline]
            pub const fn start(self) -> $addr {
                $addr::new(self.0 * PAGE_SIZE)
            }
        }

        impl From<$addr> for $name {
            /// Truncates the address to its containing granule.
            #[inline]
            fn from(addr: $addr) -> Self {
                Self(addr.as_usize() / PAGE_SIZE)
            }
        }
    };
}

page_index!(
    /// Index of a physical frame.
    FrameNumber over PhysicalAddress
);

page_index!(
    /// Index of a virtual page within one address space.
    PageNumber over VirtualAddress
);
