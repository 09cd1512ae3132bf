//! Boot-time memory bring-up.
//!
//! Turns the linker's picture of the kernel image plus the board constants
//! into the real kernel address space, then carves the heap out of the frame
//! allocator. Runs once, on the boot translation tables, before anything
//! else touches memory.

use vmm::{
    AddressSpace, AddressTranslator, FrameAllocator, KernelImage, MemoryLayout, PAGE_SIZE,
    PhysicalAddress, VirtualAddress,
};

use crate::{board, heap};

/// Pages carved out of the frame allocator for the kernel heap.
const HEAP_PAGES: usize = 256;

/// Everything the rest of boot needs from memory bring-up.
pub struct MemoryContext {
    pub layout: MemoryLayout,
    pub frames: FrameAllocator,
    pub kernel_space: AddressSpace,
}

/// Builds the kernel address space and switches the MMU onto it.
///
/// On return the boot translation tables are dead and the dynamic kernel
/// window is live.
pub fn init() -> MemoryContext {
    let layout = board::memory_layout();
    AddressTranslator::set_current(AddressTranslator::hardware(layout.direct_map_offset()));

    let image = kernel_image(&layout);

    let mut frames = FrameAllocator::new();
    frames
        .add_region(layout.ram_base, layout.ram_size)
        .expect("RAM does not fit the frame allocator");
    // The bottom of RAM holds the device tree blob, then the boot code, the
    // image, and the boot stacks and tables; reserve it all in one span.
    let reserved = image.end().as_usize() - layout.ram_base.as_usize();
    frames
        .reserve(layout.ram_base, reserved)
        .expect("kernel image must lie inside RAM");

    let kernel_space = AddressSpace::new_kernel(&mut frames, &layout, Some(&image))
        .expect("not enough memory for the kernel tables");

    // Leave the boot tables behind.
    vmm::set_table_root(kernel_space.table_root());
    vmm::invalidate_all();

    let heap_base = frames
        .alloc_pages(HEAP_PAGES, 1)
        .expect("not enough memory for the kernel heap");
    // SAFETY: freshly allocated frames, reachable through the direct map and
    // owned by the heap from here on.
    unsafe {
        heap::KERNEL_HEAP.add_region(
            VirtualAddress::direct_mapped(heap_base).as_usize(),
            HEAP_PAGES * PAGE_SIZE,
        );
    }

    MemoryContext {
        layout,
        frames,
        kernel_space,
    }
}

/// Reads the kernel image extents out of the linker script symbols.
fn kernel_image(layout: &MemoryLayout) -> KernelImage {
    // SAFETY: the symbols are defined by the linker script; only their
    // addresses are taken.
    let (text_start, text_end, rw_start, rw_end) = unsafe {
        (
            &__kernel_text_start as *const u8 as usize,
            &__kernel_text_end as *const u8 as usize,
            &__kernel_rw_start as *const u8 as usize,
            &__kernel_end as *const u8 as usize,
        )
    };

    let offset = layout.direct_map_offset();
    KernelImage::new(
        PhysicalAddress::new(text_start - offset),
        text_end - text_start,
        PhysicalAddress::new(rw_start - offset),
        rw_end - rw_start,
    )
}

// External symbols from the linker script
unsafe extern "C" {
    static __kernel_text_start: u8;
    static __kernel_text_end: u8;
    static __kernel_rw_start: u8;
    static __kernel_end: u8;
}
