//! Compile-time description of the QEMU virt board.
//!
//! Vega targets a single machine, so device locations are constants here
//! rather than something discovered from the device tree at boot.

use vmm::{MemoryLayout, PhysicalAddress, VirtualAddress};

/// Base of the board's RAM.
pub const RAM_BASE: PhysicalAddress = PhysicalAddress::new(0x4000_0000);

/// Bytes of RAM the machine is given; the board is always started with 128M.
pub const RAM_SIZE: usize = 128 * 1024 * 1024;

/// Virtual base of the kernel half. All of RAM is direct-mapped here.
pub const KERNEL_BASE: VirtualAddress = VirtualAddress::new(0xC000_0000);

/// Virtual base of the window used for device and late kernel mappings.
pub const KERNEL_WINDOW_BASE: VirtualAddress = VirtualAddress::new(0xF000_0000);

/// Size of the kernel window.
pub const KERNEL_WINDOW_SIZE: usize = 16 * 1024 * 1024;

/// PL011 UART.
pub const UART0_BASE: PhysicalAddress = PhysicalAddress::new(0x0900_0000);

/// GICv2 distributor registers.
pub const GICD_BASE: PhysicalAddress = PhysicalAddress::new(0x0800_0000);

/// GICv2 CPU interface registers.
pub const GICC_BASE: PhysicalAddress = PhysicalAddress::new(0x0801_0000);

/// Scheduler tick rate for the generic timer.
pub const TIMER_HZ: u32 = 100;

/// The fixed memory layout handed to the memory manager at boot.
pub fn memory_layout() -> MemoryLayout {
    MemoryLayout {
        ram_base: RAM_BASE,
        ram_size: RAM_SIZE,
        kernel_base: KERNEL_BASE,
        kernel_window_base: KERNEL_WINDOW_BASE,
        kernel_window_size: KERNEL_WINDOW_SIZE,
        user_base: VirtualAddress::new(task::USER_IMAGE_BASE),
        user_size: task::USER_STACK_TOP - task::USER_IMAGE_BASE,
    }
}
