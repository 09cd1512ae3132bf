//! The Vega kernel.
//!
//! A small preemptive kernel for the ARMv7-A QEMU virt board: section-mapped
//! kernel half, page-mapped user processes, a round-robin scheduler driven by
//! the generic timer, and a handful of system calls. The memory and process
//! layers live in the `vmm` and `task` crates and are unit tested on the
//! host; this crate adds the hardware and the boot path.
#![cfg_attr(all(target_arch = "arm", not(test)), no_std)]
#![cfg_attr(not(target_arch = "arm"), allow(dead_code))]

extern crate alloc;

mod arch;
mod board;
mod console;
mod fault;
mod heap;
mod interrupts;
#[cfg(target_arch = "arm")]
mod mem;
#[cfg(target_arch = "arm")]
mod sched;
mod serial;
#[cfg(target_arch = "arm")]
mod syscall;
mod userland;

pub use fault::handle_panic;

/// First Rust code after the assembly boot path. Runs on the boot stack in
/// supervisor mode with IRQs masked; never returns.
#[cfg(target_arch = "arm")]
fn kernel_main() -> ! {
    let mut mem = mem::init();

    let console = console::Console::init();
    let uart = mem
        .kernel_space
        .map_device(&mut mem.frames, board::UART0_BASE, 0x1000)
        .expect("mapping the UART cannot fail at boot");
    serial::init(console, uart);

    log::info!("vega {} booting", env!("CARGO_PKG_VERSION"));
    log::debug!(
        "memory online: {} free pages, {} KiB heap",
        mem.frames.free_page_count(),
        heap::KERNEL_HEAP.free_bytes() / 1024
    );

    arch::init(&mut mem.frames, &mut mem.kernel_space);

    sched::init(mem);
    sched::with(userland::register_all);
    sched::start()
}
