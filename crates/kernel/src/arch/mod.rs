#[cfg(target_arch = "arm")]
pub(crate) mod armv7a;

#[cfg(target_arch = "arm")]
pub use armv7a::*;

pub fn park() -> ! {
    loop {
        wait_for_interrupt();
    }
}

/// Idles the CPU until the next interrupt arrives.
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "arm")]
    // SAFETY: wfi stalls the pipeline and touches no state.
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "arm"))]
    core::hint::spin_loop();
}
