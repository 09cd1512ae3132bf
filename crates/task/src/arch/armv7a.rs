//! CPSR-based interrupt masking.

use core::arch::asm;

use crate::context::CPSR_IRQ_DISABLE;

/// Keeps IRQs masked while it lives. Dropping the guard restores the mask
/// state captured when it was created, so nested guards compose.
#[must_use = "IRQs are unmasked again when the guard drops"]
pub struct IrqGuard {
    saved: u32,
}

/// Masks IRQs and returns a guard that undoes the masking on drop.
pub fn disable_irqs() -> IrqGuard {
    let saved: u32;
    // SAFETY: reads CPSR and sets the I bit. No memory is touched and the
    // condition flags are preserved.
    unsafe {
        asm!(
            "mrs {0}, cpsr",
            "cpsid i",
            out(reg) saved,
            options(nomem, nostack, preserves_flags),
        );
    }
    IrqGuard { saved }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.saved & CPSR_IRQ_DISABLE == 0 {
            // SAFETY: clears the I bit, which was clear when the guard was
            // created.
            unsafe { asm!("cpsie i", options(nomem, nostack, preserves_flags)) };
        }
    }
}
