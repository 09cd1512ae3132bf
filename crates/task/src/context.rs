//! Saved execution state of a process.
//!
//! The layout of [`Context`] is shared with the exception entry stubs in the
//! kernel binary: on any trap the stubs materialise exactly this struct on
//! the supervisor stack (banked `sp` and `lr` first, then `r0`-`r12`, then
//! the return address and SPSR as stored by `srsdb`), and pass its address
//! to the handler. Restoring a process is the mirror image, so a context
//! switch is nothing more than copying one `Context` over another.

use vmm::VirtualAddress;

/// Entry point of a kernel thread. Kernel threads never return; they exit
/// through [`Kernel::exit_current`](crate::Kernel::exit_current).
pub type ThreadEntry = fn(usize) -> !;

/// CPSR mode field: user mode.
pub const CPSR_MODE_USER: u32 = 0x10;
/// CPSR mode field: IRQ mode.
pub const CPSR_MODE_IRQ: u32 = 0x12;
/// CPSR mode field: supervisor mode.
pub const CPSR_MODE_SVC: u32 = 0x13;
/// Mask selecting the CPSR mode field.
pub const CPSR_MODE_MASK: u32 = 0x1F;
/// CPSR I bit. Set when IRQs are masked.
pub const CPSR_IRQ_DISABLE: u32 = 1 << 7;

/// Full register state of a suspended process, in the order the exception
/// stubs store it (ascending addresses).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    /// Banked stack pointer of the interrupted mode.
    pub sp: u32,
    /// Banked link register of the interrupted mode.
    pub lr: u32,
    /// General-purpose registers `r0` through `r12`.
    pub gpr: [u32; 13],
    /// Address execution resumes at.
    pub pc: u32,
    /// Saved program status register, including the mode to return to.
    pub spsr: u32,
}

impl Context {
    /// Initial context of a kernel thread: supervisor mode with IRQs
    /// enabled, `entry` in `pc` and its argument in `r0`.
    pub fn kernel_thread(entry: ThreadEntry, arg: usize, stack_top: VirtualAddress) -> Self {
        let mut gpr = [0; 13];
        gpr[0] = arg as u32;
        Self {
            sp: stack_top.as_u32(),
            lr: 0,
            gpr,
            pc: entry as usize as u32,
            spsr: CPSR_MODE_SVC,
        }
    }

    /// Initial context of a user process: user mode with IRQs enabled,
    /// starting at `entry` with an empty descending stack.
    pub fn user(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        Self {
            sp: stack_top.as_u32(),
            lr: 0,
            gpr: [0; 13],
            pc: entry.as_u32(),
            spsr: CPSR_MODE_USER,
        }
    }

    /// Whether this context returns to user mode.
    pub fn is_user(&self) -> bool {
        self.spsr & CPSR_MODE_MASK == CPSR_MODE_USER
    }
}

#[cfg(test)]
mod tests {
    use core::mem::{offset_of, size_of};

    use super::*;

    fn never_runs(_: usize) -> ! {
        unreachable!()
    }

    #[test]
    fn layout_matches_exception_stubs() {
        assert_eq!(size_of::<Context>(), 17 * 4);
        assert_eq!(offset_of!(Context, sp), 0);
        assert_eq!(offset_of!(Context, lr), 4);
        assert_eq!(offset_of!(Context, gpr), 8);
        assert_eq!(offset_of!(Context, pc), 0x3C);
        assert_eq!(offset_of!(Context, spsr), 0x40);
    }

    #[test]
    fn kernel_thread_starts_in_svc_with_irqs_enabled() {
        let ctx = Context::kernel_thread(never_runs, 7, VirtualAddress::new(0xC010_0000));
        assert_eq!(ctx.spsr & CPSR_MODE_MASK, CPSR_MODE_SVC);
        assert_eq!(ctx.spsr & CPSR_IRQ_DISABLE, 0);
        assert_eq!(ctx.gpr[0], 7);
        assert_eq!(ctx.sp, 0xC010_0000);
        assert!(!ctx.is_user());
    }

    #[test]
    fn user_context_starts_in_user_mode() {
        let ctx = Context::user(
            VirtualAddress::new(0x0010_0000),
            VirtualAddress::new(0x8000_0000),
        );
        assert_eq!(ctx.spsr, CPSR_MODE_USER);
        assert_eq!(ctx.pc, 0x0010_0000);
        assert_eq!(ctx.sp, 0x8000_0000);
        assert!(ctx.is_user());
    }
}
