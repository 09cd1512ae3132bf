//! Software model of interrupt masking.
//!
//! Tracks a per-thread nesting depth instead of a CPU flag. Depth zero
//! means IRQs would be enabled on the target.

use core::cell::Cell;

std::thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Keeps IRQs masked while it lives. Dropping the guard restores the mask
/// state captured when it was created, so nested guards compose.
#[must_use = "IRQs are unmasked again when the guard drops"]
pub struct IrqGuard {
    _not_send: core::marker::PhantomData<*const ()>,
}

/// Masks IRQs and returns a guard that undoes the masking on drop.
pub fn disable_irqs() -> IrqGuard {
    DEPTH.with(|depth| depth.set(depth.get() + 1));
    IrqGuard {
        _not_send: core::marker::PhantomData,
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Current nesting depth of [`disable_irqs`] sections on this thread.
pub fn disable_depth() -> u32 {
    DEPTH.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_nest_and_unwind_in_order() {
        assert_eq!(disable_depth(), 0);
        let outer = disable_irqs();
        assert_eq!(disable_depth(), 1);
        {
            let _inner = disable_irqs();
            assert_eq!(disable_depth(), 2);
        }
        assert_eq!(disable_depth(), 1);
        drop(outer);
        assert_eq!(disable_depth(), 0);
    }
}
