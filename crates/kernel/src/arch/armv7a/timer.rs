//! ARM generic timer, PL1 physical (CNTP).
//!
//! The timer counts down from a reload value derived from CNTFRQ once at
//! init. The interrupt handler rearms it on every tick.

use core::arch::asm;
use core::sync::atomic::{AtomicU32, Ordering};

/// Counter ticks per scheduler tick.
static INTERVAL: AtomicU32 = AtomicU32::new(0);

pub fn init(hz: u32) {
    INTERVAL.store(counter_frequency() / hz, Ordering::Relaxed);
    rearm();
    // SAFETY: CNTP_CTL write; enables the timer with its output unmasked.
    unsafe {
        asm!("mcr p15, 0, {0}, c14, c2, 1", in(reg) 1u32, options(nomem, nostack, preserves_flags));
    }
}

/// Schedules the next tick. The pending output drops as soon as the new
/// downcount is written.
pub fn rearm() {
    let interval = INTERVAL.load(Ordering::Relaxed);
    // SAFETY: CNTP_TVAL write.
    unsafe {
        asm!("mcr p15, 0, {0}, c14, c2, 0", in(reg) interval, options(nomem, nostack, preserves_flags));
    }
}

fn counter_frequency() -> u32 {
    let frequency: u32;
    // SAFETY: CNTFRQ read, no side effects.
    unsafe {
        asm!("mrc p15, 0, {0}, c14, c0, 0", out(reg) frequency, options(nomem, nostack, preserves_flags));
    }
    frequency
}
