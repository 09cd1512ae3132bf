//! Fault reporting.
//!
//! Faults in user mode kill the offending process and the system moves on.
//! Faults in kernel mode and panics dump the interrupted registers and a
//! frame-pointer backtrace, then park the CPU. Every terminal report closes
//! with the same final line so a captured log shows whether the report made
//! it out whole.

use crate::arch;
#[cfg(target_arch = "arm")]
use crate::{board, sched};
#[cfg(target_arch = "arm")]
use task::Context;
#[cfg(target_arch = "arm")]
use vmm::VirtualAddress;

pub fn handle_panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("kernel panic: {}", info.message());
    if let Some(location) = info.location() {
        log::error!(" at {}", location)
    }

    backtrace(current_frame_pointer());

    log::error!("CPU parked");
    log::error!("END OF FAULT REPORT");
    arch::park();
}

#[cfg(target_arch = "arm")]
pub fn handle_data_abort(frame: &mut Context, address: VirtualAddress, status: u32) {
    if frame.is_user() {
        kill_current(frame, "data abort", Some((address, status)));
    } else {
        report(frame, "data abort", Some((address, status)));
    }
}

#[cfg(target_arch = "arm")]
pub fn handle_prefetch_abort(frame: &mut Context, address: VirtualAddress, status: u32) {
    if frame.is_user() {
        kill_current(frame, "prefetch abort", Some((address, status)));
    } else {
        report(frame, "prefetch abort", Some((address, status)));
    }
}

#[cfg(target_arch = "arm")]
pub fn handle_undefined(frame: &mut Context) {
    // The stored pc is the instruction after the undefined one.
    frame.pc = frame.pc.wrapping_sub(4);
    if frame.is_user() {
        kill_current(frame, "undefined instruction", None);
    } else {
        report(frame, "undefined instruction", None);
    }
}

/// Logs the fault, tears the faulting process down, and leaves the next
/// runnable one in the frame.
#[cfg(target_arch = "arm")]
fn kill_current(frame: &mut Context, kind: &str, detail: Option<(VirtualAddress, u32)>) {
    let (pid, name) = sched::with(|kernel| {
        let pid = kernel
            .current_pid()
            .expect("user fault without a current process");
        let name = kernel.process(pid).map(|proc| proc.name()).unwrap_or("?");
        (pid, name)
    });

    match detail {
        Some((address, status)) => log::error!(
            "process {} ({}) killed by {} at pc {:#010x}, address {:#010x}, status {:#x}",
            pid,
            name,
            kind,
            frame.pc,
            address.as_usize(),
            status
        ),
        None => log::error!(
            "process {} ({}) killed by {} at pc {:#010x}",
            pid,
            name,
            kind,
            frame.pc
        ),
    }

    sched::with(|kernel| kernel.exit_current(frame));
}

#[cfg(target_arch = "arm")]
fn report(frame: &Context, kind: &str, detail: Option<(VirtualAddress, u32)>) -> ! {
    log::error!("unrecoverable {} in kernel mode", kind);
    if let Some((address, status)) = detail {
        log::error!(" address {:#010x}, status {:#x}", address.as_usize(), status);
    }
    log::error!(
        " pc {:#010x} lr {:#010x} sp {:#010x} spsr {:#010x}",
        frame.pc,
        frame.lr,
        frame.sp,
        frame.spsr
    );
    log::error!(
        " r0 {:#010x} r1 {:#010x} r2 {:#010x} r3 {:#010x}",
        frame.gpr[0],
        frame.gpr[1],
        frame.gpr[2],
        frame.gpr[3]
    );
    log::error!(" r11 {:#010x} r12 {:#010x}", frame.gpr[11], frame.gpr[12]);

    backtrace(frame.gpr[11] as usize);

    log::error!("CPU parked");
    log::error!("END OF FAULT REPORT");
    arch::park();
}

/// Walks the frame-pointer chain. Each record is `{previous fp, lr}` at the
/// address fp points to; the walk stops at the first value outside the
/// direct map, a non-ascending link, or the depth cap.
#[cfg(target_arch = "arm")]
fn backtrace(mut fp: usize) {
    let lo = board::KERNEL_BASE.as_usize();
    let hi = lo + board::RAM_SIZE;

    log::error!("backtrace:");
    for depth in 0..64 {
        if fp < lo || fp + 8 > hi || fp % 4 != 0 {
            break;
        }
        // SAFETY: bounds-checked reads inside the direct map.
        let (next, lr) = unsafe {
            (
                core::ptr::read(fp as *const usize),
                core::ptr::read((fp + 4) as *const usize),
            )
        };
        if lr == 0 {
            break;
        }
        log::error!("  #{:02}: {:#010x}", depth, lr);
        if next <= fp {
            break;
        }
        fp = next;
    }
}

#[cfg(not(target_arch = "arm"))]
fn backtrace(_fp: usize) {}

#[cfg(target_arch = "arm")]
fn current_frame_pointer() -> usize {
    let fp;
    // SAFETY: register read only.
    unsafe {
        core::arch::asm!("mov {0}, r11", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    fp
}

#[cfg(not(target_arch = "arm"))]
fn current_frame_pointer() -> usize {
    0
}
