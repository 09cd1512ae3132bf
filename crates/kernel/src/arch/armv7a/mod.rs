//! ARMv7-A boot and exception plumbing.
//!
//! Everything the hardware forces into assembly lives here: the pre-MMU boot
//! path, the exception vector table, and the code that moves a suspended
//! context between memory and the register file. The trap frame layout is
//! shared with [`task::Context`]; the save and restore stubs below are the
//! other half of that contract.

pub mod gic;
pub mod timer;

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicU32, Ordering};

use task::Context;
use vmm::{AddressSpace, FrameAllocator, VirtualAddress};

use crate::board;

crate::interrupt_vectors! {
    u32,
    TIMER = 30,
    UART = 33,
}

// The CPU starts here with the MMU off, executing at the load address. Zero
// .bss (the boot table lives in it), build a section table that maps RAM both
// at itself and at the kernel half, turn the MMU on, and jump high. Section
// attribute 0x40E is kernel RW, outer and inner write-back. TTBR attribute
// 0x48 marks the walks write-back as well.
global_asm!(
    r#"
.pushsection .text.boot, "ax"
.global _start
_start:
    cpsid if, #0x13

    // Zero .bss at its physical location.
    ldr r0, =__kernel_bss_start
    ldr r1, =__kernel_bss_end
    ldr r2, =0x80000000
    sub r0, r0, r2
    sub r1, r1, r2
    mov r3, #0
1:  cmp r0, r1
    strlo r3, [r0], #4
    blo 1b

    // Clear all 4096 first-level entries of the boot table.
    ldr r0, =__boot_table_start
    sub r0, r0, r2
    mov r1, #4096
2:  str r3, [r0], #4
    subs r1, r1, #1
    bne 2b
    sub r0, r0, #16384

    // Section entries for the 128 sections of RAM, identity and kernel-half.
    ldr r4, =0x40E
    mov r5, #0x400
    mov r6, #128
3:  lsl r7, r5, #20
    orr r7, r7, r4
    str r7, [r0, r5, lsl #2]
    add r8, r5, #0x800
    str r7, [r0, r8, lsl #2]
    add r5, r5, #1
    subs r6, r6, #1
    bne 3b

    // Point the walks at the table and enable the MMU and caches.
    orr r1, r0, #0x48
    mcr p15, 0, r1, c2, c0, 0
    mov r1, #0
    mcr p15, 0, r1, c2, c0, 2
    mcr p15, 0, r1, c8, c7, 0
    mcr p15, 0, r1, c7, c5, 0
    mcr p15, 0, r1, c7, c5, 6
    mov r1, #1
    mcr p15, 0, r1, c3, c0, 0
    dsb
    isb
    mrc p15, 0, r1, c1, c0, 0
    ldr r2, =0x1005
    orr r1, r1, r2
    mcr p15, 0, r1, c1, c0, 0
    isb

    ldr r1, =_kernel_entry
    bx r1
.ltorg
.popsection
"#
);

// High-half entry: give every exception mode a stack, install the vector
// table, and hand over to Rust.
global_asm!(
    r#"
.pushsection .text, "ax"
_kernel_entry:
    cps #0x12
    ldr sp, =__irq_stack_top
    cps #0x17
    ldr sp, =__abt_stack_top
    cps #0x1B
    ldr sp, =__und_stack_top
    cps #0x13
    ldr sp, =__boot_stack_top

    ldr r0, =vector_table
    mcr p15, 0, r0, c12, c0, 0
    isb

    bl kmain
.ltorg
.popsection
"#
);

// Exception entry and exit.
//
// Every vector lands in supervisor mode with a 68-byte trap frame on the
// supervisor stack: {sp, lr, r0-r12, pc, spsr}, the layout of
// `task::Context`. `srs` pushes the return state before the mode switch, so
// the frame describes the interrupted context no matter which mode it ran
// in; the banked user sp and lr need the `^` forms.
//
// The restore path reads the frame the handler may have rewritten. A frame
// whose spsr names user mode returns through the running process's empty
// kernel stack (CURRENT_KERNEL_STACK_TOP); a supervisor frame returns onto
// the target's own stack, staging {r0-r3, pc, spsr} just below its sp so
// the last registers and the mode switch come from one `rfe`.
global_asm!(
    r#"
.macro finish_trap_frame
    push {{r0-r12}}
    sub sp, sp, #8
    ldr r0, [sp, #0x40]
    and r0, r0, #0x1F
    cmp r0, #0x10
    bne 8f
    stmia sp, {{sp, lr}}^
    b 9f
8:  add r0, sp, #68
    str r0, [sp]
    str lr, [sp, #4]
9:  mov r0, sp
    mov r4, sp
    bic sp, sp, #7
.endm

.pushsection .text, "ax"
.p2align 5
vector_table:
    b .
    b vector_undefined
    b vector_svc
    b vector_prefetch_abort
    b vector_data_abort
    b .
    b vector_irq
    b .

vector_irq:
    sub lr, lr, #4
    srsdb sp!, #0x13
    cps #0x13
    finish_trap_frame
    bl irq_trap
    mov sp, r4
    b restore_trap_frame

vector_svc:
    srsdb sp!, #0x13
    finish_trap_frame
    bl svc_trap
    mov sp, r4
    b restore_trap_frame

vector_data_abort:
    sub lr, lr, #8
    srsdb sp!, #0x13
    cps #0x13
    finish_trap_frame
    bl data_abort_trap
    mov sp, r4
    b restore_trap_frame

vector_prefetch_abort:
    sub lr, lr, #4
    srsdb sp!, #0x13
    cps #0x13
    finish_trap_frame
    bl prefetch_abort_trap
    mov sp, r4
    b restore_trap_frame

vector_undefined:
    srsdb sp!, #0x13
    cps #0x13
    finish_trap_frame
    bl undefined_trap
    mov sp, r4
    b restore_trap_frame

.global restore_trap_frame
restore_trap_frame:
    ldr r0, [sp, #0x40]
    and r0, r0, #0x1F
    cmp r0, #0x10
    bne 1f

    // User target: stage {pc, spsr} at the top of its kernel stack, load
    // the banked user sp and lr, then the general registers, and return.
    // The rfe writeback leaves the supervisor sp at the stack top, ready
    // for the next trap.
    ldr r2, [sp, #0x3C]
    ldr r3, [sp, #0x40]
    ldmia sp, {{sp, lr}}^
    ldr r1, =CURRENT_KERNEL_STACK_TOP
    ldr r1, [r1]
    sub r1, r1, #8
    stmia r1, {{r2, r3}}
    add lr, sp, #8
    ldmia lr, {{r0-r12}}
    ldr sp, =CURRENT_KERNEL_STACK_TOP
    ldr sp, [sp]
    sub sp, sp, #8
    rfeia sp!

1:  // Supervisor target: r4-r12 and lr straight from the frame, the rest
    // through a six-word staging block below the target's stack pointer.
    // Register order matters when the frame is resumed in place: the
    // staging block may overlap the frame's upper words, so they are read
    // before anything is staged.
    ldr r0, [sp]
    sub r0, r0, #24
    add r1, sp, #24
    ldmia r1, {{r4-r12}}
    ldr lr, [sp, #4]
    ldr r1, [sp, #8]
    ldr r2, [sp, #12]
    ldr r3, [sp, #16]
    str r1, [r0]
    str r2, [r0, #4]
    str r3, [r0, #8]
    ldr r1, [sp, #20]
    str r1, [r0, #12]
    ldr r1, [sp, #0x3C]
    ldr r2, [sp, #0x40]
    str r1, [r0, #16]
    str r2, [r0, #20]
    mov sp, r0
    pop {{r0-r3}}
    rfeia sp!
.ltorg
.popsection
"#
);

/// Kernel stack top of the running process. The exception entry path lands
/// traps from user mode here, so it must track every context switch.
#[unsafe(no_mangle)]
static CURRENT_KERNEL_STACK_TOP: AtomicU32 = AtomicU32::new(0);

pub fn set_kernel_stack_top(top: VirtualAddress) {
    CURRENT_KERNEL_STACK_TOP.store(top.as_u32(), Ordering::Relaxed);
}

/// Enters a context that has never run, abandoning the current stack.
///
/// # Safety
///
/// `frame` must describe a runnable context whose address space is live, and
/// [`set_kernel_stack_top`] must already name that context's kernel stack.
pub unsafe fn context_enter(frame: *const Context) -> ! {
    // SAFETY: the restore stub consumes the frame `sp` points at; the
    // caller's stack is never touched again.
    unsafe {
        asm!(
            "mov sp, {0}",
            "b restore_trap_frame",
            in(reg) frame,
            options(noreturn)
        );
    }
}

/// Issues a supervisor call from kernel code.
///
/// Kernel threads share the syscall path with user programs so that blocking
/// calls run through the trap frame machinery. The banked supervisor lr is
/// overwritten by the exception itself, so it is saved around the call.
pub fn kernel_syscall(nr: usize, arg0: usize, arg1: usize, arg2: usize) -> isize {
    let ret: isize;
    // SAFETY: the svc handler preserves every register except r0.
    unsafe {
        asm!(
            "push {{lr}}",
            "svc #0",
            "pop {{lr}}",
            inout("r0") arg0 => ret,
            in("r1") arg1,
            in("r2") arg2,
            in("r7") nr,
        );
    }
    ret
}

/// Maps and starts the interrupt hardware: GIC first, then the generic
/// timer, which is the only interrupt source the kernel unmasks.
pub fn init(frames: &mut FrameAllocator, kernel_space: &mut AddressSpace) {
    let gicd = kernel_space
        .map_device(frames, board::GICD_BASE, 0x1000)
        .expect("mapping the interrupt distributor cannot fail at boot");
    let gicc = kernel_space
        .map_device(frames, board::GICC_BASE, 0x1000)
        .expect("mapping the interrupt CPU interface cannot fail at boot");

    gic::init(gicd, gicc);
    timer::init(board::TIMER_HZ);
    gic::enable(InterruptVector::TIMER);
    log::debug!("interrupts online, timer at {} Hz", board::TIMER_HZ);
}

fn data_fault_address() -> VirtualAddress {
    let addr: usize;
    // SAFETY: DFAR read, no side effects.
    unsafe {
        asm!("mrc p15, 0, {0}, c6, c0, 0", out(reg) addr, options(nomem, nostack, preserves_flags));
    }
    VirtualAddress::new(addr)
}

fn data_fault_status() -> u32 {
    let status: u32;
    // SAFETY: DFSR read, no side effects.
    unsafe {
        asm!("mrc p15, 0, {0}, c5, c0, 0", out(reg) status, options(nomem, nostack, preserves_flags));
    }
    status
}

fn instruction_fault_address() -> VirtualAddress {
    let addr: usize;
    // SAFETY: IFAR read, no side effects.
    unsafe {
        asm!("mrc p15, 0, {0}, c6, c0, 2", out(reg) addr, options(nomem, nostack, preserves_flags));
    }
    VirtualAddress::new(addr)
}

fn instruction_fault_status() -> u32 {
    let status: u32;
    // SAFETY: IFSR read, no side effects.
    unsafe {
        asm!("mrc p15, 0, {0}, c5, c0, 1", out(reg) status, options(nomem, nostack, preserves_flags));
    }
    status
}

#[unsafe(no_mangle)]
extern "C" fn kmain() -> ! {
    crate::kernel_main()
}

#[unsafe(no_mangle)]
extern "C" fn irq_trap(frame: &mut Context) {
    crate::interrupts::handle_irq(frame);
}

#[unsafe(no_mangle)]
extern "C" fn svc_trap(frame: &mut Context) {
    crate::syscall::handle(frame);
}

#[unsafe(no_mangle)]
extern "C" fn data_abort_trap(frame: &mut Context) {
    crate::fault::handle_data_abort(frame, data_fault_address(), data_fault_status());
}

#[unsafe(no_mangle)]
extern "C" fn prefetch_abort_trap(frame: &mut Context) {
    crate::fault::handle_prefetch_abort(frame, instruction_fault_address(), instruction_fault_status());
}

#[unsafe(no_mangle)]
extern "C" fn undefined_trap(frame: &mut Context) {
    crate::fault::handle_undefined(frame);
}
