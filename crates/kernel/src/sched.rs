//! The global scheduler instance and the built-in threads.
//!
//! All process state lives in one [`task::Kernel`] behind a spin lock.
//! Handlers reach it through [`with`], which masks IRQs for the duration of
//! the closure so the timer cannot preempt a lock holder.

use alloc::vec::Vec;

use spin::{Mutex, Once};
use task::{Context, Kernel};

use crate::mem::MemoryContext;
use crate::{arch, syscall};

static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// Builds the kernel instance out of the boot-time memory state.
pub fn init(mem: MemoryContext) {
    KERNEL.call_once(|| Mutex::new(Kernel::new(mem.layout, mem.frames, mem.kernel_space)));
}

/// Runs `f` with the kernel locked and IRQs masked. The closure may switch
/// processes, so the current kernel stack top is republished for the
/// exception stubs on the way out.
pub fn with<T>(f: impl FnOnce(&mut Kernel) -> T) -> T {
    let _irqs_off = task::arch::disable_irqs();
    let mut kernel = KERNEL
        .get()
        .expect("scheduler touched before init")
        .lock();
    let result = f(&mut kernel);
    if kernel.current_pid().is_some() {
        arch::set_kernel_stack_top(kernel.current_kernel_stack_top());
    }
    result
}

/// Spawns the built-in threads and enters the first one. Never returns.
pub fn start() -> ! {
    with(|kernel| {
        kernel
            .spawn_kthread("init", init_main, 0)
            .expect("init thread must spawn");
        kernel
            .spawn_kthread("idle", idle_main, 0)
            .expect("idle thread must spawn");
    });

    let mut frame = Context::default();
    with(|kernel| kernel.start(&mut frame));
    // SAFETY: the frame was filled in by the scheduler and its kernel stack
    // top published by `with`.
    unsafe { arch::context_enter(&frame) }
}

/// Runs whenever nothing else is Ready. Must never block or exit.
fn idle_main(_arg: usize) -> ! {
    loop {
        arch::wait_for_interrupt();
    }
}

/// Launches every registered user image, waits for each to exit, then
/// reports and exits itself. From that point on only user processes and
/// the idle thread remain.
fn init_main(_arg: usize) -> ! {
    let names: Vec<&'static str> =
        with(|kernel| kernel.images().iter().map(|image| image.name()).collect());
    log::info!("init: {} user images registered", names.len());

    let mut pids = Vec::new();
    for name in names {
        match with(|kernel| kernel.spawn_user(name)) {
            Ok(pid) => pids.push(pid),
            Err(err) => log::error!("init: spawning {name:?} failed: {err}"),
        }
    }

    for pid in pids {
        let err = arch::kernel_syscall(syscall::NR_WAIT_FOR_EXIT, pid.as_u32() as usize, 0, 0);
        // The process may have exited before the wait went in.
        if err != 0 && err != -syscall::ESRCH {
            log::warn!("init: waiting for pid {pid} failed: {err}");
        }
    }

    let free = with(|kernel| kernel.free_frame_count());
    log::info!("init: all user processes exited, {free} pages free");
    arch::kernel_syscall(syscall::NR_EXIT, 0, 0, 0);
    unreachable!("exited process resumed")
}
