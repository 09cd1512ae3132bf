//! The syscall surface.
//!
//! Calls arrive through the svc vector with the number in r7, arguments in
//! r0-r2, and the result in r0. Failures come back as small negative numbers
//! in the Unix style. Kernel threads use the same entry path as user
//! programs so that blocking calls park their trap frame like anyone else's.

use task::{CONSOLE_HANDLE, Context, Pid, SpawnError, WaitError};
use vmm::VirtualAddress;

use crate::console::Console;
use crate::sched;

pub const NR_EXIT: usize = 0;
pub const NR_WRITE: usize = 1;
pub const NR_YIELD: usize = 2;
pub const NR_GETPID: usize = 3;
pub const NR_SPAWN: usize = 4;
pub const NR_WAIT_FOR_EXIT: usize = 5;

pub const ESRCH: isize = 3;
pub const EBADF: isize = 9;
pub const ENOMEM: isize = 12;
pub const EFAULT: isize = 14;
pub const EINVAL: isize = 22;
pub const ENOSYS: isize = 38;

/// Longest write accepted in one call.
const WRITE_MAX: usize = 64 * 1024;

/// Longest image name accepted by spawn.
const NAME_MAX: usize = 32;

pub fn handle(frame: &mut Context) {
    let nr = frame.gpr[7] as usize;
    let (arg0, arg1, arg2) = (
        frame.gpr[0] as usize,
        frame.gpr[1] as usize,
        frame.gpr[2] as usize,
    );

    match nr {
        NR_EXIT => sched::with(|kernel| kernel.exit_current(frame)),
        NR_YIELD => {
            // Result goes into the frame before it is saved away.
            frame.gpr[0] = 0;
            sched::with(|kernel| kernel.yield_now(frame));
        }
        NR_WAIT_FOR_EXIT => {
            let pid = Pid::new(arg0 as u32);
            frame.gpr[0] = 0;
            if let Err(err) = sched::with(|kernel| kernel.wait_for_exit(frame, pid)) {
                frame.gpr[0] = encode(Err(match err {
                    WaitError::UnknownPid => ESRCH,
                    WaitError::SelfWait => EINVAL,
                }));
            }
        }
        NR_WRITE => frame.gpr[0] = encode(write(arg0, arg1, arg2)),
        NR_GETPID => {
            let pid = sched::with(|kernel| kernel.current_pid());
            frame.gpr[0] = pid.map(|pid| pid.as_u32()).unwrap_or(0);
        }
        NR_SPAWN => frame.gpr[0] = encode(spawn(arg0, arg1)),
        unknown => {
            log::debug!("unknown syscall {}", unknown);
            frame.gpr[0] = encode(Err(ENOSYS));
        }
    }
}

fn encode(result: Result<usize, isize>) -> u32 {
    match result {
        Ok(value) => value as u32,
        Err(errno) => (-errno) as u32,
    }
}

/// write(fd, buf, len): copies the buffer out of the caller's space and
/// puts it on the console. The copy validates the whole range first, so a
/// bad buffer produces no partial output.
fn write(fd: usize, base: usize, len: usize) -> Result<usize, isize> {
    if len == 0 {
        return Ok(0);
    }
    if len > WRITE_MAX {
        return Err(EINVAL);
    }

    let mut buf = alloc::vec![0u8; len];
    sched::with(|kernel| {
        let pid = kernel.current_pid().ok_or(EBADF)?;
        let handle = kernel
            .process(pid)
            .and_then(|proc| proc.files().handle(fd))
            .ok_or(EBADF)?;
        if handle != CONSOLE_HANDLE {
            return Err(EBADF);
        }
        kernel
            .copy_from_user(VirtualAddress::new(base), &mut buf)
            .map_err(|_| EFAULT)
    })?;

    Console::default().write_bytes(&buf);
    Ok(len)
}

/// spawn(name, len): starts a new process from a registered image and
/// returns its pid.
fn spawn(base: usize, len: usize) -> Result<usize, isize> {
    if len == 0 || len > NAME_MAX {
        return Err(EINVAL);
    }

    let mut name = [0u8; NAME_MAX];
    sched::with(|kernel| {
        kernel
            .copy_from_user(VirtualAddress::new(base), &mut name[..len])
            .map_err(|_| EFAULT)
    })?;
    let name = core::str::from_utf8(&name[..len]).map_err(|_| EINVAL)?;

    sched::with(|kernel| kernel.spawn_user(name))
        .map(|pid| pid.as_u32() as usize)
        .map_err(|err| match err {
            SpawnError::OutOfMemory => ENOMEM,
            SpawnError::UnknownImage => EINVAL,
        })
}
