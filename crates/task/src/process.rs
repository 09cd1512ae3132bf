//! Process control blocks.

use core::fmt;

use vmm::{AddressSpace, PhysicalAddress, TableRoot};

use crate::context::Context;
use crate::waitlist::Waitlist;

/// Process identifier. Pids are allocated sequentially starting at 1 and
/// never reused within a boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// Control block exists but the process has never been scheduled.
    Created,
    /// Runnable, waiting for the scheduler to pick it.
    Ready,
    /// Currently executing on the CPU.
    Running,
    /// Parked on a waitlist until another process wakes it.
    Blocked,
    /// Finished. Set during teardown, just before the control block is
    /// removed from the process table.
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessKind {
    /// Runs in supervisor mode inside the shared kernel address space.
    KernelThread,
    /// Runs in user mode inside its own address space.
    User,
}

/// Handle token stored in a file descriptor slot. The kernel binary decides
/// what each token names; token 0 is conventionally the console.
pub const CONSOLE_HANDLE: u32 = 0;

/// Per-process open file slots.
pub const NOFILE: usize = 16;

/// Fixed-size file descriptor table. Descriptors are indices into the slot
/// array; allocation always takes the lowest free slot, so a freshly
/// spawned process sees the familiar 0, 1, 2 for its standard streams.
#[derive(Debug)]
pub struct FdTable {
    slots: [Option<u32>; NOFILE],
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; NOFILE],
        }
    }

    /// A table with descriptors 0, 1 and 2 wired to the console.
    pub fn with_standard_streams() -> Self {
        let mut table = Self::new();
        for _ in 0..3 {
            let _ = table.open(CONSOLE_HANDLE);
        }
        table
    }

    /// Stores `handle` in the lowest free slot and returns its descriptor,
    /// or `None` if the table is full.
    pub fn open(&mut self, handle: u32) -> Option<usize> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(handle);
        Some(fd)
    }

    /// Releases `fd` and returns the handle it held.
    pub fn close(&mut self, fd: usize) -> Option<u32> {
        self.slots.get_mut(fd)?.take()
    }

    /// The handle behind `fd`, if the descriptor is open.
    pub fn handle(&self, fd: usize) -> Option<u32> {
        *self.slots.get(fd)?
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the kernel knows about one process.
///
/// Kernel threads carry `space: None` and execute inside the shared kernel
/// address space; their `table_root` is the kernel root. User processes own
/// their `AddressSpace`, which is destroyed when they exit.
pub struct Process {
    pub(crate) pid: Pid,
    pub(crate) name: &'static str,
    pub(crate) kind: ProcessKind,
    pub(crate) state: ProcessState,
    pub(crate) context: Context,
    pub(crate) table_root: TableRoot,
    pub(crate) space: Option<AddressSpace>,
    pub(crate) kernel_stack: PhysicalAddress,
    pub(crate) kernel_stack_pages: usize,
    pub(crate) end_waiters: Waitlist,
    pub(crate) files: FdTable,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pid: Pid,
        name: &'static str,
        kind: ProcessKind,
        context: Context,
        table_root: TableRoot,
        space: Option<AddressSpace>,
        kernel_stack: PhysicalAddress,
        kernel_stack_pages: usize,
        files: FdTable,
    ) -> Self {
        Self {
            pid,
            name,
            kind,
            state: ProcessState::Created,
            context,
            table_root,
            space,
            kernel_stack,
            kernel_stack_pages,
            end_waiters: Waitlist::new(),
            files,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// The saved register state. Only meaningful while the process is not
    /// Running; the running process lives in the trap frame.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn files(&self) -> &FdTable {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut FdTable {
        &mut self.files
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod fd_table {
        use super::*;

        #[test]
        fn allocates_lowest_free_descriptor() {
            let mut table = FdTable::new();
            assert_eq!(table.open(10), Some(0));
            assert_eq!(table.open(11), Some(1));
            assert_eq!(table.open(12), Some(2));
            assert_eq!(table.close(1), Some(11));
            assert_eq!(table.open(13), Some(1));
            assert_eq!(table.handle(1), Some(13));
            assert_eq!(table.open_count(), 3);
        }

        #[test]
        fn close_is_idempotent_per_slot() {
            let mut table = FdTable::new();
            let fd = table.open(42).unwrap();
            assert_eq!(table.close(fd), Some(42));
            assert_eq!(table.close(fd), None);
            assert_eq!(table.handle(fd), None);
            assert_eq!(table.close(NOFILE + 1), None);
        }

        #[test]
        fn full_table_rejects_opens() {
            let mut table = FdTable::new();
            for expected in 0..NOFILE {
                assert_eq!(table.open(expected as u32), Some(expected));
            }
            assert_eq!(table.open(99), None);
        }

        #[test]
        fn standard_streams_point_at_the_console() {
            let table = FdTable::with_standard_streams();
            for fd in 0..3 {
                assert_eq!(table.handle(fd), Some(CONSOLE_HANDLE));
            }
            assert_eq!(table.open_count(), 3);
        }
    }
}
