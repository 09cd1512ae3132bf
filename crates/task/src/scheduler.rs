//! Round-robin scheduling policy.
//!
//! Selection is a pure function over the process table so it can be tested
//! without a kernel. There are no priorities and no run queues: the table
//! itself, in creation order, is the rotation, and the scheduler walks it
//! once per decision. The table stays small enough that the linear scan is
//! not worth improving on.

use crate::process::{Process, ProcessState};

/// Index of the next Ready process strictly after `from`, wrapping around
/// the table, or `None` when no other process is runnable. `from` itself is
/// never returned.
pub(crate) fn next_ready(procs: &[Process], from: usize) -> Option<usize> {
    let len = procs.len();
    (1..len)
        .map(|step| (from + step) % len)
        .find(|&index| procs[index].state == ProcessState::Ready)
}

/// Index of the first Ready process at or after `start`, wrapping around
/// the table. Unlike [`next_ready`] the scan includes its starting point,
/// which may lie one past the end of the table.
pub(crate) fn first_ready_from(procs: &[Process], start: usize) -> Option<usize> {
    let len = procs.len();
    if len == 0 {
        return None;
    }
    (0..len)
        .map(|step| (start + step) % len)
        .find(|&index| procs[index].state == ProcessState::Ready)
}

#[cfg(test)]
mod tests {
    use vmm::{PhysicalAddress, TableRoot};

    use super::*;
    use crate::context::Context;
    use crate::process::{FdTable, Pid, ProcessKind};

    fn table(states: &[ProcessState]) -> alloc::vec::Vec<Process> {
        states
            .iter()
            .enumerate()
            .map(|(i, &state)| {
                let mut proc = Process::new(
                    Pid::new(i as u32 + 1),
                    "stub",
                    ProcessKind::KernelThread,
                    Context::default(),
                    TableRoot::new(PhysicalAddress::new(0x4000_0000)),
                    None,
                    PhysicalAddress::new(0x4010_0000),
                    4,
                    FdTable::new(),
                );
                proc.state = state;
                proc
            })
            .collect()
    }

    use ProcessState::{Blocked, Ready, Running};

    #[test]
    fn picks_the_next_ready_in_table_order() {
        let procs = table(&[Ready, Running, Ready, Ready]);
        assert_eq!(next_ready(&procs, 1), Some(2));
        assert_eq!(next_ready(&procs, 2), Some(3));
    }

    #[test]
    fn wraps_past_the_end_of_the_table() {
        let procs = table(&[Ready, Blocked, Running]);
        assert_eq!(next_ready(&procs, 2), Some(0));
    }

    #[test]
    fn skips_blocked_processes() {
        let procs = table(&[Blocked, Running, Blocked, Ready]);
        assert_eq!(next_ready(&procs, 1), Some(3));
        assert_eq!(next_ready(&procs, 3), None);
    }

    #[test]
    fn never_selects_the_starting_index() {
        let procs = table(&[Ready, Blocked]);
        assert_eq!(next_ready(&procs, 0), None);
    }

    #[test]
    fn empty_and_single_entry_tables_have_no_successor() {
        assert_eq!(next_ready(&table(&[]), 0), None);
        assert_eq!(next_ready(&table(&[Running]), 0), None);
    }

    #[test]
    fn first_ready_scan_includes_its_starting_point() {
        let procs = table(&[Blocked, Ready, Ready]);
        assert_eq!(first_ready_from(&procs, 1), Some(1));
        assert_eq!(first_ready_from(&procs, 0), Some(1));
    }

    #[test]
    fn first_ready_scan_wraps_from_one_past_the_end() {
        let procs = table(&[Ready, Blocked]);
        assert_eq!(first_ready_from(&procs, 2), Some(0));
        assert_eq!(first_ready_from(&table(&[Blocked]), 0), None);
        assert_eq!(first_ready_from(&table(&[]), 0), None);
    }
}
