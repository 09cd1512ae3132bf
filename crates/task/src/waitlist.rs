//! FIFO queues of blocked processes.

use alloc::collections::VecDeque;

use crate::process::Pid;

/// An ordered queue of processes blocked on some condition.
///
/// A waitlist only records who is waiting; the state transitions happen in
/// [`Kernel::wait`](crate::Kernel::wait) and
/// [`Kernel::wake_one`](crate::Kernel::wake_one), which guarantee that a
/// queued pid is always a Blocked process. Wakeups are strictly first in,
/// first out.
#[derive(Debug, Default)]
pub struct Waitlist {
    queue: VecDeque<Pid>,
}

impl Waitlist {
    pub const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn enqueue(&mut self, pid: Pid) {
        self.queue.push_back(pid);
    }

    pub(crate) fn dequeue(&mut self) -> Option<Pid> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.queue.contains(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeues_in_arrival_order() {
        let mut list = Waitlist::new();
        list.enqueue(Pid::new(3));
        list.enqueue(Pid::new(1));
        list.enqueue(Pid::new(2));
        assert_eq!(list.len(), 3);
        assert!(list.contains(Pid::new(1)));
        assert_eq!(list.dequeue(), Some(Pid::new(3)));
        assert_eq!(list.dequeue(), Some(Pid::new(1)));
        assert_eq!(list.dequeue(), Some(Pid::new(2)));
        assert_eq!(list.dequeue(), None);
        assert!(list.is_empty());
    }
}
