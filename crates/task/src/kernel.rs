//! The kernel object: process table, scheduler entry points, process
//! creation and teardown, and guarded copies in and out of user memory.
//!
//! There is exactly one [`Kernel`] per boot and the binary owns it. Every
//! operation that can transfer control takes the live trap frame as
//! `&mut Context`; switching processes is done by overwriting that frame,
//! and the exception return path does the rest. Nothing here sleeps or
//! retries: callers get a typed error and decide.

use alloc::vec::Vec;
use core::fmt;

use vmm::{
    AddressSpace, AddressTranslator, AllocError, FrameAllocator, MapError, MemoryLayout,
    PAGE_SIZE, PageAttributes, PhysicalAddress, SpaceKind, UserAccessError, VirtualAddress,
};

use crate::arch;
use crate::context::{Context, ThreadEntry};
use crate::image::{Image, ImageRegistry, USER_IMAGE_BASE, USER_STACK_PAGES, USER_STACK_TOP};
use crate::process::{FdTable, Pid, Process, ProcessKind, ProcessState};
use crate::scheduler;
use crate::waitlist::Waitlist;

/// Pages in each per-process kernel stack.
pub const KERNEL_STACK_PAGES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnError {
    /// No frames left for a stack, image pages, or page tables.
    OutOfMemory,
    /// No image registered under the requested name.
    UnknownImage,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::UnknownImage => write!(f, "no such image"),
        }
    }
}

impl From<AllocError> for SpawnError {
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}

impl From<MapError> for SpawnError {
    // User regions sit at fixed, disjoint addresses inside a fresh space,
    // so a mapping failure is always table memory running out.
    fn from(_: MapError) -> Self {
        Self::OutOfMemory
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitError {
    /// The pid does not name a live process.
    UnknownPid,
    /// A process cannot wait for its own exit.
    SelfWait,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPid => write!(f, "no such process"),
            Self::SelfWait => write!(f, "cannot wait for own exit"),
        }
    }
}

pub struct Kernel {
    layout: MemoryLayout,
    frames: FrameAllocator,
    kernel_space: AddressSpace,
    images: ImageRegistry,
    procs: Vec<Process>,
    /// Index of the Running process. Meaningless until [`Kernel::start`].
    current: usize,
    next_pid: u32,
    preemption_enabled: bool,
}

impl Kernel {
    pub fn new(layout: MemoryLayout, frames: FrameAllocator, kernel_space: AddressSpace) -> Self {
        assert_eq!(kernel_space.kind(), SpaceKind::Kernel);
        Self {
            layout,
            frames,
            kernel_space,
            images: ImageRegistry::new(),
            procs: Vec::new(),
            current: 0,
            next_pid: 1,
            preemption_enabled: true,
        }
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn images(&self) -> &ImageRegistry {
        &self.images
    }

    pub fn images_mut(&mut self) -> &mut ImageRegistry {
        &mut self.images
    }

    /// Pid of the process occupying the CPU, or `None` before the
    /// scheduler has started.
    pub fn current_pid(&self) -> Option<Pid> {
        self.procs
            .get(self.current)
            .filter(|proc| proc.state == ProcessState::Running)
            .map(|proc| proc.pid)
    }

    pub fn process_count(&self) -> usize {
        self.procs.len()
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.index_of(pid).map(|index| &self.procs[index])
    }

    pub fn process_state(&self, pid: Pid) -> Option<ProcessState> {
        self.process(pid).map(Process::state)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.procs.iter()
    }

    pub fn free_frame_count(&self) -> usize {
        self.frames.free_page_count()
    }

    pub fn preemption_enabled(&self) -> bool {
        self.preemption_enabled
    }

    fn index_of(&self, pid: Pid) -> Option<usize> {
        self.procs.iter().position(|proc| proc.pid == pid)
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Creates a kernel thread and makes it Ready. The thread runs `entry`
    /// with `arg` in supervisor mode on a freshly allocated kernel stack,
    /// inside the shared kernel address space.
    pub fn spawn_kthread(
        &mut self,
        name: &'static str,
        entry: ThreadEntry,
        arg: usize,
    ) -> Result<Pid, SpawnError> {
        let stack = self.frames.alloc_pages(KERNEL_STACK_PAGES, 1)?;
        let context = Context::kernel_thread(entry, arg, self.kernel_stack_top(stack));
        let pid = self.allocate_pid();
        let mut proc = Process::new(
            pid,
            name,
            ProcessKind::KernelThread,
            context,
            self.kernel_space.table_root(),
            None,
            stack,
            KERNEL_STACK_PAGES,
            FdTable::new(),
        );
        proc.state = ProcessState::Ready;
        self.procs.push(proc);
        log::info!("spawned kernel thread {name:?} as pid {pid}");
        Ok(pid)
    }

    /// Creates a user process from the registered image `name` and makes
    /// it Ready. The image's text, data and bss are mapped into a new
    /// address space together with a user stack; a failure at any point
    /// releases everything acquired so far.
    pub fn spawn_user(&mut self, name: &str) -> Result<Pid, SpawnError> {
        let image = *self.images.get(name).ok_or(SpawnError::UnknownImage)?;
        let stack = self.frames.alloc_pages(KERNEL_STACK_PAGES, 1)?;
        let mut space = match AddressSpace::new_user(&mut self.frames, &self.kernel_space, &self.layout)
        {
            Ok(space) => space,
            Err(err) => {
                self.release_frames_or_log(stack, KERNEL_STACK_PAGES);
                return Err(err.into());
            }
        };
        if let Err(err) = self.load_image(&mut space, &image) {
            self.release_user_space(space);
            self.release_frames_or_log(stack, KERNEL_STACK_PAGES);
            return Err(err);
        }
        let context = Context::user(image.entry_address(), VirtualAddress::new(USER_STACK_TOP));
        let pid = self.allocate_pid();
        let mut proc = Process::new(
            pid,
            image.name(),
            ProcessKind::User,
            context,
            space.table_root(),
            Some(space),
            stack,
            KERNEL_STACK_PAGES,
            FdTable::with_standard_streams(),
        );
        proc.state = ProcessState::Ready;
        self.procs.push(proc);
        log::info!("spawned {name:?} as pid {pid}");
        Ok(pid)
    }

    /// Maps a user image at its linked addresses: text, then the writable
    /// data and bss, then the stack at the top of the user half.
    fn load_image(&mut self, space: &mut AddressSpace, image: &Image) -> Result<(), SpawnError> {
        let header = *image.header();
        let text_base = VirtualAddress::new(USER_IMAGE_BASE);
        self.map_user_region(
            space,
            text_base,
            header.text_page_count(),
            PageAttributes::USER_CODE,
            image.text(),
        )?;
        self.map_user_region(
            space,
            text_base + header.text_page_count() * PAGE_SIZE,
            header.rw_page_count(),
            PageAttributes::USER_DATA,
            image.data(),
        )?;
        self.map_user_region(
            space,
            VirtualAddress::new(USER_STACK_TOP - USER_STACK_PAGES * PAGE_SIZE),
            USER_STACK_PAGES,
            PageAttributes::USER_DATA,
            &[],
        )?;
        Ok(())
    }

    /// Allocates `pages` frames, fills them with `contents` padded with
    /// zeroes, and maps them at `virt`. On a mapping failure the frames go
    /// straight back to the allocator.
    fn map_user_region(
        &mut self,
        space: &mut AddressSpace,
        virt: VirtualAddress,
        pages: usize,
        attrs: PageAttributes,
        contents: &[u8],
    ) -> Result<(), SpawnError> {
        if pages == 0 {
            return Ok(());
        }
        let phys = self.frames.alloc_pages(pages, 1)?;
        fill_frames(phys, pages, contents);
        if let Err(err) = space.map_pages(&mut self.frames, virt, phys, pages * PAGE_SIZE, attrs) {
            self.release_frames_or_log(phys, pages);
            return Err(err.into());
        }
        Ok(())
    }

    fn release_frames_or_log(&mut self, base: PhysicalAddress, pages: usize) {
        if let Err(err) = self.frames.free_pages(base, pages) {
            log::error!("leaked {pages} pages at {base}: {err}");
        }
    }

    fn release_user_space(&mut self, space: AddressSpace) {
        if let Err(err) = space.destroy(&mut self.frames) {
            log::error!("leaked address space frames: {err}");
        }
    }

    /// Virtual address one past the top of a kernel stack. Kernel stacks
    /// live in the direct map.
    fn kernel_stack_top(&self, base: PhysicalAddress) -> VirtualAddress {
        let offset = base.as_usize() - self.layout.ram_base.as_usize();
        self.layout.kernel_base + offset + KERNEL_STACK_PAGES * PAGE_SIZE
    }

    /// Kernel stack top of the running process. The trap entry path needs
    /// it to find an empty supervisor stack when an exception arrives from
    /// user mode.
    pub fn current_kernel_stack_top(&self) -> VirtualAddress {
        self.kernel_stack_top(self.procs[self.current].kernel_stack)
    }

    /// Enters the scheduler for the first time: installs the first Ready
    /// process into `frame` without saving any prior state. The caller
    /// returns into that frame and never comes back here.
    ///
    /// # Panics
    ///
    /// Panics if no process is Ready.
    pub fn start(&mut self, frame: &mut Context) {
        assert!(!self.procs.is_empty(), "started with an empty process table");
        let next = scheduler::first_ready_from(&self.procs, 0).expect("no runnable process");
        log::info!("entering scheduler with {} processes", self.procs.len());
        self.switch_to(next, frame);
    }

    /// Timer interrupt entry point. Rotates to the next Ready process
    /// unless preemption is disabled.
    pub fn timer_tick(&mut self, frame: &mut Context) {
        if !self.preemption_enabled {
            return;
        }
        self.reschedule(frame);
    }

    /// Gives up the CPU voluntarily. The caller keeps running if no other
    /// process is Ready.
    pub fn yield_now(&mut self, frame: &mut Context) {
        self.reschedule(frame);
    }

    fn reschedule(&mut self, frame: &mut Context) {
        let Some(next) = scheduler::next_ready(&self.procs, self.current) else {
            return;
        };
        let proc = &mut self.procs[self.current];
        proc.context = *frame;
        proc.state = ProcessState::Ready;
        self.switch_to(next, frame);
    }

    /// Makes `next` the Running process: installs its translation root,
    /// flushes the whole TLB, and overwrites the live trap frame with its
    /// saved context. IRQs stay masked for the duration.
    fn switch_to(&mut self, next: usize, frame: &mut Context) {
        let _irqs = arch::disable_irqs();
        self.current = next;
        let proc = &mut self.procs[next];
        proc.state = ProcessState::Running;
        vmm::set_table_root(proc.table_root);
        vmm::invalidate_all();
        *frame = proc.context;
        log::trace!("switched to pid {} ({})", proc.pid, proc.name);
    }

    /// Blocks the running process on `list` and transfers control to the
    /// next Ready process. The context in `frame` at the moment of the
    /// call is the exact state the process resumes with once woken.
    ///
    /// # Panics
    ///
    /// Panics if nothing else is Ready. The idle thread exists so that
    /// this cannot happen in a running system.
    pub fn wait(&mut self, frame: &mut Context, list: &mut Waitlist) {
        let proc = &self.procs[self.current];
        list.enqueue(proc.pid);
        log::trace!("pid {} blocked", proc.pid);
        self.block_current(frame);
    }

    /// Blocks the running process until `pid` exits.
    pub fn wait_for_exit(&mut self, frame: &mut Context, pid: Pid) -> Result<(), WaitError> {
        let target = self.index_of(pid).ok_or(WaitError::UnknownPid)?;
        if target == self.current {
            return Err(WaitError::SelfWait);
        }
        let caller = self.procs[self.current].pid;
        self.procs[target].end_waiters.enqueue(caller);
        log::trace!("pid {caller} waiting for pid {pid} to exit");
        self.block_current(frame);
        Ok(())
    }

    fn block_current(&mut self, frame: &mut Context) {
        let proc = &mut self.procs[self.current];
        proc.context = *frame;
        proc.state = ProcessState::Blocked;
        let next = scheduler::next_ready(&self.procs, self.current).expect("no runnable process");
        self.switch_to(next, frame);
    }

    /// Wakes the process at the head of `list`, making it Ready. Returns
    /// the woken pid, or `None` if the list was empty. The waker keeps the
    /// CPU; the woken process runs when the rotation reaches it.
    pub fn wake_one(&mut self, list: &mut Waitlist) -> Option<Pid> {
        let pid = list.dequeue()?;
        self.mark_ready(pid);
        Some(pid)
    }

    /// Wakes every process on `list`. Returns how many were woken.
    pub fn wake_all(&mut self, list: &mut Waitlist) -> usize {
        let mut woken = 0;
        while self.wake_one(list).is_some() {
            woken += 1;
        }
        woken
    }

    fn mark_ready(&mut self, pid: Pid) {
        if let Some(index) = self.index_of(pid) {
            let proc = &mut self.procs[index];
            if proc.state == ProcessState::Blocked {
                proc.state = ProcessState::Ready;
                log::trace!("pid {pid} ready");
            }
        }
    }

    /// Terminates the running process: wakes everything waiting for its
    /// exit, releases its address space and kernel stack, removes it from
    /// the table, and schedules the next Ready process. The freed pid is
    /// never reused.
    ///
    /// # Panics
    ///
    /// Panics if no other process is Ready; the idle thread keeps that
    /// from happening in a running system.
    pub fn exit_current(&mut self, frame: &mut Context) {
        let index = self.current;
        let proc = &mut self.procs[index];
        proc.state = ProcessState::Terminated;
        log::info!("pid {} ({}) exited", proc.pid, proc.name);
        let mut waiters = core::mem::take(&mut proc.end_waiters);
        self.wake_all(&mut waiters);

        let proc = self.procs.remove(index);
        if let Some(space) = proc.space {
            self.release_user_space(space);
        }
        self.release_frames_or_log(proc.kernel_stack, proc.kernel_stack_pages);

        // After the removal the table element at `index` is the exited
        // process's successor in the rotation.
        let next = scheduler::first_ready_from(&self.procs, index).expect("no runnable process");
        self.switch_to(next, frame);
    }

    /// Runs `f` with timer preemption disabled, restoring the previous
    /// setting afterwards. Voluntary scheduling still works inside `f`;
    /// only [`Kernel::timer_tick`] becomes a no-op.
    pub fn without_preemption<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = self.preemption_enabled;
        self.preemption_enabled = false;
        let result = f(self);
        self.preemption_enabled = saved;
        result
    }

    /// Copies `buf.len()` bytes out of the running process's memory at
    /// `virt`. The whole range is validated against user permissions
    /// before any byte moves; kernel-half addresses always fail.
    pub fn copy_from_user(
        &self,
        virt: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), UserAccessError> {
        match self.procs[self.current].space.as_ref() {
            Some(space) => space.user_read(virt, buf),
            None => self.kernel_space.user_read(virt, buf),
        }
    }

    /// Copies `buf` into the running process's memory at `virt`, with the
    /// same all-or-nothing validation as [`Kernel::copy_from_user`].
    pub fn copy_to_user(&mut self, virt: VirtualAddress, buf: &[u8]) -> Result<(), UserAccessError> {
        match self.procs[self.current].space.as_mut() {
            Some(space) => space.user_write(virt, buf),
            None => self.kernel_space.user_write(virt, buf),
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("processes", &self.procs.len())
            .field("current", &self.current)
            .field("preemption_enabled", &self.preemption_enabled)
            .finish_non_exhaustive()
    }
}

/// Copies `contents` to the start of a freshly allocated physical region
/// and zeroes the remainder.
fn fill_frames(base: PhysicalAddress, pages: usize, contents: &[u8]) {
    let len = pages * PAGE_SIZE;
    debug_assert!(contents.len() <= len);
    let dst = AddressTranslator::current().phys_to_ptr::<u8>(base.as_usize());
    // SAFETY: the region was just allocated from RAM the translator maps,
    // is `len` bytes long, and nothing else aliases it yet.
    unsafe {
        core::ptr::write_bytes(dst, 0, len);
        core::ptr::copy_nonoverlapping(contents.as_ptr(), dst, contents.len());
    }
}

#[cfg(test)]
mod tests {
    use vmm::SECTION_SIZE;

    use super::*;
    use crate::context::{CPSR_MODE_MASK, CPSR_MODE_SVC, CPSR_MODE_USER};
    use crate::image::tests::{build_image, leak};
    use crate::process::CONSOLE_HANDLE;

    const RAM_BASE: usize = 0x4000_0000;
    const RAM_SIZE: usize = 8 * SECTION_SIZE;

    fn layout() -> MemoryLayout {
        MemoryLayout {
            ram_base: PhysicalAddress::new(RAM_BASE),
            ram_size: RAM_SIZE,
            kernel_base: VirtualAddress::new(0xC000_0000),
            kernel_window_base: VirtualAddress::new(0xF000_0000),
            kernel_window_size: 16 * SECTION_SIZE,
            user_base: VirtualAddress::new(0x0010_0000),
            user_size: 0x8000_0000 - 0x0010_0000,
        }
    }

    fn fresh_kernel() -> Kernel {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(RAM_BASE, RAM_SIZE));
        }
        let mut frames = FrameAllocator::new();
        frames
            .add_region(PhysicalAddress::new(RAM_BASE), RAM_SIZE)
            .unwrap();
        let layout = layout();
        let kernel_space = AddressSpace::new_kernel(&mut frames, &layout, None).unwrap();
        Kernel::new(layout, frames, kernel_space)
    }

    fn never_runs(_: usize) -> ! {
        unreachable!()
    }

    mod scheduling {
        use super::*;

        #[test]
        fn start_installs_the_first_ready_process() {
            let mut kernel = fresh_kernel();
            let alpha = kernel.spawn_kthread("alpha", never_runs, 11).unwrap();
            let _beta = kernel.spawn_kthread("beta", never_runs, 22).unwrap();
            assert_eq!(kernel.current_pid(), None);

            let mut frame = Context::default();
            kernel.start(&mut frame);

            assert_eq!(kernel.current_pid(), Some(alpha));
            assert_eq!(kernel.process_state(alpha), Some(ProcessState::Running));
            assert_eq!(frame.gpr[0], 11);
            assert_eq!(frame.spsr & CPSR_MODE_MASK, CPSR_MODE_SVC);
            assert!(frame.sp as usize >= 0xC000_0000);
            assert_eq!(frame.sp % 8, 0);
            assert_eq!(kernel.current_kernel_stack_top().as_u32(), frame.sp);
            assert_eq!(
                vmm::current_table_root(),
                Some(kernel.process(alpha).unwrap().table_root),
            );
        }

        #[test]
        fn timer_rotates_through_every_process_before_repeating() {
            let mut kernel = fresh_kernel();
            let alpha = kernel.spawn_kthread("alpha", never_runs, 1).unwrap();
            let beta = kernel.spawn_kthread("beta", never_runs, 2).unwrap();
            let gamma = kernel.spawn_kthread("gamma", never_runs, 3).unwrap();

            let mut frame = Context::default();
            kernel.start(&mut frame);
            assert_eq!(kernel.current_pid(), Some(alpha));

            // Simulate alpha doing work before it gets preempted.
            frame.gpr[5] = 0x51;
            frame.pc = 0xC123_4560;

            let mut order = Vec::new();
            for _ in 0..4 {
                kernel.timer_tick(&mut frame);
                order.push(kernel.current_pid().unwrap());
            }
            assert_eq!(order, vec![beta, gamma, alpha, beta]);

            // Alpha resumed with the state it was preempted in.
            kernel.timer_tick(&mut frame);
            kernel.timer_tick(&mut frame);
            assert_eq!(kernel.current_pid(), Some(alpha));
            assert_eq!(frame.gpr[5], 0x51);
            assert_eq!(frame.pc, 0xC123_4560);
            assert_eq!(frame.gpr[0], 1);

            assert_eq!(arch::disable_depth(), 0);
        }

        #[test]
        fn lone_process_keeps_running() {
            let mut kernel = fresh_kernel();
            let alpha = kernel.spawn_kthread("alpha", never_runs, 0).unwrap();
            let mut frame = Context::default();
            kernel.start(&mut frame);

            let before = frame;
            kernel.timer_tick(&mut frame);
            kernel.yield_now(&mut frame);
            assert_eq!(kernel.current_pid(), Some(alpha));
            assert_eq!(frame, before);

            // A late spawn joins the rotation immediately.
            let beta = kernel.spawn_kthread("beta", never_runs, 0).unwrap();
            kernel.yield_now(&mut frame);
            assert_eq!(kernel.current_pid(), Some(beta));
        }

        #[test]
        fn timer_preemption_can_be_gated_off() {
            let mut kernel = fresh_kernel();
            let alpha = kernel.spawn_kthread("alpha", never_runs, 0).unwrap();
            let beta = kernel.spawn_kthread("beta", never_runs, 0).unwrap();
            let mut frame = Context::default();
            kernel.start(&mut frame);

            kernel.without_preemption(|k| {
                k.timer_tick(&mut frame);
                assert_eq!(k.current_pid(), Some(alpha));
                assert!(!k.preemption_enabled());
            });
            assert!(kernel.preemption_enabled());

            kernel.timer_tick(&mut frame);
            assert_eq!(kernel.current_pid(), Some(beta));
        }

        #[test]
        fn voluntary_yield_ignores_the_preemption_gate() {
            let mut kernel = fresh_kernel();
            let _alpha = kernel.spawn_kthread("alpha", never_runs, 0).unwrap();
            let beta = kernel.spawn_kthread("beta", never_runs, 0).unwrap();
            let mut frame = Context::default();
            kernel.start(&mut frame);

            let result = kernel.without_preemption(|k| {
                k.yield_now(&mut frame);
                assert_eq!(k.current_pid(), Some(beta));
                k.without_preemption(|inner| assert!(!inner.preemption_enabled()));
                assert!(!k.preemption_enabled());
                7
            });
            assert_eq!(result, 7);
            assert!(kernel.preemption_enabled());
        }

        #[test]
        #[should_panic(expected = "started with an empty process table")]
        fn starting_with_no_processes_panics() {
            let mut kernel = fresh_kernel();
            kernel.start(&mut Context::default());
        }
    }

    mod blocking {
        use super::*;

        #[test]
        fn woken_waiter_resumes_with_the_context_it_blocked_in() {
            let mut kernel = fresh_kernel();
            let alpha = kernel.spawn_kthread("alpha", never_runs, 0).unwrap();
            let beta = kernel.spawn_kthread("beta", never_runs, 0).unwrap();
            let mut frame = Context::default();
            let mut list = Waitlist::new();
            kernel.start(&mut frame);
            assert_eq!(kernel.current_pid(), Some(alpha));

            // Alpha blocks mid-computation.
            frame.gpr[2] = 0x4141_4141;
            frame.pc = 0xC000_8000;
            let resume_point = frame;
            kernel.wait(&mut frame, &mut list);

            assert_eq!(kernel.current_pid(), Some(beta));
            assert_eq!(kernel.process_state(alpha), Some(ProcessState::Blocked));
            assert!(list.contains(alpha));

            // Beta wakes alpha and yields; alpha is next in the rotation
            // and picks up exactly where it blocked.
            assert_eq!(kernel.wake_one(&mut list), Some(alpha));
            assert_eq!(kernel.process_state(alpha), Some(ProcessState::Ready));
            assert_eq!(kernel.current_pid(), Some(beta));
            kernel.yield_now(&mut frame);
            assert_eq!(kernel.current_pid(), Some(alpha));
            assert_eq!(frame, resume_point);
        }

        #[test]
        fn wakeups_are_first_in_first_out() {
            let mut kernel = fresh_kernel();
            let alpha = kernel.spawn_kthread("alpha", never_runs, 0).unwrap();
            let beta = kernel.spawn_kthread("beta", never_runs, 0).unwrap();
            let gamma = kernel.spawn_kthread("gamma", never_runs, 0).unwrap();
            let mut frame = Context::default();
            let mut list = Waitlist::new();
            kernel.start(&mut frame);

            kernel.wait(&mut frame, &mut list);
            assert_eq!(kernel.current_pid(), Some(beta));
            kernel.wait(&mut frame, &mut list);
            assert_eq!(kernel.current_pid(), Some(gamma));
            assert_eq!(list.len(), 2);

            assert_eq!(kernel.wake_one(&mut list), Some(alpha));
            assert_eq!(kernel.wake_one(&mut list), Some(beta));
            assert_eq!(kernel.wake_one(&mut list), None);
            assert_eq!(kernel.process_state(alpha), Some(ProcessState::Ready));
            assert_eq!(kernel.process_state(beta), Some(ProcessState::Ready));
        }

        #[test]
        fn wake_all_readies_every_waiter() {
            let mut kernel = fresh_kernel();
            let alpha = kernel.spawn_kthread("alpha", never_runs, 0).unwrap();
            let beta = kernel.spawn_kthread("beta", never_runs, 0).unwrap();
            let _gamma = kernel.spawn_kthread("gamma", never_runs, 0).unwrap();
            let mut frame = Context::default();
            let mut list = Waitlist::new();
            kernel.start(&mut frame);

            kernel.wait(&mut frame, &mut list);
            kernel.wait(&mut frame, &mut list);
            assert_eq!(kernel.wake_all(&mut list), 2);
            assert!(list.is_empty());
            assert_eq!(kernel.process_state(alpha), Some(ProcessState::Ready));
            assert_eq!(kernel.process_state(beta), Some(ProcessState::Ready));
        }

        #[test]
        #[should_panic(expected = "no runnable process")]
        fn blocking_the_last_runnable_process_panics() {
            let mut kernel = fresh_kernel();
            kernel.spawn_kthread("alpha", never_runs, 0).unwrap();
            let mut frame = Context::default();
            let mut list = Waitlist::new();
            kernel.start(&mut frame);
            kernel.wait(&mut frame, &mut list);
        }
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn exit_wakes_waiters_and_retires_the_pid() {
            let mut kernel = fresh_kernel();
            let first = kernel.spawn_kthread("first", never_runs, 0).unwrap();
            let second = kernel.spawn_kthread("second", never_runs, 0).unwrap();
            let main = kernel.spawn_kthread("main", never_runs, 0).unwrap();
            let free_before_worker = kernel.free_frame_count();
            let worker = kernel.spawn_kthread("worker", never_runs, 0).unwrap();

            let mut frame = Context::default();
            kernel.start(&mut frame);
            assert_eq!(kernel.current_pid(), Some(first));

            kernel.wait_for_exit(&mut frame, worker).unwrap();
            assert_eq!(kernel.current_pid(), Some(second));
            kernel.wait_for_exit(&mut frame, worker).unwrap();
            assert_eq!(kernel.current_pid(), Some(main));

            assert_eq!(
                kernel.wait_for_exit(&mut frame, main),
                Err(WaitError::SelfWait)
            );
            assert_eq!(
                kernel.wait_for_exit(&mut frame, Pid::new(999)),
                Err(WaitError::UnknownPid)
            );

            kernel.yield_now(&mut frame);
            assert_eq!(kernel.current_pid(), Some(worker));
            kernel.exit_current(&mut frame);

            // Both waiters woke in queue order; the first is already
            // scheduled because it follows the exited slot in the table.
            assert_eq!(kernel.current_pid(), Some(first));
            assert_eq!(kernel.process_state(second), Some(ProcessState::Ready));
            assert_eq!(kernel.process_state(worker), None);
            assert_eq!(kernel.process_count(), 3);
            assert_eq!(kernel.free_frame_count(), free_before_worker);

            // The dead pid never shows up in the rotation again.
            for _ in 0..6 {
                kernel.timer_tick(&mut frame);
                assert_ne!(kernel.current_pid(), Some(worker));
            }
        }

        #[test]
        fn spawn_reports_exhaustion_without_leaking() {
            let mut kernel = fresh_kernel();
            let err = loop {
                match kernel.spawn_kthread("filler", never_runs, 0) {
                    Ok(_) => continue,
                    Err(err) => break err,
                }
            };
            assert_eq!(err, SpawnError::OutOfMemory);

            kernel
                .images_mut()
                .register("hello", leak(build_image(0, b"\0\0\0\0", &[], 0)))
                .unwrap();
            let free = kernel.free_frame_count();
            assert_eq!(kernel.spawn_user("hello"), Err(SpawnError::OutOfMemory));
            assert_eq!(kernel.free_frame_count(), free);
        }

        #[test]
        fn unknown_image_is_rejected_up_front() {
            let mut kernel = fresh_kernel();
            let free = kernel.free_frame_count();
            assert_eq!(kernel.spawn_user("missing"), Err(SpawnError::UnknownImage));
            assert_eq!(kernel.free_frame_count(), free);
            assert_eq!(kernel.process_count(), 0);
        }
    }

    mod user_memory {
        use super::*;

        fn kernel_with_image(text: &[u8], data: &[u8], bss: u32) -> Kernel {
            let mut kernel = fresh_kernel();
            kernel
                .images_mut()
                .register("hello", leak(build_image(8, text, data, bss)))
                .unwrap();
            kernel
        }

        #[test]
        fn spawn_user_maps_text_data_bss_and_stack() {
            let text: Vec<u8> = (0u8..=255).cycle().take(PAGE_SIZE + 123).collect();
            let mut kernel = kernel_with_image(&text, b"greetings", 64);
            let pid = kernel.spawn_user("hello").unwrap();

            let proc = kernel.process(pid).unwrap();
            assert_eq!(proc.kind(), ProcessKind::User);
            assert_eq!(proc.name(), "hello");
            assert_eq!(proc.context().pc as usize, USER_IMAGE_BASE + 8);
            assert_eq!(proc.context().sp as usize, USER_STACK_TOP);
            assert_eq!(proc.context().spsr & CPSR_MODE_MASK, CPSR_MODE_USER);
            assert_eq!(proc.files().handle(1), Some(CONSOLE_HANDLE));

            let mut frame = Context::default();
            kernel.start(&mut frame);
            assert_eq!(kernel.current_pid(), Some(pid));

            // Text reads back byte for byte.
            let mut readback = vec![0u8; text.len()];
            kernel
                .copy_from_user(VirtualAddress::new(USER_IMAGE_BASE), &mut readback)
                .unwrap();
            assert_eq!(readback, text);

            // Data is initialised and the bss after it is zero.
            let rw_base = VirtualAddress::new(USER_IMAGE_BASE + 2 * PAGE_SIZE);
            let mut rw = [0xFFu8; 9 + 64];
            kernel.copy_from_user(rw_base, &mut rw).unwrap();
            assert_eq!(&rw[..9], b"greetings");
            assert!(rw[9..].iter().all(|&b| b == 0));

            // The stack is writable user memory.
            let sp_page = VirtualAddress::new(USER_STACK_TOP - PAGE_SIZE);
            kernel.copy_to_user(sp_page, b"stacked").unwrap();
            let mut stacked = [0u8; 7];
            kernel.copy_from_user(sp_page, &mut stacked).unwrap();
            assert_eq!(&stacked, b"stacked");
        }

        #[test]
        fn copies_respect_user_permissions() {
            let mut kernel = kernel_with_image(b"\0\0\0\0codecode", &[], 0);
            let pid = kernel.spawn_user("hello").unwrap();
            let mut frame = Context::default();
            kernel.start(&mut frame);
            assert_eq!(kernel.current_pid(), Some(pid));

            // Text is read-only to everyone but the loader.
            let text = VirtualAddress::new(USER_IMAGE_BASE);
            assert_eq!(
                kernel.copy_to_user(text, &[0]),
                Err(UserAccessError::Forbidden(text))
            );

            // A hole between the image and the stack.
            let hole = VirtualAddress::new(USER_IMAGE_BASE + 64 * PAGE_SIZE);
            assert_eq!(
                kernel.copy_from_user(hole, &mut [0u8; 4]),
                Err(UserAccessError::Unmapped(hole))
            );

            // The kernel half is mapped but never user accessible.
            let kernel_va = VirtualAddress::new(0xC000_0000);
            assert_eq!(
                kernel.copy_from_user(kernel_va, &mut [0u8; 4]),
                Err(UserAccessError::Forbidden(kernel_va))
            );
        }

        #[test]
        fn kernel_threads_have_no_user_memory() {
            let mut kernel = fresh_kernel();
            kernel.spawn_kthread("alpha", never_runs, 0).unwrap();
            let mut frame = Context::default();
            kernel.start(&mut frame);

            assert_eq!(
                kernel.copy_from_user(VirtualAddress::new(USER_IMAGE_BASE), &mut [0u8; 4]),
                Err(UserAccessError::Unmapped(VirtualAddress::new(
                    USER_IMAGE_BASE
                )))
            );
            assert!(
                kernel
                    .copy_to_user(VirtualAddress::new(0xC000_0000), &[0])
                    .is_err()
            );
        }

        #[test]
        fn exit_returns_every_frame_a_user_process_held() {
            let text: Vec<u8> = (0u8..=255).cycle().take(3 * PAGE_SIZE).collect();
            let mut kernel = kernel_with_image(&text, b"data", 4096);
            let idle = kernel.spawn_kthread("idle", never_runs, 0).unwrap();
            let free_before = kernel.free_frame_count();

            let pid = kernel.spawn_user("hello").unwrap();
            assert!(kernel.free_frame_count() < free_before);

            let mut frame = Context::default();
            kernel.start(&mut frame);
            kernel.yield_now(&mut frame);
            assert_eq!(kernel.current_pid(), Some(pid));

            kernel.exit_current(&mut frame);
            assert_eq!(kernel.current_pid(), Some(idle));
            assert_eq!(kernel.process_state(pid), None);
            assert_eq!(kernel.free_frame_count(), free_before);
        }
    }
}
