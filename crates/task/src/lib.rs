//! Process management for the kernel: process control blocks, saved
//! execution contexts, wait queues, user image loading, and the [`Kernel`]
//! object that ties them to a scheduler.
//!
//! The crate is deliberately free of global state. The kernel binary owns
//! the single [`Kernel`] instance and hands every operation the live trap
//! frame; on the host the test suite constructs as many instances as it
//! likes and drives them with synthetic frames.
#![cfg_attr(all(target_arch = "arm", not(test)), no_std)]

extern crate alloc;

pub mod arch;
mod context;
mod image;
mod kernel;
mod process;
mod scheduler;
mod waitlist;

pub use context::{
    CPSR_IRQ_DISABLE, CPSR_MODE_IRQ, CPSR_MODE_MASK, CPSR_MODE_SVC, CPSR_MODE_USER, Context,
    ThreadEntry,
};
pub use image::{
    Image, ImageError, ImageHeader, ImageRegistry, USER_IMAGE_BASE, USER_STACK_PAGES,
    USER_STACK_TOP,
};
pub use kernel::{KERNEL_STACK_PAGES, Kernel, SpawnError, WaitError};
pub use process::{CONSOLE_HANDLE, FdTable, NOFILE, Pid, Process, ProcessKind, ProcessState};
pub use waitlist::Waitlist;
