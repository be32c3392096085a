//! minos: a small preemptive multitasking kernel for x86-32.
//!
//! Three cores carry the design: the task/scheduler core (`proc`), the
//! virtual-memory core with fork-time copy-on-write (`vm`, `kalloc`),
//! and the VFS core with its inode and data-buffer caches (`fs`,
//! `file`, `pipe`, `console`). The syscall boundary (`syscall`, `trap`,
//! `x86`) ties them together under the single [`kernel::Kernel`]
//! object.
//!
//! The boot loader, interrupt controller programming, trap entry
//! stubs, and the on-disk ext2 driver are external collaborators; the
//! kernel reaches them through the contracts in `trap` and `fs::disk`,
//! which is also how the hosted tests drive it.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate bitflags;
#[cfg(test)]
extern crate std;

pub mod addr;
pub mod console;
pub mod error;
pub mod exec;
pub mod file;
pub mod fs;
pub mod kalloc;
pub mod kernel;
pub mod memlayout;
pub mod param;
pub mod pipe;
pub mod proc;
pub mod syscall;
pub mod trap;
pub mod vm;
pub mod x86;
