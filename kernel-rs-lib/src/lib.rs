//! Reusable building blocks for the minos kernel.
//!
//! Nothing in this crate knows about tasks, inodes, or page tables; it
//! provides the two mechanisms the kernel leans on everywhere:
//!
//! * [`arena`] — fixed-capacity slabs of reference-counted objects
//!   addressed by typed handles.
//! * [`lock`] — the interrupt-enable bit as a scoped token, the only
//!   mutual-exclusion primitive a single-CPU kernel needs.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod arena;
pub mod lock;
