//! x86-32 paging and trap machinery.
//!
//! Two-level paging: a page directory of 1024 entries, each covering
//! 4 MiB through a page table of 1024 entries. Directory and table
//! entries share one word format, so a single set of codecs serves both.
//! All helpers here are pure; walking tables on behalf of a task is the
//! `vm` module's business.

use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::addr::{Addr, PAddr, UVAddr};
use crate::memlayout::KERNEL_VMM_START;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Entries per page directory / page table.
pub const ENTRY_PER_TABLE: usize = 1024;

/// Directory slots below this index map user space; slots at or above it
/// map kernel space and are shared by every address space.
pub const USER_PDE_NUM: usize = KERNEL_VMM_START >> 22;

bitflags! {
    /// Low bits of a directory or table entry.
    pub struct PteFlags: u32 {
        const PRESENT = 1;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

bitflags! {
    /// Page-fault hardware error code. Bit 0 distinguishes "present,
    /// access violation" from "not present".
    pub struct FaultCode: u32 {
        const PRESENT = 1;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
    }
}

pub fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub fn pg_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Directory slot covering a user virtual address.
pub fn pde_index(va: UVAddr) -> usize {
    va.into_usize() >> 22
}

/// Table slot covering a user virtual address.
pub fn pte_index(va: UVAddr) -> usize {
    (va.into_usize() >> PAGE_SHIFT) & (ENTRY_PER_TABLE - 1)
}

/// Builds a directory or table entry.
pub fn make_entry(pa: PAddr, flags: PteFlags) -> u32 {
    debug_assert!(pa.is_page_aligned());
    pa.into_usize() as u32 | flags.bits()
}

pub fn entry_paddr(entry: u32) -> PAddr {
    PAddr::from((entry & !(PAGE_SIZE as u32 - 1)) as usize)
}

pub fn entry_flags(entry: u32) -> PteFlags {
    PteFlags::from_bits_truncate(entry)
}

pub fn entry_present(entry: u32) -> bool {
    entry_flags(entry).contains(PteFlags::PRESENT)
}

pub fn entry_writable(entry: u32) -> bool {
    entry_flags(entry).contains(PteFlags::WRITABLE)
}

pub fn clear_writable(entry: u32) -> u32 {
    entry & !PteFlags::WRITABLE.bits()
}

pub fn set_writable(entry: u32) -> u32 {
    entry | PteFlags::WRITABLE.bits()
}

/// Kernel code segment selector.
pub const GDT_KERNEL_CS: u32 = 0x08;
/// User code/data selectors (RPL 3).
pub const GDT_USER_CS: u32 = 0x1b;
pub const GDT_USER_DS: u32 = 0x23;

/// EFLAGS interrupt-enable bit, set on every user-space frame.
pub const EFLAGS_IF: u32 = 0x200;

/// Linear address of the trap-return stub in kernel text. The schedule
/// frame built for a forked child resumes here so the child falls out of
/// the trap path as if it had entered it itself.
pub const TRAP_RET_STUB: u32 = 0xC000_8000;

/// Register block pushed by the trap entry stub. The layout must match
/// the assembly bit for bit; everything else reads it through the named
/// accessors.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub trap_num: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

const_assert!(mem::size_of::<TrapFrame>() == 19 * 4);

impl TrapFrame {
    /// Frame for the first entry into user space.
    pub fn user_entry(entry: u32, stack: u32) -> Self {
        TrapFrame {
            ds: GDT_USER_DS,
            es: GDT_USER_DS,
            fs: GDT_USER_DS,
            gs: GDT_USER_DS,
            eip: entry,
            cs: GDT_USER_CS,
            eflags: EFLAGS_IF,
            user_esp: stack,
            user_ss: GDT_USER_DS,
            ..TrapFrame::default()
        }
    }

    pub fn syscall_num(&self) -> u32 {
        self.eax
    }

    pub fn arg1(&self) -> u32 {
        self.ebx
    }

    pub fn arg2(&self) -> u32 {
        self.ecx
    }

    pub fn arg3(&self) -> u32 {
        self.edx
    }

    /// Writes a syscall result into the accumulator slot.
    pub fn set_return(&mut self, val: i32) {
        self.eax = val as u32;
    }
}

/// Callee-saved frame consumed by the low-level switch. A new task's
/// kernel stack carries one of these under its trap frame so the first
/// switch "returns" into the trap-return stub.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, AsBytes)]
pub struct SchedFrame {
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub eflags: u32,
    pub eip: u32,
}

const_assert!(mem::size_of::<SchedFrame>() == 9 * 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_codec_round_trip() {
        let pa = PAddr::from(0x1234_5000);
        let e = make_entry(pa, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER);
        assert_eq!(entry_paddr(e), pa);
        assert!(entry_present(e));
        assert!(entry_writable(e));
        let e = clear_writable(e);
        assert!(!entry_writable(e));
        assert!(entry_present(e));
        assert_eq!(entry_paddr(e), pa);
    }

    #[test]
    fn index_split() {
        let va = UVAddr::from(0x4000_0123);
        assert_eq!(pde_index(va), 0x100);
        assert_eq!(pte_index(va), 0);
        assert_eq!(pg_round_down(0x4000_0123), 0x4000_0000);
        assert_eq!(pg_round_up(0x4000_0123), 0x4000_1000);
    }

    #[test]
    fn kernel_base_splits_directory() {
        assert_eq!(USER_PDE_NUM, 768);
    }
}
