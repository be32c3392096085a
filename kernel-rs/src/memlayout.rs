//! Physical and virtual memory map.
//!
//! The machine is x86-32 with a flat layout: all managed physical memory
//! is aliased into kernel space at a fixed offset, so translating between
//! a physical address and its kernel virtual alias is pure arithmetic.
//!
//! ```text
//! user       0x0000_0000 .. 0xC000_0000   per-task, demand paged
//! kernel     0xC000_0000 .. 0xC040_0000   kernel code/data (first 4 MiB)
//!            0xC040_0000 ..               alias of managed physical memory
//! ```

use crate::addr::{Addr, KVAddr, PAddr};

/// First managed physical address (everything below is BIOS/legacy).
pub const PHY_MM_START: usize = 0x10_0000;

/// Size of the managed physical range.
pub const PHY_MM_SIZE: usize = 124 * 1024 * 1024;

/// Kernel virtual base; also the top of user space.
pub const KERNEL_VMM_START: usize = 0xC000_0000;

/// Kernel code/data reservation at the bottom of kernel space.
pub const KERNEL_SIZE: usize = 0x40_0000;

/// Physical home of the boot page tables that map kernel space. Every
/// address space shares these tables; their directory entries are copied
/// verbatim and never torn down.
pub const INIT_PAGE_TABLES_START: usize = 0x40_2000;

/// User stack top, growing down.
pub const USER_STACK_TOP: usize = 0xC000_0000;

/// Maximum user stack span, 1 GiB.
pub const USER_STACK_LEN: usize = 0x4000_0000;

/// Bottom of the default user heap area.
pub const USER_HEAP_START: usize = 0x4000_0000;

/// Default user heap span, 16 MiB.
pub const USER_HEAP_DEFAULT_LEN: usize = 0x100_0000;

/// Kernel virtual alias of a managed physical address.
pub fn paddr_to_kvaddr(pa: PAddr) -> KVAddr {
    let pa = pa.into_usize();
    debug_assert!(pa < PHY_MM_START + PHY_MM_SIZE, "paddr out of managed range");
    KVAddr::from(pa + KERNEL_VMM_START)
}

/// Physical address behind a kernel virtual alias.
pub fn kvaddr_to_paddr(va: KVAddr) -> PAddr {
    let va = va.into_usize();
    debug_assert!(va >= KERNEL_VMM_START, "not a kernel alias");
    PAddr::from(va - KERNEL_VMM_START)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_round_trip() {
        let pa = PAddr::from(PHY_MM_START);
        let va = paddr_to_kvaddr(pa);
        assert_eq!(va.into_usize(), 0xC010_0000);
        assert_eq!(kvaddr_to_paddr(va), pa);
    }
}
