//! Physical frame pool.
//!
//! Owns every managed 4096-byte frame together with its `PhysPage`
//! record. Allocation is a LIFO freelist of frame indices. The record's
//! `refcount` is the number of address-space descriptors currently
//! mapping the frame: 1 after `alloc`, bumped by `dup` when a fork-clone
//! shares the frame, dropped by `free`; the frame returns to the pool
//! when it reaches zero. Kernel-private pages (page tables, directory
//! roots) simply live at refcount 1 until freed.

use alloc::vec::Vec;

use zerocopy::LayoutVerified;

use crate::addr::{Addr, PAddr};
use crate::error::{KernelError, Result};
use crate::memlayout::PHY_MM_START;
use crate::x86::{ENTRY_PER_TABLE, PAGE_SIZE};

/// One page frame, page-aligned.
#[repr(align(4096))]
pub struct Page {
    inner: [u8; PAGE_SIZE],
}

impl Page {
    pub const DEFAULT: Self = Self {
        inner: [0; PAGE_SIZE],
    };

    pub fn bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.inner
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.inner
    }
}

/// Book-keeping record, one per managed frame.
struct PhysPage {
    refcount: u32,
}

pub struct Kmem {
    base: PAddr,
    frames: Vec<Page>,
    pages: Vec<PhysPage>,
    free: Vec<u32>,
}

impl Kmem {
    /// Builds a pool of `nframes` frames starting at the bottom of the
    /// managed physical range.
    pub fn new(nframes: usize) -> Self {
        let base = PAddr::from(PHY_MM_START);
        let mut frames = Vec::with_capacity(nframes);
        let mut pages = Vec::with_capacity(nframes);
        for _ in 0..nframes {
            frames.push(Page::DEFAULT);
            pages.push(PhysPage { refcount: 0 });
        }
        let mut kmem = Self {
            base,
            frames,
            pages,
            free: Vec::with_capacity(nframes),
        };
        let start = kmem.base.into_usize();
        for pa in num_iter::range_step(start, start + nframes * PAGE_SIZE, PAGE_SIZE) {
            let idx = kmem.index_of(PAddr::from(pa));
            kmem.free.push(idx as u32);
        }
        kmem
    }

    fn index_of(&self, pa: PAddr) -> usize {
        debug_assert!(pa.is_page_aligned());
        let off = pa
            .into_usize()
            .checked_sub(self.base.into_usize())
            .expect("frame below managed range");
        let idx = off / PAGE_SIZE;
        assert!(idx < self.frames.len(), "frame beyond managed range");
        idx
    }

    /// Takes a frame off the freelist with refcount 1. The contents are
    /// whatever the previous owner left there; callers that need zeroes
    /// say so.
    pub fn alloc(&mut self) -> Option<PAddr> {
        let idx = self.free.pop()? as usize;
        debug_assert_eq!(self.pages[idx].refcount, 0);
        self.pages[idx].refcount = 1;
        Some(self.base + idx * PAGE_SIZE)
    }

    /// Records one more address space mapping the frame.
    pub fn dup(&mut self, pa: PAddr) {
        let idx = self.index_of(pa);
        assert!(self.pages[idx].refcount > 0, "dup of free frame");
        self.pages[idx].refcount += 1;
    }

    /// Drops one mapping; the frame is reclaimed at zero.
    pub fn free(&mut self, pa: PAddr) {
        let idx = self.index_of(pa);
        assert!(self.pages[idx].refcount > 0, "free of free frame");
        self.pages[idx].refcount -= 1;
        if self.pages[idx].refcount == 0 {
            self.free.push(idx as u32);
        }
    }

    pub fn refcount(&self, pa: PAddr) -> u32 {
        self.pages[self.index_of(pa)].refcount
    }

    /// Frames currently on the freelist.
    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    pub fn frame(&self, pa: PAddr) -> &[u8; PAGE_SIZE] {
        self.frames[self.index_of(pa)].bytes()
    }

    pub fn frame_mut(&mut self, pa: PAddr) -> &mut [u8; PAGE_SIZE] {
        let idx = self.index_of(pa);
        self.frames[idx].bytes_mut()
    }

    pub fn zero_frame(&mut self, pa: PAddr) {
        for b in self.frame_mut(pa).iter_mut() {
            *b = 0;
        }
    }

    /// Copies a whole frame, used by the copy-on-write resolver.
    pub fn copy_frame(&mut self, src: PAddr, dst: PAddr) {
        let si = self.index_of(src);
        let di = self.index_of(dst);
        assert_ne!(si, di, "copy_frame onto itself");
        if si < di {
            let (lo, hi) = self.frames.split_at_mut(di);
            hi[0].bytes_mut().copy_from_slice(lo[si].bytes());
        } else {
            let (lo, hi) = self.frames.split_at_mut(si);
            lo[di].bytes_mut().copy_from_slice(hi[0].bytes());
        }
    }

    /// The frame viewed as a page directory / page table.
    pub fn table(&self, pa: PAddr) -> &[u32] {
        let lv = LayoutVerified::<&[u8], [u32]>::new_slice(&self.frame(pa)[..])
            .expect("page-table view");
        debug_assert_eq!(lv.len(), ENTRY_PER_TABLE);
        lv.into_slice()
    }

    pub fn table_mut(&mut self, pa: PAddr) -> &mut [u32] {
        let lv = LayoutVerified::<&mut [u8], [u32]>::new_slice(&mut self.frame_mut(pa)[..])
            .expect("page-table view");
        lv.into_mut_slice()
    }

    /// A convenience for error paths: allocate or fail with
    /// `OutOfMemory`.
    pub fn try_alloc(&mut self) -> Result<PAddr> {
        self.alloc().ok_or(KernelError::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_cycle() {
        let mut kmem = Kmem::new(4);
        assert_eq!(kmem.free_frames(), 4);
        let a = kmem.alloc().unwrap();
        let b = kmem.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(kmem.refcount(a), 1);
        kmem.free(a);
        assert_eq!(kmem.free_frames(), 3);
        kmem.free(b);
        assert_eq!(kmem.free_frames(), 4);
    }

    #[test]
    fn shared_frame_survives_one_free() {
        let mut kmem = Kmem::new(2);
        let a = kmem.alloc().unwrap();
        kmem.dup(a);
        assert_eq!(kmem.refcount(a), 2);
        kmem.free(a);
        assert_eq!(kmem.refcount(a), 1);
        assert_eq!(kmem.free_frames(), 1);
        kmem.free(a);
        assert_eq!(kmem.free_frames(), 2);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut kmem = Kmem::new(1);
        let a = kmem.alloc().unwrap();
        assert!(kmem.alloc().is_none());
        kmem.free(a);
        assert!(kmem.alloc().is_some());
    }

    #[test]
    fn frame_copy_is_exact() {
        let mut kmem = Kmem::new(2);
        let a = kmem.alloc().unwrap();
        let b = kmem.alloc().unwrap();
        kmem.frame_mut(a)[0] = 0xAA;
        kmem.frame_mut(a)[PAGE_SIZE - 1] = 0x55;
        kmem.copy_frame(a, b);
        assert_eq!(kmem.frame(b)[0], 0xAA);
        assert_eq!(kmem.frame(b)[PAGE_SIZE - 1], 0x55);
    }
}
