//! Per-task virtual memory.
//!
//! An [`AddrSpace`] is a page-directory root plus an ordered list of
//! [`VmArea`]s. Nothing is mapped eagerly: the first touch of a page
//! takes a not-present fault, and the resolver builds the page from the
//! areas overlapping it. Fork clones an address space by duplicating
//! the page tables, clearing the writable bit on both sides, and
//! bumping the mapper count of every shared frame; the first write on
//! either side takes an access-violation fault and is resolved by
//! copying the frame (or just re-enabling the write when the sharing is
//! already gone).
//!
//! Kernel accesses to user memory go through the copy helpers below,
//! which probe mappings through the same fault resolver and surface
//! `Fault` for ranges the descriptor cannot back.

use alloc::string::String;
use alloc::vec::Vec;

use minos_kernel_lib::arena::Handle;
use scopeguard::ScopeGuard;

use crate::addr::{Addr, PAddr, UVAddr};
use crate::error::{KernelError, Result};
use crate::file::FileId;
use crate::fs::Vfs;
use crate::kalloc::Kmem;
use crate::memlayout::{INIT_PAGE_TABLES_START, KERNEL_VMM_START};
use crate::x86::{
    clear_writable, entry_paddr, entry_present, entry_writable, make_entry, pde_index, pg_round_down,
    pg_round_up, pte_index, set_writable, FaultCode, PteFlags, ENTRY_PER_TABLE, PAGE_SIZE,
    USER_PDE_NUM,
};

bitflags! {
    /// Virtual-area permissions and fill policy.
    pub struct AreaFlags: u32 {
        const WRITE = 1;
        const ALLOC = 1 << 1;
        const EXEC = 1 << 2;
        /// Zero the page before any populate hook runs.
        const ZERO = 1 << 3;
    }
}

/// Distinguished roles an area can play in its address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AreaTag {
    Plain,
    Heap,
    Stack,
}

/// Where the bytes of a freshly touched page come from. `Image` pulls
/// from the address space's executable file; plain areas rely on the
/// `ZERO` flag alone.
#[derive(Clone, Copy, Debug)]
pub enum AreaSource {
    None,
    Image { file_offset: u32, file_len: u32 },
}

/// A half-open range `[start, start + len)` of user address space with
/// uniform permissions and fill policy.
#[derive(Clone, Debug)]
pub struct VmArea {
    pub start: usize,
    pub len: usize,
    pub flags: AreaFlags,
    pub tag: AreaTag,
    pub source: AreaSource,
}

impl VmArea {
    pub fn new(start: usize, len: usize, flags: AreaFlags) -> Self {
        Self {
            start,
            len,
            flags,
            tag: AreaTag::Plain,
            source: AreaSource::None,
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    fn overlaps(&self, lo: usize, hi: usize) -> bool {
        self.start < hi && lo < self.end()
    }
}

pub type AsId = Handle<AddrSpace>;

/// Fault-resolver statistics, kept by the kernel object.
#[derive(Default)]
pub struct VmStats {
    pub not_present: u64,
    pub cow_copies: u64,
    pub write_enables: u64,
}

/// What the resolver did about a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultFix {
    /// Not-present: a fresh page was populated and mapped.
    Mapped,
    /// Access violation on a shared frame: copied and remapped.
    Copied,
    /// Access violation on an exclusively held frame: write re-enabled.
    Promoted,
}

/// Everything the fault resolver may touch besides the address space.
pub struct FaultCtx<'a> {
    pub kmem: &'a mut Kmem,
    pub vfs: &'a mut Vfs,
    pub stats: &'a mut VmStats,
}

/// Directory entry for one kernel-space slot. The boot page tables are
/// set up before the first task exists and shared by every address
/// space; user-memory walks never descend through them.
fn kernel_pde(slot: usize) -> u32 {
    debug_assert!(slot >= USER_PDE_NUM);
    let table = INIT_PAGE_TABLES_START + (slot - USER_PDE_NUM) * PAGE_SIZE;
    make_entry(
        PAddr::from(table),
        PteFlags::PRESENT | PteFlags::WRITABLE,
    )
}

#[derive(Debug)]
pub struct AddrSpace {
    /// Physical address of the page-directory root, allocated lazily.
    pgdir: Option<PAddr>,
    /// Sorted ascending by `start`; no two areas overlap.
    areas: Vec<VmArea>,
    /// Backing file for `Image`-sourced areas; the owner holds one file
    /// reference, dropped by the kernel on teardown.
    pub exec_image: Option<FileId>,
}

impl AddrSpace {
    pub fn new() -> Self {
        Self {
            pgdir: None,
            areas: Vec::new(),
            exec_image: None,
        }
    }

    pub fn pgdir(&self) -> Option<PAddr> {
        self.pgdir
    }

    pub fn areas(&self) -> &[VmArea] {
        &self.areas
    }

    /// Places `area` in the sorted list, refusing any intersection with
    /// its would-be predecessor or successor.
    pub fn insert_area(&mut self, area: VmArea) -> Result<()> {
        let pos = self
            .areas
            .iter()
            .position(|a| a.start > area.start)
            .unwrap_or(self.areas.len());
        if pos > 0 && self.areas[pos - 1].end() > area.start {
            return Err(KernelError::Overlap);
        }
        if pos < self.areas.len() && area.end() > self.areas[pos].start {
            return Err(KernelError::Overlap);
        }
        self.areas.insert(pos, area);
        Ok(())
    }

    /// The area containing `addr`, else the greatest area starting at
    /// or below it (an insertion-point probe for callers).
    pub fn search_area(&self, addr: usize) -> Option<&VmArea> {
        let mut best = None;
        for a in &self.areas {
            if a.start <= addr {
                best = Some(a);
            } else {
                break;
            }
        }
        best
    }

    /// Grows the heap area by `delta` bytes, refusing to run into the
    /// next area. Returns the old break.
    pub fn grow_heap(&mut self, delta: usize) -> Result<usize> {
        let idx = self
            .areas
            .iter()
            .position(|a| a.tag == AreaTag::Heap)
            .ok_or(KernelError::InvalidArgument)?;
        let old_end = self.areas[idx].end();
        let new_end = old_end.checked_add(delta).ok_or(KernelError::Overlap)?;
        if let Some(next) = self.areas.get(idx + 1) {
            if new_end > next.start {
                return Err(KernelError::Overlap);
            }
        }
        if new_end > KERNEL_VMM_START {
            return Err(KernelError::Overlap);
        }
        self.areas[idx].len += delta;
        Ok(old_end)
    }

    /// Shrinks the heap, unmapping and releasing the frames in the
    /// abandoned range. Returns the old break.
    pub fn shrink_heap(&mut self, kmem: &mut Kmem, delta: usize) -> Result<usize> {
        let idx = self
            .areas
            .iter()
            .position(|a| a.tag == AreaTag::Heap)
            .ok_or(KernelError::InvalidArgument)?;
        if delta > self.areas[idx].len {
            return Err(KernelError::InvalidArgument);
        }
        let old_end = self.areas[idx].end();
        let new_end = old_end - delta;
        self.areas[idx].len -= delta;
        self.unmap_range(kmem, pg_round_up(new_end), old_end);
        Ok(old_end)
    }

    fn unmap_range(&mut self, kmem: &mut Kmem, lo: usize, hi: usize) {
        let pgdir = match self.pgdir {
            Some(p) => p,
            None => return,
        };
        let mut va = pg_round_up(lo);
        while va < hi {
            let uva = UVAddr::from(va);
            let pde = kmem.table(pgdir)[pde_index(uva)];
            if entry_present(pde) {
                let pt = entry_paddr(pde);
                let pte = kmem.table(pt)[pte_index(uva)];
                if entry_present(pte) {
                    kmem.free(entry_paddr(pte));
                    kmem.table_mut(pt)[pte_index(uva)] = 0;
                }
            }
            va += PAGE_SIZE;
        }
    }

    /// Allocates the page-directory root if it does not exist yet and
    /// installs the shared kernel-space entries.
    pub fn ensure_pgdir(&mut self, kmem: &mut Kmem) -> Result<PAddr> {
        if let Some(pa) = self.pgdir {
            return Ok(pa);
        }
        let pa = kmem.try_alloc()?;
        kmem.zero_frame(pa);
        let table = kmem.table_mut(pa);
        for i in USER_PDE_NUM..ENTRY_PER_TABLE {
            table[i] = kernel_pde(i);
        }
        self.pgdir = Some(pa);
        Ok(pa)
    }

    /// Maps one user page. A missing page table is allocated on the
    /// way; on allocation failure nothing is changed.
    pub fn map(&mut self, kmem: &mut Kmem, va: usize, pa: PAddr, writable: bool) -> Result<()> {
        let pgdir = self.ensure_pgdir(kmem)?;
        let uva = UVAddr::from(va);
        let pdei = pde_index(uva);
        debug_assert!(pdei < USER_PDE_NUM, "user mapping in kernel space");
        let pde = kmem.table(pgdir)[pdei];
        let pt = if entry_present(pde) {
            entry_paddr(pde)
        } else {
            let pt = kmem.try_alloc()?;
            kmem.zero_frame(pt);
            kmem.table_mut(pgdir)[pdei] =
                make_entry(pt, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER);
            pt
        };
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        kmem.table_mut(pt)[pte_index(uva)] = make_entry(pa, flags);
        Ok(())
    }

    /// Walks the page tables for `va`. Returns the backing frame and
    /// whether the mapping is writable.
    pub fn translate(&self, kmem: &Kmem, va: usize) -> Option<(PAddr, bool)> {
        let pgdir = self.pgdir?;
        let uva = UVAddr::from(va);
        let pde = kmem.table(pgdir)[pde_index(uva)];
        if !entry_present(pde) {
            return None;
        }
        let pte = kmem.table(entry_paddr(pde))[pte_index(uva)];
        if !entry_present(pte) {
            return None;
        }
        Some((entry_paddr(pte), entry_writable(pte)))
    }

    fn set_pte_writable(&self, kmem: &mut Kmem, va: usize) {
        let pgdir = self.pgdir.expect("writable fixup without page tables");
        let uva = UVAddr::from(va);
        let pde = kmem.table(pgdir)[pde_index(uva)];
        debug_assert!(entry_present(pde));
        let pt = entry_paddr(pde);
        let pte = kmem.table(pt)[pte_index(uva)];
        kmem.table_mut(pt)[pte_index(uva)] = set_writable(pte);
    }

    /// Copy-on-write snapshot: duplicated areas, a fresh directory with
    /// the kernel entries copied verbatim, duplicated user page tables
    /// with the writable bit cleared on both sides, and shared frames.
    /// On any allocation failure every partially allocated page-table
    /// page is returned to the pool.
    pub fn clone_cow(&self, kmem: &mut Kmem) -> Result<AddrSpace> {
        let mut new = AddrSpace::new();
        new.areas = self.areas.clone();
        new.exec_image = self.exec_image;
        let src_pgdir = match self.pgdir {
            Some(p) => p,
            None => return Ok(new),
        };

        // Allocation phase: nothing shared is touched, so the rollback
        // guard only has to return fresh pages to the pool.
        let mut ctx = scopeguard::guard(CloneAlloc { kmem, pages: Vec::new() }, |c| {
            for pa in c.pages {
                c.kmem.free(pa);
            }
        });
        let dst_pgdir = {
            let pa = ctx.kmem.try_alloc()?;
            ctx.pages.push(pa);
            ctx.kmem.zero_frame(pa);
            pa
        };
        for i in USER_PDE_NUM..ENTRY_PER_TABLE {
            let e = ctx.kmem.table(src_pgdir)[i];
            ctx.kmem.table_mut(dst_pgdir)[i] = e;
        }
        for i in 0..USER_PDE_NUM {
            let pde = ctx.kmem.table(src_pgdir)[i];
            if !entry_present(pde) {
                continue;
            }
            let src_pt = entry_paddr(pde);
            let dst_pt = ctx.kmem.try_alloc()?;
            ctx.pages.push(dst_pt);
            ctx.kmem.copy_frame(src_pt, dst_pt);
            let table = ctx.kmem.table_mut(dst_pt);
            for j in 0..ENTRY_PER_TABLE {
                table[j] = clear_writable(table[j]);
            }
            ctx.kmem.table_mut(dst_pgdir)[i] = make_entry(
                dst_pt,
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
            );
        }
        let CloneAlloc { kmem, .. } = ScopeGuard::into_inner(ctx);

        // Commit phase: share every mapped frame and make both sides
        // fault on their next write. The hardware TLB would be flushed
        // here; the switch path reloads the directory root anyway.
        for i in 0..USER_PDE_NUM {
            let pde = kmem.table(src_pgdir)[i];
            if !entry_present(pde) {
                continue;
            }
            let src_pt = entry_paddr(pde);
            for j in 0..ENTRY_PER_TABLE {
                let pte = kmem.table(src_pt)[j];
                if entry_present(pte) {
                    kmem.dup(entry_paddr(pte));
                    kmem.table_mut(src_pt)[j] = clear_writable(pte);
                }
            }
        }
        new.pgdir = Some(dst_pgdir);
        Ok(new)
    }

    /// Tears the address space down: every mapped frame drops one
    /// mapper, page tables and the directory root go back to the pool.
    /// The caller drops the executable-image reference.
    pub fn release(mut self, kmem: &mut Kmem) {
        if let Some(pgdir) = self.pgdir.take() {
            for i in 0..USER_PDE_NUM {
                let pde = kmem.table(pgdir)[i];
                if !entry_present(pde) {
                    continue;
                }
                let pt = entry_paddr(pde);
                for j in 0..ENTRY_PER_TABLE {
                    let pte = kmem.table(pt)[j];
                    if entry_present(pte) {
                        kmem.free(entry_paddr(pte));
                    }
                }
                kmem.free(pt);
            }
            kmem.free(pgdir);
        }
    }
}

struct CloneAlloc<'a> {
    kmem: &'a mut Kmem,
    pages: Vec<PAddr>,
}

// ----------------------------------------------------------------------
// Fault resolution
// ----------------------------------------------------------------------

/// Resolves a page fault against the task's address space.
///
/// * Kernel-range addresses are fatal (`SegmentError`).
/// * Not-present: a fresh frame is built from every overlapping area
///   (zero-fill first when asked, then populate), and mapped writable
///   iff any overlapping area is.
/// * Access violation on a write: copy-on-write when the frame is still
///   shared, write re-enable when it is not, fatal when no overlapping
///   area permits writing.
///
/// Allocation failures surface as `OutOfMemory`; the trap layer kills
/// the task for them, the copy helpers report the error.
pub fn handle_fault(
    mm: &mut AddrSpace,
    ctx: &mut FaultCtx<'_>,
    fault_va: usize,
    code: FaultCode,
) -> Result<FaultFix> {
    if fault_va >= KERNEL_VMM_START {
        return Err(KernelError::SegmentError);
    }
    if code.contains(FaultCode::PRESENT) {
        fault_access(mm, ctx, fault_va, code)
    } else {
        fault_no_page(mm, ctx, fault_va)
    }
}

fn fault_no_page(mm: &mut AddrSpace, ctx: &mut FaultCtx<'_>, fault_va: usize) -> Result<FaultFix> {
    let page = pg_round_down(fault_va);
    let mut writable = false;
    let mut zero = false;
    let mut any = false;
    // (offset in page, offset in image, length)
    let mut fills: Vec<(usize, u32, usize)> = Vec::new();
    for area in &mm.areas {
        if area.start >= page + PAGE_SIZE {
            break;
        }
        if !area.overlaps(page, page + PAGE_SIZE) {
            continue;
        }
        any = true;
        writable |= area.flags.contains(AreaFlags::WRITE);
        zero |= area.flags.contains(AreaFlags::ZERO);
        if let AreaSource::Image { file_offset, file_len } = area.source {
            let data_end = area.start + (file_len as usize).min(area.len);
            let lo = page.max(area.start);
            let hi = (page + PAGE_SIZE).min(data_end);
            if lo < hi {
                let in_file = file_offset + (lo - area.start) as u32;
                fills.push((lo - page, in_file, hi - lo));
            }
        }
    }
    if !any {
        return Err(KernelError::SegmentError);
    }
    let FaultCtx { kmem, vfs, stats } = &mut *ctx;
    let pa = kmem.try_alloc()?;
    if zero {
        kmem.zero_frame(pa);
    }
    for (dst_off, file_off, len) in fills {
        let fid = match mm.exec_image {
            Some(f) => f,
            None => {
                kmem.free(pa);
                return Err(KernelError::SegmentError);
            }
        };
        let inode = vfs.files.get(fid).inode;
        let frame = kmem.frame_mut(pa);
        if let Err(e) = vfs.read_at(inode, file_off, &mut frame[dst_off..dst_off + len]) {
            kmem.free(pa);
            return Err(e);
        }
    }
    if let Err(e) = mm.map(kmem, page, pa, writable) {
        kmem.free(pa);
        return Err(e);
    }
    stats.not_present += 1;
    Ok(FaultFix::Mapped)
}

fn fault_access(
    mm: &mut AddrSpace,
    ctx: &mut FaultCtx<'_>,
    fault_va: usize,
    code: FaultCode,
) -> Result<FaultFix> {
    if !code.contains(FaultCode::WRITE) {
        return Err(KernelError::SegmentError);
    }
    let page = pg_round_down(fault_va);
    let kmem = &mut *ctx.kmem;
    let (frame, already_writable) = mm
        .translate(kmem, page)
        .ok_or(KernelError::SegmentError)?;
    debug_assert!(!already_writable, "write fault on writable mapping");
    let allowed = mm
        .areas
        .iter()
        .any(|a| a.overlaps(page, page + PAGE_SIZE) && a.flags.contains(AreaFlags::WRITE));
    if !allowed {
        return Err(KernelError::SegmentError);
    }
    if kmem.refcount(frame) > 1 {
        let new = kmem.try_alloc()?;
        kmem.copy_frame(frame, new);
        kmem.free(frame);
        mm.map(kmem, page, new, true)?;
        ctx.stats.cow_copies += 1;
        Ok(FaultFix::Copied)
    } else {
        mm.set_pte_writable(kmem, page);
        ctx.stats.write_enables += 1;
        Ok(FaultFix::Promoted)
    }
}

/// `SegmentError` from a kernel-side probe is a bad user pointer, not a
/// dead task.
fn fault_to_copy_err(e: KernelError) -> KernelError {
    match e {
        KernelError::SegmentError => KernelError::Fault,
        other => other,
    }
}

fn resolve_for_write(
    mm: &mut AddrSpace,
    ctx: &mut FaultCtx<'_>,
    page: usize,
) -> Result<PAddr> {
    loop {
        match mm.translate(ctx.kmem, page) {
            Some((frame, true)) => return Ok(frame),
            Some((_, false)) => {
                handle_fault(mm, ctx, page, FaultCode::PRESENT | FaultCode::WRITE)
                    .map_err(fault_to_copy_err)?;
            }
            None => {
                handle_fault(mm, ctx, page, FaultCode::WRITE).map_err(fault_to_copy_err)?;
            }
        }
    }
}

fn resolve_for_read(mm: &mut AddrSpace, ctx: &mut FaultCtx<'_>, page: usize) -> Result<PAddr> {
    loop {
        match mm.translate(ctx.kmem, page) {
            Some((frame, _)) => return Ok(frame),
            None => {
                handle_fault(mm, ctx, page, FaultCode::empty()).map_err(fault_to_copy_err)?;
            }
        }
    }
}

/// Copies kernel bytes into user space, faulting pages in (and breaking
/// copy-on-write sharing) as needed.
pub fn copy_to_user(
    mm: &mut AddrSpace,
    ctx: &mut FaultCtx<'_>,
    dst: UVAddr,
    src: &[u8],
) -> Result<()> {
    if src.is_empty() {
        return Ok(());
    }
    let start = dst.into_usize();
    let end = start.checked_add(src.len()).ok_or(KernelError::Fault)?;
    if end > KERNEL_VMM_START {
        return Err(KernelError::Fault);
    }
    let mut va = start;
    let mut done = 0;
    while done < src.len() {
        let page = pg_round_down(va);
        let frame = resolve_for_write(mm, ctx, page)?;
        let off = va - page;
        let chunk = (PAGE_SIZE - off).min(src.len() - done);
        ctx.kmem.frame_mut(frame)[off..off + chunk].copy_from_slice(&src[done..done + chunk]);
        va += chunk;
        done += chunk;
    }
    Ok(())
}

/// Copies user bytes into a kernel buffer, faulting pages in as needed.
pub fn copy_from_user(
    mm: &mut AddrSpace,
    ctx: &mut FaultCtx<'_>,
    dst: &mut [u8],
    src: UVAddr,
) -> Result<()> {
    if dst.is_empty() {
        return Ok(());
    }
    let start = src.into_usize();
    let end = start.checked_add(dst.len()).ok_or(KernelError::Fault)?;
    if end > KERNEL_VMM_START {
        return Err(KernelError::Fault);
    }
    let mut va = start;
    let mut done = 0;
    while done < dst.len() {
        let page = pg_round_down(va);
        let frame = resolve_for_read(mm, ctx, page)?;
        let off = va - page;
        let chunk = (PAGE_SIZE - off).min(dst.len() - done);
        dst[done..done + chunk].copy_from_slice(&ctx.kmem.frame(frame)[off..off + chunk]);
        va += chunk;
        done += chunk;
    }
    Ok(())
}

/// Copies a NUL-terminated user string into `buf`. Returns the length
/// without the terminator; a string that does not terminate within
/// `buf` is an `InvalidArgument`.
pub fn copy_str_from_user(
    mm: &mut AddrSpace,
    ctx: &mut FaultCtx<'_>,
    src: UVAddr,
    buf: &mut [u8],
) -> Result<usize> {
    let start = src.into_usize();
    // The scan window ends at the kernel base; a string still running
    // there is an unresolvable pointer, not an oversized argument.
    let limit = buf.len().min(KERNEL_VMM_START.saturating_sub(start));
    if limit == 0 {
        return Err(KernelError::Fault);
    }
    let mut va = start;
    let mut n = 0;
    while n < limit {
        let page = pg_round_down(va);
        let frame = resolve_for_read(mm, ctx, page)?;
        let off = va - page;
        let chunk = (PAGE_SIZE - off).min(limit - n);
        let bytes = &ctx.kmem.frame(frame)[off..off + chunk];
        for (i, b) in bytes.iter().enumerate() {
            buf[n + i] = *b;
            if *b == 0 {
                return Ok(n + i);
            }
        }
        va += chunk;
        n += chunk;
    }
    if limit < buf.len() {
        Err(KernelError::Fault)
    } else {
        Err(KernelError::InvalidArgument)
    }
}

/// Fetches a bounded user path into an owned string.
pub fn user_path(
    mm: &mut AddrSpace,
    ctx: &mut FaultCtx<'_>,
    src: UVAddr,
    buf: &mut [u8],
) -> Result<String> {
    let len = copy_str_from_user(mm, ctx, src, buf)?;
    let cstr = cstr_core::CStr::from_bytes_with_nul(&buf[..len + 1])
        .map_err(|_| KernelError::InvalidArgument)?;
    let s = cstr.to_str().map_err(|_| KernelError::InvalidArgument)?;
    Ok(String::from(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memfs::MemFs;
    use crate::memlayout::{USER_HEAP_DEFAULT_LEN, USER_HEAP_START};
    use alloc::boxed::Box;

    fn heap_space() -> AddrSpace {
        let mut mm = AddrSpace::new();
        let mut area = VmArea::new(
            USER_HEAP_START,
            USER_HEAP_DEFAULT_LEN,
            AreaFlags::WRITE | AreaFlags::ALLOC | AreaFlags::ZERO,
        );
        area.tag = AreaTag::Heap;
        mm.insert_area(area).unwrap();
        mm
    }

    struct Fixture {
        kmem: Kmem,
        vfs: Vfs,
        stats: VmStats,
    }

    impl Fixture {
        fn new(frames: usize) -> Self {
            Self {
                kmem: Kmem::new(frames),
                vfs: Vfs::new(Box::new(MemFs::new())).unwrap(),
                stats: VmStats::default(),
            }
        }

        fn ctx(&mut self) -> FaultCtx<'_> {
            FaultCtx {
                kmem: &mut self.kmem,
                vfs: &mut self.vfs,
                stats: &mut self.stats,
            }
        }
    }

    #[test]
    fn insert_rejects_overlap_with_predecessor_and_successor() {
        let mut mm = AddrSpace::new();
        mm.insert_area(VmArea::new(0x2000, 0x2000, AreaFlags::WRITE))
            .unwrap();
        // Overlaps tail of the existing area.
        assert_eq!(
            mm.insert_area(VmArea::new(0x3000, 0x2000, AreaFlags::WRITE)),
            Err(KernelError::Overlap)
        );
        // Lands ahead of the first area but runs into it.
        assert_eq!(
            mm.insert_area(VmArea::new(0x1000, 0x2000, AreaFlags::WRITE)),
            Err(KernelError::Overlap)
        );
        // Clean fits on both sides.
        mm.insert_area(VmArea::new(0x0, 0x1000, AreaFlags::WRITE))
            .unwrap();
        mm.insert_area(VmArea::new(0x4000, 0x1000, AreaFlags::WRITE))
            .unwrap();
        let starts: Vec<usize> = mm.areas().iter().map(|a| a.start).collect();
        assert_eq!(starts, [0x0, 0x2000, 0x4000]);
    }

    #[test]
    fn search_finds_container_or_floor() {
        let mut mm = AddrSpace::new();
        mm.insert_area(VmArea::new(0x2000, 0x1000, AreaFlags::WRITE))
            .unwrap();
        mm.insert_area(VmArea::new(0x5000, 0x1000, AreaFlags::WRITE))
            .unwrap();
        assert_eq!(mm.search_area(0x2800).unwrap().start, 0x2000);
        assert_eq!(mm.search_area(0x4000).unwrap().start, 0x2000);
        assert!(mm.search_area(0x1000).is_none());
        assert_eq!(mm.search_area(0x9000).unwrap().start, 0x5000);
    }

    #[test]
    fn zero_fill_read_takes_one_not_present_fault() {
        let mut fx = Fixture::new(16);
        let mut mm = heap_space();
        let mut byte = [0xFFu8; 1];
        let mut ctx = fx.ctx();
        copy_from_user(&mut mm, &mut ctx, &mut byte, UVAddr::from(USER_HEAP_START + 0x123))
            .unwrap();
        assert_eq!(byte[0], 0);
        assert_eq!(fx.stats.not_present, 1);
        // The page came in writable: the heap area is writable.
        let (_, writable) = mm.translate(&fx.kmem, USER_HEAP_START + 0x123).unwrap();
        assert!(writable);
        mm.release(&mut fx.kmem);
        assert_eq!(fx.kmem.free_frames(), 16);
    }

    #[test]
    fn untouched_address_is_a_fault_for_copies() {
        let mut fx = Fixture::new(16);
        let mut mm = heap_space();
        let mut ctx = fx.ctx();
        let mut byte = [0u8; 1];
        assert_eq!(
            copy_from_user(&mut mm, &mut ctx, &mut byte, UVAddr::from(0x1000)),
            Err(KernelError::Fault)
        );
        assert_eq!(
            copy_to_user(&mut mm, &mut ctx, UVAddr::from(KERNEL_VMM_START), &byte),
            Err(KernelError::Fault)
        );
    }

    #[test]
    fn cow_fork_isolates_parent_and_child() {
        let mut fx = Fixture::new(32);
        let mut parent = heap_space();
        let addr = UVAddr::from(USER_HEAP_START);
        {
            let mut ctx = fx.ctx();
            copy_to_user(&mut parent, &mut ctx, addr, &[0xAA; 64]).unwrap();
        }
        let (parent_frame, _) = parent.translate(&fx.kmem, USER_HEAP_START).unwrap();

        let mut child = parent.clone_cow(&mut fx.kmem).unwrap();
        // Both sides share the frame and both are read-only now.
        assert_eq!(fx.kmem.refcount(parent_frame), 2);
        let (child_frame, w) = child.translate(&fx.kmem, USER_HEAP_START).unwrap();
        assert_eq!(child_frame, parent_frame);
        assert!(!w);
        let (_, w) = parent.translate(&fx.kmem, USER_HEAP_START).unwrap();
        assert!(!w);

        // Child writes: exactly one access-violation fault, resolved by
        // copying the frame.
        let cow_before = fx.stats.cow_copies;
        {
            let mut ctx = fx.ctx();
            copy_to_user(&mut child, &mut ctx, addr, &[0xBB; 64]).unwrap();
        }
        assert_eq!(fx.stats.cow_copies, cow_before + 1);
        let (child_frame, _) = child.translate(&fx.kmem, USER_HEAP_START).unwrap();
        assert_ne!(child_frame, parent_frame);
        let (pf, _) = parent.translate(&fx.kmem, USER_HEAP_START).unwrap();
        assert_eq!(pf, parent_frame);

        // Parent still reads its own bytes; child sees its own.
        let mut buf = [0u8; 64];
        {
            let mut ctx = fx.ctx();
            copy_from_user(&mut parent, &mut ctx, &mut buf, addr).unwrap();
        }
        assert!(buf.iter().all(|&b| b == 0xAA));
        {
            let mut ctx = fx.ctx();
            copy_from_user(&mut child, &mut ctx, &mut buf, addr).unwrap();
        }
        assert!(buf.iter().all(|&b| b == 0xBB));

        // The parent is the sole mapper again; its next write is a
        // plain re-enable, not a copy.
        assert_eq!(fx.kmem.refcount(parent_frame), 1);
        {
            let mut ctx = fx.ctx();
            copy_to_user(&mut parent, &mut ctx, addr, &[0xCC; 1]).unwrap();
        }
        assert_eq!(fx.stats.cow_copies, cow_before + 1);
        assert_eq!(fx.stats.write_enables, 1);

        // Teardown returns every frame.
        parent.release(&mut fx.kmem);
        child.release(&mut fx.kmem);
        assert_eq!(fx.kmem.free_frames(), 32);
    }

    #[test]
    fn clone_failure_frees_partial_tables() {
        let mut fx = Fixture::new(4);
        let mut parent = heap_space();
        {
            let mut ctx = fx.ctx();
            copy_to_user(&mut parent, &mut ctx, UVAddr::from(USER_HEAP_START), &[1]).unwrap();
        }
        // pgdir + page table + data page are gone; one frame left, but
        // the clone needs two.
        assert_eq!(fx.kmem.free_frames(), 1);
        assert_eq!(
            parent.clone_cow(&mut fx.kmem).unwrap_err(),
            KernelError::OutOfMemory
        );
        assert_eq!(fx.kmem.free_frames(), 1);
        parent.release(&mut fx.kmem);
        assert_eq!(fx.kmem.free_frames(), 4);
    }

    #[test]
    fn write_to_readonly_area_is_fatal() {
        let mut fx = Fixture::new(8);
        let mut mm = AddrSpace::new();
        mm.insert_area(VmArea::new(0x1000, 0x1000, AreaFlags::ZERO))
            .unwrap();
        let mut ctx = fx.ctx();
        // Read faults the page in read-only.
        let mut b = [0u8; 1];
        copy_from_user(&mut mm, &mut ctx, &mut b, UVAddr::from(0x1000)).unwrap();
        // Writing is refused by the resolver.
        assert_eq!(
            copy_to_user(&mut mm, &mut ctx, UVAddr::from(0x1000), &b),
            Err(KernelError::Fault)
        );
        mm.release(&mut fx.kmem);
    }

    #[test]
    fn heap_growth_checks_neighbors() {
        let mut fx = Fixture::new(8);
        let mut mm = heap_space();
        let mut stack = VmArea::new(
            USER_HEAP_START + USER_HEAP_DEFAULT_LEN,
            PAGE_SIZE,
            AreaFlags::WRITE | AreaFlags::ZERO,
        );
        stack.tag = AreaTag::Stack;
        mm.insert_area(stack).unwrap();
        assert_eq!(
            mm.grow_heap(PAGE_SIZE).unwrap_err(),
            KernelError::Overlap
        );
        let old = mm.shrink_heap(&mut fx.kmem, PAGE_SIZE).unwrap();
        assert_eq!(old, USER_HEAP_START + USER_HEAP_DEFAULT_LEN);
        assert_eq!(mm.grow_heap(PAGE_SIZE).unwrap(), old - PAGE_SIZE);
    }
}
