//! Executable images and `exec`.
//!
//! The boot tooling packs user programs into a flat section format: a
//! header, a section table, then the section payloads. `exec` parses
//! the image, builds a complete replacement address space (one area per
//! loadable section, a default heap, the user stack), sweeps
//! close-on-exec descriptors, and rewrites the trap frame so the next
//! user-space return lands on the entry point. Nothing of the old
//! image survives a successful exec; nothing of the new one is
//! installed by a failed one.

use alloc::vec::Vec;
use core::mem;

use arrayvec::ArrayVec;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{KernelError, Result};
use crate::file::{FileId, OpenFlags};
use crate::kernel::Kernel;
use crate::memlayout::{
    USER_HEAP_DEFAULT_LEN, USER_HEAP_START, USER_STACK_LEN, USER_STACK_TOP,
};
use crate::param::{MAX_IMAGE_SECTIONS, MAX_OPEN_FD};
use crate::proc::Pid;
use crate::vm::{AddrSpace, AreaFlags, AreaSource, AreaTag, AsId, VmArea};
use crate::x86::TrapFrame;

/// `b"MNOS"` little-endian.
pub const IMAGE_MAGIC: u32 = 0x534F_4E4D;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, AsBytes)]
pub struct ImageHeader {
    pub magic: u32,
    pub entry: u32,
    pub nsections: u32,
}

/// One loadable section record. `flags` uses the [`AreaFlags`] bit
/// assignment; a section without file payload (bss) sets `file_len` 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, AsBytes)]
pub struct ImageSection {
    pub vaddr: u32,
    pub mem_len: u32,
    pub file_offset: u32,
    pub file_len: u32,
    pub flags: u32,
}

const HEADER_SIZE: usize = mem::size_of::<ImageHeader>();
const SECTION_SIZE: usize = mem::size_of::<ImageSection>();

/// Input to [`pack_image`].
pub struct SectionSpec<'a> {
    pub vaddr: u32,
    pub mem_len: u32,
    pub flags: AreaFlags,
    pub data: &'a [u8],
}

/// Serializes an executable image; the mkfs-style boot tooling and the
/// tests install the result as a file.
pub fn pack_image(entry: u32, sections: &[SectionSpec<'_>]) -> Vec<u8> {
    let hdr = ImageHeader {
        magic: IMAGE_MAGIC,
        entry,
        nsections: sections.len() as u32,
    };
    let mut out = Vec::new();
    out.extend_from_slice(hdr.as_bytes());
    let mut file_offset = (HEADER_SIZE + sections.len() * SECTION_SIZE) as u32;
    for s in sections {
        let rec = ImageSection {
            vaddr: s.vaddr,
            mem_len: s.mem_len,
            file_offset,
            file_len: s.data.len() as u32,
            flags: s.flags.bits(),
        };
        out.extend_from_slice(rec.as_bytes());
        file_offset += s.data.len() as u32;
    }
    for s in sections {
        out.extend_from_slice(s.data);
    }
    out
}

impl Kernel {
    /// Replaces `pid`'s program with the executable at `path`.
    pub fn exec(&mut self, pid: Pid, path: &str) -> Result<()> {
        let cwd = self.tasks.get(pid).cwd.unwrap_or_else(|| self.vfs.root());
        let fid = self.vfs.open(cwd, path, OpenFlags::empty(), 0)?;
        let parsed = match self.parse_image(fid) {
            Ok(p) => p,
            Err(e) => {
                self.close_file(fid);
                return Err(e);
            }
        };
        let mm = match self.build_user_space(fid, &parsed.1) {
            Ok(mm) => mm,
            Err(e) => {
                self.close_file(fid);
                return Err(e);
            }
        };
        // Point of no return: swap the address space, reset the trap
        // frame, close marked descriptors.
        let old = {
            let task = self.tasks.get_mut(pid);
            let old = task.mm.take();
            task.mm = Some(mm);
            let tf = TrapFrame::user_entry(parsed.0, USER_STACK_TOP as u32);
            task.set_trap_frame(&tf);
            old
        };
        let marked: Vec<usize> = {
            let task = self.tasks.get(pid);
            (0..MAX_OPEN_FD)
                .filter(|&fd| task.close_on_exec.get(fd))
                .collect()
        };
        for fd in marked {
            self.close_fd(pid, fd);
        }
        if let Some(old) = old {
            self.aspace_put(old);
        }
        Ok(())
    }

    /// Reads and validates the header and section table.
    fn parse_image(
        &mut self,
        fid: FileId,
    ) -> Result<(u32, ArrayVec<ImageSection, MAX_IMAGE_SECTIONS>)> {
        let inode = self.vfs.files.get(fid).inode;
        let mut hdr = ImageHeader::default();
        if self.vfs.read_at(inode, 0, hdr.as_bytes_mut())? != HEADER_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        if hdr.magic != IMAGE_MAGIC || hdr.nsections as usize > MAX_IMAGE_SECTIONS {
            return Err(KernelError::InvalidArgument);
        }
        let mut sections = ArrayVec::new();
        for i in 0..hdr.nsections as usize {
            let mut rec = ImageSection::default();
            let off = (HEADER_SIZE + i * SECTION_SIZE) as u32;
            if self.vfs.read_at(inode, off, rec.as_bytes_mut())? != SECTION_SIZE {
                return Err(KernelError::InvalidArgument);
            }
            sections.push(rec);
        }
        Ok((hdr.entry, sections))
    }

    /// Assembles the replacement address space: loadable sections, the
    /// default heap, the stack growing down from the user stack top.
    /// The image file reference is owned by the space from here on.
    fn build_user_space(
        &mut self,
        fid: FileId,
        sections: &[ImageSection],
    ) -> Result<AsId> {
        let mut mm = AddrSpace::new();
        for sec in sections {
            let flags = AreaFlags::from_bits_truncate(sec.flags);
            if !flags.contains(AreaFlags::ALLOC) {
                continue;
            }
            let mut area = VmArea::new(
                sec.vaddr as usize,
                sec.mem_len as usize,
                flags | AreaFlags::ZERO,
            );
            if sec.file_len > 0 {
                area.source = AreaSource::Image {
                    file_offset: sec.file_offset,
                    file_len: sec.file_len,
                };
            }
            mm.insert_area(area)
                .map_err(|_| KernelError::InvalidArgument)?;
        }
        let mut heap = VmArea::new(
            USER_HEAP_START,
            USER_HEAP_DEFAULT_LEN,
            AreaFlags::WRITE | AreaFlags::ALLOC | AreaFlags::ZERO,
        );
        heap.tag = AreaTag::Heap;
        mm.insert_area(heap)
            .map_err(|_| KernelError::InvalidArgument)?;
        let mut stack = VmArea::new(
            USER_STACK_TOP - USER_STACK_LEN,
            USER_STACK_LEN,
            AreaFlags::WRITE | AreaFlags::ALLOC | AreaFlags::ZERO,
        );
        stack.tag = AreaTag::Stack;
        mm.insert_area(stack)
            .map_err(|_| KernelError::InvalidArgument)?;
        mm.exec_image = Some(fid);
        let id = self
            .aspaces
            .alloc(mm)
            .map_err(|_| KernelError::OutOfMemory)?;
        if let Err(e) = {
            let Kernel { aspaces, kmem, .. } = self;
            aspaces.get_mut(id).ensure_pgdir(kmem)
        } {
            // No frames are held yet; drop the slab slot again. The
            // caller still owns the file reference.
            self.aspaces.release(id);
            return Err(e);
        }
        Ok(id)
    }
}
