//! Virtual file system core.
//!
//! The VFS keeps three kinds of state:
//!
//! * an inode slab plus a flat cache list keyed by on-disk inode number
//!   — at most one in-memory inode exists per number, and a cached
//!   inode legitimately sits at reference count zero while its disk
//!   link count is positive;
//! * a per-inode list of data buffers, sorted by block offset, with a
//!   most-recently-used probe in front of the scan;
//! * the system-wide open-file table.
//!
//! An inode's reference count is driven entirely by live `File`s (and
//! the console's own tty reference); the cache list holds none. When
//! the count drops to zero the inode is synced: dirty buffers are
//! flushed while the link count is positive, otherwise the file's disk
//! presence is deleted (truncate to zero, free the inode number) and
//! the in-memory inode is destroyed.
//!
//! Operation dispatch is by inode kind — `Regular`, `Directory`,
//! `Pipe`, `Tty` — matched where the operation happens; a kind that
//! does not carry an operation surfaces `InvalidArgument`.

pub mod disk;
pub mod memfs;

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use minos_kernel_lib::arena::ArrayArena;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{KernelError, Result};
use crate::file::{File, FileId, OpenFlags, SEEK_CUR, SEEK_END, SEEK_SET};
use crate::fs::disk::{mode, DiskFs, Ino};
use crate::param::{FS_DATA_BUFFER_SIZE, MAX_FILE_NAME_LEN, NFILE, NINODE};
use crate::pipe::Pipe;
use crate::x86::PAGE_SIZE;

const_assert!(PAGE_SIZE % FS_DATA_BUFFER_SIZE == 0);

/// Index into the VFS inode slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeId(usize);

pub enum InodeKind {
    Regular,
    Directory,
    Pipe(Pipe),
    Tty,
}

impl InodeKind {
    fn on_disk(&self) -> bool {
        match self {
            InodeKind::Regular | InodeKind::Directory => true,
            _ => false,
        }
    }
}

/// One `FS_DATA_BUFFER_SIZE`-aligned slab of cached file bytes.
#[repr(align(1024))]
pub struct Block(pub [u8; FS_DATA_BUFFER_SIZE]);

impl Block {
    pub const ZERO: Block = Block([0; FS_DATA_BUFFER_SIZE]);
}

pub struct DataBuffer {
    pub block_offset: u32,
    pub dirty: bool,
    pub data: Box<Block>,
}

pub struct Inode {
    /// On-disk inode number; 0 for pseudo inodes (pipe, tty).
    pub ino: Ino,
    /// Live references from open files (plus the console's for the tty).
    pub count: u32,
    pub links_count: u16,
    pub mode: u16,
    pub size: u32,
    pub kind: InodeKind,
    /// Ascending by `block_offset`.
    bufs: Vec<DataBuffer>,
    /// Most-recently-used probe into `bufs`; validated before use.
    recent: Option<usize>,
    /// Inode number of the directory this was reached through.
    pub parent: Option<Ino>,
    in_cache: bool,
}

/// `stat` record copied out to user space.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, AsBytes)]
pub struct Stat {
    pub inode_num: u32,
    pub links_count: u32,
    pub mode: u32,
    pub size: u32,
}

/// Directory entry copied out to user space.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, AsBytes)]
pub struct Dirent {
    pub ino: u32,
    pub name_len: u32,
    pub name: [u8; MAX_FILE_NAME_LEN],
}

pub struct Vfs {
    pub disk: Box<dyn DiskFs>,
    inodes: Vec<Option<Inode>>,
    /// The inode cache: slab indices of on-disk inodes, linear scan.
    cache: Vec<InodeId>,
    pub files: ArrayArena<File, NFILE>,
    root: InodeId,
    tty: InodeId,
}

impl Vfs {
    pub fn new(disk: Box<dyn DiskFs>) -> Result<Self> {
        let mut inodes = Vec::new();
        inodes.resize_with(NINODE, || None);
        let mut vfs = Self {
            disk,
            inodes,
            cache: Vec::new(),
            files: ArrayArena::new(),
            root: InodeId(0),
            tty: InodeId(0),
        };
        let root_ino = vfs.disk.root_ino();
        vfs.root = vfs.iget(root_ino)?;
        let tty = vfs.alloc_pseudo(mode::S_IFCHR, InodeKind::Tty)?;
        // The console itself keeps the tty inode alive.
        vfs.inode_mut(tty).count = 1;
        vfs.tty = tty;
        Ok(vfs)
    }

    pub fn root(&self) -> InodeId {
        self.root
    }

    pub fn tty(&self) -> InodeId {
        self.tty
    }

    pub fn inode(&self, id: InodeId) -> &Inode {
        self.inodes[id.0].as_ref().expect("vfs: stale inode id")
    }

    pub fn inode_mut(&mut self, id: InodeId) -> &mut Inode {
        self.inodes[id.0].as_mut().expect("vfs: stale inode id")
    }

    /// Number of live in-memory inodes (cache-resident or pseudo).
    pub fn live_inodes(&self) -> usize {
        self.inodes.iter().filter(|i| i.is_some()).count()
    }

    pub fn cached(&self, ino: Ino) -> Option<InodeId> {
        self.cache
            .iter()
            .copied()
            .find(|&id| self.inode(id).ino == ino)
    }

    fn alloc_slot(&mut self, inode: Inode) -> Result<InodeId> {
        for (i, slot) in self.inodes.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(inode);
                return Ok(InodeId(i));
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Finds the in-memory inode for `ino`, loading and caching it on a
    /// miss. A fresh inode enters with count zero; counts come from
    /// open files only.
    pub fn iget(&mut self, ino: Ino) -> Result<InodeId> {
        if let Some(id) = self.cached(ino) {
            return Ok(id);
        }
        let di = self.disk.read_inode(ino)?;
        let kind = if mode::is_dir(di.mode) {
            InodeKind::Directory
        } else {
            InodeKind::Regular
        };
        let id = self.alloc_slot(Inode {
            ino,
            count: 0,
            links_count: di.links,
            mode: di.mode,
            size: di.size,
            kind,
            bufs: Vec::new(),
            recent: None,
            parent: None,
            in_cache: true,
        })?;
        self.cache.push(id);
        Ok(id)
    }

    /// Creates a pseudo inode (pipe, tty) outside the cache.
    pub fn alloc_pseudo(&mut self, fmode: u16, kind: InodeKind) -> Result<InodeId> {
        self.alloc_slot(Inode {
            ino: 0,
            count: 0,
            links_count: 0,
            mode: fmode,
            size: 0,
            kind,
            bufs: Vec::new(),
            recent: None,
            parent: None,
            in_cache: false,
        })
    }

    pub fn get_inode(&mut self, id: InodeId) {
        self.inode_mut(id).count += 1;
    }

    /// Drops one reference; on the last one the inode is synced and, if
    /// it no longer exists on disk (or never did), destroyed.
    pub fn put_inode(&mut self, id: InodeId) -> Result<()> {
        {
            let inode = self.inode_mut(id);
            assert!(inode.count > 0, "put of unreferenced inode");
            inode.count -= 1;
            if inode.count > 0 {
                return Ok(());
            }
        }
        let res = self.sync_inode(id);
        let destroy = {
            let inode = self.inode(id);
            match inode.kind {
                InodeKind::Pipe(_) => true,
                InodeKind::Tty => false,
                _ => inode.links_count == 0,
            }
        };
        if destroy {
            self.destroy_inode(id);
        }
        res
    }

    /// The sync operation: flush while the file still exists on disk,
    /// delete it otherwise. The delete branch only fires once no file
    /// references the inode.
    fn sync_inode(&mut self, id: InodeId) -> Result<()> {
        let (on_disk, ino, links, count) = {
            let inode = self.inode(id);
            (
                inode.kind.on_disk(),
                inode.ino,
                inode.links_count,
                inode.count,
            )
        };
        if !on_disk {
            return Ok(());
        }
        if links > 0 {
            self.flush_bufs(id)
        } else if count == 0 {
            self.disk.truncate(ino, 0)?;
            self.disk.free_inode(ino)?;
            let inode = self.inode_mut(id);
            inode.bufs.clear();
            inode.recent = None;
            inode.size = 0;
            Ok(())
        } else {
            Ok(())
        }
    }

    fn flush_bufs(&mut self, id: InodeId) -> Result<()> {
        let Self { inodes, disk, .. } = self;
        let inode = inodes[id.0].as_mut().expect("vfs: stale inode id");
        for buf in inode.bufs.iter_mut() {
            if buf.dirty {
                disk.write_buffer(inode.ino, buf.block_offset, &buf.data.0)?;
                buf.dirty = false;
            }
        }
        Ok(())
    }

    /// The release operation: drops cached state and the slab slot.
    fn destroy_inode(&mut self, id: InodeId) {
        let inode = self.inodes[id.0].take().expect("vfs: stale inode id");
        if inode.in_cache {
            self.cache.retain(|&c| c != id);
        }
    }

    /// Sync of a single inode on behalf of a file descriptor.
    pub fn fsync(&mut self, id: InodeId) -> Result<()> {
        self.sync_inode(id)
    }

    /// Syncs every cached inode and the filesystem metadata. Only dirty
    /// state reaches the disk, so a second call with no intervening
    /// writes is free.
    pub fn sync_all(&mut self) -> Result<()> {
        let ids: Vec<InodeId> = self.cache.clone();
        for id in ids {
            if self.inodes[id.0].is_none() {
                continue;
            }
            self.sync_inode(id)?;
            let dead = {
                let inode = self.inode(id);
                inode.links_count == 0 && inode.count == 0
            };
            if dead {
                self.destroy_inode(id);
            }
        }
        self.disk.sync_meta()
    }

    // ------------------------------------------------------------------
    // Path resolution
    // ------------------------------------------------------------------

    /// Walks `path` up to its final component. Returns the inode of the
    /// directory the final component would live in, and the component
    /// itself (`None` when the path names the starting directory, e.g.
    /// `/` or `.`). Empty components and `.` are skipped.
    pub fn resolve_parent(
        &mut self,
        cwd: InodeId,
        path: &str,
    ) -> Result<(InodeId, Option<String>)> {
        let path = path.trim_start_matches(|c| c == ' ' || c == '\t');
        if path.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        let mut cur = if path.starts_with('/') { self.root } else { cwd };
        let comps: Vec<&str> = path
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect();
        for (i, name) in comps.iter().enumerate() {
            if !mode::is_dir(self.inode(cur).mode) {
                return Err(KernelError::NotDirectory);
            }
            if i == comps.len() - 1 {
                return Ok((cur, Some((*name).to_string())));
            }
            let dir_ino = self.inode(cur).ino;
            let next_ino = self.disk.lookup(dir_ino, name)?;
            let next = self.iget(next_ino)?;
            self.inode_mut(next).parent = Some(dir_ino);
            cur = next;
        }
        Ok((cur, None))
    }

    /// Full walk to an existing inode.
    pub fn resolve(&mut self, cwd: InodeId, path: &str) -> Result<InodeId> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        match name {
            None => Ok(parent),
            Some(name) => {
                let dir_ino = self.inode(parent).ino;
                let ino = self.disk.lookup(dir_ino, &name)?;
                let id = self.iget(ino)?;
                self.inode_mut(id).parent = Some(dir_ino);
                Ok(id)
            }
        }
    }

    /// Opens `path`, creating the final component when asked to, and
    /// returns a fresh open file. Nothing is installed on failure.
    pub fn open(
        &mut self,
        cwd: InodeId,
        path: &str,
        flags: OpenFlags,
        fmode: u16,
    ) -> Result<FileId> {
        let (parent, last) = self.resolve_parent(cwd, path)?;
        let mut created = false;
        let target = match last {
            None => parent,
            Some(name) => {
                let dir_ino = self.inode(parent).ino;
                let ino = match self.disk.lookup(dir_ino, &name) {
                    Ok(ino) => ino,
                    Err(KernelError::NoSuchEntry) if flags.contains(OpenFlags::O_CREAT) => {
                        created = true;
                        self.disk.create(dir_ino, &name, mode::S_IFREG | fmode)?
                    }
                    Err(e) => return Err(e),
                };
                let id = self.iget(ino)?;
                self.inode_mut(id).parent = Some(dir_ino);
                id
            }
        };
        if flags.contains(OpenFlags::O_CREAT | OpenFlags::O_EXCL) && !created {
            return Err(KernelError::AlreadyExists);
        }
        if flags.contains(OpenFlags::O_TRUNC) && mode::is_reg(self.inode(target).mode) {
            self.truncate_inode(target, 0)?;
        }
        let fid = self
            .files
            .alloc(File::new(target, flags))
            .map_err(|_| KernelError::OutOfMemory)?;
        self.get_inode(target);
        Ok(fid)
    }

    pub fn mkdir(&mut self, cwd: InodeId, path: &str, fmode: u16) -> Result<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let name = name.ok_or(KernelError::AlreadyExists)?;
        let dir_ino = self.inode(parent).ino;
        self.disk.mkdir(dir_ino, &name, fmode)?;
        Ok(())
    }

    pub fn unlink(&mut self, cwd: InodeId, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let name = name.ok_or(KernelError::InvalidArgument)?;
        let dir_ino = self.inode(parent).ino;
        let ino = self.disk.unlink(dir_ino, &name)?;
        self.note_disk_unlink(ino)
    }

    pub fn rmdir(&mut self, cwd: InodeId, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let name = name.ok_or(KernelError::InvalidArgument)?;
        let dir_ino = self.inode(parent).ino;
        let ino = self.disk.rmdir(dir_ino, &name)?;
        self.note_disk_unlink(ino)
    }

    pub fn link(&mut self, cwd: InodeId, old: &str, new: &str) -> Result<()> {
        let target = self.resolve(cwd, old)?;
        let (target_ino, target_mode) = {
            let inode = self.inode(target);
            (inode.ino, inode.mode)
        };
        if mode::is_dir(target_mode) {
            return Err(KernelError::InvalidArgument);
        }
        let (parent, name) = self.resolve_parent(cwd, new)?;
        let name = name.ok_or(KernelError::AlreadyExists)?;
        let dir_ino = self.inode(parent).ino;
        self.disk.link(dir_ino, &name, target_ino)?;
        self.inode_mut(target).links_count += 1;
        Ok(())
    }

    /// Reconciles in-memory state after a disk-level unlink/rmdir: the
    /// cached inode (if any) learns the new link count, and a file with
    /// no remaining links and no open references is deleted right away.
    fn note_disk_unlink(&mut self, ino: Ino) -> Result<()> {
        let links = self.disk.read_inode(ino)?.links;
        match self.cached(ino) {
            Some(id) => {
                self.inode_mut(id).links_count = links;
                let dead = {
                    let inode = self.inode(id);
                    inode.count == 0 && inode.links_count == 0
                };
                if dead {
                    self.sync_inode(id)?;
                    self.destroy_inode(id);
                }
                Ok(())
            }
            None => {
                if links == 0 {
                    self.disk.truncate(ino, 0)?;
                    self.disk.free_inode(ino)?;
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Data buffers
    // ------------------------------------------------------------------

    /// The buffer covering block `block_offset`, filling it from disk if
    /// it is not cached yet. The MRU probe short-circuits repeated
    /// access to the same block.
    fn get_buffer(&mut self, id: InodeId, block_offset: u32) -> Result<&mut DataBuffer> {
        let Self { inodes, disk, .. } = self;
        let inode = inodes[id.0].as_mut().expect("vfs: stale inode id");
        let hit = match inode.recent {
            Some(i) if i < inode.bufs.len() && inode.bufs[i].block_offset == block_offset => {
                Some(i)
            }
            _ => inode
                .bufs
                .iter()
                .position(|b| b.block_offset == block_offset),
        };
        let idx = match hit {
            Some(i) => i,
            None => {
                let mut data = Box::new(Block::ZERO);
                disk.fill_buffer(inode.ino, block_offset, &mut data.0)?;
                let pos = inode
                    .bufs
                    .iter()
                    .position(|b| b.block_offset > block_offset)
                    .unwrap_or(inode.bufs.len());
                inode.bufs.insert(
                    pos,
                    DataBuffer {
                        block_offset,
                        dirty: false,
                        data,
                    },
                );
                pos
            }
        };
        inode.recent = Some(idx);
        Ok(&mut inode.bufs[idx])
    }

    /// Reads up to `buf.len()` bytes at `offset`, clamped to the file
    /// size, without touching any file offset.
    pub fn read_at(&mut self, id: InodeId, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let size = self.inode(id).size;
        if offset >= size {
            return Ok(0);
        }
        let n = buf.len().min((size - offset) as usize);
        let mut done = 0;
        let mut off = offset as usize;
        while done < n {
            let block = (off / FS_DATA_BUFFER_SIZE) as u32;
            let in_buf = off % FS_DATA_BUFFER_SIZE;
            let chunk = (FS_DATA_BUFFER_SIZE - in_buf).min(n - done);
            let dbuf = self.get_buffer(id, block)?;
            buf[done..done + chunk].copy_from_slice(&dbuf.data.0[in_buf..in_buf + chunk]);
            off += chunk;
            done += chunk;
        }
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Generic-file operations
    // ------------------------------------------------------------------

    /// Reads from the file's current offset. The offset is advanced by
    /// the caller once the bytes have safely reached user space.
    pub fn gener_read(&mut self, fid: FileId, buf: &mut [u8]) -> Result<usize> {
        let (id, off) = {
            let f = self.files.get(fid);
            (f.inode, f.off)
        };
        self.read_at(id, off, buf)
    }

    /// Writes at the file's current offset (or at EOF with `O_APPEND`),
    /// extending the file first when the write reaches past the end.
    /// Touched buffers go dirty; the offset moves on success only.
    pub fn gener_write(&mut self, fid: FileId, data: &[u8]) -> Result<usize> {
        let (id, flags, mut off) = {
            let f = self.files.get(fid);
            (f.inode, f.flags, f.off)
        };
        let size = self.inode(id).size;
        if flags.contains(OpenFlags::O_APPEND) {
            off = size;
        }
        let end = off as usize + data.len();
        if end > u32::MAX as usize {
            return Err(KernelError::InvalidArgument);
        }
        if !data.is_empty() && end as u32 > size {
            self.truncate_inode(id, end as u32)?;
        }
        let mut done = 0;
        let mut pos = off as usize;
        while done < data.len() {
            let block = (pos / FS_DATA_BUFFER_SIZE) as u32;
            let in_buf = pos % FS_DATA_BUFFER_SIZE;
            let chunk = (FS_DATA_BUFFER_SIZE - in_buf).min(data.len() - done);
            let dbuf = self.get_buffer(id, block)?;
            dbuf.dirty = true;
            dbuf.data.0[in_buf..in_buf + chunk].copy_from_slice(&data[done..done + chunk]);
            pos += chunk;
            done += chunk;
        }
        self.files.get_mut(fid).off = end as u32;
        Ok(data.len())
    }

    /// Commits a read: advances the file offset.
    pub fn advance(&mut self, fid: FileId, n: usize) {
        self.files.get_mut(fid).off += n as u32;
    }

    pub fn gener_seek(&mut self, fid: FileId, offset: i32, whence: u32) -> Result<i32> {
        let (id, cur) = {
            let f = self.files.get(fid);
            (f.inode, f.off)
        };
        let size = self.inode(id).size;
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => cur as i64,
            SEEK_END => size as i64,
            _ => return Err(KernelError::InvalidArgument),
        };
        let new = (base + offset as i64).max(0);
        if new > i32::MAX as i64 {
            return Err(KernelError::InvalidArgument);
        }
        self.files.get_mut(fid).off = new as u32;
        Ok(new as i32)
    }

    /// Reads the next directory entry, advancing the file offset by one
    /// entry index.
    pub fn gener_readdir(&mut self, fid: FileId) -> Result<Dirent> {
        let (id, pos) = {
            let f = self.files.get(fid);
            (f.inode, f.off)
        };
        let inode = self.inode(id);
        if !mode::is_dir(inode.mode) {
            return Err(KernelError::InvalidArgument);
        }
        let ino = inode.ino;
        match self.disk.readdir(ino, pos)? {
            Some((entry_ino, name)) => {
                self.files.get_mut(fid).off = pos + 1;
                let mut out = Dirent {
                    ino: entry_ino,
                    name_len: name.len().min(MAX_FILE_NAME_LEN) as u32,
                    name: [0; MAX_FILE_NAME_LEN],
                };
                let n = out.name_len as usize;
                out.name[..n].copy_from_slice(&name.as_bytes()[..n]);
                Ok(out)
            }
            None => Err(KernelError::InvalidArgument),
        }
    }

    /// Sets the file length. Extending leaves a hole that reads zero;
    /// shrinking invalidates the cached buffers.
    pub fn truncate_inode(&mut self, id: InodeId, len: u32) -> Result<()> {
        let (ino, size) = {
            let inode = self.inode(id);
            (inode.ino, inode.size)
        };
        self.disk.truncate(ino, len)?;
        let inode = self.inode_mut(id);
        if len < size {
            inode.bufs.clear();
            inode.recent = None;
        }
        inode.size = len;
        Ok(())
    }

    pub fn stat(&self, fid: FileId) -> Stat {
        let inode = self.inode(self.files.get(fid).inode);
        Stat {
            inode_num: inode.ino,
            links_count: inode.links_count as u32,
            mode: inode.mode as u32,
            size: inode.size,
        }
    }

    // ------------------------------------------------------------------
    // File table
    // ------------------------------------------------------------------

    pub fn dup_file(&mut self, fid: FileId) {
        self.files.dup(fid);
    }

    /// Drops one reference to an open file. Returns the dead `File` on
    /// the last one; the caller finishes kind-specific teardown and then
    /// releases the inode reference.
    pub fn release_file(&mut self, fid: FileId) -> Option<File> {
        self.files.release(fid)
    }

    /// Throws away a pseudo inode that never got a reference (error
    /// paths of pipe creation).
    pub(crate) fn discard_pseudo(&mut self, id: InodeId) {
        debug_assert!(!self.inode(id).in_cache);
        debug_assert_eq!(self.inode(id).count, 0);
        self.destroy_inode(id);
    }

    /// Mutable access to a pipe's state.
    pub fn pipe_mut(&mut self, id: InodeId) -> Option<&mut Pipe> {
        match &mut self.inode_mut(id).kind {
            InodeKind::Pipe(p) => Some(p),
            _ => None,
        }
    }
}
