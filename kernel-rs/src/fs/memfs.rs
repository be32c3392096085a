//! RAM-backed implementation of the storage collaborator.
//!
//! Stands in for the on-disk ext2 driver behind the same [`DiskFs`]
//! seam: inode numbers, link counts, block-granular data access, and
//! deferred inode release all behave like the real thing, including the
//! ext2 convention of root at inode 2. The boot path seeds it with an
//! init image; the tests seed it with fixtures.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::fs::disk::{mode, DiskInode, DiskFs, Ino};
use crate::param::{FS_DATA_BUFFER_SIZE, MAX_FILE_NAME_LEN};

const ROOT_INO: Ino = 2;

struct Node {
    mode: u16,
    links: u16,
    /// File content; `len()` is the file size. Unused for directories.
    data: Vec<u8>,
    /// Directory entries, including `.` and `..`. Unused for files.
    entries: Vec<(String, Ino)>,
}

impl Node {
    fn is_dir(&self) -> bool {
        mode::is_dir(self.mode)
    }
}

pub struct MemFs {
    /// Indexed by inode number; 0 and 1 are never handed out.
    nodes: Vec<Option<Node>>,
    writes: u64,
    meta_dirty: bool,
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = Vec::new();
        nodes.resize_with(ROOT_INO as usize + 1, || None);
        let mut root = Node {
            mode: mode::S_IFDIR | 0o755,
            links: 2,
            data: Vec::new(),
            entries: Vec::new(),
        };
        root.entries.push((".".to_string(), ROOT_INO));
        root.entries.push(("..".to_string(), ROOT_INO));
        nodes[ROOT_INO as usize] = Some(root);
        Self {
            nodes,
            writes: 0,
            meta_dirty: false,
        }
    }

    fn node(&self, ino: Ino) -> Result<&Node> {
        self.nodes
            .get(ino as usize)
            .and_then(|n| n.as_ref())
            .ok_or(KernelError::Io)
    }

    fn node_mut(&mut self, ino: Ino) -> Result<&mut Node> {
        self.nodes
            .get_mut(ino as usize)
            .and_then(|n| n.as_mut())
            .ok_or(KernelError::Io)
    }

    fn alloc_node(&mut self, node: Node) -> Ino {
        for (i, slot) in self.nodes.iter_mut().enumerate().skip(ROOT_INO as usize + 1) {
            if slot.is_none() {
                *slot = Some(node);
                return i as Ino;
            }
        }
        self.nodes.push(Some(node));
        (self.nodes.len() - 1) as Ino
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_FILE_NAME_LEN || name.contains('/') {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    fn insert_entry(&mut self, dir: Ino, name: &str, ino: Ino) -> Result<()> {
        Self::check_name(name)?;
        let d = self.node_mut(dir)?;
        if !d.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        if d.entries.iter().any(|(n, _)| n == name) {
            return Err(KernelError::AlreadyExists);
        }
        d.entries.push((name.to_string(), ino));
        Ok(())
    }

    /// Seeds a regular file; the boot image installer and the tests use
    /// this to populate the disk before the kernel mounts it.
    pub fn add_file(&mut self, dir: Ino, name: &str, data: &[u8]) -> Result<Ino> {
        let ino = self.create(dir, name, mode::S_IFREG | 0o644)?;
        self.node_mut(ino)?.data.extend_from_slice(data);
        Ok(ino)
    }

    /// Seeds a directory.
    pub fn add_dir(&mut self, dir: Ino, name: &str) -> Result<Ino> {
        self.mkdir(dir, name, mode::S_IFDIR | 0o755)
    }
}

impl DiskFs for MemFs {
    fn root_ino(&self) -> Ino {
        ROOT_INO
    }

    fn lookup(&mut self, dir: Ino, name: &str) -> Result<Ino> {
        let d = self.node(dir)?;
        if !d.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        d.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, ino)| ino)
            .ok_or(KernelError::NoSuchEntry)
    }

    fn create(&mut self, dir: Ino, name: &str, fmode: u16) -> Result<Ino> {
        let ino = self.alloc_node(Node {
            mode: if fmode & mode::S_IFMT == 0 {
                mode::S_IFREG | fmode
            } else {
                fmode
            },
            links: 1,
            data: Vec::new(),
            entries: Vec::new(),
        });
        if let Err(e) = self.insert_entry(dir, name, ino) {
            self.nodes[ino as usize] = None;
            return Err(e);
        }
        self.writes += 1;
        self.meta_dirty = true;
        Ok(ino)
    }

    fn mkdir(&mut self, dir: Ino, name: &str, fmode: u16) -> Result<Ino> {
        let ino = self.alloc_node(Node {
            mode: mode::S_IFDIR | (fmode & !mode::S_IFMT),
            links: 2,
            data: Vec::new(),
            entries: Vec::new(),
        });
        if let Err(e) = self.insert_entry(dir, name, ino) {
            self.nodes[ino as usize] = None;
            return Err(e);
        }
        {
            let d = self.node_mut(ino).expect("fresh dir node");
            d.entries.push((".".to_string(), ino));
            d.entries.push(("..".to_string(), dir));
        }
        self.node_mut(dir)?.links += 1; // the child's ".."
        self.writes += 1;
        self.meta_dirty = true;
        Ok(ino)
    }

    fn read_inode(&self, ino: Ino) -> Result<DiskInode> {
        let n = self.node(ino)?;
        Ok(DiskInode {
            mode: n.mode,
            links: n.links,
            size: n.data.len() as u32,
        })
    }

    fn fill_buffer(&mut self, ino: Ino, block_offset: u32, buf: &mut [u8]) -> Result<()> {
        let n = self.node(ino)?;
        let start = block_offset as usize * FS_DATA_BUFFER_SIZE;
        for b in buf.iter_mut() {
            *b = 0;
        }
        if start < n.data.len() {
            let end = (start + buf.len()).min(n.data.len());
            buf[..end - start].copy_from_slice(&n.data[start..end]);
        }
        Ok(())
    }

    fn write_buffer(&mut self, ino: Ino, block_offset: u32, buf: &[u8]) -> Result<()> {
        self.writes += 1;
        let n = self.node_mut(ino)?;
        let start = block_offset as usize * FS_DATA_BUFFER_SIZE;
        if start < n.data.len() {
            let end = (start + buf.len()).min(n.data.len());
            let len = end - start;
            n.data[start..end].copy_from_slice(&buf[..len]);
        }
        Ok(())
    }

    fn truncate(&mut self, ino: Ino, len: u32) -> Result<()> {
        let n = self.node_mut(ino)?;
        if n.data.len() != len as usize {
            n.data.resize(len as usize, 0);
            self.writes += 1;
            self.meta_dirty = true;
        }
        Ok(())
    }

    fn link(&mut self, dir: Ino, name: &str, target: Ino) -> Result<()> {
        if self.node(target)?.is_dir() {
            return Err(KernelError::InvalidArgument);
        }
        self.insert_entry(dir, name, target)?;
        self.node_mut(target)?.links += 1;
        self.writes += 1;
        self.meta_dirty = true;
        Ok(())
    }

    fn unlink(&mut self, dir: Ino, name: &str) -> Result<Ino> {
        let ino = self.lookup(dir, name)?;
        if self.node(ino)?.is_dir() {
            return Err(KernelError::InvalidArgument);
        }
        let d = self.node_mut(dir)?;
        d.entries.retain(|(n, _)| n != name);
        self.node_mut(ino)?.links -= 1;
        self.writes += 1;
        self.meta_dirty = true;
        Ok(ino)
    }

    fn rmdir(&mut self, dir: Ino, name: &str) -> Result<Ino> {
        let ino = self.lookup(dir, name)?;
        {
            let n = self.node(ino)?;
            if !n.is_dir() {
                return Err(KernelError::NotDirectory);
            }
            if n.entries.iter().any(|(n, _)| n != "." && n != "..") {
                return Err(KernelError::InvalidArgument);
            }
        }
        let d = self.node_mut(dir)?;
        d.entries.retain(|(n, _)| n != name);
        d.links -= 1; // the child's ".." goes away
        self.node_mut(ino)?.links = 0;
        self.writes += 1;
        self.meta_dirty = true;
        Ok(ino)
    }

    fn readdir(&mut self, dir: Ino, pos: u32) -> Result<Option<(Ino, String)>> {
        let d = self.node(dir)?;
        if !d.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        Ok(d.entries
            .get(pos as usize)
            .map(|(n, ino)| (*ino, n.clone())))
    }

    fn free_inode(&mut self, ino: Ino) -> Result<()> {
        let slot = self
            .nodes
            .get_mut(ino as usize)
            .ok_or(KernelError::Io)?;
        assert!(slot.is_some(), "free of free inode");
        *slot = None;
        self.writes += 1;
        self.meta_dirty = true;
        Ok(())
    }

    fn sync_meta(&mut self) -> Result<()> {
        if self.meta_dirty {
            self.writes += 1;
            self.meta_dirty = false;
        }
        Ok(())
    }

    fn write_count(&self) -> u64 {
        self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_create() {
        let mut fs = MemFs::new();
        assert_eq!(fs.lookup(ROOT_INO, "x"), Err(KernelError::NoSuchEntry));
        let ino = fs.create(ROOT_INO, "x", 0o644).unwrap();
        assert_eq!(fs.lookup(ROOT_INO, "x"), Ok(ino));
        assert_eq!(fs.create(ROOT_INO, "x", 0o644), Err(KernelError::AlreadyExists));
    }

    #[test]
    fn block_fill_pads_with_zeroes() {
        let mut fs = MemFs::new();
        let ino = fs.add_file(ROOT_INO, "f", b"hello").unwrap();
        let mut buf = [0xFFu8; FS_DATA_BUFFER_SIZE];
        fs.fill_buffer(ino, 0, &mut buf).unwrap();
        assert_eq!(&buf[..5], b"hello");
        assert!(buf[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_extends_with_hole() {
        let mut fs = MemFs::new();
        let ino = fs.add_file(ROOT_INO, "f", b"ab").unwrap();
        fs.truncate(ino, 10).unwrap();
        assert_eq!(fs.read_inode(ino).unwrap().size, 10);
        let mut buf = [0xFFu8; FS_DATA_BUFFER_SIZE];
        fs.fill_buffer(ino, 0, &mut buf).unwrap();
        assert_eq!(&buf[..2], b"ab");
        assert!(buf[2..10].iter().all(|&b| b == 0));
    }

    #[test]
    fn unlink_keeps_node_until_freed() {
        let mut fs = MemFs::new();
        let ino = fs.add_file(ROOT_INO, "f", b"data").unwrap();
        assert_eq!(fs.unlink(ROOT_INO, "f").unwrap(), ino);
        assert_eq!(fs.read_inode(ino).unwrap().links, 0);
        assert_eq!(fs.lookup(ROOT_INO, "f"), Err(KernelError::NoSuchEntry));
        fs.free_inode(ino).unwrap();
        assert!(fs.read_inode(ino).is_err());
    }

    #[test]
    fn rmdir_rejects_non_empty() {
        let mut fs = MemFs::new();
        let d = fs.add_dir(ROOT_INO, "d").unwrap();
        fs.add_file(d, "f", b"").unwrap();
        assert_eq!(fs.rmdir(ROOT_INO, "d"), Err(KernelError::InvalidArgument));
        fs.unlink(d, "f").unwrap();
        fs.rmdir(ROOT_INO, "d").unwrap();
        assert_eq!(fs.lookup(ROOT_INO, "d"), Err(KernelError::NoSuchEntry));
    }

    #[test]
    fn sync_meta_is_idempotent() {
        let mut fs = MemFs::new();
        fs.create(ROOT_INO, "f", 0o644).unwrap();
        fs.sync_meta().unwrap();
        let w = fs.write_count();
        fs.sync_meta().unwrap();
        assert_eq!(fs.write_count(), w);
    }
}
