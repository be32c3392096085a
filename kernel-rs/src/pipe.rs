//! Pipes.
//!
//! A pipe is a pseudo inode whose kind carries a bounded byte ring and
//! reader/writer end counts. The two `File`s handed out by
//! [`Kernel::make_pipe`] are the ends; dup and fork share them, and the
//! counts drop only when a `File` itself dies. Readers block on empty
//! (while writers remain), writers block on full (while readers
//! remain); the blocked syscall is re-issued after a wakeup.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::file::{File, FileId, OpenFlags};
use crate::fs::disk::mode;
use crate::fs::InodeKind;
use crate::kernel::Kernel;
use crate::param::PIPE_BUF_SIZE;
use crate::proc::Pid;

pub struct Pipe {
    pub buf: VecDeque<u8>,
    pub readers: u32,
    pub writers: u32,
    pub read_waiters: Vec<Pid>,
    pub write_waiters: Vec<Pid>,
}

impl Pipe {
    pub fn new() -> Self {
        Self {
            buf: VecDeque::new(),
            readers: 1,
            writers: 1,
            read_waiters: Vec::new(),
            write_waiters: Vec::new(),
        }
    }
}

impl Kernel {
    /// Creates a pipe and returns `(read end, write end)`.
    pub fn make_pipe(&mut self) -> Result<(FileId, FileId)> {
        let inode = self
            .vfs
            .alloc_pseudo(mode::S_IFIFO, InodeKind::Pipe(Pipe::new()))?;
        let rf = match self.vfs.files.alloc(File::new(inode, OpenFlags::empty())) {
            Ok(f) => f,
            Err(_) => {
                self.vfs.discard_pseudo(inode);
                return Err(KernelError::OutOfMemory);
            }
        };
        self.vfs.get_inode(inode);
        let wf = match self.vfs.files.alloc(File::new(inode, OpenFlags::O_WRONLY)) {
            Ok(f) => f,
            Err(_) => {
                self.close_file(rf);
                return Err(KernelError::OutOfMemory);
            }
        };
        self.vfs.get_inode(inode);
        Ok((rf, wf))
    }

    /// Pipe read: EOF once every writer is gone, otherwise block until
    /// bytes show up (`None` means "blocked, restart later").
    pub(crate) fn pipe_read(
        &mut self,
        cur: Pid,
        fid: FileId,
        buf: &mut [u8],
    ) -> Result<Option<usize>> {
        let (inode, writes) = {
            let f = self.vfs.files.get(fid);
            (f.inode, f.writes())
        };
        if writes {
            return Err(KernelError::InvalidArgument);
        }
        let pipe = self
            .vfs
            .pipe_mut(inode)
            .ok_or(KernelError::InvalidArgument)?;
        if pipe.buf.is_empty() {
            if pipe.writers == 0 {
                return Ok(Some(0));
            }
            pipe.read_waiters.push(cur);
            self.sched.block(&mut self.tasks, &self.irq, cur);
            return Ok(None);
        }
        let mut n = 0;
        while n < buf.len() {
            match pipe.buf.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        let waiters: Vec<Pid> = pipe.write_waiters.drain(..).collect();
        for pid in waiters {
            self.sched.ready(&mut self.tasks, &self.irq, pid);
        }
        Ok(Some(n))
    }

    /// Pipe write: fails outright with no reader left, blocks while the
    /// ring is full, otherwise takes what fits.
    pub(crate) fn pipe_write(
        &mut self,
        cur: Pid,
        fid: FileId,
        data: &[u8],
    ) -> Result<Option<usize>> {
        let (inode, writes) = {
            let f = self.vfs.files.get(fid);
            (f.inode, f.writes())
        };
        if !writes {
            return Err(KernelError::InvalidArgument);
        }
        let pipe = self
            .vfs
            .pipe_mut(inode)
            .ok_or(KernelError::InvalidArgument)?;
        if pipe.readers == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if pipe.buf.len() >= PIPE_BUF_SIZE {
            pipe.write_waiters.push(cur);
            self.sched.block(&mut self.tasks, &self.irq, cur);
            return Ok(None);
        }
        let room = PIPE_BUF_SIZE - pipe.buf.len();
        let n = room.min(data.len());
        for &b in &data[..n] {
            pipe.buf.push_back(b);
        }
        let waiters: Vec<Pid> = pipe.read_waiters.drain(..).collect();
        for pid in waiters {
            self.sched.ready(&mut self.tasks, &self.irq, pid);
        }
        Ok(Some(n))
    }
}
