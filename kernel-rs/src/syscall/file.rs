//! File-system syscalls: argument checking and kind dispatch, with the
//! heavy lifting in the VFS core.
//!
//! Reads and writes stage through a kernel buffer, so a bad user
//! pointer can never half-corrupt a file and a failed copy-out never
//! advances an offset.

use zerocopy::AsBytes;

use crate::error::{KernelError, Result};
use crate::file::{
    OpenFlags, FD_CLOEXEC, F_DUPFD, F_GETFD, F_GETFL, F_SETFD, F_SETFL,
};
use crate::fs::InodeKind;
use crate::kernel::Kernel;
use crate::param::{MAX_OPEN_FD, MAX_RW_BYTES};
use crate::proc::Pid;
use crate::syscall::SysRet;
use crate::x86::TrapFrame;

/// Which dispatch family an inode belongs to.
#[derive(Clone, Copy, PartialEq, Eq)]
enum IoKind {
    Generic,
    Pipe,
    Tty,
}

impl Kernel {
    fn io_kind(&self, fid: crate::file::FileId) -> IoKind {
        let inode = self.vfs.files.get(fid).inode;
        match self.vfs.inode(inode).kind {
            InodeKind::Pipe(_) => IoKind::Pipe,
            InodeKind::Tty => IoKind::Tty,
            _ => IoKind::Generic,
        }
    }

    pub(crate) fn sys_open(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let path = self.user_path_for(cur, tf.arg1() as usize)?;
        let flags = OpenFlags::from_bits_truncate(tf.arg2());
        let fmode = (tf.arg3() as u16) & 0o7777;
        let cwd = self.tasks.get(cur).cwd.unwrap_or_else(|| self.vfs.root());
        let fid = self.vfs.open(cwd, &path, flags, fmode)?;
        let fd = match self.tasks.get_mut(cur).alloc_fd() {
            Ok(fd) => fd,
            Err(_) => {
                self.close_file(fid);
                return Err(KernelError::OutOfMemory);
            }
        };
        let task = self.tasks.get_mut(cur);
        task.set_fd(fd, fid);
        if flags.contains(OpenFlags::O_CLOEXEC) {
            task.close_on_exec.set(fd, true);
        }
        Ok(SysRet::Done(fd as i32))
    }

    pub(crate) fn sys_read(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let fid = self.tasks.get(cur).fd(tf.arg1() as i32)?;
        let uptr = tf.arg2() as usize;
        let n = tf.arg3() as usize;
        if n == 0 {
            return Ok(SysRet::Done(0));
        }
        if n > MAX_RW_BYTES {
            return Err(KernelError::OutOfMemory);
        }
        let kind = self.io_kind(fid);
        let mut buf = alloc::vec![0u8; n];
        let read = match kind {
            IoKind::Pipe => match self.pipe_read(cur, fid, &mut buf)? {
                Some(n) => n,
                None => return Ok(SysRet::Restart),
            },
            IoKind::Tty => match self.tty_read(cur, &mut buf)? {
                Some(n) => n,
                None => return Ok(SysRet::Restart),
            },
            IoKind::Generic => self.vfs.gener_read(fid, &mut buf)?,
        };
        self.copy_to_user_for(cur, uptr, &buf[..read])?;
        if kind == IoKind::Generic {
            self.vfs.advance(fid, read);
        }
        Ok(SysRet::Done(read as i32))
    }

    pub(crate) fn sys_write(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let fid = self.tasks.get(cur).fd(tf.arg1() as i32)?;
        let uptr = tf.arg2() as usize;
        let n = tf.arg3() as usize;
        if n == 0 {
            return Ok(SysRet::Done(0));
        }
        if n > MAX_RW_BYTES {
            return Err(KernelError::OutOfMemory);
        }
        let mut buf = alloc::vec![0u8; n];
        self.copy_from_user_for(cur, &mut buf, uptr)?;
        let written = match self.io_kind(fid) {
            IoKind::Pipe => match self.pipe_write(cur, fid, &buf)? {
                Some(n) => n,
                None => return Ok(SysRet::Restart),
            },
            IoKind::Tty => self.tty_write(&buf),
            IoKind::Generic => self.vfs.gener_write(fid, &buf)?,
        };
        Ok(SysRet::Done(written as i32))
    }

    pub(crate) fn sys_seek(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let fid = self.tasks.get(cur).fd(tf.arg1() as i32)?;
        if self.io_kind(fid) != IoKind::Generic {
            return Err(KernelError::InvalidArgument);
        }
        let off = self.vfs.gener_seek(fid, tf.arg2() as i32, tf.arg3())?;
        Ok(SysRet::Done(off))
    }

    pub(crate) fn sys_sync(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let fid = self.tasks.get(cur).fd(tf.arg1() as i32)?;
        let inode = self.vfs.files.get(fid).inode;
        self.vfs.fsync(inode)?;
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_close(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let fd = tf.arg1() as i32;
        self.tasks.get(cur).fd(fd)?;
        self.close_fd(cur, fd as usize);
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_ioctl(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let fid = self.tasks.get(cur).fd(tf.arg1() as i32)?;
        match self.io_kind(fid) {
            IoKind::Tty => {
                let val = self.tty_ioctl(cur, tf.arg2(), tf.arg3() as usize)?;
                Ok(SysRet::Done(val))
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    pub(crate) fn sys_readdir(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let fid = self.tasks.get(cur).fd(tf.arg1() as i32)?;
        let dirent = self.vfs.gener_readdir(fid)?;
        self.copy_to_user_for(cur, tf.arg2() as usize, dirent.as_bytes())
            .map_err(|_| KernelError::InvalidArgument)?;
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_mkdir(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let path = self.user_path_for(cur, tf.arg1() as usize)?;
        let fmode = (tf.arg2() as u16) & 0o7777;
        let cwd = self.tasks.get(cur).cwd.unwrap_or_else(|| self.vfs.root());
        self.vfs.mkdir(cwd, &path, fmode)?;
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_link(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let old = self.user_path_for(cur, tf.arg1() as usize)?;
        let new = self.user_path_for(cur, tf.arg2() as usize)?;
        let cwd = self.tasks.get(cur).cwd.unwrap_or_else(|| self.vfs.root());
        self.vfs.link(cwd, &old, &new)?;
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_unlink(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let path = self.user_path_for(cur, tf.arg1() as usize)?;
        let cwd = self.tasks.get(cur).cwd.unwrap_or_else(|| self.vfs.root());
        self.vfs.unlink(cwd, &path)?;
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_rmdir(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let path = self.user_path_for(cur, tf.arg1() as usize)?;
        let cwd = self.tasks.get(cur).cwd.unwrap_or_else(|| self.vfs.root());
        self.vfs.rmdir(cwd, &path)?;
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_ftruncate(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let fid = self.tasks.get(cur).fd(tf.arg1() as i32)?;
        if self.io_kind(fid) != IoKind::Generic {
            return Err(KernelError::InvalidArgument);
        }
        let inode = self.vfs.files.get(fid).inode;
        if crate::fs::disk::mode::is_dir(self.vfs.inode(inode).mode) {
            return Err(KernelError::InvalidArgument);
        }
        self.vfs.truncate_inode(inode, tf.arg2())?;
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_fssync(&mut self, _cur: Pid, _tf: &TrapFrame) -> Result<SysRet> {
        self.vfs.sync_all()?;
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_fstat(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let fid = self.tasks.get(cur).fd(tf.arg1() as i32)?;
        let stat = self.vfs.stat(fid);
        self.copy_to_user_for(cur, tf.arg2() as usize, stat.as_bytes())
            .map_err(|_| KernelError::InvalidArgument)?;
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_fcntl(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let fd = tf.arg1() as i32;
        let fid = self.tasks.get(cur).fd(fd)?;
        let fd = fd as usize;
        let arg = tf.arg3();
        match tf.arg2() {
            F_GETFD => Ok(SysRet::Done(
                self.tasks.get(cur).close_on_exec.get(fd) as i32
            )),
            F_SETFD => {
                self.tasks
                    .get_mut(cur)
                    .close_on_exec
                    .set(fd, arg & FD_CLOEXEC != 0);
                Ok(SysRet::Done(0))
            }
            F_GETFL => Ok(SysRet::Done(self.vfs.files.get(fid).flags.bits() as i32)),
            F_SETFL => {
                self.vfs.files.get_mut(fid).flags = OpenFlags::from_bits_truncate(arg);
                Ok(SysRet::Done(0))
            }
            F_DUPFD => {
                let newfd = self.tasks.get_mut(cur).alloc_fd()?;
                self.tasks.get_mut(cur).set_fd(newfd, fid);
                self.vfs.dup_file(fid);
                Ok(SysRet::Done(newfd as i32))
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    pub(crate) fn sys_dup3(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let oldfd = tf.arg1() as i32;
        let newfd = tf.arg2() as i32;
        let fid = self.tasks.get(cur).fd(oldfd)?;
        if newfd < 0 || newfd as usize >= MAX_OPEN_FD || newfd == oldfd {
            return Err(KernelError::InvalidArgument);
        }
        let newfd = newfd as usize;
        if self.tasks.get(cur).files[newfd].is_some() {
            self.close_fd(cur, newfd);
        }
        let task = self.tasks.get_mut(cur);
        task.set_fd(newfd, fid);
        if tf.arg3() != 0 {
            task.close_on_exec.set(newfd, true);
        }
        self.vfs.dup_file(fid);
        Ok(SysRet::Done(0))
    }

    pub(crate) fn sys_pipe(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let uptr = tf.arg1() as usize;
        let (rf, wf) = self.make_pipe()?;
        let fd0 = match self.tasks.get_mut(cur).alloc_fd() {
            Ok(fd) => fd,
            Err(e) => {
                self.close_file(rf);
                self.close_file(wf);
                return Err(e);
            }
        };
        self.tasks.get_mut(cur).set_fd(fd0, rf);
        let fd1 = match self.tasks.get_mut(cur).alloc_fd() {
            Ok(fd) => fd,
            Err(e) => {
                self.close_fd(cur, fd0);
                self.close_file(wf);
                return Err(e);
            }
        };
        self.tasks.get_mut(cur).set_fd(fd1, wf);
        let fds = [fd0 as i32, fd1 as i32];
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&fds[0].to_le_bytes());
        bytes[4..].copy_from_slice(&fds[1].to_le_bytes());
        if let Err(e) = self.copy_to_user_for(cur, uptr, &bytes) {
            self.close_fd(cur, fds[0] as usize);
            self.close_fd(cur, fds[1] as usize);
            return Err(e);
        }
        Ok(SysRet::Done(0))
    }
}
