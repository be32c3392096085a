//! Syscall dispatch.
//!
//! The dispatcher owns exactly one job: validate the syscall number and
//! route to a handler. Handlers read their arguments from the fixed
//! trap-frame slots and validate them (descriptor ranges, user pointers
//! through the copy helpers). The result lands back in the accumulator
//! slot as a non-negative value or a negative errno.
//!
//! A handler that must wait blocks its task and answers `Restart`: the
//! accumulator is left untouched and the whole syscall is re-issued
//! from the saved trap frame when the task is scheduled again.

mod file;
mod proc;

use crate::error::Result;
use crate::kernel::Kernel;
use crate::x86::TrapFrame;

pub const SYS_FORK: u32 = 1;
pub const SYS_EXIT: u32 = 2;
pub const SYS_WAITPID: u32 = 3;
pub const SYS_GETPID: u32 = 4;
pub const SYS_EXEC: u32 = 5;
pub const SYS_PIPE: u32 = 6;
pub const SYS_OPEN: u32 = 7;
pub const SYS_READ: u32 = 8;
pub const SYS_WRITE: u32 = 9;
pub const SYS_SEEK: u32 = 10;
pub const SYS_SYNC: u32 = 11;
pub const SYS_CLOSE: u32 = 12;
pub const SYS_IOCTL: u32 = 13;
pub const SYS_READDIR: u32 = 14;
pub const SYS_MKDIR: u32 = 15;
pub const SYS_LINK: u32 = 16;
pub const SYS_UNLINK: u32 = 17;
pub const SYS_RMDIR: u32 = 18;
pub const SYS_FTRUNCATE: u32 = 19;
pub const SYS_FSSYNC: u32 = 20;
pub const SYS_FSTAT: u32 = 21;
pub const SYS_FCNTL: u32 = 22;
pub const SYS_DUP3: u32 = 23;
pub const SYS_SBRK: u32 = 24;

/// Handler outcome.
pub(crate) enum SysRet {
    /// Write the value into the accumulator slot.
    Done(i32),
    /// The task blocked; re-issue the syscall after the next wakeup.
    Restart,
    /// The task is gone (exit); nothing to write back.
    NoReturn,
}

impl Kernel {
    /// Trap-side entry: dispatch the current task's saved trap frame.
    pub(crate) fn do_syscall(&mut self) {
        let cur = match self.sched.current {
            Some(c) => c,
            None => return,
        };
        let tf = self.tasks.get(cur).trap_frame();
        match self.dispatch(cur, &tf) {
            Ok(SysRet::Done(val)) => {
                // Re-read the frame: exec may have replaced it.
                let task = self.tasks.get_mut(cur);
                let mut tf = task.trap_frame();
                tf.set_return(val);
                task.set_trap_frame(&tf);
            }
            Ok(SysRet::Restart) => {
                self.tasks.get_mut(cur).pending_syscall = true;
                self.schedule();
            }
            Ok(SysRet::NoReturn) => {
                self.schedule();
            }
            Err(e) => {
                let task = self.tasks.get_mut(cur);
                let mut tf = task.trap_frame();
                tf.set_return(e.errno());
                task.set_trap_frame(&tf);
            }
        }
    }

    fn dispatch(&mut self, cur: crate::proc::Pid, tf: &TrapFrame) -> Result<SysRet> {
        match tf.syscall_num() {
            SYS_FORK => self.sys_fork(cur, tf),
            SYS_EXIT => self.sys_exit(cur, tf),
            SYS_WAITPID => self.sys_waitpid(cur, tf),
            SYS_GETPID => self.sys_getpid(cur, tf),
            SYS_EXEC => self.sys_exec(cur, tf),
            SYS_PIPE => self.sys_pipe(cur, tf),
            SYS_OPEN => self.sys_open(cur, tf),
            SYS_READ => self.sys_read(cur, tf),
            SYS_WRITE => self.sys_write(cur, tf),
            SYS_SEEK => self.sys_seek(cur, tf),
            SYS_SYNC => self.sys_sync(cur, tf),
            SYS_CLOSE => self.sys_close(cur, tf),
            SYS_IOCTL => self.sys_ioctl(cur, tf),
            SYS_READDIR => self.sys_readdir(cur, tf),
            SYS_MKDIR => self.sys_mkdir(cur, tf),
            SYS_LINK => self.sys_link(cur, tf),
            SYS_UNLINK => self.sys_unlink(cur, tf),
            SYS_RMDIR => self.sys_rmdir(cur, tf),
            SYS_FTRUNCATE => self.sys_ftruncate(cur, tf),
            SYS_FSSYNC => self.sys_fssync(cur, tf),
            SYS_FSTAT => self.sys_fstat(cur, tf),
            SYS_FCNTL => self.sys_fcntl(cur, tf),
            SYS_DUP3 => self.sys_dup3(cur, tf),
            SYS_SBRK => self.sys_sbrk(cur, tf),
            _ => Err(crate::error::KernelError::InvalidArgument),
        }
    }
}
