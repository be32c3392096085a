//! Process syscalls.

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::proc::{Pid, TaskState};
use crate::syscall::SysRet;
use crate::x86::TrapFrame;

impl Kernel {
    /// Child gets 0 in its saved frame, the parent gets the child PID.
    pub(crate) fn sys_fork(&mut self, cur: Pid, _tf: &TrapFrame) -> Result<SysRet> {
        let child = self.fork(cur)?;
        Ok(SysRet::Done(child as i32))
    }

    pub(crate) fn sys_exit(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        self.do_exit(cur, tf.arg1() as i32);
        Ok(SysRet::NoReturn)
    }

    /// Reaps a zombie child (`pid` < 0 means any), writing its exit
    /// status to the optional user pointer. Blocks while children exist
    /// but none is a zombie yet.
    pub(crate) fn sys_waitpid(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let pid_arg = tf.arg1() as i32;
        let status_ptr = tf.arg2() as usize;
        let children = self.tasks.get(cur).children.clone();
        if children.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if pid_arg >= 0 && !children.contains(&(pid_arg as Pid)) {
            return Err(KernelError::InvalidArgument);
        }
        let zombie = children
            .into_iter()
            .find(|&c| {
                (pid_arg < 0 || c == pid_arg as Pid)
                    && self.tasks.get(c).state == TaskState::Zombie
            });
        match zombie {
            Some(child) => {
                let status = self.tasks.get(child).exit_status;
                if status_ptr != 0 {
                    self.copy_to_user_for(cur, status_ptr, &status.to_le_bytes())?;
                }
                self.reap(cur, child);
                Ok(SysRet::Done(child as i32))
            }
            None => {
                self.sched.block(&mut self.tasks, &self.irq, cur);
                Ok(SysRet::Restart)
            }
        }
    }

    pub(crate) fn sys_getpid(&mut self, cur: Pid, _tf: &TrapFrame) -> Result<SysRet> {
        Ok(SysRet::Done(cur as i32))
    }

    pub(crate) fn sys_exec(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let path = self.user_path_for(cur, tf.arg1() as usize)?;
        self.exec(cur, &path)?;
        // The rebuilt frame carries 0 into user space.
        Ok(SysRet::Done(0))
    }

    /// Moves the heap break by `delta` bytes; returns the old break.
    pub(crate) fn sys_sbrk(&mut self, cur: Pid, tf: &TrapFrame) -> Result<SysRet> {
        let delta = tf.arg1() as i32;
        let mm = self
            .tasks
            .get(cur)
            .mm
            .ok_or(KernelError::InvalidArgument)?;
        let old = if delta >= 0 {
            self.aspaces.get_mut(mm).grow_heap(delta as usize)?
        } else {
            let Kernel { aspaces, kmem, .. } = self;
            aspaces.get_mut(mm).shrink_heap(kmem, delta.unsigned_abs() as usize)?
        };
        Ok(SysRet::Done(old as i32))
    }
}
