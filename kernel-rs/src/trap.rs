//! Trap dispatch.
//!
//! The assembly entry stubs classify a trap, push the register block,
//! and call in here. Kernel control flow then runs to completion: only
//! the explicit blockers suspend a task, and preemption takes effect at
//! the user-space boundary via [`Kernel::user_return`], never inside
//! the kernel.

use crate::kernel::Kernel;
use crate::proc::TaskState;
use crate::vm;
use crate::x86::FaultCode;

/// What the entry stub decoded.
#[derive(Clone, Copy, Debug)]
pub enum Trap {
    /// `int 0x80`, arguments in the saved trap frame.
    Syscall,
    /// Timer IRQ.
    Timer,
    /// Page fault; `addr` is the faulting linear address, `code` the
    /// hardware error code.
    PageFault { addr: usize, code: FaultCode },
}

impl Kernel {
    /// One full trap: the cause-specific handler, then the user-space
    /// return path.
    pub fn handle_trap(&mut self, trap: Trap) {
        match trap {
            Trap::Syscall => self.do_syscall(),
            Trap::Timer => self.timer_irq(),
            Trap::PageFault { addr, code } => self.page_fault(addr, code),
        }
        self.user_return();
    }

    /// Timer-IRQ bookkeeping. IRQ handlers never schedule; they only
    /// burn the current quantum and raise `need_sched`.
    pub fn timer_irq(&mut self) {
        self.ticks += 1;
        self.sched.tick(&mut self.tasks);
    }

    fn page_fault(&mut self, addr: usize, code: FaultCode) {
        let cur = match self.sched.current {
            Some(c) => c,
            // A fault with no task behind it is a kernel bug.
            None => panic!("page fault at {:#x} with no current task", addr),
        };
        let mm = match self.tasks.get(cur).mm {
            Some(mm) => mm,
            None => {
                self.segment_error(cur);
                return;
            }
        };
        let (space, mut ctx) = self.mm_ctx(mm);
        if vm::handle_fault(space, &mut ctx, addr, code).is_err() {
            // Unresolvable or out of memory: fatal to the task, never
            // to the kernel.
            self.segment_error(cur);
        }
    }

    /// Reselects the current task.
    pub fn schedule(&mut self) {
        // The architecture switch (directory root, TSS kernel stack,
        // register state) keys off the selected task's fields.
        let _next = self.sched.schedule(&self.irq);
    }

    /// Invoked on every return to user space: honor a pending
    /// reschedule request.
    pub fn check_schedule(&mut self) {
        let cur = match self.sched.current {
            Some(c) => c,
            None => return,
        };
        if self.tasks.get(cur).need_sched {
            self.tasks.get_mut(cur).need_sched = false;
            self.schedule();
        }
    }

    /// The user-space boundary: apply pending reschedules and re-issue
    /// any syscall that blocked. Returns once the current task can
    /// proceed in user mode, or with no current task when everyone is
    /// blocked (the stubs then halt until an IRQ).
    pub fn user_return(&mut self) {
        loop {
            self.check_schedule();
            let cur = match self.sched.current {
                Some(c) => c,
                None => {
                    // Idle slot: an IRQ may have readied someone since.
                    self.schedule();
                    match self.sched.current {
                        Some(_) => continue,
                        None => return,
                    }
                }
            };
            if self.tasks.get(cur).state != TaskState::Running {
                // The current task blocked or died inside its handler.
                self.schedule();
                if self.sched.current == Some(cur) {
                    return;
                }
                continue;
            }
            if self.tasks.get(cur).pending_syscall {
                self.tasks.get_mut(cur).pending_syscall = false;
                self.do_syscall();
                continue;
            }
            return;
        }
    }
}
