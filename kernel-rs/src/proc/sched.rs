//! Round-robin scheduler.
//!
//! Two ready lists: `run` feeds the CPU, `time_up` collects tasks whose
//! quantum expired. The current task is the head of `run` and stays
//! there while it runs; expiry moves it to the tail of `time_up` with a
//! refilled quantum. When `run` drains the lists swap; when both are
//! empty the machine idles until an IRQ readies someone. Selection is
//! FIFO within a list.
//!
//! Every list manipulation that can race with the timer IRQ runs under
//! the IRQ-mask token; the tick itself arrives in IRQ context with
//! interrupts already masked.

use alloc::collections::VecDeque;

use minos_kernel_lib::lock::IrqFlag;

use crate::param::MAX_TASK_RUN_CLICK;
use crate::proc::{Pid, TaskState, TaskTable};

pub struct Scheduler {
    run: VecDeque<Pid>,
    time_up: VecDeque<Pid>,
    pub current: Option<Pid>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            run: VecDeque::new(),
            time_up: VecDeque::new(),
            current: None,
        }
    }

    /// Head of the run list — the task `schedule` would pick next.
    pub fn run_head(&self) -> Option<Pid> {
        self.run.front().copied()
    }

    /// Whether a task sits on either ready list.
    pub fn on_ready_lists(&self, pid: Pid) -> bool {
        self.run.contains(&pid) || self.time_up.contains(&pid)
    }

    fn unlink(&mut self, pid: Pid) {
        self.run.retain(|&p| p != pid);
        self.time_up.retain(|&p| p != pid);
    }

    /// Enters a new task into the task system: Running, tail of `run`.
    /// The very first task becomes current outright.
    pub fn add_new(&mut self, tasks: &mut TaskTable, irq: &IrqFlag, pid: Pid) {
        let _irq = irq.save();
        tasks.get_mut(pid).state = TaskState::Running;
        self.run.push_back(pid);
        if self.current.is_none() {
            self.current = Some(pid);
        }
    }

    /// Timer-IRQ accounting: burns one click of the current task's
    /// quantum; on expiry the task moves to the time-up tail, its
    /// quantum refills, and a reschedule is requested.
    pub fn tick(&mut self, tasks: &mut TaskTable) {
        let cur = match self.current {
            Some(p) => p,
            None => return,
        };
        let task = tasks.get_mut(cur);
        if task.need_sched || task.state != TaskState::Running {
            return;
        }
        task.remain_click -= 1;
        if task.remain_click == 0 {
            task.remain_click = MAX_TASK_RUN_CLICK;
            task.need_sched = true;
            self.run.retain(|&p| p != cur);
            self.time_up.push_back(cur);
        }
    }

    /// Takes a task off the ready lists and marks it Blocked.
    pub fn block(&mut self, tasks: &mut TaskTable, irq: &IrqFlag, pid: Pid) {
        let _irq = irq.save();
        let task = tasks.get_mut(pid);
        if task.state == TaskState::Running {
            self.unlink(pid);
        }
        task.state = TaskState::Blocked;
    }

    /// Wakes a task: back onto `run` while its quantum lasts, else onto
    /// `time_up` with a fresh quantum.
    pub fn ready(&mut self, tasks: &mut TaskTable, irq: &IrqFlag, pid: Pid) {
        let _irq = irq.save();
        let task = tasks.get_mut(pid);
        if task.state == TaskState::Running {
            return;
        }
        task.state = TaskState::Running;
        if task.remain_click > 0 {
            self.run.push_back(pid);
        } else {
            task.remain_click = MAX_TASK_RUN_CLICK;
            self.time_up.push_back(pid);
        }
        task.need_sched = true;
    }

    /// Marks a task Zombie and takes it off the ready lists.
    pub fn to_zombie(&mut self, tasks: &mut TaskTable, irq: &IrqFlag, pid: Pid) {
        let _irq = irq.save();
        let task = tasks.get_mut(pid);
        if task.state == TaskState::Running {
            self.unlink(pid);
        }
        task.state = TaskState::Zombie;
    }

    /// Picks the next task: head of `run`, reloading from `time_up`
    /// when `run` is empty. With both lists empty the CPU would sit in
    /// an interrupts-enabled halt loop; that belongs to the trap stubs,
    /// so here the current slot just empties.
    pub fn schedule(&mut self, irq: &IrqFlag) -> Option<Pid> {
        let _irq = irq.save();
        if self.run.is_empty() {
            core::mem::swap(&mut self.run, &mut self.time_up);
        }
        let next = self.run.front().copied();
        self.current = next;
        next
    }
}
