//! Tasks and the PID table.
//!
//! A [`Task`] is one schedulable unit: saved kernel stack pointer (first
//! field, at a fixed offset for the low-level switch), run state, PID,
//! parent/child links, scheduling accounting, the owning address-space
//! descriptor, the kernel stack, and the descriptor table. The
//! [`TaskTable`] is the task hash: it owns every task, indexed by PID
//! from a dense 256-entry bitmap. Parent links are PIDs, never owning
//! references, so the parent/child cycle cannot leak.

pub mod sched;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;

use bitmaps::Bitmap;
use static_assertions::const_assert;
use zerocopy::AsBytes;

use crate::error::{KernelError, Result};
use crate::file::FileId;
use crate::fs::InodeId;
use crate::param::{KERNEL_STACK_SIZE, MAX_OPEN_FD, MAX_PID_NUM, MAX_TASK_RUN_CLICK};
use crate::vm::AsId;
use crate::x86::{SchedFrame, TrapFrame, TRAP_RET_STUB};

pub type Pid = usize;

const_assert!(MAX_PID_NUM == 256);
const_assert!(MAX_OPEN_FD == 64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Ready or executing; on exactly one ready list.
    Running,
    /// Waiting for a wakeup; on no ready list.
    Blocked,
    /// Terminated, awaiting the parent's reap; on no ready list.
    Zombie,
}

/// Per-task kernel stack.
#[repr(align(4096))]
pub struct KernelStack(pub [u8; KERNEL_STACK_SIZE]);

impl KernelStack {
    const ZERO: KernelStack = KernelStack([0; KERNEL_STACK_SIZE]);
}

/// Byte offset of the trap frame within the kernel stack.
const TF_OFFSET: usize = KERNEL_STACK_SIZE - mem::size_of::<TrapFrame>();
/// Byte offset of a pushed schedule frame, directly below the trap
/// frame.
const SCHED_OFFSET: usize = TF_OFFSET - mem::size_of::<SchedFrame>();

#[repr(C)]
pub struct Task {
    /// Saved kernel stack pointer, as an offset from the stack base.
    /// Must stay the first field: the switch stub loads it at offset 0.
    pub cur_stack: u32,
    pub state: TaskState,
    pub pid: Pid,
    /// Lookup-only link; the table owns the task.
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    /// Remaining quantum, in timer clicks.
    pub remain_click: u32,
    pub need_sched: bool,
    /// A blocked syscall is re-issued from the saved trap frame when
    /// the task is scheduled again.
    pub pending_syscall: bool,
    pub exit_status: i32,
    pub mm: Option<AsId>,
    pub cwd: Option<InodeId>,
    pub files: [Option<FileId>; MAX_OPEN_FD],
    pub fd_map: Bitmap<64>,
    pub close_on_exec: Bitmap<64>,
    kstack: Box<KernelStack>,
}

impl Task {
    /// A fresh task: Blocked until the caller readies it, full quantum,
    /// empty descriptor table, zeroed kernel stack.
    fn new(pid: Pid) -> Self {
        Self {
            cur_stack: TF_OFFSET as u32,
            state: TaskState::Blocked,
            pid,
            parent: None,
            children: Vec::new(),
            remain_click: MAX_TASK_RUN_CLICK,
            need_sched: false,
            pending_syscall: false,
            exit_status: 0,
            mm: None,
            cwd: None,
            files: [None; MAX_OPEN_FD],
            fd_map: Bitmap::new(),
            close_on_exec: Bitmap::new(),
            kstack: Box::new(KernelStack::ZERO),
        }
    }

    /// The saved trap frame at the top of the kernel stack.
    pub fn trap_frame(&self) -> TrapFrame {
        let mut tf = TrapFrame::default();
        tf.as_bytes_mut()
            .copy_from_slice(&self.kstack.0[TF_OFFSET..]);
        tf
    }

    pub fn set_trap_frame(&mut self, tf: &TrapFrame) {
        self.kstack.0[TF_OFFSET..].copy_from_slice(tf.as_bytes());
    }

    /// Reads back a pushed schedule frame (the switch consumes it on
    /// real hardware).
    pub fn sched_frame(&self) -> SchedFrame {
        let mut frame = SchedFrame::default();
        frame
            .as_bytes_mut()
            .copy_from_slice(&self.kstack.0[SCHED_OFFSET..TF_OFFSET]);
        frame
    }

    /// Pushes the schedule frame that makes the first switch into this
    /// task resume at the trap-return stub, under the trap frame the
    /// caller prepared.
    pub fn push_sched_frame(&mut self) {
        let frame = SchedFrame {
            eip: TRAP_RET_STUB,
            ..SchedFrame::default()
        };
        self.kstack.0[SCHED_OFFSET..TF_OFFSET].copy_from_slice(frame.as_bytes());
        self.cur_stack = SCHED_OFFSET as u32;
    }

    // -- descriptor table ------------------------------------------------

    /// Reserves the lowest free descriptor index.
    pub fn alloc_fd(&mut self) -> Result<usize> {
        let fd = self
            .fd_map
            .first_false_index()
            .filter(|&fd| fd < MAX_OPEN_FD)
            .ok_or(KernelError::NoFreeDescriptor)?;
        self.fd_map.set(fd, true);
        Ok(fd)
    }

    pub fn set_fd(&mut self, fd: usize, fid: FileId) {
        self.fd_map.set(fd, true);
        self.files[fd] = Some(fid);
    }

    /// The open file behind a descriptor argument.
    pub fn fd(&self, fd: i32) -> Result<FileId> {
        if fd < 0 || fd as usize >= MAX_OPEN_FD {
            return Err(KernelError::InvalidArgument);
        }
        self.files[fd as usize].ok_or(KernelError::InvalidArgument)
    }

    pub fn clear_fd(&mut self, fd: usize) {
        self.files[fd] = None;
        self.fd_map.set(fd, false);
        self.close_on_exec.set(fd, false);
    }
}

/// The task hash: owner of every task, keyed by PID.
pub struct TaskTable {
    slots: Vec<Option<Box<Task>>>,
    pid_map: Bitmap<256>,
    /// The bootstrap task; orphans are re-parented to it.
    pub init: Option<Pid>,
}

impl TaskTable {
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(MAX_PID_NUM, || None);
        Self {
            slots,
            pid_map: Bitmap::new(),
            init: None,
        }
    }

    /// Allocates a PID and a fresh Blocked task behind it.
    pub fn spawn(&mut self) -> Result<Pid> {
        let pid = self
            .pid_map
            .first_false_index()
            .filter(|&p| p < MAX_PID_NUM)
            .ok_or(KernelError::NoPid)?;
        self.pid_map.set(pid, true);
        self.slots[pid] = Some(Box::new(Task::new(pid)));
        Ok(pid)
    }

    pub fn get(&self, pid: Pid) -> &Task {
        self.slots[pid].as_deref().expect("task hash: no such pid")
    }

    pub fn get_mut(&mut self, pid: Pid) -> &mut Task {
        self.slots[pid].as_deref_mut().expect("task hash: no such pid")
    }

    pub fn find(&self, pid: Pid) -> Option<&Task> {
        self.slots.get(pid).and_then(|s| s.as_deref())
    }

    /// Deletes a reaped zombie: the task leaves the hash, its kernel
    /// stack is freed with it, and the PID returns to the pool.
    pub fn remove(&mut self, pid: Pid) -> Box<Task> {
        let task = self.slots[pid].take().expect("task hash: no such pid");
        assert_eq!(task.state, TaskState::Zombie, "removing a live task");
        self.pid_map.set(pid, false);
        task
    }

    pub fn live_tasks(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
