//! The process-wide kernel object.
//!
//! Everything mutable in the system hangs off [`Kernel`]: the frame
//! pool, the VFS, the address-space slab, the task hash, the scheduler,
//! and the console. Boot builds exactly one from [`BootArgs`] and never
//! tears it down; single-CPU discipline (no in-kernel preemption, IRQ
//! masking around scheduler state) makes the interior safe to mutate
//! through plain `&mut` access.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use bitmaps::Bitmap;
use minos_kernel_lib::arena::ArrayArena;
use minos_kernel_lib::lock::IrqFlag;

use crate::addr::UVAddr;
use crate::console::Console;
use crate::error::{KernelError, Result};
use crate::file::{File, FileId, OpenFlags};
use crate::fs::disk::DiskFs;
use crate::fs::Vfs;
use crate::kalloc::Kmem;
use crate::param::{MAX_OPEN_FD, MAX_PATH_LEN, NASPACE, TASK_FATAL_STATUS};
use crate::proc::sched::Scheduler;
use crate::proc::{Pid, TaskState, TaskTable};
use crate::vm::{self, AddrSpace, AsId, FaultCtx, VmStats};

/// Everything the boot path hands the kernel.
pub struct BootArgs {
    /// Frames the physical pool manages.
    pub memory_frames: usize,
    /// The mounted filesystem's storage driver.
    pub disk: Box<dyn DiskFs>,
}

pub struct Kernel {
    pub irq: IrqFlag,
    pub kmem: Kmem,
    pub vfs: Vfs,
    pub aspaces: ArrayArena<AddrSpace, NASPACE>,
    pub tasks: TaskTable,
    pub sched: Scheduler,
    pub console: Console,
    pub vm_stats: VmStats,
    pub ticks: u64,
}

impl Kernel {
    pub fn new(args: BootArgs) -> Result<Self> {
        let kernel = Self {
            irq: IrqFlag::new(),
            kmem: Kmem::new(args.memory_frames),
            vfs: Vfs::new(args.disk)?,
            aspaces: ArrayArena::new(),
            tasks: TaskTable::new(),
            sched: Scheduler::new(),
            console: Console::new(),
            vm_stats: VmStats::default(),
            ticks: 0,
        };
        kernel.irq.enable();
        Ok(kernel)
    }

    /// Builds and launches the first task: descriptors 0..2 on the tty,
    /// current directory at the root, address space from the executable
    /// at `path`. The task becomes runnable (and current) here.
    pub fn setup_init(&mut self, path: &str) -> Result<Pid> {
        let pid = self.tasks.spawn()?;
        self.tasks.init = Some(pid);
        let tty = self.vfs.tty();
        let f = self
            .vfs
            .files
            .alloc(File::new(tty, OpenFlags::O_RDWR))
            .map_err(|_| KernelError::OutOfMemory)?;
        self.vfs.get_inode(tty);
        self.vfs.dup_file(f);
        self.vfs.dup_file(f);
        let root = self.vfs.root();
        self.vfs.get_inode(root);
        {
            let task = self.tasks.get_mut(pid);
            for fd in 0..3 {
                task.set_fd(fd, f);
            }
            task.cwd = Some(root);
        }
        self.exec(pid, path)?;
        self.sched.add_new(&mut self.tasks, &self.irq, pid);
        Ok(pid)
    }

    pub fn current(&self) -> Option<Pid> {
        self.sched.current
    }

    // ------------------------------------------------------------------
    // User-memory access on behalf of a task
    // ------------------------------------------------------------------

    /// Splits the kernel into an address space and the context the
    /// fault resolver needs alongside it.
    pub(crate) fn mm_ctx(&mut self, id: AsId) -> (&mut AddrSpace, FaultCtx<'_>) {
        let Kernel {
            aspaces,
            kmem,
            vfs,
            vm_stats,
            ..
        } = self;
        (
            aspaces.get_mut(id),
            FaultCtx {
                kmem,
                vfs,
                stats: vm_stats,
            },
        )
    }

    fn task_mm(&self, pid: Pid) -> Result<AsId> {
        self.tasks.get(pid).mm.ok_or(KernelError::Fault)
    }

    pub fn copy_to_user_for(&mut self, pid: Pid, dst: usize, src: &[u8]) -> Result<()> {
        let id = self.task_mm(pid)?;
        let (mm, mut ctx) = self.mm_ctx(id);
        vm::copy_to_user(mm, &mut ctx, UVAddr::from(dst), src)
    }

    pub fn copy_from_user_for(&mut self, pid: Pid, dst: &mut [u8], src: usize) -> Result<()> {
        let id = self.task_mm(pid)?;
        let (mm, mut ctx) = self.mm_ctx(id);
        vm::copy_from_user(mm, &mut ctx, dst, UVAddr::from(src))
    }

    /// Fetches a NUL-terminated, `MAX_PATH_LEN`-bounded user string.
    pub fn user_path_for(&mut self, pid: Pid, src: usize) -> Result<String> {
        let id = self.task_mm(pid)?;
        let mut buf = alloc::vec![0u8; MAX_PATH_LEN];
        let (mm, mut ctx) = self.mm_ctx(id);
        vm::user_path(mm, &mut ctx, UVAddr::from(src), &mut buf)
    }

    // ------------------------------------------------------------------
    // Resource teardown
    // ------------------------------------------------------------------

    /// Drops one reference to an open file, running kind-specific close
    /// behavior (pipe end accounting, waiter wakeup) when the last
    /// reference goes.
    pub fn close_file(&mut self, fid: FileId) {
        let file = match self.vfs.release_file(fid) {
            Some(f) => f,
            None => return,
        };
        let inode = file.inode;
        let mut waiters: Vec<Pid> = Vec::new();
        if let Some(pipe) = self.vfs.pipe_mut(inode) {
            if file.writes() {
                pipe.writers -= 1;
            } else {
                pipe.readers -= 1;
            }
            waiters.extend(pipe.read_waiters.drain(..));
            waiters.extend(pipe.write_waiters.drain(..));
        }
        let _ = self.vfs.put_inode(inode);
        for pid in waiters {
            self.sched.ready(&mut self.tasks, &self.irq, pid);
        }
    }

    /// Closes one descriptor slot of a task.
    pub fn close_fd(&mut self, pid: Pid, fd: usize) {
        let fid = {
            let task = self.tasks.get_mut(pid);
            let fid = task.files[fd];
            task.clear_fd(fd);
            fid
        };
        if let Some(fid) = fid {
            self.close_file(fid);
        }
    }

    /// Drops one reference to an address-space descriptor; the last one
    /// releases every mapped frame, the page tables, and the
    /// executable-image file reference.
    pub fn aspace_put(&mut self, id: AsId) {
        if let Some(mm) = self.aspaces.release(id) {
            let exec = mm.exec_image;
            mm.release(&mut self.kmem);
            if let Some(fid) = exec {
                self.close_file(fid);
            }
        }
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// Fork-clone: copy-on-write snapshot of the parent's address
    /// space, duplicated descriptor table and close-on-exec bitmap,
    /// child trap frame returning 0, schedule frame aimed at the
    /// trap-return stub.
    pub fn fork(&mut self, parent: Pid) -> Result<Pid> {
        // Clone the address space before anything irreversible.
        let child_mm = match self.tasks.get(parent).mm {
            Some(id) => {
                let Kernel { aspaces, kmem, .. } = self;
                aspaces.get(id).clone_cow(kmem)?
            }
            None => AddrSpace::new(),
        };
        let child_as = match self.aspaces.alloc(child_mm) {
            Ok(id) => id,
            Err(mm) => {
                // The slab is full; hand the cloned frames back.
                mm.release(&mut self.kmem);
                return Err(KernelError::OutOfMemory);
            }
        };
        if let Some(fid) = self.aspaces.get(child_as).exec_image {
            self.vfs.dup_file(fid);
        }
        let child = match self.tasks.spawn() {
            Ok(pid) => pid,
            Err(e) => {
                self.aspace_put(child_as);
                return Err(e);
            }
        };
        let (files, fd_map, cloexec, cwd, parent_tf) = {
            let p = self.tasks.get(parent);
            (
                p.files,
                p.fd_map.clone(),
                p.close_on_exec.clone(),
                p.cwd,
                p.trap_frame(),
            )
        };
        for fid in files.iter().flatten() {
            self.vfs.dup_file(*fid);
        }
        if let Some(cwd) = cwd {
            self.vfs.get_inode(cwd);
        }
        {
            let c = self.tasks.get_mut(child);
            c.mm = Some(child_as);
            c.files = files;
            c.fd_map = fd_map;
            c.close_on_exec = cloexec;
            c.cwd = cwd;
            c.parent = Some(parent);
            let mut tf = parent_tf;
            tf.set_return(0);
            c.set_trap_frame(&tf);
            c.push_sched_frame();
        }
        self.tasks.get_mut(parent).children.push(child);
        self.sched.add_new(&mut self.tasks, &self.irq, child);
        Ok(child)
    }

    /// Exit: release every owned resource, hand children to init, go
    /// Zombie, wake a parent blocked in wait.
    pub fn do_exit(&mut self, pid: Pid, status: i32) {
        let (fids, mm, cwd, children, parent) = {
            let task = self.tasks.get_mut(pid);
            let mut fids = Vec::new();
            for fd in 0..MAX_OPEN_FD {
                if let Some(f) = task.files[fd].take() {
                    fids.push(f);
                }
            }
            task.fd_map = Bitmap::new();
            task.close_on_exec = Bitmap::new();
            (
                fids,
                task.mm.take(),
                task.cwd.take(),
                core::mem::take(&mut task.children),
                task.parent,
            )
        };
        for fid in fids {
            self.close_file(fid);
        }
        if let Some(cwd) = cwd {
            let _ = self.vfs.put_inode(cwd);
        }
        if let Some(mm) = mm {
            self.aspace_put(mm);
        }
        if let Some(init) = self.tasks.init {
            if init != pid {
                for &c in &children {
                    self.tasks.get_mut(c).parent = Some(init);
                }
                self.tasks.get_mut(init).children.extend(children);
            }
        }
        self.sched.to_zombie(&mut self.tasks, &self.irq, pid);
        self.tasks.get_mut(pid).exit_status = status;
        if let Some(pp) = parent {
            // The parent may be blocked in wait (or anywhere else; a
            // spurious wakeup just re-checks its condition).
            if self.tasks.find(pp).map(|t| t.state) == Some(TaskState::Blocked) {
                self.sched.ready(&mut self.tasks, &self.irq, pp);
            }
        }
    }

    /// Parent-side reap of a zombie child: unlink it, free its kernel
    /// stack and PID, return its exit status.
    pub fn reap(&mut self, parent: Pid, child: Pid) -> i32 {
        debug_assert_eq!(self.tasks.get(child).state, TaskState::Zombie);
        debug_assert!(!self.sched.on_ready_lists(child));
        self.tasks.get_mut(parent).children.retain(|&c| c != child);
        let task = self.tasks.remove(child);
        task.exit_status
    }

    /// Kills a task for an unresolvable fault.
    pub fn segment_error(&mut self, pid: Pid) {
        self.do_exit(pid, TASK_FATAL_STATUS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::TIOCGWINSZ;
    use crate::exec::{pack_image, SectionSpec};
    use crate::fs::disk::DiskFs;
    use crate::fs::memfs::MemFs;
    use crate::memlayout::{USER_HEAP_START, USER_STACK_TOP};
    use crate::param::MAX_TASK_RUN_CLICK;
    use crate::syscall::*;
    use crate::trap::Trap;
    use crate::vm::AreaFlags;
    use crate::x86::{FaultCode, GDT_USER_CS, TRAP_RET_STUB};
    use alloc::vec::Vec;

    const INIT_ENTRY: u32 = 0x0800_0000;

    fn boot() -> Kernel {
        let mut disk = MemFs::new();
        let text = [0x90u8; 64];
        let img = pack_image(
            INIT_ENTRY,
            &[SectionSpec {
                vaddr: INIT_ENTRY,
                mem_len: 4096,
                flags: AreaFlags::ALLOC | AreaFlags::EXEC,
                data: &text,
            }],
        );
        let root = disk.root_ino();
        disk.add_file(root, "init", &img).unwrap();
        let mut k = Kernel::new(BootArgs {
            memory_frames: 512,
            disk: Box::new(disk),
        })
        .unwrap();
        k.setup_init("/init").unwrap();
        k
    }

    /// Issues a syscall as the current task; returns the value left in
    /// its accumulator slot (stale for tasks that blocked or died).
    fn sys(k: &mut Kernel, num: u32, a1: u32, a2: u32, a3: u32) -> i32 {
        let cur = k.current().expect("no current task");
        let mut tf = k.tasks.get(cur).trap_frame();
        tf.eax = num;
        tf.ebx = a1;
        tf.ecx = a2;
        tf.edx = a3;
        k.tasks.get_mut(cur).set_trap_frame(&tf);
        k.handle_trap(Trap::Syscall);
        match k.tasks.find(cur) {
            Some(t) => t.trap_frame().eax as i32,
            None => 0,
        }
    }

    /// Plants a NUL-terminated string in the current task's heap.
    fn put_cstr(k: &mut Kernel, addr: usize, s: &str) {
        let cur = k.current().unwrap();
        let mut bytes = Vec::from(s.as_bytes());
        bytes.push(0);
        k.copy_to_user_for(cur, addr, &bytes).unwrap();
    }

    const PATH_A: usize = USER_HEAP_START;
    const PATH_B: usize = USER_HEAP_START + 0x100;
    const DATA: usize = USER_HEAP_START + 0x1000;
    const SCRATCH: usize = USER_HEAP_START + 0x2000;

    #[test]
    fn boot_launches_init_on_the_tty() {
        let k = boot();
        let pid = k.current().unwrap();
        assert_eq!(k.tasks.init, Some(pid));
        let task = k.tasks.get(pid);
        let tf = task.trap_frame();
        assert_eq!(tf.eip, INIT_ENTRY);
        assert_eq!(tf.user_esp, USER_STACK_TOP as u32);
        assert_eq!(tf.cs, GDT_USER_CS);
        let f0 = task.fd(0).unwrap();
        assert_eq!(task.fd(1).unwrap(), f0);
        assert_eq!(task.fd(2).unwrap(), f0);
        assert_eq!(k.vfs.files.get(f0).inode, k.vfs.tty());
    }

    #[test]
    fn fork_returns_child_pid_to_parent_and_zero_to_child() {
        let mut k = boot();
        let parent = k.current().unwrap();
        let child = sys(&mut k, SYS_FORK, 0, 0, 0);
        assert!(child > 0);
        let child = child as usize;
        let ct = k.tasks.get(child);
        assert_eq!(ct.trap_frame().eax, 0);
        assert_eq!(ct.sched_frame().eip, TRAP_RET_STUB);
        assert_eq!(ct.parent, Some(parent));
        assert!(k.tasks.get(parent).children.contains(&child));
        assert!(k.sched.on_ready_lists(child));
        // The parent keeps running until its quantum expires.
        assert_eq!(k.current(), Some(parent));
    }

    #[test]
    fn fork_shares_frames_until_the_child_writes() {
        let mut k = boot();
        let parent = k.current().unwrap();
        k.copy_to_user_for(parent, DATA, &[0xAA; 8]).unwrap();
        let child = sys(&mut k, SYS_FORK, 0, 0, 0) as usize;

        let pmm = k.tasks.get(parent).mm.unwrap();
        let (frame, _) = k.aspaces.get(pmm).translate(&k.kmem, DATA).unwrap();
        assert_eq!(k.kmem.refcount(frame), 2);

        let cow_before = k.vm_stats.cow_copies;
        k.copy_to_user_for(child, DATA, &[0xBB; 8]).unwrap();
        assert_eq!(k.vm_stats.cow_copies, cow_before + 1);
        assert_eq!(k.kmem.refcount(frame), 1);

        let mut buf = [0u8; 8];
        k.copy_from_user_for(parent, &mut buf, DATA).unwrap();
        assert_eq!(buf, [0xAA; 8]);
        k.copy_from_user_for(child, &mut buf, DATA).unwrap();
        assert_eq!(buf, [0xBB; 8]);
    }

    #[test]
    fn waitpid_blocks_until_the_child_exits() {
        let mut k = boot();
        let parent = k.current().unwrap();
        let child = sys(&mut k, SYS_FORK, 0, 0, 0) as usize;
        let live_before = k.tasks.live_tasks();

        let _ = sys(&mut k, SYS_WAITPID, -1i32 as u32, SCRATCH as u32, 0);
        assert_eq!(k.tasks.get(parent).state, TaskState::Blocked);
        assert_eq!(k.current(), Some(child));

        let _ = sys(&mut k, SYS_EXIT, 42, 0, 0);
        // The exit woke the parent, whose wait re-ran and reaped.
        assert_eq!(k.current(), Some(parent));
        assert_eq!(k.tasks.get(parent).state, TaskState::Running);
        assert_eq!(k.tasks.get(parent).trap_frame().eax as i32, child as i32);
        assert!(k.tasks.find(child).is_none());
        assert_eq!(k.tasks.live_tasks(), live_before - 1);
        let mut st = [0u8; 4];
        k.copy_from_user_for(parent, &mut st, SCRATCH).unwrap();
        assert_eq!(i32::from_le_bytes(st), 42);
        assert!(k.tasks.get(parent).children.is_empty());
    }

    #[test]
    fn waitpid_without_children_is_invalid() {
        let mut k = boot();
        assert_eq!(sys(&mut k, SYS_WAITPID, -1i32 as u32, 0, 0), -22);
    }

    #[test]
    fn exec_closes_marked_descriptors_and_keeps_the_rest() {
        let mut k = boot();
        let pid = k.current().unwrap();
        put_cstr(&mut k, PATH_A, "/a");
        put_cstr(&mut k, PATH_B, "/b");
        let flags_cloexec = (crate::file::OpenFlags::O_CREAT | crate::file::OpenFlags::O_CLOEXEC).bits();
        let fd3 = sys(&mut k, SYS_OPEN, PATH_A as u32, flags_cloexec, 0o644);
        assert_eq!(fd3, 3);
        let fd4 = sys(
            &mut k,
            SYS_OPEN,
            PATH_B as u32,
            crate::file::OpenFlags::O_CREAT.bits(),
            0o644,
        );
        assert_eq!(fd4, 4);
        let fid4 = k.tasks.get(pid).fd(4).unwrap();
        let inode4 = k.vfs.files.get(fid4).inode;

        put_cstr(&mut k, DATA, "/init");
        assert_eq!(sys(&mut k, SYS_EXEC, DATA as u32, 0, 0), 0);

        let task = k.tasks.get(pid);
        assert!(task.fd(3).is_err());
        assert!(!task.fd_map.get(3));
        let fid4_after = task.fd(4).unwrap();
        assert_eq!(fid4_after, fid4);
        assert_eq!(k.vfs.files.get(fid4_after).inode, inode4);
        // Fresh program state.
        assert_eq!(k.tasks.get(pid).trap_frame().eip, INIT_ENTRY);
    }

    #[test]
    fn timer_preemption_alternates_two_busy_tasks() {
        let mut k = boot();
        let a = k.current().unwrap();
        let b = sys(&mut k, SYS_FORK, 0, 0, 0) as usize;
        let mut ran = [0u32; 256];
        let mut order = Vec::new();
        for _ in 0..2 * MAX_TASK_RUN_CLICK {
            let cur = k.current().unwrap();
            ran[cur] += 1;
            if order.last() != Some(&cur) {
                order.push(cur);
            }
            k.handle_trap(Trap::Timer);
        }
        assert_eq!(ran[a], MAX_TASK_RUN_CLICK);
        assert_eq!(ran[b], MAX_TASK_RUN_CLICK);
        assert_eq!(order, [a, b]);
        // Third round starts over with the first task.
        assert_eq!(k.current(), Some(a));
    }

    #[test]
    fn kernel_range_fault_kills_the_task() {
        let mut k = boot();
        let pid = k.current().unwrap();
        k.handle_trap(Trap::PageFault {
            addr: 0xC000_1000,
            code: FaultCode::WRITE,
        });
        assert_eq!(k.tasks.get(pid).state, TaskState::Zombie);
        assert_eq!(k.tasks.get(pid).exit_status, TASK_FATAL_STATUS);
        assert_eq!(k.current(), None);
    }

    #[test]
    fn blocked_pipe_reader_is_woken_by_the_writer() {
        let mut k = boot();
        let parent = k.current().unwrap();
        assert_eq!(sys(&mut k, SYS_PIPE, SCRATCH as u32, 0, 0), 0);
        let mut fds = [0u8; 8];
        k.copy_from_user_for(parent, &mut fds, SCRATCH).unwrap();
        let fd_r = i32::from_le_bytes([fds[0], fds[1], fds[2], fds[3]]) as u32;
        let fd_w = i32::from_le_bytes([fds[4], fds[5], fds[6], fds[7]]) as u32;

        let child = sys(&mut k, SYS_FORK, 0, 0, 0) as usize;
        let _ = sys(&mut k, SYS_READ, fd_r, DATA as u32, 4);
        assert_eq!(k.tasks.get(parent).state, TaskState::Blocked);
        assert_eq!(k.current(), Some(child));

        k.copy_to_user_for(child, PATH_A, b"ping").unwrap();
        assert_eq!(sys(&mut k, SYS_WRITE, fd_w, PATH_A as u32, 4), 4);
        // The writer keeps its quantum; the reader resumes when the
        // scheduler rotates.
        for _ in 0..MAX_TASK_RUN_CLICK {
            k.handle_trap(Trap::Timer);
        }
        assert_eq!(k.current(), Some(parent));
        assert_eq!(k.tasks.get(parent).trap_frame().eax, 4);
        let mut out = [0u8; 4];
        k.copy_from_user_for(parent, &mut out, DATA).unwrap();
        assert_eq!(&out, b"ping");
    }

    #[test]
    fn pipe_read_sees_eof_after_the_last_writer_closes() {
        let mut k = boot();
        assert_eq!(sys(&mut k, SYS_PIPE, SCRATCH as u32, 0, 0), 0);
        let parent = k.current().unwrap();
        let mut fds = [0u8; 8];
        k.copy_from_user_for(parent, &mut fds, SCRATCH).unwrap();
        let fd_r = i32::from_le_bytes([fds[0], fds[1], fds[2], fds[3]]) as u32;
        let fd_w = i32::from_le_bytes([fds[4], fds[5], fds[6], fds[7]]) as u32;
        assert_eq!(sys(&mut k, SYS_CLOSE, fd_w, 0, 0), 0);
        assert_eq!(sys(&mut k, SYS_READ, fd_r, DATA as u32, 16), 0);
        // And writing with no reader left fails.
        assert_eq!(sys(&mut k, SYS_CLOSE, fd_r, 0, 0), 0);
    }

    #[test]
    fn tty_read_blocks_until_console_input() {
        let mut k = boot();
        let pid = k.current().unwrap();
        let _ = sys(&mut k, SYS_READ, 0, DATA as u32, 8);
        assert_eq!(k.tasks.get(pid).state, TaskState::Blocked);
        assert_eq!(k.current(), None);

        k.feed_console(b"hi");
        k.user_return();
        assert_eq!(k.current(), Some(pid));
        assert_eq!(k.tasks.get(pid).trap_frame().eax, 2);
        let mut out = [0u8; 2];
        k.copy_from_user_for(pid, &mut out, DATA).unwrap();
        assert_eq!(&out, b"hi");
    }

    #[test]
    fn tty_write_and_winsize_ioctl() {
        let mut k = boot();
        let pid = k.current().unwrap();
        k.copy_to_user_for(pid, DATA, b"hello").unwrap();
        assert_eq!(sys(&mut k, SYS_WRITE, 1, DATA as u32, 5), 5);
        assert_eq!(&k.console.output, b"hello");

        assert_eq!(sys(&mut k, SYS_IOCTL, 1, TIOCGWINSZ, SCRATCH as u32), 0);
        let mut ws = [0u8; 4];
        k.copy_from_user_for(pid, &mut ws, SCRATCH).unwrap();
        assert_eq!(u16::from_le_bytes([ws[0], ws[1]]), 25);
        assert_eq!(u16::from_le_bytes([ws[2], ws[3]]), 80);
    }

    #[test]
    fn file_round_trip_through_user_buffers() {
        let mut k = boot();
        let pid = k.current().unwrap();
        put_cstr(&mut k, PATH_A, "/notes");
        let fd = sys(
            &mut k,
            SYS_OPEN,
            PATH_A as u32,
            crate::file::OpenFlags::O_CREAT.bits(),
            0o644,
        );
        assert!(fd >= 0);
        k.copy_to_user_for(pid, DATA, b"round trip payload").unwrap();
        assert_eq!(sys(&mut k, SYS_WRITE, fd as u32, DATA as u32, 18), 18);
        assert_eq!(sys(&mut k, SYS_SEEK, fd as u32, 0, 0), 0);
        assert_eq!(sys(&mut k, SYS_READ, fd as u32, SCRATCH as u32, 18), 18);
        let mut out = [0u8; 18];
        k.copy_from_user_for(pid, &mut out, SCRATCH).unwrap();
        assert_eq!(&out, b"round trip payload");

        // Reading into a kernel-range pointer faults cleanly.
        assert_eq!(sys(&mut k, SYS_SEEK, fd as u32, 0, 0), 0);
        assert_eq!(
            sys(&mut k, SYS_READ, fd as u32, 0xC000_0000, 4),
            -14
        );
        // A failed copy-out does not advance the offset.
        assert_eq!(sys(&mut k, SYS_READ, fd as u32, SCRATCH as u32, 5), 5);
        let mut head = [0u8; 5];
        k.copy_from_user_for(pid, &mut head, SCRATCH).unwrap();
        assert_eq!(&head, b"round");
    }

    #[test]
    fn close_twice_is_invalid() {
        let mut k = boot();
        put_cstr(&mut k, PATH_A, "/once");
        let fd = sys(
            &mut k,
            SYS_OPEN,
            PATH_A as u32,
            crate::file::OpenFlags::O_CREAT.bits(),
            0o644,
        );
        assert!(fd >= 0);
        assert_eq!(sys(&mut k, SYS_CLOSE, fd as u32, 0, 0), 0);
        assert_eq!(sys(&mut k, SYS_CLOSE, fd as u32, 0, 0), -22);
    }

    #[test]
    fn fstat_reports_the_inode() {
        let mut k = boot();
        let pid = k.current().unwrap();
        put_cstr(&mut k, PATH_A, "/stat_me");
        let fd = sys(
            &mut k,
            SYS_OPEN,
            PATH_A as u32,
            crate::file::OpenFlags::O_CREAT.bits(),
            0o644,
        );
        k.copy_to_user_for(pid, DATA, &[7u8; 10]).unwrap();
        assert_eq!(sys(&mut k, SYS_WRITE, fd as u32, DATA as u32, 10), 10);
        assert_eq!(sys(&mut k, SYS_FSTAT, fd as u32, SCRATCH as u32, 0), 0);
        let mut raw = [0u8; 16];
        k.copy_from_user_for(pid, &mut raw, SCRATCH).unwrap();
        let links = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let size = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
        assert_eq!(links, 1);
        assert_eq!(size, 10);
    }

    #[test]
    fn fcntl_commands_and_dup3() {
        let mut k = boot();
        let pid = k.current().unwrap();
        put_cstr(&mut k, PATH_A, "/f");
        let fd = sys(
            &mut k,
            SYS_OPEN,
            PATH_A as u32,
            (crate::file::OpenFlags::O_CREAT | crate::file::OpenFlags::O_APPEND).bits(),
            0o644,
        ) as u32;

        assert_eq!(sys(&mut k, SYS_FCNTL, fd, crate::file::F_GETFD, 0), 0);
        assert_eq!(
            sys(&mut k, SYS_FCNTL, fd, crate::file::F_SETFD, crate::file::FD_CLOEXEC),
            0
        );
        assert_eq!(sys(&mut k, SYS_FCNTL, fd, crate::file::F_GETFD, 0), 1);
        let fl = sys(&mut k, SYS_FCNTL, fd, crate::file::F_GETFL, 0) as u32;
        assert_ne!(fl & crate::file::OpenFlags::O_APPEND.bits(), 0);
        // F_SETFL stores flags and returns 0; it must not dup the fd.
        let before = k.tasks.get(pid).fd_map.first_false_index();
        assert_eq!(sys(&mut k, SYS_FCNTL, fd, crate::file::F_SETFL, 0), 0);
        assert_eq!(k.tasks.get(pid).fd_map.first_false_index(), before);

        let dup = sys(&mut k, SYS_FCNTL, fd, crate::file::F_DUPFD, 0);
        assert!(dup >= 0 && dup != fd as i32);
        assert_eq!(
            k.tasks.get(pid).fd(dup).unwrap(),
            k.tasks.get(pid).fd(fd as i32).unwrap()
        );

        assert_eq!(sys(&mut k, SYS_DUP3, fd, 20, 1), 0);
        assert!(k.tasks.get(pid).close_on_exec.get(20));
        assert_eq!(
            k.tasks.get(pid).fd(20).unwrap(),
            k.tasks.get(pid).fd(fd as i32).unwrap()
        );
        assert_eq!(sys(&mut k, SYS_DUP3, fd, fd, 0), -22);
    }

    #[test]
    fn sbrk_moves_the_break_and_checks_bounds() {
        let mut k = boot();
        let old = sys(&mut k, SYS_SBRK, 0x2000, 0, 0);
        assert_eq!(
            old as usize,
            USER_HEAP_START + crate::memlayout::USER_HEAP_DEFAULT_LEN
        );
        let next = sys(&mut k, SYS_SBRK, 0, 0, 0);
        assert_eq!(next, old + 0x2000);
        assert_eq!(sys(&mut k, SYS_SBRK, (-0x2000i32) as u32, 0, 0), next);
        // Growing into the stack area is refused.
        assert_eq!(sys(&mut k, SYS_SBRK, 0x7000_0000, 0, 0), -12);
    }

    #[test]
    fn fssync_twice_costs_no_extra_disk_writes() {
        let mut k = boot();
        let pid = k.current().unwrap();
        put_cstr(&mut k, PATH_A, "/dirty");
        let fd = sys(
            &mut k,
            SYS_OPEN,
            PATH_A as u32,
            crate::file::OpenFlags::O_CREAT.bits(),
            0o644,
        );
        k.copy_to_user_for(pid, DATA, b"payload").unwrap();
        assert_eq!(sys(&mut k, SYS_WRITE, fd as u32, DATA as u32, 7), 7);
        assert_eq!(sys(&mut k, SYS_FSSYNC, 0, 0, 0), 0);
        let writes = k.vfs.disk.write_count();
        assert_eq!(sys(&mut k, SYS_FSSYNC, 0, 0, 0), 0);
        assert_eq!(k.vfs.disk.write_count(), writes);
    }

    #[test]
    fn unknown_syscall_number_is_invalid() {
        let mut k = boot();
        assert_eq!(sys(&mut k, 999, 0, 0, 0), -22);
        assert_eq!(sys(&mut k, SYS_READ, 63, 0, 0), -22);
    }
}
