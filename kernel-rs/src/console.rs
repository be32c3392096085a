//! The terminal device behind the tty inode.
//!
//! Input arrives byte-wise from the keyboard/serial IRQ path via
//! [`Kernel::feed_console`]; readers block until something is there.
//! Output goes to a sink the display driver drains. One console, one
//! tty inode, shared by every task that inherits descriptors 0..2.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use zerocopy::AsBytes;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::proc::Pid;

/// Window-size request.
pub const TIOCGWINSZ: u32 = 0x5413;

#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes)]
pub struct WinSize {
    pub rows: u16,
    pub cols: u16,
}

pub struct Console {
    input: VecDeque<u8>,
    pub output: Vec<u8>,
    read_waiters: Vec<Pid>,
    pub size: WinSize,
}

impl Console {
    pub fn new() -> Self {
        Self {
            input: VecDeque::new(),
            output: Vec::new(),
            read_waiters: Vec::new(),
            size: WinSize { rows: 25, cols: 80 },
        }
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }
}

impl Kernel {
    /// Input-IRQ path: queue bytes and wake blocked readers.
    pub fn feed_console(&mut self, bytes: &[u8]) {
        self.console.input.extend(bytes.iter().copied());
        let waiters: Vec<Pid> = self.console.read_waiters.drain(..).collect();
        for pid in waiters {
            self.sched.ready(&mut self.tasks, &self.irq, pid);
        }
    }

    /// Tty read: drains queued input, blocking the caller when there is
    /// none yet (`None` means "blocked, restart later").
    pub(crate) fn tty_read(&mut self, cur: Pid, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.console.input.is_empty() {
            self.console.read_waiters.push(cur);
            self.sched.block(&mut self.tasks, &self.irq, cur);
            return Ok(None);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.console.input.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(Some(n))
    }

    /// Tty write: append to the output sink.
    pub(crate) fn tty_write(&mut self, data: &[u8]) -> usize {
        self.console.output.extend_from_slice(data);
        data.len()
    }

    /// Tty ioctl: only the window-size request is understood.
    pub(crate) fn tty_ioctl(&mut self, cur: Pid, req: u32, arg: usize) -> Result<i32> {
        match req {
            TIOCGWINSZ => {
                let size = self.console.size;
                self.copy_to_user_for(cur, arg, size.as_bytes())?;
                Ok(0)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }
}
