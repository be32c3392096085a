//! Open-file handles.

use minos_kernel_lib::arena::Handle;

use crate::fs::InodeId;

bitflags! {
    /// Open flags, Linux-compatible numbering.
    pub struct OpenFlags: u32 {
        const O_WRONLY = 0o1;
        const O_RDWR = 0o2;
        const O_CREAT = 0o100;
        const O_EXCL = 0o200;
        const O_TRUNC = 0o1000;
        const O_APPEND = 0o2000;
        const O_CLOEXEC = 0o2000000;
    }
}

/// `fcntl` commands.
pub const F_DUPFD: u32 = 0;
pub const F_GETFD: u32 = 1;
pub const F_SETFD: u32 = 2;
pub const F_GETFL: u32 = 3;
pub const F_SETFL: u32 = 4;

/// `F_SETFD` flag bit.
pub const FD_CLOEXEC: u32 = 1;

/// `seek` whence values.
pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

/// One open handle: a counted inode reference, a byte offset, and the
/// open flags. Shared across tasks by fork and dup, so it lives in the
/// system-wide file table and is addressed by handle.
pub struct File {
    pub inode: InodeId,
    pub off: u32,
    pub flags: OpenFlags,
}

pub type FileId = Handle<File>;

impl File {
    pub fn new(inode: InodeId, flags: OpenFlags) -> Self {
        Self {
            inode,
            off: 0,
            flags,
        }
    }

    /// Whether this handle is the writing end of a pipe.
    pub fn writes(&self) -> bool {
        self.flags
            .intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}
