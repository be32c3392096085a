/// Size of the dense PID set.
pub const MAX_PID_NUM: usize = 256;

/// Open files per task.
pub const MAX_OPEN_FD: usize = 64;

/// Open files per system.
pub const NFILE: usize = 128;

/// Maximum number of in-memory inodes.
pub const NINODE: usize = 64;

/// Maximum number of address-space descriptors.
pub const NASPACE: usize = MAX_PID_NUM;

/// Per-task kernel stack, two pages.
pub const KERNEL_STACK_SIZE: usize = 2 * crate::x86::PAGE_SIZE;

/// Timer ticks a task may run before it is moved to the time-up list.
pub const MAX_TASK_RUN_CLICK: u32 = 10;

/// Bytes per cached file data buffer.
pub const FS_DATA_BUFFER_SIZE: usize = 1024;

/// Maximum file path length, including the terminating NUL.
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum length of one directory-entry name.
pub const MAX_FILE_NAME_LEN: usize = 28;

/// Pipe ring capacity.
pub const PIPE_BUF_SIZE: usize = 512;

/// Loadable sections per executable image.
pub const MAX_IMAGE_SECTIONS: usize = 8;

/// Upper bound on a single read/write transfer; larger requests behave
/// like a failed kernel buffer allocation.
pub const MAX_RW_BYTES: usize = 1 << 20;

/// Exit status recorded for a task killed by the kernel (segment error).
pub const TASK_FATAL_STATUS: i32 = -11;
