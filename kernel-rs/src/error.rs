//! Kernel error taxonomy.
//!
//! Every fallible kernel path reports one of these kinds; the syscall
//! boundary flattens them to negative errno-compatible integers. Kinds
//! that never cross the boundary (`Overlap`, `SegmentError`) still map
//! to an errno so a handler that forwards them blindly stays sane.

/// Kernel-wide result type.
pub type Result<T> = core::result::Result<T, KernelError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Malformed argument, unknown syscall, operation not supported by
    /// the file kind.
    InvalidArgument,
    /// Path component or directory entry does not exist.
    NoSuchEntry,
    /// A non-final path component is not a directory.
    NotDirectory,
    /// Exclusive creation of an existing entry.
    AlreadyExists,
    /// Frame pool, slab, or kernel heap exhausted.
    OutOfMemory,
    /// Per-task descriptor table exhausted.
    NoFreeDescriptor,
    /// PID space exhausted.
    NoPid,
    /// A user pointer could not be resolved through the address-space
    /// descriptor.
    Fault,
    /// The storage collaborator reported an I/O failure.
    Io,
    /// A virtual area would intersect an existing one.
    Overlap,
    /// Fatal to the offending task: a fault the resolver must not fix.
    SegmentError,
}

impl KernelError {
    /// The negative errno value surfaced to user space.
    pub fn errno(self) -> i32 {
        match self {
            KernelError::InvalidArgument => -22,  // EINVAL
            KernelError::NoSuchEntry => -2,       // ENOENT
            KernelError::NotDirectory => -20,     // ENOTDIR
            KernelError::AlreadyExists => -17,    // EEXIST
            KernelError::OutOfMemory => -12,      // ENOMEM
            KernelError::NoFreeDescriptor => -23, // ENFILE
            KernelError::NoPid => -11,            // EAGAIN
            KernelError::Fault => -14,            // EFAULT
            KernelError::Io => -5,                // EIO
            KernelError::Overlap => -12,          // ENOMEM
            KernelError::SegmentError => -14,     // EFAULT
        }
    }
}
