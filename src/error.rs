//! Kernel error kinds.
//!
//! Every user-visible failure of the core maps to one of these kinds; the
//! syscall layer turns them into `-1`/`NULL` returns. Fatal inconsistency
//! (a broken on-disk image, an invariant violation, swap exhaustion) is not
//! an error value: the kernel panics with a descriptive message instead.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// FAT or swap allocation failed.
    OutOfSpace,
    /// A page or frame structure could not be allocated.
    OutOfMemory,
    /// Name lookup or page lookup failed.
    NotFound,
    /// Write to a read-only page, a write-denied inode, or a kernel
    /// address from user mode.
    Denied,
    /// Duplicate directory entry or duplicate page mapping.
    AlreadyExists,
    /// Malformed argument (unaligned address, bad range, bad name).
    InvalidArg,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfSpace => "out of space",
            KernelError::OutOfMemory => "out of memory",
            KernelError::NotFound => "not found",
            KernelError::Denied => "permission denied",
            KernelError::AlreadyExists => "already exists",
            KernelError::InvalidArg => "invalid argument",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for KernelError {}

pub type Result<T> = core::result::Result<T, KernelError>;
