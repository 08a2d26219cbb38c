//! Kernel error codes
//!
//! Runtime failures are returned as [`KernError`]; contract violations never
//! get here, they halt through [`crate::kassert!`].

use thiserror::Error;

/// POSIX errno values used at the syscall boundary
pub mod errno {
    pub const ESRCH: i32 = 3; // No such process
    pub const EINTR: i32 = 4; // Interrupted system call
    pub const ECHILD: i32 = 10; // No child processes
    pub const EAGAIN: i32 = 11; // Try again
    pub const ENOMEM: i32 = 12; // Out of memory
    pub const EFAULT: i32 = 14; // Bad address
    pub const EINVAL: i32 = 22; // Invalid argument
    pub const ENOSPC: i32 = 28; // No space left on device
    pub const ETIME: i32 = 62; // Timer expired
}

/// Recoverable kernel error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernError {
    #[error("no such task")]
    NoSuchTask,
    #[error("no child processes")]
    NoChild,
    #[error("identifier space exhausted")]
    Again,
    #[error("out of memory")]
    NoMemory,
    #[error("invalid argument")]
    Invalid,
    #[error("no free slot")]
    NoSpace,
    #[error("bad address")]
    Fault,
    #[error("interrupted by a signal")]
    Interrupted,
}

impl KernError {
    /// Negative errno value, as returned to user space
    pub const fn errno(self) -> i32 {
        -(match self {
            KernError::NoSuchTask => errno::ESRCH,
            KernError::NoChild => errno::ECHILD,
            KernError::Again => errno::EAGAIN,
            KernError::NoMemory => errno::ENOMEM,
            KernError::Invalid => errno::EINVAL,
            KernError::NoSpace => errno::ENOSPC,
            KernError::Fault => errno::EFAULT,
            KernError::Interrupted => errno::EINTR,
        })
    }
}

/// Result type for fallible kernel operations
pub type KResult<T> = Result<T, KernError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values_are_negative() {
        assert_eq!(KernError::NoSuchTask.errno(), -3);
        assert_eq!(KernError::Interrupted.errno(), -4);
        assert_eq!(KernError::Again.errno(), -11);
        assert_eq!(KernError::NoSpace.errno(), -28);
    }

    #[test]
    fn test_display() {
        assert_eq!(KernError::NoMemory.to_string(), "out of memory");
    }
}
