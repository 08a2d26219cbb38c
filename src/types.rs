//! Common types used across ksched
//!
//! This module defines shared identifier types to avoid circular dependencies.

use core::fmt;

use crate::config::KERNEL_TID_START;

/// Task identifier
///
/// User tasks share the pid namespace (a process' pid is the tid of its main
/// thread); kernel threads are numbered from [`KERNEL_TID_START`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tid(pub i32);

impl Tid {
    /// Tid of the boot context, main task of the kernel process
    pub const KERNEL_MAIN: Tid = Tid(0);

    /// Is this a kernel thread id?
    pub const fn is_kernel_thread_id(self) -> bool {
        self.0 >= KERNEL_TID_START
    }

    /// The pid a main thread with this tid gives to its process
    pub const fn as_pid(self) -> Pid {
        Pid(self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub i32);

impl Pid {
    /// The kernel process
    pub const KERNEL: Pid = Pid(0);
    /// Adopter of orphaned processes, when present
    pub const INIT: Pid = Pid(1);

    /// Tid of the main thread of this process
    pub const fn main_tid(self) -> Tid {
        Tid(self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
