//! ksched - Single-CPU preemptive kernel scheduler
//!
//! Task and process management, preemption control, timers, and the
//! blocking primitives built on the scheduler: semaphores, mutexes,
//! condition variables and multi-object waits.
//!
//! The crate is `no_std`. Everything that touches the CPU goes through the
//! [`arch::Architecture`] trait; the `std` feature adds a hosted backend
//! running each task on an OS thread.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

// Core types
pub mod types;

pub mod arch;
pub mod config;
pub mod console;
pub mod error;
pub mod kern;
pub mod panic;

#[cfg(test)]
mod testing;

pub use error::{KResult, KernError};
pub use types::{Pid, Tid};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
