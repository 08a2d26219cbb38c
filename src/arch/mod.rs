//! Architecture boundary
//!
//! The scheduler never touches registers itself. Context switching, the
//! interrupt flag, halting and fault recovery are provided by an [`Arch`]
//! implementation installed once at boot.

use alloc::boxed::Box;
use spin::RwLock;

use crate::error::KResult;
use crate::types::Tid;

#[cfg(any(test, feature = "std"))]
pub mod host;

/// Body of a new task. Never expected to return; the registry wraps it with
/// the exit path.
pub type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

/// Operations every platform must implement
pub trait Architecture: Sync {
    /// Attach the currently executing context to `tid` (the boot task)
    fn adopt_boot_context(&self, tid: Tid);

    /// Prepare the saved context of a new task so that the first switch to
    /// it runs `entry` on the stack ending at `stack_top`
    fn init_task_context(&self, tid: Tid, stack_top: usize, entry: TaskEntry) -> KResult<()>;

    /// Save the state of `from` and resume `to`. Returns when some later
    /// switch resumes `from`.
    fn switch(&self, from: Tid, to: Tid);

    /// Resume `to` without saving `from`, which is dying
    fn switch_and_discard(&self, from: Tid, to: Tid) -> !;

    /// Drop whatever was kept for a destroyed task
    fn release_task_context(&self, tid: Tid);

    /// Disable interrupts, returning whether they were enabled
    fn disable_interrupts(&self) -> bool;

    /// Restore the interrupt flag saved by [`Architecture::disable_interrupts`]
    fn restore_interrupts(&self, were_enabled: bool);

    /// Enable interrupts
    fn enable_interrupts(&self);

    /// Check if interrupts are enabled
    fn are_interrupts_enabled(&self) -> bool;

    /// Wait for the next interrupt
    fn halt(&self);

    /// Handler run on every timer interrupt
    fn set_timer_handler(&self, handler: fn());

    /// Run `f`; if a fault is redirected through
    /// [`Architecture::resume_from_fault`] meanwhile, return its number
    fn call_with_fault_recovery(&self, f: &mut dyn FnMut()) -> Option<u32>;

    /// Abandon the faulting code and resume at the innermost
    /// [`Architecture::call_with_fault_recovery`]
    fn resume_from_fault(&self, fault: u32) -> !;

    /// Emit console output
    fn console_write(&self, _bytes: &[u8]) {}
}

pub use Architecture as Arch;

static ARCH: RwLock<Option<&'static dyn Arch>> = RwLock::new(None);

/// Install the platform backend (done by `init_sched`)
pub fn install(arch: &'static dyn Arch) {
    *ARCH.write() = Some(arch);
}

/// The installed backend, if any
pub fn try_arch() -> Option<&'static dyn Arch> {
    *ARCH.read()
}

/// The installed backend
pub fn arch() -> &'static dyn Arch {
    match try_arch() {
        Some(arch) => arch,
        None => crate::kpanic!("no architecture backend installed"),
    }
}

/// Interrupts disabled for the lifetime of the guard
pub struct IrqGuard {
    were_enabled: bool,
}

impl IrqGuard {
    pub fn new() -> Self {
        Self {
            were_enabled: arch().disable_interrupts(),
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        arch().restore_interrupts(self.were_enabled);
    }
}
