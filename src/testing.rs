//! Test support: boot a fresh scheduler on the hosted backend
//!
//! The scheduler is a global singleton, so tests that boot it run one at
//! a time.

extern crate std;

use std::sync::{Mutex, MutexGuard};

use crate::arch::host::HostArch;
use crate::config::SchedConfig;
use crate::kern::sched::init_sched;
use crate::kern::timer::kernel_sleep;

static KERNEL: Mutex<()> = Mutex::new(());

/// A booted kernel, exclusive to the test holding it
pub struct TestKernel {
    _guard: MutexGuard<'static, ()>,
}

pub fn boot() -> TestKernel {
    boot_with(SchedConfig::default())
}

pub fn boot_with(cfg: SchedConfig) -> TestKernel {
    // A should_panic test leaves the lock poisoned; the state is rebuilt anyway
    let guard = KERNEL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    init_sched(HostArch::leak(), cfg);
    TestKernel { _guard: guard }
}

/// Let ticks go by until `cond` holds
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        kernel_sleep(1);
    }
}
