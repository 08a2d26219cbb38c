//! Hosted backend
//!
//! Every task runs on its own OS thread. A task only executes while it holds
//! its baton; `switch` hands the baton to the target and parks until some
//! later switch hands it back, so exactly one task thread runs at a time and
//! the scheduler sees a single CPU.

extern crate std;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard};

use super::{Architecture, TaskEntry};
use crate::error::{KResult, KernError};
use crate::types::Tid;

/// Panic payload used to unwind from a simulated fault to its recovery scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultUnwind(pub u32);

#[derive(Default)]
struct Baton {
    held: Mutex<bool>,
    cv: Condvar,
}

impl Baton {
    fn give(&self) {
        let mut held = lock(&self.held);
        *held = true;
        self.cv.notify_one();
    }

    fn take(&self) {
        let mut held = lock(&self.held);
        while !*held {
            held = match self.cv.wait(held) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *held = false;
    }
}

// A test that panics on the boot thread poisons nothing we cannot reuse.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// OS-thread backed implementation of [`Architecture`]
pub struct HostArch {
    batons: Mutex<BTreeMap<Tid, Arc<Baton>>>,
    irqs_enabled: AtomicBool,
    timer_handler: Mutex<Option<fn()>>,
}

impl HostArch {
    pub fn new() -> Self {
        Self {
            batons: Mutex::new(BTreeMap::new()),
            irqs_enabled: AtomicBool::new(true),
            timer_handler: Mutex::new(None),
        }
    }

    /// A backend that lives for the rest of the process
    pub fn leak() -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new()))
    }

    fn baton(&self, tid: Tid) -> Arc<Baton> {
        match lock(&self.batons).get(&tid) {
            Some(baton) => baton.clone(),
            None => crate::kpanic!("no context for task {}", tid),
        }
    }

    /// Number of task contexts currently alive
    pub fn live_contexts(&self) -> usize {
        lock(&self.batons).len()
    }
}

impl Architecture for HostArch {
    fn adopt_boot_context(&self, tid: Tid) {
        lock(&self.batons).insert(tid, Arc::new(Baton::default()));
    }

    fn init_task_context(&self, tid: Tid, _stack_top: usize, entry: TaskEntry) -> KResult<()> {
        let baton = Arc::new(Baton::default());
        let start = baton.clone();
        std::thread::Builder::new()
            .name(format!("task-{}", tid))
            .spawn(move || {
                start.take();
                if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
                    // The baton died with this thread; nothing can run again.
                    std::process::abort();
                }
                // Tasks leave through the exit path, never by returning.
                loop {
                    std::thread::park();
                }
            })
            .map_err(|_| KernError::NoMemory)?;
        lock(&self.batons).insert(tid, baton);
        Ok(())
    }

    fn switch(&self, from: Tid, to: Tid) {
        let (from, to) = (self.baton(from), self.baton(to));
        to.give();
        from.take();
    }

    fn switch_and_discard(&self, _from: Tid, to: Tid) -> ! {
        self.baton(to).give();
        loop {
            std::thread::park();
        }
    }

    fn release_task_context(&self, tid: Tid) {
        lock(&self.batons).remove(&tid);
    }

    fn disable_interrupts(&self) -> bool {
        self.irqs_enabled.swap(false, Ordering::SeqCst)
    }

    fn restore_interrupts(&self, were_enabled: bool) {
        if were_enabled {
            self.irqs_enabled.store(true, Ordering::SeqCst);
        }
    }

    fn enable_interrupts(&self) {
        self.irqs_enabled.store(true, Ordering::SeqCst);
    }

    fn are_interrupts_enabled(&self) -> bool {
        self.irqs_enabled.load(Ordering::SeqCst)
    }

    fn halt(&self) {
        let handler = *lock(&self.timer_handler);
        match handler {
            Some(handler) if self.are_interrupts_enabled() => handler(),
            _ => std::thread::yield_now(),
        }
    }

    fn set_timer_handler(&self, handler: fn()) {
        *lock(&self.timer_handler) = Some(handler);
    }

    fn call_with_fault_recovery(&self, f: &mut dyn FnMut()) -> Option<u32> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => None,
            Err(payload) => match payload.downcast::<FaultUnwind>() {
                Ok(fault) => Some(fault.0),
                Err(other) => panic::resume_unwind(other),
            },
        }
    }

    fn resume_from_fault(&self, fault: u32) -> ! {
        panic::resume_unwind(alloc::boxed::Box::new(FaultUnwind(fault)))
    }
}

/// Simulate CPU exception `fault` on the current task
pub fn raise_fault(fault: u32) {
    crate::kern::fault::handle_cpu_fault(fault);
}
