//! Preemption control
//!
//! A single CPU-wide disable count: preemption is allowed only while it is
//! zero. The need-resched flag asks for a reschedule at the next point where
//! the count drops back to zero.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static DISABLE_PREEMPT_COUNT: AtomicI32 = AtomicI32::new(0);
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

pub fn disable_preemption() {
    DISABLE_PREEMPT_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Decrement the disable count without ever rescheduling
pub fn enable_preemption_nosched() {
    let old = DISABLE_PREEMPT_COUNT.fetch_sub(1, Ordering::SeqCst);
    crate::kassert!(old > 0, "preemption enabled more times than disabled");
}

/// Decrement the disable count; reschedule if it reaches zero with a
/// reschedule pending
pub fn enable_preemption() {
    let old = DISABLE_PREEMPT_COUNT.fetch_sub(1, Ordering::SeqCst);
    crate::kassert!(old > 0, "preemption enabled more times than disabled");

    if old == 1 && need_reschedule() && !super::timer::in_irq() {
        super::sched::schedule();
    }
}

pub fn get_preempt_disable_count() -> i32 {
    DISABLE_PREEMPT_COUNT.load(Ordering::SeqCst)
}

pub fn is_preemption_enabled() -> bool {
    get_preempt_disable_count() == 0
}

pub fn sched_set_need_resched() {
    NEED_RESCHED.store(true, Ordering::SeqCst);
}

pub fn sched_clear_need_resched() {
    NEED_RESCHED.store(false, Ordering::SeqCst);
}

pub fn need_reschedule() -> bool {
    NEED_RESCHED.load(Ordering::SeqCst)
}

/// Restore a count saved before code that may have been abandoned midway
pub(crate) fn restore_preempt_disable_count(count: i32) {
    DISABLE_PREEMPT_COUNT.store(count, Ordering::SeqCst);
}

pub(crate) fn reset() {
    DISABLE_PREEMPT_COUNT.store(0, Ordering::SeqCst);
    NEED_RESCHED.store(false, Ordering::SeqCst);
}

/// Preemption disabled for the lifetime of the guard
///
/// The guard doubles as the proof handed to the "preempt disabled" entry
/// points ([`super::sched::kernel_yield_preempt_disabled`],
/// [`super::sched::enter_sleep_wait_state`], ...). They consume it, switch
/// away, and return with preemption enabled; the guard is never dropped in
/// that case.
#[must_use]
pub struct PreemptGuard {
    _not_send: PhantomData<*mut ()>,
}

impl PreemptGuard {
    pub fn new() -> Self {
        disable_preemption();
        Self {
            _not_send: PhantomData,
        }
    }

    /// Hand the disabled section over to a callee that re-enables it
    pub(crate) fn into_handoff(self) {
        core::mem::forget(self);
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        enable_preemption();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_guard_nesting() {
        let _k = testing::boot();
        assert!(is_preemption_enabled());
        {
            let _outer = PreemptGuard::new();
            assert_eq!(get_preempt_disable_count(), 1);
            {
                let _inner = PreemptGuard::new();
                assert_eq!(get_preempt_disable_count(), 2);
            }
            assert_eq!(get_preempt_disable_count(), 1);
        }
        assert!(is_preemption_enabled());
    }

    #[test]
    fn test_need_resched_flag() {
        let _k = testing::boot();
        assert!(!need_reschedule());
        sched_set_need_resched();
        assert!(need_reschedule());
        sched_clear_need_resched();
        assert!(!need_reschedule());
    }

    #[test]
    fn test_enable_with_pending_resched_and_nothing_to_run() {
        let _k = testing::boot();
        disable_preemption();
        sched_set_need_resched();
        // Only the idle task is runnable, so the reschedule keeps us.
        enable_preemption();
        assert!(is_preemption_enabled());
        assert!(!need_reschedule());
    }

    #[test]
    #[should_panic(expected = "preemption enabled more times than disabled")]
    fn test_unbalanced_enable() {
        let _k = testing::boot();
        enable_preemption_nosched();
    }
}
