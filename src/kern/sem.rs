//! Counting semaphore
//!
//! Waiters queue in FIFO order, each asking for some number of units. A
//! signal wakes waiters from the head for as long as the units available
//! cover their requests, and stops at the first one they do not: a big
//! request is never overtaken by a smaller one queued behind it.

use core::sync::atomic::{AtomicI32, Ordering};

use super::preempt::PreemptGuard;
use super::sched::{enter_sleep_wait_state, get_curr_tid, with_sched};
use super::wait::{WaitList, WaitObjType, WaitOn, WaitResult, WaitTarget, Waitable};
use crate::error::{KResult, KernError};

/// No upper bound on the counter
pub const KSEM_NO_MAX: i32 = -1;
/// Block until the units are there
pub const KSEM_WAIT_FOREVER: i32 = -1;
/// Never block
pub const KSEM_NO_WAIT: i32 = 0;

pub struct KSem {
    max: i32,
    counter: AtomicI32,
    wait_list: WaitList,
}

impl KSem {
    pub const fn new(value: i32, max: i32) -> Self {
        Self {
            max,
            counter: AtomicI32::new(value),
            wait_list: WaitList::new(),
        }
    }

    pub fn counter(&self) -> i32 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn wait_list(&self) -> &WaitList {
        &self.wait_list
    }

    fn check_units(&self, units: i32) -> KResult<()> {
        let too_many = self.max != KSEM_NO_MAX && units > self.max;
        if units <= 0 || too_many || units > i32::from(u16::MAX) {
            return Err(KernError::Invalid);
        }
        Ok(())
    }

    fn try_take(&self, units: i32) -> bool {
        self.counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c - units >= 0).then_some(c - units)
            })
            .is_ok()
    }

    /// Take `units`, blocking for at most `timeout` ticks
    /// ([`KSEM_WAIT_FOREVER`], [`KSEM_NO_WAIT`] or a tick count)
    pub fn wait(&self, units: i32, timeout: i32) -> KResult<WaitResult> {
        self.check_units(units)?;
        if self.try_take(units) {
            return Ok(WaitResult::Normal);
        }
        if timeout == KSEM_NO_WAIT {
            return Ok(WaitResult::TimedOut);
        }

        let curr = get_curr_tid();
        let timed = timeout > 0;
        let mut armed = false;

        let result = loop {
            let guard = PreemptGuard::new();
            let done = with_sched(|s| {
                if self.try_take(units) {
                    return Some(WaitResult::Normal);
                }
                if armed && s.task(curr).timer_ready {
                    return Some(WaitResult::TimedOut);
                }
                if s.has_pending_signals(curr) {
                    return Some(WaitResult::Interrupted);
                }
                if timed && !armed {
                    s.task_set_wakeup_timer(curr, timeout.unsigned_abs());
                    armed = true;
                }
                let list = self.wait_list.key(s);
                s.prepare_to_wait_on(curr, WaitOn::Sem(list), units as u16, Some(list));
                None
            });
            match done {
                Some(result) => break result,
                None => enter_sleep_wait_state(guard),
            }
        };

        if armed {
            with_sched(|s| s.task_cancel_wakeup_timer(curr));
        }
        if result != WaitResult::Normal {
            log::trace!("ksem wait by {} ended: {:?}", curr, result);
        }
        Ok(result)
    }

    /// Add `units` (clamped to the maximum) and wake the waiters they can
    /// satisfy, head first
    pub fn signal(&self, units: i32) -> KResult<()> {
        self.check_units(units)?;
        with_sched(|s| {
            let max = self.max;
            let _ = self.counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                let v = c.saturating_add(units);
                Some(if max == KSEM_NO_MAX { v } else { v.min(max) })
            });

            let list = self.wait_list.key(s);
            let mut avail = self.counter();
            while let Some(node) = s.waits.first(list) {
                let (need, multi) = s
                    .waits
                    .node(node)
                    .map_or((1, false), |n| (i32::from(n.extra.max(1)), n.elem.is_some()));
                if need > avail {
                    break;
                }
                // A multi-object slot is only told the semaphore is ready;
                // it takes no units, so they stay for the waiters behind it
                if !multi {
                    avail -= need;
                }
                s.wake_up_node(node);
            }
        });
        Ok(())
    }
}

impl Waitable for KSem {
    fn wait_target(&self) -> WaitTarget {
        let list = with_sched(|s| self.wait_list.key(s));
        WaitTarget {
            on: WaitObjType::Sem,
            list,
            extra: 1,
        }
    }
}

pub fn ksem_wait(sem: &KSem, units: i32, timeout: i32) -> KResult<WaitResult> {
    sem.wait(units, timeout)
}

pub fn ksem_signal(sem: &KSem, units: i32) -> KResult<()> {
    sem.signal(units)
}
