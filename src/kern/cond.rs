//! Condition variable
//!
//! Used with a [`KMutex`]. A waiter queues itself before giving up the
//! mutex, all with preemption disabled, so a signal sent by whoever takes
//! the mutex next always finds it on the list.

use super::mutex::KMutex;
use super::preempt::PreemptGuard;
use super::sched::{enter_sleep_wait_state, get_curr_tid, with_sched};
use super::wait::{WaitList, WaitObjType, WaitOn, WaitResult, WaitTarget, Waitable, NO_EXTRA};

/// Timeout value meaning "no timeout"
pub const KCOND_WAIT_FOREVER: u32 = 0;

pub struct KCond {
    wait_list: WaitList,
}

impl KCond {
    pub const fn new() -> Self {
        Self {
            wait_list: WaitList::new(),
        }
    }

    pub fn wait_list(&self) -> &WaitList {
        &self.wait_list
    }

    pub fn is_anyone_waiting(&self) -> bool {
        !self.wait_list.is_empty()
    }

    /// Release `m`, sleep until signalled (or `timeout_ticks` pass), then
    /// take `m` again. Wake-ups may be spurious: callers recheck their
    /// predicate.
    pub fn wait(&self, m: &KMutex, timeout_ticks: u32) -> WaitResult {
        let curr = get_curr_tid();
        crate::kassert!(m.is_curr_task_holding_lock(), "kcond_wait without holding the mutex");

        let guard = PreemptGuard::new();
        with_sched(|s| {
            if timeout_ticks != KCOND_WAIT_FOREVER {
                s.task_set_wakeup_timer(curr, timeout_ticks);
            }
            let list = self.wait_list.key(s);
            s.prepare_to_wait_on(curr, WaitOn::Cond(list), NO_EXTRA, Some(list));
        });
        m.unlock();
        enter_sleep_wait_state(guard);

        let result = with_sched(|s| {
            let timer_ready = s.task(curr).timer_ready;
            if timeout_ticks != KCOND_WAIT_FOREVER {
                s.task_cancel_wakeup_timer(curr);
            }
            s.wait_obj_reset(curr);
            if timeout_ticks != KCOND_WAIT_FOREVER && timer_ready {
                WaitResult::TimedOut
            } else if s.has_pending_signals(curr) {
                WaitResult::Interrupted
            } else {
                WaitResult::Normal
            }
        });

        m.lock();
        result
    }

    /// Wake the longest waiting task, if any
    pub fn signal_one(&self) {
        with_sched(|s| {
            let list = self.wait_list.key(s);
            if let Some(node) = s.waits.first(list) {
                s.wake_up_node(node);
            }
        });
    }

    /// Wake every waiting task
    pub fn signal_all(&self) {
        with_sched(|s| {
            let list = self.wait_list.key(s);
            s.wake_up_all(list);
        });
    }
}

impl Default for KCond {
    fn default() -> Self {
        Self::new()
    }
}

impl Waitable for KCond {
    fn wait_target(&self) -> WaitTarget {
        let list = with_sched(|s| self.wait_list.key(s));
        WaitTarget {
            on: WaitObjType::Cond,
            list,
            extra: NO_EXTRA,
        }
    }
}

pub fn kcond_wait(c: &KCond, m: &KMutex, timeout_ticks: u32) -> WaitResult {
    c.wait(m, timeout_ticks)
}

pub fn kcond_signal_one(c: &KCond) {
    c.signal_one();
}

pub fn kcond_signal_all(c: &KCond) {
    c.signal_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::mutex::KMutexFlags;
    use crate::kern::registry::{get_task, kthread_create, kthread_join, kthread_join_all};
    use crate::kern::sched::kernel_yield;
    use crate::kern::task::{KthFlags, TaskState};
    use crate::testing;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Shared {
        m: KMutex,
        c: KCond,
        ready: AtomicBool,
    }

    fn shared() -> Arc<Shared> {
        Arc::new(Shared {
            m: KMutex::new(KMutexFlags::empty()),
            c: KCond::new(),
            ready: AtomicBool::new(false),
        })
    }

    #[test]
    fn test_wait_releases_and_reacquires() {
        let _k = testing::boot();
        let sh = shared();
        let s2 = sh.clone();
        let t = kthread_create("waiter", KthFlags::empty(), move || {
            s2.m.lock();
            while !s2.ready.load(Ordering::SeqCst) {
                s2.c.wait(&s2.m, KCOND_WAIT_FOREVER);
            }
            assert!(s2.m.is_curr_task_holding_lock());
            s2.m.unlock();
        })
        .unwrap();

        kernel_yield();
        assert_eq!(get_task(t).unwrap().state, TaskState::Sleeping);
        assert!(sh.c.is_anyone_waiting());
        // The waiter gave the mutex up while sleeping
        assert!(sh.m.trylock());
        sh.ready.store(true, Ordering::SeqCst);
        sh.c.signal_one();
        sh.m.unlock();

        kthread_join(t, true).unwrap();
        assert_eq!(sh.m.owner(), None);
    }

    #[test]
    fn test_signal_after_enqueue_is_not_lost() {
        let _k = testing::boot();
        let sh = shared();
        let woke = Arc::new(AtomicUsize::new(0));
        let (s2, w) = (sh.clone(), woke.clone());
        let t = kthread_create("waiter", KthFlags::empty(), move || {
            s2.m.lock();
            assert_eq!(s2.c.wait(&s2.m, KCOND_WAIT_FOREVER), WaitResult::Normal);
            w.fetch_add(1, Ordering::SeqCst);
            s2.m.unlock();
        })
        .unwrap();

        kernel_yield();
        // No mutex taken here: the waiter is already on the list
        sh.c.signal_one();
        kthread_join(t, true).unwrap();
        assert_eq!(woke.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signal_with_nobody_waiting() {
        let _k = testing::boot();
        let c = KCond::new();
        c.signal_one();
        c.signal_all();
        assert!(!c.is_anyone_waiting());
    }

    #[test]
    fn test_signal_all() {
        let _k = testing::boot();
        let sh = shared();
        let woke = Arc::new(AtomicUsize::new(0));
        let tids: Vec<_> = (0..3)
            .map(|_| {
                let (s2, w) = (sh.clone(), woke.clone());
                let t = kthread_create("waiter", KthFlags::empty(), move || {
                    s2.m.lock();
                    s2.c.wait(&s2.m, KCOND_WAIT_FOREVER);
                    w.fetch_add(1, Ordering::SeqCst);
                    s2.m.unlock();
                })
                .unwrap();
                kernel_yield();
                t
            })
            .collect();

        assert_eq!(sh.c.wait_list().len(), 3);
        sh.c.signal_all();
        assert!(!sh.c.is_anyone_waiting());
        kthread_join_all(&tids, true).unwrap();
        assert_eq!(woke.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_timeout_returns_with_mutex_held() {
        let _k = testing::boot();
        let sh = shared();
        sh.m.lock();
        assert_eq!(sh.c.wait(&sh.m, 4), WaitResult::TimedOut);
        assert!(sh.m.is_curr_task_holding_lock());
        assert!(!sh.c.is_anyone_waiting());
        sh.m.unlock();
    }

    #[test]
    #[should_panic(expected = "without holding the mutex")]
    fn test_wait_without_mutex_panics() {
        let _k = testing::boot();
        let m = KMutex::new(KMutexFlags::empty());
        KCond::new().wait(&m, KCOND_WAIT_FOREVER);
    }
}
