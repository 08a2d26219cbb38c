//! Sleeping mutex
//!
//! FIFO waiters and direct handoff: unlock picks the head waiter, makes it
//! the owner and wakes it, so nobody can grab the lock in between.

use bitflags::bitflags;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use super::preempt::PreemptGuard;
use super::sched::{enter_sleep_wait_state, get_curr_tid, with_sched};
use super::timer::in_irq;
use super::wait::{WaitList, WaitObjType, WaitOn, WaitTarget, Waitable, NO_EXTRA};
use crate::types::Tid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KMutexFlags: u32 {
        /// The owner may lock again; it must unlock as many times
        const RECURSIVE = 1 << 0;
    }
}

const NO_OWNER: i32 = -1;

pub struct KMutex {
    owner: AtomicI32,
    lock_count: AtomicU32,
    flags: KMutexFlags,
    wait_list: WaitList,
    #[cfg(feature = "kmutex-stats")]
    num_waiters: AtomicU32,
    #[cfg(feature = "kmutex-stats")]
    max_num_waiters: AtomicU32,
}

impl KMutex {
    pub const fn new(flags: KMutexFlags) -> Self {
        Self {
            owner: AtomicI32::new(NO_OWNER),
            lock_count: AtomicU32::new(0),
            flags,
            wait_list: WaitList::new(),
            #[cfg(feature = "kmutex-stats")]
            num_waiters: AtomicU32::new(0),
            #[cfg(feature = "kmutex-stats")]
            max_num_waiters: AtomicU32::new(0),
        }
    }

    pub fn flags(&self) -> KMutexFlags {
        self.flags
    }

    fn is_recursive(&self) -> bool {
        self.flags.contains(KMutexFlags::RECURSIVE)
    }

    pub fn owner(&self) -> Option<Tid> {
        match self.owner.load(Ordering::SeqCst) {
            NO_OWNER => None,
            tid => Some(Tid(tid)),
        }
    }

    /// Times the owner locked it (recursive mutexes only)
    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::SeqCst)
    }

    pub fn wait_list(&self) -> &WaitList {
        &self.wait_list
    }

    pub fn is_curr_task_holding_lock(&self) -> bool {
        self.owner() == Some(get_curr_tid())
    }

    fn claim(&self, tid: Tid) {
        self.owner.store(tid.0, Ordering::SeqCst);
        if self.is_recursive() {
            self.lock_count.store(1, Ordering::SeqCst);
        }
    }

    /// Take the lock if that needs no waiting. Relocking a non-recursive
    /// mutex is a deadlock and halts the kernel.
    fn lock_fast(&self, curr: Tid) -> bool {
        match self.owner() {
            None => {
                self.claim(curr);
                true
            }
            Some(owner) if owner == curr => {
                if !self.is_recursive() {
                    crate::kpanic!("deadlock: task {} relocking a non-recursive mutex", curr);
                }
                self.lock_count.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(_) => false,
        }
    }

    pub fn lock(&self) {
        let curr = get_curr_tid();
        crate::kassert!(!in_irq(), "kmutex_lock from interrupt context");

        let guard = PreemptGuard::new();
        if self.lock_fast(curr) {
            return;
        }

        with_sched(|s| {
            let list = self.wait_list.key(s);
            s.prepare_to_wait_on(curr, WaitOn::Mutex(list), NO_EXTRA, Some(list));
        });
        #[cfg(feature = "kmutex-stats")]
        {
            let n = self.num_waiters.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_num_waiters.fetch_max(n, Ordering::SeqCst);
        }

        enter_sleep_wait_state(guard);

        // The unlocking task made us the owner before waking us
        crate::kassert!(self.owner() == Some(curr), "task {} woken without the mutex", curr);
    }

    /// Like [`KMutex::lock`], but fail instead of blocking
    pub fn trylock(&self) -> bool {
        let curr = get_curr_tid();
        let _guard = PreemptGuard::new();
        self.lock_fast(curr)
    }

    pub fn unlock(&self) {
        let curr = get_curr_tid();
        let _guard = PreemptGuard::new();
        crate::kassert!(
            self.owner() == Some(curr),
            "task {} unlocking a mutex owned by {:?}",
            curr,
            self.owner()
        );

        if self.is_recursive() && self.lock_count.fetch_sub(1, Ordering::SeqCst) > 1 {
            return;
        }

        let next = with_sched(|s| {
            let list = self.wait_list.key(s);
            let node = s.waits.first(list)?;
            let n = s.waits.node(node)?;
            let (next, multi) = (n.task, n.elem.is_some());
            self.claim(next);
            s.wake_up_node(node);
            Some((next, multi))
        });
        match next {
            Some((next, _multi)) => {
                // Multi-object slots are not counted as waiters
                #[cfg(feature = "kmutex-stats")]
                if !_multi {
                    self.num_waiters.fetch_sub(1, Ordering::SeqCst);
                }
                log::trace!("kmutex handed from {} to {}", curr, next);
            }
            None => {
                self.owner.store(NO_OWNER, Ordering::SeqCst);
                self.lock_count.store(0, Ordering::SeqCst);
            }
        }
    }

    /// Tasks currently blocked in [`KMutex::lock`]
    #[cfg(feature = "kmutex-stats")]
    pub fn num_waiters(&self) -> u32 {
        self.num_waiters.load(Ordering::SeqCst)
    }

    /// High-water mark of [`KMutex::num_waiters`]
    #[cfg(feature = "kmutex-stats")]
    pub fn max_num_waiters(&self) -> u32 {
        self.max_num_waiters.load(Ordering::SeqCst)
    }
}

impl Waitable for KMutex {
    fn wait_target(&self) -> WaitTarget {
        let list = with_sched(|s| self.wait_list.key(s));
        WaitTarget {
            on: WaitObjType::Mutex,
            list,
            extra: NO_EXTRA,
        }
    }
}

pub fn kmutex_lock(m: &KMutex) {
    m.lock();
}

pub fn kmutex_trylock(m: &KMutex) -> bool {
    m.trylock()
}

pub fn kmutex_unlock(m: &KMutex) {
    m.unlock();
}

pub fn kmutex_is_curr_task_holding_lock(m: &KMutex) -> bool {
    m.is_curr_task_holding_lock()
}
