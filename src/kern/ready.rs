//! Readiness polling
//!
//! poll()-style waiting on several objects at once, built on the
//! multi-object waiter: every object exposes readiness predicates and the
//! condition variables it signals when readiness may have changed.

use alloc::vec::Vec;
use bitflags::bitflags;

use super::cond::KCond;
use super::mobj::MultiObjWaiter;
use super::preempt::PreemptGuard;
use super::timer::{get_ticks, kernel_sleep};
use super::wait::WaitResult;
use crate::error::{KResult, KernError};

bitflags! {
    /// Events of interest, and events found
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u16 {
        const READ = 1 << 0;
        const EXCEPT = 1 << 1;
        const WRITE = 1 << 2;
    }
}

/// An object whose readiness can be waited for
pub trait ReadyObject: Sync {
    fn read_ready(&self) -> bool;
    fn write_ready(&self) -> bool;
    fn except_ready(&self) -> bool {
        false
    }

    /// Signalled when the object may have become readable
    fn rready_cond(&self) -> Option<&KCond> {
        None
    }

    /// Signalled when the object may have become writable
    fn wready_cond(&self) -> Option<&KCond> {
        None
    }

    fn except_cond(&self) -> Option<&KCond> {
        None
    }
}

pub struct PollItem<'a> {
    pub obj: &'a dyn ReadyObject,
    pub events: PollEvents,
    pub revents: PollEvents,
}

impl<'a> PollItem<'a> {
    pub fn new(obj: &'a dyn ReadyObject, events: PollEvents) -> Self {
        Self {
            obj,
            events,
            revents: PollEvents::empty(),
        }
    }
}

/// Fill in `revents`; returns the number of ready items
fn scan(items: &mut [PollItem<'_>]) -> usize {
    let mut ready = 0;
    for item in items.iter_mut() {
        let mut found = PollEvents::empty();
        if item.events.contains(PollEvents::READ) && item.obj.read_ready() {
            found |= PollEvents::READ;
        }
        if item.events.contains(PollEvents::WRITE) && item.obj.write_ready() {
            found |= PollEvents::WRITE;
        }
        if item.events.contains(PollEvents::EXCEPT) && item.obj.except_ready() {
            found |= PollEvents::EXCEPT;
        }
        item.revents = found;
        if !found.is_empty() {
            ready += 1;
        }
    }
    ready
}

fn conditions<'a>(items: &[PollItem<'a>]) -> Vec<&'a KCond> {
    let mut conds: Vec<&'a KCond> = Vec::new();
    for item in items {
        let obj = item.obj;
        let wanted = [
            (PollEvents::READ, obj.rready_cond()),
            (PollEvents::WRITE, obj.wready_cond()),
            (PollEvents::EXCEPT, obj.except_cond()),
        ];
        for (ev, cond) in wanted {
            if let Some(c) = cond.filter(|_| item.events.contains(ev)) {
                if !conds.iter().any(|&k| core::ptr::eq(k, c)) {
                    conds.push(c);
                }
            }
        }
    }
    conds
}

/// Wait until at least one item is ready. `timeout_ticks` of None waits
/// forever, Some(0) only checks. Returns the number of ready items (0 on
/// timeout) with `revents` filled in.
pub fn poll_ready(items: &mut [PollItem<'_>], timeout_ticks: Option<u32>) -> KResult<usize> {
    let deadline = timeout_ticks.map(|t| get_ticks() + u64::from(t));

    loop {
        // Scan and enqueue without a window for a missed wake-up
        let guard = PreemptGuard::new();
        let ready = scan(items);
        let remaining = deadline.map(|d| d.saturating_sub(get_ticks()));
        if ready > 0 || remaining == Some(0) {
            return Ok(ready);
        }

        let conds = conditions(items);
        if conds.is_empty() {
            drop(guard);
            return match remaining {
                Some(ticks) => {
                    kernel_sleep(ticks as u32);
                    Ok(scan(items))
                }
                None => Err(KernError::Invalid),
            };
        }

        let mut waiter = MultiObjWaiter::new(conds.len())?;
        for (i, c) in conds.iter().enumerate() {
            waiter.set(i, *c);
        }
        let timeout = remaining.map_or(0, |r| r.min(u64::from(u32::MAX)) as u32);
        match waiter.wait_preempt_disabled(guard, timeout) {
            WaitResult::Interrupted => return Err(KernError::Interrupted),
            WaitResult::Normal | WaitResult::TimedOut => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::registry::{kthread_create, kthread_join};
    use crate::kern::signal::{send_signal, SIGUSR1};
    use crate::kern::task::KthFlags;
    use crate::testing;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// A byte counter that is readable when non-empty
    struct Chan {
        bytes: AtomicUsize,
        cap: usize,
        readable: KCond,
    }

    impl Chan {
        fn new(cap: usize) -> Self {
            Self {
                bytes: AtomicUsize::new(0),
                cap,
                readable: KCond::new(),
            }
        }

        fn push(&self) {
            self.bytes.fetch_add(1, Ordering::SeqCst);
            self.readable.signal_all();
        }
    }

    impl ReadyObject for Chan {
        fn read_ready(&self) -> bool {
            self.bytes.load(Ordering::SeqCst) > 0
        }
        fn write_ready(&self) -> bool {
            self.bytes.load(Ordering::SeqCst) < self.cap
        }
        fn rready_cond(&self) -> Option<&KCond> {
            Some(&self.readable)
        }
    }

    #[test]
    fn test_immediate_readiness() {
        let _k = testing::boot();
        let a = Chan::new(1);
        let b = Chan::new(1);
        b.push();
        let mut items = [
            PollItem::new(&a, PollEvents::READ),
            PollItem::new(&b, PollEvents::READ | PollEvents::WRITE),
        ];
        assert_eq!(poll_ready(&mut items, None), Ok(1));
        assert!(items[0].revents.is_empty());
        assert_eq!(items[1].revents, PollEvents::READ);
    }

    #[test]
    fn test_conditions_deduplicated() {
        let a = Chan::new(1);
        let b = Chan::new(1);
        let items = [
            PollItem::new(&a, PollEvents::READ),
            PollItem::new(&a, PollEvents::READ | PollEvents::WRITE),
            PollItem::new(&b, PollEvents::WRITE),
        ];
        // b has no write condition, and a's read condition appears once
        let conds = conditions(&items);
        assert_eq!(conds.len(), 1);
        assert!(core::ptr::eq(conds[0], &a.readable));
    }

    #[test]
    fn test_check_only() {
        let _k = testing::boot();
        let a = Chan::new(1);
        let mut items = [PollItem::new(&a, PollEvents::READ)];
        assert_eq!(poll_ready(&mut items, Some(0)), Ok(0));
    }

    #[test]
    fn test_wakes_when_ready() {
        let _k = testing::boot();
        let chans = Arc::new([Chan::new(4), Chan::new(4)]);
        let result = Arc::new(StdMutex::new(None));
        let (c, r) = (chans.clone(), result.clone());
        let t = kthread_create("poller", KthFlags::empty(), move || {
            let mut items = [
                PollItem::new(&c[0], PollEvents::READ),
                PollItem::new(&c[1], PollEvents::READ),
            ];
            let n = poll_ready(&mut items, None);
            *r.lock().unwrap() = Some((n, items[1].revents));
        })
        .unwrap();

        crate::kern::sched::kernel_yield();
        assert!(chans[0].readable.is_anyone_waiting());
        assert!(chans[1].readable.is_anyone_waiting());

        chans[1].push();
        kthread_join(t, true).unwrap();
        assert_eq!(*result.lock().unwrap(), Some((Ok(1), PollEvents::READ)));
        assert!(!chans[0].readable.is_anyone_waiting());
    }

    #[test]
    fn test_timeout() {
        let _k = testing::boot();
        let a = Chan::new(1);
        let mut items = [PollItem::new(&a, PollEvents::READ)];
        let before = get_ticks();
        assert_eq!(poll_ready(&mut items, Some(6)), Ok(0));
        assert!(get_ticks() - before >= 6);
        assert!(!a.readable.is_anyone_waiting());
    }

    #[test]
    fn test_interrupted_by_signal() {
        let _k = testing::boot();
        let result = Arc::new(StdMutex::new(None));
        let r = result.clone();
        let t = kthread_create("poller", KthFlags::empty(), move || {
            let a = Chan::new(1);
            let mut items = [PollItem::new(&a, PollEvents::READ)];
            *r.lock().unwrap() = Some(poll_ready(&mut items, None));
        })
        .unwrap();
        crate::kern::sched::kernel_yield();
        send_signal(t, SIGUSR1).unwrap();
        kthread_join(t, true).unwrap();
        assert_eq!(*result.lock().unwrap(), Some(Err(KernError::Interrupted)));
    }

    #[test]
    fn test_nothing_to_wait_on() {
        let _k = testing::boot();
        struct Never;
        impl ReadyObject for Never {
            fn read_ready(&self) -> bool {
                false
            }
            fn write_ready(&self) -> bool {
                false
            }
        }
        let mut items = [PollItem::new(&Never, PollEvents::READ)];
        assert_eq!(poll_ready(&mut items, None), Err(KernError::Invalid));
        assert_eq!(poll_ready(&mut items, Some(2)), Ok(0));
    }
}
