//! Signal bookkeeping
//!
//! Only what blocking needs: pending and blocked masks, stop/continue, and
//! waking a sleeper so its primitive can report an interrupted wait.
//! Delivery to user handlers is somebody else's job.

use super::preempt::sched_set_need_resched;
use super::sched::{get_curr_tid, with_sched, SchedState};
use super::task::{TaskFlags, TaskState};
use super::wait::WaitOn;
use crate::error::{KResult, KernError};
use crate::types::Tid;

pub const SIGINT: u32 = 2;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGUSR2: u32 = 12;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;

/// Highest valid signal number
pub const SIG_MAX: u32 = 63;

const fn sig_bit(sig: u32) -> u64 {
    1u64 << sig
}

/// Signals that can never be blocked
const UNBLOCKABLE: u64 = sig_bit(SIGKILL) | sig_bit(SIGSTOP);

impl SchedState {
    /// Does `tid` have a pending signal it does not block?
    pub(crate) fn has_pending_signals(&self, tid: Tid) -> bool {
        self.tasks
            .get(&tid)
            .is_some_and(|t| t.sig_pending & !t.sig_blocked != 0)
    }

    fn send_signal(&mut self, tid: Tid, sig: u32) -> KResult<()> {
        let curr = self.current;
        let t = match self.tasks.get_mut(&tid) {
            Some(t) if t.state() != TaskState::Zombie => t,
            _ => return Err(KernError::NoSuchTask),
        };

        match sig {
            SIGSTOP | SIGTSTP => {
                t.flags.insert(TaskFlags::STOPPED | TaskFlags::WAS_STOPPED);
                if tid == curr {
                    sched_set_need_resched();
                }
                log::debug!("task {} stopped by signal {}", tid, sig);
                return Ok(());
            }
            SIGCONT => {
                t.flags.remove(TaskFlags::STOPPED);
                log::debug!("task {} continued", tid);
            }
            _ => {}
        }

        t.sig_pending |= sig_bit(sig);
        let interrupts_sleep = t.state() == TaskState::Sleeping
            && !matches!(t.wobj.on, WaitOn::Mutex(_))
            && t.sig_pending & !t.sig_blocked != 0;
        if interrupts_sleep {
            self.wake_up(tid);
        }
        Ok(())
    }
}

/// Make `sig` pending on `tid`, waking it if it sleeps interruptibly
pub fn send_signal(tid: Tid, sig: u32) -> KResult<()> {
    if sig == 0 || sig > SIG_MAX {
        return Err(KernError::Invalid);
    }
    with_sched(|s| s.send_signal(tid, sig))
}

/// Pending signals of the current task, blocked ones included
pub fn pending_signals() -> u64 {
    let curr = get_curr_tid();
    with_sched(|s| s.task(curr).sig_pending)
}

/// Does the current task have a signal to act on?
pub fn has_pending_signals_curr() -> bool {
    let curr = get_curr_tid();
    with_sched(|s| s.has_pending_signals(curr))
}

/// Dequeue the lowest-numbered unblocked pending signal
pub fn take_pending_signal() -> Option<u32> {
    let curr = get_curr_tid();
    with_sched(|s| {
        let t = s.task_mut(curr);
        let ready = t.sig_pending & !t.sig_blocked;
        if ready == 0 {
            return None;
        }
        let sig = ready.trailing_zeros();
        t.sig_pending &= !sig_bit(sig);
        Some(sig)
    })
}

/// Replace the blocked mask of the current task, returning the old one.
/// SIGKILL and SIGSTOP stay deliverable.
pub fn set_blocked_signals(mask: u64) -> u64 {
    let curr = get_curr_tid();
    with_sched(|s| {
        let t = s.task_mut(curr);
        core::mem::replace(&mut t.sig_blocked, mask & !UNBLOCKABLE & !1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::registry::{get_task, kthread_create, kthread_join};
    use crate::kern::sched::kernel_yield;
    use crate::kern::task::KthFlags;
    use crate::kern::timer::{get_ticks, kernel_sleep};
    use crate::testing;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[test]
    fn test_invalid_signals() {
        let _k = testing::boot();
        assert_eq!(send_signal(Tid::KERNEL_MAIN, 0), Err(KernError::Invalid));
        assert_eq!(send_signal(Tid::KERNEL_MAIN, 64), Err(KernError::Invalid));
        assert_eq!(send_signal(Tid(777), SIGUSR1), Err(KernError::NoSuchTask));
    }

    #[test]
    fn test_pending_and_take_in_order() {
        let _k = testing::boot();
        let me = get_curr_tid();
        send_signal(me, SIGTERM).unwrap();
        send_signal(me, SIGUSR1).unwrap();
        assert_eq!(pending_signals(), sig_bit(SIGUSR1) | sig_bit(SIGTERM));
        assert!(has_pending_signals_curr());
        assert_eq!(take_pending_signal(), Some(SIGUSR1));
        assert_eq!(take_pending_signal(), Some(SIGTERM));
        assert_eq!(take_pending_signal(), None);
        assert!(!has_pending_signals_curr());
    }

    #[test]
    fn test_blocked_signals_stay_pending() {
        let _k = testing::boot();
        let me = get_curr_tid();
        assert_eq!(set_blocked_signals(sig_bit(SIGUSR2) | UNBLOCKABLE), 0);
        send_signal(me, SIGUSR2).unwrap();
        assert!(!has_pending_signals_curr());
        assert_eq!(take_pending_signal(), None);

        // KILL and STOP were silently left out of the mask
        let old = set_blocked_signals(0);
        assert_eq!(old, sig_bit(SIGUSR2));
        assert_eq!(take_pending_signal(), Some(SIGUSR2));
    }

    #[test]
    fn test_signal_interrupts_sleep() {
        let _k = testing::boot();
        let slept = Arc::new(AtomicU64::new(u64::MAX));
        let s2 = slept.clone();
        let t = kthread_create("sleeper", KthFlags::empty(), move || {
            let start = get_ticks();
            kernel_sleep(1000);
            s2.store(get_ticks() - start, Ordering::SeqCst);
        })
        .unwrap();
        kernel_yield();
        assert_eq!(get_task(t).unwrap().state, TaskState::Sleeping);

        send_signal(t, SIGUSR1).unwrap();
        assert_eq!(get_task(t).unwrap().state, TaskState::Runnable);
        kthread_join(t, true).unwrap();
        assert!(slept.load(Ordering::SeqCst) < 1000);
    }

    #[test]
    fn test_blocked_signal_does_not_wake() {
        let _k = testing::boot();
        let t = kthread_create("sleeper", KthFlags::empty(), || {
            set_blocked_signals(sig_bit(SIGUSR1));
            kernel_sleep(3);
        })
        .unwrap();
        kernel_yield();
        send_signal(t, SIGUSR1).unwrap();
        assert_eq!(get_task(t).unwrap().state, TaskState::Sleeping);
        kthread_join(t, true).unwrap();
    }

    #[test]
    fn test_stop_and_continue() {
        let _k = testing::boot();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let t = kthread_create("victim", KthFlags::empty(), move || r.store(true, Ordering::SeqCst)).unwrap();

        send_signal(t, SIGSTOP).unwrap();
        let info = get_task(t).unwrap();
        assert!(info.flags.contains(TaskFlags::STOPPED | TaskFlags::WAS_STOPPED));
        kernel_yield();
        assert!(!ran.load(Ordering::SeqCst));

        send_signal(t, SIGCONT).unwrap();
        assert!(!get_task(t).unwrap().flags.contains(TaskFlags::STOPPED));
        kthread_join(t, true).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
