//! Timer interrupt and task wake-up timers
//!
//! Every tick advances the system tick count, runs down the armed wake-up
//! timers and charges the running task. Preemption happens on the way out of
//! the interrupt, once nothing holds it off.

use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use super::preempt::{
    disable_preemption, enable_preemption_nosched, is_preemption_enabled, need_reschedule,
    PreemptGuard,
};
use super::sched::{get_curr_tid, kernel_yield_preempt_disabled, schedule, with_sched, SchedState};
use super::task::TaskState;
use crate::types::Tid;

static TICKS: AtomicU64 = AtomicU64::new(0);
static IRQ_NESTING: AtomicI32 = AtomicI32::new(0);

/// Ticks since boot
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::SeqCst)
}

/// Are we running an interrupt handler?
pub fn in_irq() -> bool {
    IRQ_NESTING.load(Ordering::SeqCst) > 0
}

pub(crate) fn reset() {
    TICKS.store(0, Ordering::SeqCst);
    IRQ_NESTING.store(0, Ordering::SeqCst);
}

fn irq_enter() {
    disable_preemption();
    IRQ_NESTING.fetch_add(1, Ordering::SeqCst);
}

fn irq_exit() {
    IRQ_NESTING.fetch_sub(1, Ordering::SeqCst);
    enable_preemption_nosched();
}

impl SchedState {
    /// Arm a one-shot timer waking `tid` after `ticks`
    pub(crate) fn task_set_wakeup_timer(&mut self, tid: Tid, ticks: u32) {
        crate::kassert!(ticks > 0);
        let t = self.task_mut(tid);
        t.ticks_before_wake_up = ticks;
        t.timer_ready = false;
        if !self.timers.contains(&tid) {
            self.timers.push(tid);
        }
    }

    /// Change the timeout of an armed timer; no-op if none is armed
    pub(crate) fn task_update_wakeup_timer_if_any(&mut self, tid: Tid, ticks: u32) {
        crate::kassert!(ticks > 0);
        if self.timers.contains(&tid) {
            self.task_mut(tid).ticks_before_wake_up = ticks;
        }
    }

    /// Disarm the timer of `tid`, returning the ticks it had left
    pub(crate) fn task_cancel_wakeup_timer(&mut self, tid: Tid) -> u32 {
        self.timers.retain(|&t| t != tid);
        match self.tasks.get_mut(&tid) {
            Some(t) => {
                t.timer_ready = false;
                core::mem::take(&mut t.ticks_before_wake_up)
            }
            None => 0,
        }
    }

    /// One tick for every armed timer; expired ones wake their task
    pub(crate) fn tick_wakeup_timers(&mut self) {
        let mut expired = alloc::vec::Vec::new();
        for &tid in &self.timers {
            if let Some(t) = self.tasks.get_mut(&tid) {
                t.ticks_before_wake_up = t.ticks_before_wake_up.saturating_sub(1);
                if t.ticks_before_wake_up == 0 {
                    t.timer_ready = true;
                    expired.push(tid);
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        self.timers.retain(|t| !expired.contains(t));
        for tid in expired {
            log::trace!("wake-up timer of task {} expired", tid);
            self.wake_up(tid);
        }
    }
}

pub fn task_set_wakeup_timer(tid: Tid, ticks: u32) {
    with_sched(|s| s.task_set_wakeup_timer(tid, ticks));
}

pub fn task_update_wakeup_timer_if_any(tid: Tid, ticks: u32) {
    with_sched(|s| s.task_update_wakeup_timer_if_any(tid, ticks));
}

pub fn task_cancel_wakeup_timer(tid: Tid) -> u32 {
    with_sched(|s| s.task_cancel_wakeup_timer(tid))
}

/// Timer interrupt entry point
pub fn timer_irq_handler() {
    irq_enter();
    TICKS.fetch_add(1, Ordering::SeqCst);
    with_sched(|s| {
        s.tick_wakeup_timers();
        s.account_ticks();
    });
    irq_exit();

    if need_reschedule() && is_preemption_enabled() && !in_irq() {
        schedule();
    }
}

/// Sleep for `ticks` timer ticks (or until a signal arrives)
pub fn kernel_sleep(ticks: u32) {
    if ticks == 0 {
        super::sched::kernel_yield();
        return;
    }
    let curr = get_curr_tid();
    let guard = PreemptGuard::new();
    with_sched(|s| {
        s.task_set_wakeup_timer(curr, ticks);
        s.task_change_state(curr, TaskState::Sleeping);
    });
    kernel_yield_preempt_disabled(guard);
    with_sched(|s| s.task_cancel_wakeup_timer(curr));
}
