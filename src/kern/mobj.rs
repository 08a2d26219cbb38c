//! Multi-object waiter
//!
//! Lets one task sleep on several wait lists at once and be woken by the
//! first of them to fire. Each bound slot puts its own node on the watched
//! object's list; the generic wake path retracts all the other nodes before
//! the task runs again, so no stale registration survives the wake-up.

use alloc::vec::Vec;

use super::preempt::PreemptGuard;
use super::sched::{enter_sleep_wait_state, get_curr_tid, try_with_sched, with_sched, SchedState};
use super::task::TaskState;
use super::wait::{MwoKey, NodeKey, WaitObjType, WaitOn, WaitResult, WaitTarget, Waitable};
use crate::error::{KResult, KernError};
use crate::types::Tid;

#[derive(Debug, Default)]
pub(crate) struct MwoElem {
    target: Option<WaitTarget>,
    node: Option<NodeKey>,
}

/// Scheduler-side record of a multi-object waiter
#[derive(Debug)]
pub(crate) struct MwoRecord {
    owner: Tid,
    elems: Vec<MwoElem>,
    fired: Option<usize>,
}

impl SchedState {
    /// Unlink every slot of `mwo` from the list it is queued on
    pub(crate) fn retract_multi_obj(&mut self, mwo: MwoKey) {
        let Some(record) = self.waits.mwaiters.get_mut(mwo.0) else {
            return;
        };
        let nodes: Vec<NodeKey> = record.elems.iter_mut().filter_map(|e| e.node.take()).collect();
        for node in nodes {
            self.waits.unlink(node);
        }
    }

    pub(crate) fn note_multi_obj_fired(&mut self, mwo: MwoKey, index: usize) {
        if let Some(record) = self.waits.mwaiters.get_mut(mwo.0) {
            if let Some(elem) = record.elems.get_mut(index) {
                elem.node = None;
            }
            record.fired.get_or_insert(index);
        }
    }

    /// Queue `tid` on every bound slot of `mwo` and mark it SLEEPING
    pub(crate) fn prepare_to_wait_on_multi_obj(&mut self, tid: Tid, mwo: MwoKey) {
        crate::kassert!(!super::preempt::is_preemption_enabled());

        let targets: Vec<(usize, WaitTarget)> = match self.waits.mwaiters.get_mut(mwo.0) {
            Some(record) => {
                crate::kassert!(record.owner == tid, "multi-object waiter used by another task");
                record.fired = None;
                record
                    .elems
                    .iter()
                    .enumerate()
                    .filter_map(|(i, e)| e.target.map(|t| (i, t)))
                    .collect()
            }
            None => crate::kpanic!("multi-object waiter freed"),
        };
        crate::kassert!(!targets.is_empty(), "multi-object wait with no bound slot");

        for (index, target) in targets {
            let node = self.waits.push_back(target.list, tid, target.extra, Some((mwo, index)));
            if let Some(record) = self.waits.mwaiters.get_mut(mwo.0) {
                record.elems[index].node = Some(node);
            }
        }
        self.wait_obj_set(tid, WaitOn::MultiWaiter(mwo), 0, None);
        self.task_change_state(tid, TaskState::Sleeping);
    }
}

/// Waiter on the first-ready of several objects
///
/// Owned by the waiting task: allocated before the wait, freed on drop.
pub struct MultiObjWaiter {
    key: MwoKey,
    len: usize,
}

impl MultiObjWaiter {
    /// Allocate a waiter with `elems` unbound slots
    pub fn new(elems: usize) -> KResult<Self> {
        if elems == 0 {
            return Err(KernError::Invalid);
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(elems).map_err(|_| KernError::NoMemory)?;
        slots.resize_with(elems, MwoElem::default);

        let owner = get_curr_tid();
        let key = with_sched(|s| {
            s.waits.mwaiters.try_insert(MwoRecord {
                owner,
                elems: slots,
                fired: None,
            })
        })?;
        Ok(Self {
            key: MwoKey(key),
            len: elems,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn key(&self) -> MwoKey {
        self.key
    }

    /// Bind slot `index` to `obj`
    pub fn set(&mut self, index: usize, obj: &dyn Waitable) {
        let target = obj.wait_target();
        self.set_target(index, target);
    }

    pub(crate) fn set_target(&mut self, index: usize, target: WaitTarget) {
        crate::kassert!(index < self.len, "slot {} out of {}", index, self.len);
        crate::kassert!(target.on != WaitObjType::None && target.on != WaitObjType::MultiWaiter);
        with_sched(|s| {
            if let Some(record) = s.waits.mwaiters.get_mut(self.key.0) {
                let elem = &mut record.elems[index];
                crate::kassert!(elem.node.is_none(), "rebinding a queued slot");
                elem.target = Some(target);
            }
        });
    }

    /// Unbind slot `index`, dropping its registration if still queued
    pub fn reset(&mut self, index: usize) {
        crate::kassert!(index < self.len);
        with_sched(|s| {
            let node = s.waits.mwaiters.get_mut(self.key.0).and_then(|r| {
                let elem = &mut r.elems[index];
                elem.target = None;
                elem.node.take()
            });
            if let Some(node) = node {
                s.waits.unlink(node);
            }
        });
    }

    /// Slot whose object woke the task in the last wait, if any
    pub fn fired_index(&self) -> Option<usize> {
        with_sched(|s| s.waits.mwaiters.get(self.key.0).and_then(|r| r.fired))
    }

    /// Queue the current task on every bound slot and mark it SLEEPING
    pub fn prepare(&self, _guard: &PreemptGuard) {
        let curr = get_curr_tid();
        with_sched(|s| s.prepare_to_wait_on_multi_obj(curr, self.key));
    }

    /// Block until one of the bound objects fires. `timeout_ticks == 0`
    /// waits forever.
    pub fn wait(&mut self, timeout_ticks: u32) -> WaitResult {
        let guard = PreemptGuard::new();
        self.wait_preempt_disabled(guard, timeout_ticks)
    }

    /// [`MultiObjWaiter::wait`] for a caller that already disabled
    /// preemption, e.g. to check readiness race-free before sleeping
    pub fn wait_preempt_disabled(&mut self, guard: PreemptGuard, timeout_ticks: u32) -> WaitResult {
        let curr = get_curr_tid();
        with_sched(|s| {
            if timeout_ticks > 0 {
                s.task_set_wakeup_timer(curr, timeout_ticks);
            }
            s.prepare_to_wait_on_multi_obj(curr, self.key)
        });

        enter_sleep_wait_state(guard);

        let _guard = PreemptGuard::new();
        with_sched(|s| {
            let timer_ready = s.task(curr).timer_ready;
            let fired = s.waits.mwaiters.get(self.key.0).and_then(|r| r.fired);
            if timeout_ticks > 0 {
                s.task_cancel_wakeup_timer(curr);
            }
            s.wait_obj_reset(curr);

            if fired.is_some() {
                WaitResult::Normal
            } else if timeout_ticks > 0 && timer_ready {
                WaitResult::TimedOut
            } else if s.has_pending_signals(curr) {
                WaitResult::Interrupted
            } else {
                WaitResult::Normal
            }
        })
    }
}

impl Drop for MultiObjWaiter {
    fn drop(&mut self) {
        let key = self.key;
        try_with_sched(|s| {
            s.retract_multi_obj(key);
            s.waits.mwaiters.remove(key.0);
        });
    }
}

/// Allocate a multi-object waiter with `elems` slots
pub fn allocate_mobj_waiter(elems: usize) -> KResult<MultiObjWaiter> {
    MultiObjWaiter::new(elems)
}

/// Release a multi-object waiter
pub fn free_mobj_waiter(w: MultiObjWaiter) {
    drop(w);
}

/// Bind slot `index` of `w` to `obj`
pub fn mobj_waiter_set(w: &mut MultiObjWaiter, index: usize, obj: &dyn Waitable) {
    w.set(index, obj);
}

/// Unbind slot `index` of `w`
pub fn mobj_waiter_reset(w: &mut MultiObjWaiter, index: usize) {
    w.reset(index);
}

/// Queue the current task on all bound slots of `w`
pub fn prepare_to_wait_on_multi_obj(w: &MultiObjWaiter, guard: &PreemptGuard) {
    w.prepare(guard);
}
