//! Task and process registry
//!
//! Identifier allocation, creation and destruction of tasks and processes,
//! the exit path, zombie reaping and reparenting. The tables themselves live
//! in the scheduler state; this module is the only code that adds to or
//! removes from them.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::preempt::{is_preemption_enabled, PreemptGuard};
use super::sched::{
    enter_sleep_wait_state, get_curr_tid, schedule_preempt_disabled, with_sched, SchedState,
};
use super::signal::has_pending_signals_curr;
use super::task::{
    KernelStack, KthFlags, Process, ProcessInfo, Task, TaskFlags, TaskInfo, TaskState,
};
use super::timer::in_irq;
use super::wait::{WaitOn, NO_EXTRA};
use crate::arch::{self, TaskEntry};
use crate::config::{KERNEL_MAX_TID, KERNEL_TID_START, MAX_ON_EXIT_CBS};
use crate::error::{KResult, KernError};
use crate::types::{Pid, Tid};

/// Callback run by every task on its way out
pub type ExitCallback = fn(Tid);

/// Linux-style wait status of a normal exit
pub const fn exit_status(code: i32) -> i32 {
    (code & 0xff) << 8
}

/// Linux-style wait status of a death by signal
pub const fn signal_status(sig: u32) -> i32 {
    (sig & 0x7f) as i32
}

// ============================================================================
// Identifiers and Tables
// ============================================================================

impl SchedState {
    /// Next free user pid, round-robin over 1..=max_pid
    pub(crate) fn create_new_pid(&mut self) -> Option<Tid> {
        let max = self.cfg.max_pid;
        for i in 1..=max {
            let candidate = (self.last_pid + i - 1) % max + 1;
            if !self.tasks.contains_key(&Tid(candidate)) && !self.procs.contains_key(&Pid(candidate)) {
                self.last_pid = candidate;
                return Some(Tid(candidate));
            }
        }
        None
    }

    /// Next free kernel thread id, wrapping within the kernel window
    pub(crate) fn create_new_kernel_tid(&mut self) -> Option<Tid> {
        for i in 1..=KERNEL_MAX_TID {
            let offset = (self.last_kernel_tid + i).rem_euclid(KERNEL_MAX_TID);
            let candidate = Tid(KERNEL_TID_START + offset);
            if !self.tasks.contains_key(&candidate) {
                self.last_kernel_tid = offset;
                return Some(candidate);
            }
        }
        None
    }

    pub(crate) fn add_task(&mut self, task: Task) {
        let (tid, pid) = (task.tid, task.pid);
        crate::kassert!(!self.tasks.contains_key(&tid), "tid {} in use", tid);
        if let Some(p) = self.procs.get_mut(&pid) {
            if !p.threads.contains(&tid) {
                p.threads.push(tid);
            }
        }
        self.tasks.insert(tid, task);
    }

    pub(crate) fn remove_task(&mut self, tid: Tid) -> Option<Task> {
        let task = self.tasks.remove(&tid)?;
        self.runq.remove(tid);
        self.timers.retain(|&t| t != tid);
        if let Some(node) = task.wobj.node {
            self.waits.unlink(node);
        }
        if let Some(p) = self.procs.get_mut(&task.pid) {
            p.threads.retain(|&t| t != tid);
        }
        self.wake_up_all(task.waiters);
        self.waits.free_list(task.waiters);
        Some(task)
    }

    /// Free a task for good
    pub(crate) fn destroy_task(&mut self, tid: Tid) {
        if self.remove_task(tid).is_some() {
            arch::arch().release_task_context(tid);
            log::debug!("task {} destroyed", tid);
        }
    }

    /// Free a process and all its (zombie) threads. Returns the wait
    /// status of its main thread.
    pub(crate) fn destroy_process(&mut self, pid: Pid) -> i32 {
        let wstatus = self.tasks.get(&pid.main_tid()).map_or(0, |t| t.wstatus);
        let threads = self.procs.get(&pid).map(|p| p.threads.clone()).unwrap_or_default();
        for tid in threads {
            self.detached_zombies.retain(|&t| t != tid);
            self.destroy_task(tid);
        }
        self.reparent_children(pid);
        if let Some(p) = self.procs.remove(&pid) {
            if let Some(parent) = self.procs.get_mut(&p.parent_pid) {
                parent.children.retain(|&c| c != pid);
            }
        }
        log::debug!("process {} reaped, status {:#x}", pid, wstatus);
        wstatus
    }

    fn is_reapable(&self, pid: Pid) -> bool {
        self.procs.get(&pid).is_some_and(|p| {
            p.threads
                .iter()
                .all(|t| self.tasks.get(t).map_or(true, |t| t.state() == TaskState::Zombie))
        })
    }

    /// Wake every thread of `parent` blocked in a wait for children
    fn notify_parent(&mut self, parent: Pid) {
        let waiting: Vec<Tid> = match self.procs.get(&parent) {
            Some(p) => p
                .threads
                .iter()
                .copied()
                .filter(|t| matches!(self.tasks.get(t).map(|t| t.wobj.on), Some(WaitOn::Task(_))))
                .collect(),
            None => return,
        };
        for tid in waiting {
            self.wake_up(tid);
        }
    }

    /// Move the children of `pid` to init (or the kernel process)
    fn reparent_children(&mut self, pid: Pid) {
        let children = match self.procs.get_mut(&pid) {
            Some(p) => core::mem::take(&mut p.children),
            None => return,
        };
        if children.is_empty() {
            return;
        }
        let new_parent = if pid != Pid::INIT && self.procs.contains_key(&Pid::INIT) {
            Pid::INIT
        } else {
            Pid::KERNEL
        };

        let mut any_zombie = false;
        for child in children {
            if let Some(c) = self.procs.get_mut(&child) {
                c.parent_pid = new_parent;
            }
            if let Some(p) = self.procs.get_mut(&new_parent) {
                p.children.push(child);
            }
            if self.is_reapable(child) {
                any_zombie = true;
                if new_parent == Pid::KERNEL {
                    self.detached_zombies.push(child.main_tid());
                }
            }
        }
        if any_zombie && new_parent != Pid::KERNEL {
            self.notify_parent(new_parent);
        }
    }

    /// Every thread of `pid` is a zombie now: let its parent reap it, or
    /// free it on a later schedule if nobody will
    fn process_became_reapable(&mut self, pid: Pid) {
        let parent = self.procs.get(&pid).map_or(Pid::KERNEL, |p| p.parent_pid);
        if parent == Pid::KERNEL {
            let main = pid.main_tid();
            if !self.detached_zombies.contains(&main) {
                self.detached_zombies.push(main);
            }
        } else {
            self.notify_parent(parent);
        }
    }

    /// Turn `tid` into a zombie and tell whoever cares
    pub(crate) fn terminate(&mut self, tid: Tid, wstatus: i32) {
        self.task_cancel_wakeup_timer(tid);
        self.wait_obj_reset(tid);

        let t = self.task_mut(tid);
        t.wstatus = wstatus;
        let (pid, is_main, waiters) = (t.pid, t.is_main_thread(), t.waiters);
        self.task_change_state(tid, TaskState::Zombie);
        self.wake_up_all(waiters);

        if pid == Pid::KERNEL {
            self.detached_zombies.push(tid);
            return;
        }
        if is_main {
            self.reparent_children(pid);
        } else {
            // Secondary threads leave no status behind
            self.detached_zombies.push(tid);
        }
        if self.is_reapable(pid) {
            self.process_became_reapable(pid);
        }
    }
}

// ============================================================================
// Lookup
// ============================================================================

pub fn get_task(tid: Tid) -> Option<TaskInfo> {
    with_sched(|s| s.tasks.get(&tid).map(Task::info))
}

pub fn get_process(pid: Pid) -> Option<ProcessInfo> {
    with_sched(|s| s.procs.get(&pid).map(Process::info))
}

/// Inspect a task in place
pub fn with_task<R>(tid: Tid, f: impl FnOnce(&Task) -> R) -> Option<R> {
    with_sched(|s| s.tasks.get(&tid).map(f))
}

/// Walk all tasks in tid order until `f` returns non-zero, which is then
/// returned. Preemption must be disabled; `f` runs under the scheduler
/// lock and must not call back into the scheduler.
pub fn iterate_over_tasks(mut f: impl FnMut(&Task) -> i32) -> i32 {
    crate::kassert!(!is_preemption_enabled());
    with_sched(|s| {
        for t in s.tasks.values() {
            let rc = f(t);
            if rc != 0 {
                return rc;
            }
        }
        0
    })
}

pub fn create_new_pid() -> Option<Tid> {
    crate::kassert!(!is_preemption_enabled());
    with_sched(|s| s.create_new_pid())
}

pub fn create_new_kernel_tid() -> Option<Tid> {
    crate::kassert!(!is_preemption_enabled());
    with_sched(|s| s.create_new_kernel_tid())
}

/// Number of processes in group `pgid`
pub fn sched_count_proc_in_group(pgid: Pid) -> usize {
    with_sched(|s| s.procs.values().filter(|p| p.pgid == pgid).count())
}

/// Session of process group `pgid`, if the group exists
pub fn sched_get_session_of_group(pgid: Pid) -> Option<Pid> {
    with_sched(|s| s.procs.values().find(|p| p.pgid == pgid).map(|p| p.sid))
}

/// Move `pid` into group `pgid` (0 meaning its own pid)
pub fn set_process_group(pid: Pid, pgid: Pid) -> KResult<()> {
    with_sched(|s| {
        let pgid = if pgid.0 == 0 { pid } else { pgid };
        let sid = s.procs.get(&pid).ok_or(KernError::NoSuchTask)?.sid;
        if pgid != pid {
            match s.procs.values().find(|p| p.pgid == pgid) {
                Some(leader) if leader.sid == sid => {}
                _ => return Err(KernError::Invalid),
            }
        }
        if let Some(p) = s.procs.get_mut(&pid) {
            p.pgid = pgid;
        }
        Ok(())
    })
}

// ============================================================================
// Exit Callbacks
// ============================================================================

/// Register `cb` to run on every task exit. Returns its slot. Freed slots
/// are reused, but callbacks always run in registration order.
pub fn register_on_task_exit_cb(cb: ExitCallback) -> KResult<usize> {
    with_sched(|s| {
        let entry = Some((s.exit_cb_seq, cb));
        let slot = match s.exit_cbs.iter().position(Option::is_none) {
            Some(i) => {
                s.exit_cbs[i] = entry;
                i
            }
            None => {
                s.exit_cbs.push(entry).map_err(|_| KernError::NoSpace)?;
                s.exit_cbs.len() - 1
            }
        };
        s.exit_cb_seq += 1;
        Ok(slot)
    })
}

pub fn unregister_on_task_exit_cb(index: usize) -> KResult<()> {
    with_sched(|s| match s.exit_cbs.get_mut(index) {
        Some(slot @ Some(_)) => {
            *slot = None;
            Ok(())
        }
        _ => Err(KernError::Invalid),
    })
}

// ============================================================================
// Creation
// ============================================================================

fn start_task(tid: Tid, stack_top: usize, entry: TaskEntry, kthread: bool) -> KResult<()> {
    let body: TaskEntry = Box::new(move || {
        arch::arch().enable_interrupts();
        entry();
        if kthread {
            kthread_exit();
        } else {
            task_exit(0);
        }
    });

    if let Err(e) = arch::arch().init_task_context(tid, stack_top, body) {
        with_sched(|s| {
            let (pid, is_main) = (s.task(tid).pid, s.task(tid).is_main_thread());
            if is_main && pid != Pid::KERNEL {
                s.destroy_process(pid);
            } else {
                s.destroy_task(tid);
            }
        });
        return Err(e);
    }

    with_sched(|s| {
        let vruntime = s.min_vruntime();
        s.task_mut(tid).ticks.vruntime = vruntime;
        s.task_change_state(tid, TaskState::Runnable);
    });
    Ok(())
}

fn alloc_stack() -> KResult<KernelStack> {
    let size = with_sched(|s| s.cfg.kernel_stack_size);
    KernelStack::alloc(size)
}

/// Create a kernel thread running `entry`
pub fn kthread_create(
    name: &'static str,
    flags: KthFlags,
    entry: impl FnOnce() + Send + 'static,
) -> KResult<Tid> {
    let stack = alloc_stack()?;
    let top = stack.top();
    let _guard = PreemptGuard::new();

    let tid = with_sched(|s| {
        let Some(tid) = s.create_new_kernel_tid() else {
            log::warn!("kthread_create: kernel tid space exhausted");
            return Err(KernError::Again);
        };
        let waiters = s.waits.new_list();
        let mut task = Task::new(tid, Pid::KERNEL, waiters, Some(stack));
        task.name = Some(name);
        task.kthread_flags = flags;
        s.add_task(task);
        Ok(tid)
    })?;

    start_task(tid, top, Box::new(entry), true)?;
    log::debug!("kthread {} '{}' created", tid, name);
    Ok(tid)
}

fn idle_body() {
    loop {
        arch::arch().halt();
        super::sched::kernel_yield();
    }
}

pub(crate) fn create_idle_task() -> KResult<Tid> {
    let tid = kthread_create("idle", KthFlags::empty(), idle_body)?;
    with_sched(|s| s.idle = Some(tid));
    Ok(tid)
}

/// Create a process, child of `parent`, whose main thread runs `entry`
pub fn create_process(parent: Pid, entry: impl FnOnce() + Send + 'static) -> KResult<Pid> {
    let stack = alloc_stack()?;
    let top = stack.top();
    let _guard = PreemptGuard::new();

    let pid = with_sched(|s| {
        let (pgid, sid) = match s.procs.get(&parent) {
            Some(p) => (p.pgid, p.sid),
            None => return Err(KernError::NoSuchTask),
        };
        let Some(tid) = s.create_new_pid() else {
            log::warn!("create_process: pid space exhausted");
            return Err(KernError::Again);
        };
        let pid = tid.as_pid();
        // Children of the kernel start their own session
        let (pgid, sid) = if parent == Pid::KERNEL { (pid, pid) } else { (pgid, sid) };
        s.procs.insert(pid, Process::new(pid, parent, pgid, sid));
        if let Some(p) = s.procs.get_mut(&parent) {
            p.children.push(pid);
        }

        let waiters = s.waits.new_list();
        let mut task = Task::new(tid, pid, waiters, Some(stack));
        task.flags |= TaskFlags::MAIN_THREAD;
        s.add_task(task);
        Ok(pid)
    })?;

    start_task(pid.main_tid(), top, Box::new(entry), false)?;
    log::debug!("process {} created, parent {}", pid, parent);
    Ok(pid)
}

/// Create an extra thread in process `pid`
pub fn create_thread(pid: Pid, entry: impl FnOnce() + Send + 'static) -> KResult<Tid> {
    if pid == Pid::KERNEL {
        return Err(KernError::Invalid);
    }
    let stack = alloc_stack()?;
    let top = stack.top();
    let _guard = PreemptGuard::new();

    let tid = with_sched(|s| {
        let main_alive = s
            .tasks
            .get(&pid.main_tid())
            .is_some_and(|t| t.state() != TaskState::Zombie);
        if !s.procs.contains_key(&pid) || !main_alive {
            return Err(KernError::NoSuchTask);
        }
        let tid = s.create_new_pid().ok_or(KernError::Again)?;
        let waiters = s.waits.new_list();
        s.add_task(Task::new(tid, pid, waiters, Some(stack)));
        Ok(tid)
    })?;

    start_task(tid, top, Box::new(entry), false)?;
    Ok(tid)
}

// ============================================================================
// Exit
// ============================================================================

/// Terminate the current task with `wstatus`
pub fn task_exit(wstatus: i32) -> ! {
    let curr = get_curr_tid();
    crate::kassert!(!in_irq(), "task_exit from interrupt context");
    let (mut cbs, is_idle) = with_sched(|s| {
        let cbs: heapless::Vec<(u64, ExitCallback), MAX_ON_EXIT_CBS> =
            s.exit_cbs.iter().flatten().copied().collect();
        (cbs, s.idle == Some(curr))
    });
    crate::kassert!(curr != Tid::KERNEL_MAIN && !is_idle, "task {} cannot exit", curr);

    cbs.sort_unstable_by_key(|&(seq, _)| seq);
    for (_, cb) in &cbs {
        cb(curr);
    }

    let guard = PreemptGuard::new();
    with_sched(|s| s.terminate(curr, wstatus));
    log::debug!("task {} exited, status {:#x}", curr, wstatus);
    schedule_preempt_disabled(guard);
    crate::kpanic!("zombie task {} resumed", curr)
}

/// Terminate the current kernel thread
pub fn kthread_exit() -> ! {
    task_exit(0)
}

// ============================================================================
// Joining and Reaping
// ============================================================================

/// Wait for thread `tid` to exit
pub fn kthread_join(tid: Tid, ignore_signals: bool) -> KResult<()> {
    let curr = get_curr_tid();
    crate::kassert!(tid != curr, "task {} joining itself", tid);

    loop {
        let guard = PreemptGuard::new();
        let done = with_sched(|s| match s.tasks.get(&tid).map(|t| (t.state(), t.waiters)) {
            None | Some((TaskState::Zombie, _)) => true,
            Some((_, list)) => {
                s.prepare_to_wait_on(curr, WaitOn::Task(tid.0), NO_EXTRA, Some(list));
                false
            }
        });
        if done {
            return Ok(());
        }

        enter_sleep_wait_state(guard);

        if !ignore_signals && has_pending_signals_curr() {
            with_sched(|s| s.wait_obj_reset(curr));
            return Err(KernError::Interrupted);
        }
    }
}

/// Join every thread in `tids`
pub fn kthread_join_all(tids: &[Tid], ignore_signals: bool) -> KResult<()> {
    tids.iter().try_for_each(|&tid| kthread_join(tid, ignore_signals))
}

fn child_matches(selector: i32, child: &Process, my_pgid: Pid) -> bool {
    match selector {
        -1 => true,
        0 => child.pgid == my_pgid,
        s if s > 0 => child.pid == Pid(s),
        s => child.pgid == Pid(-s),
    }
}

enum ChildWait {
    Reaped(Pid, i32),
    NoChild,
    WouldBlock,
    Sleep,
}

/// Wait for a child process to exit and reap it.
///
/// `selector` selects children like waitpid: -1 any, > 0 that pid, 0 the
/// caller's group, < -1 group `-selector`. Returns `Ok(None)` when `nohang` is
/// set and no selected child has exited yet.
pub fn wait_child(selector: i32, nohang: bool) -> KResult<Option<(Pid, i32)>> {
    let curr = get_curr_tid();
    loop {
        let guard = PreemptGuard::new();
        let outcome = with_sched(|s| {
            let me = s.task(curr).pid;
            let Some(me_proc) = s.procs.get(&me) else {
                return ChildWait::NoChild;
            };
            let mut any = false;
            let mut reapable = None;
            for &child in &me_proc.children {
                let Some(c) = s.procs.get(&child) else {
                    continue;
                };
                if child_matches(selector, c, me_proc.pgid) {
                    any = true;
                    if s.is_reapable(child) {
                        reapable = Some(child);
                        break;
                    }
                }
            }
            if let Some(child) = reapable {
                let wstatus = s.destroy_process(child);
                return ChildWait::Reaped(child, wstatus);
            }
            if !any {
                return ChildWait::NoChild;
            }
            if nohang {
                return ChildWait::WouldBlock;
            }
            s.prepare_to_wait_on(curr, WaitOn::Task(selector), NO_EXTRA, None);
            ChildWait::Sleep
        });

        match outcome {
            ChildWait::Reaped(pid, wstatus) => return Ok(Some((pid, wstatus))),
            ChildWait::NoChild => return Err(KernError::NoChild),
            ChildWait::WouldBlock => return Ok(None),
            ChildWait::Sleep => {
                enter_sleep_wait_state(guard);
                if has_pending_signals_curr() {
                    with_sched(|s| s.wait_obj_reset(curr));
                    return Err(KernError::Interrupted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedConfig;
    use crate::kern::sched::kernel_yield;
    use crate::testing;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_kernel_tids_come_from_kernel_window() {
        let _k = testing::boot();
        let t = kthread_create("k", KthFlags::WORKER_THREAD, || {}).unwrap();
        assert!(t.is_kernel_thread_id());
        assert!(t.0 < KERNEL_TID_START + KERNEL_MAX_TID);
        let info = get_task(t).unwrap();
        assert_eq!(info.pid, Pid::KERNEL);
        assert_eq!(info.name, Some("k"));
        kernel_yield();
    }

    #[test]
    fn test_pid_allocation_and_exhaustion() {
        let _k = testing::boot_with(SchedConfig {
            max_pid: 3,
            ..SchedConfig::default()
        });
        let _guard = PreemptGuard::new();
        let a = with_sched(|s| s.create_new_pid()).unwrap();
        assert_eq!(a, Tid(1));
        // Reserve the ids by hand so nothing has to run
        with_sched(|s| {
            for tid in [Tid(1), Tid(2), Tid(3)] {
                let l = s.waits.new_list();
                s.add_task(Task::new(tid, Pid::KERNEL, l, None));
            }
        });
        assert_eq!(create_new_pid(), None);
        with_sched(|s| {
            s.remove_task(Tid(2));
        });
        assert_eq!(create_new_pid(), Some(Tid(2)));
        with_sched(|s| {
            for tid in [Tid(1), Tid(3)] {
                s.remove_task(tid);
            }
        });
    }

    #[test]
    fn test_lookup_missing() {
        let _k = testing::boot();
        assert!(get_task(Tid(4242)).is_none());
        assert!(get_process(Pid(4242)).is_none());
        assert!(with_task(Tid(4242), |t| t.tid).is_none());
    }

    #[test]
    fn test_iterate_in_tid_order() {
        let _k = testing::boot();
        let a = kthread_create("a", KthFlags::empty(), || {}).unwrap();
        let guard = PreemptGuard::new();
        let mut seen = Vec::new();
        iterate_over_tasks(|t| {
            seen.push(t.tid);
            0
        });
        assert_eq!(seen.first(), Some(&Tid::KERNEL_MAIN));
        assert!(seen.contains(&a));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        // Early stop returns the callback's value
        assert_eq!(iterate_over_tasks(|t| if t.tid == a { 7 } else { 0 }), 7);
        drop(guard);
        kernel_yield();
    }

    #[test]
    fn test_kthread_join() {
        let _k = testing::boot();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let t = kthread_create("worker", KthFlags::empty(), move || {
            crate::kern::timer::kernel_sleep(2);
            d.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        kthread_join(t, true).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        // Joining a thread that is gone returns at once
        kthread_join(t, true).unwrap();
    }

    #[test]
    fn test_kthread_join_all() {
        let _k = testing::boot();
        let done = Arc::new(AtomicUsize::new(0));
        let tids: Vec<Tid> = (0..3)
            .map(|_| {
                let d = done.clone();
                kthread_create("w", KthFlags::empty(), move || {
                    d.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        kthread_join_all(&tids, true).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_detached_kthread_is_freed_later() {
        let _k = testing::boot();
        let t = kthread_create("short", KthFlags::empty(), || {}).unwrap();
        kernel_yield();
        // Still a zombie right after it switched away, gone after the next pick
        kernel_yield();
        assert!(get_task(t).is_none());
    }

    #[test]
    fn test_exit_callbacks() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_exit(_tid: Tid) {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }
        fn other(_tid: Tid) {}

        let _k = testing::boot();
        CALLS.store(0, Ordering::SeqCst);
        let slot = register_on_task_exit_cb(on_exit).unwrap();
        assert_eq!(slot, 0);
        for expected in 1..crate::config::MAX_ON_EXIT_CBS {
            assert_eq!(register_on_task_exit_cb(other), Ok(expected));
        }
        assert_eq!(register_on_task_exit_cb(other), Err(KernError::NoSpace));

        let t = kthread_create("bye", KthFlags::empty(), || {}).unwrap();
        kthread_join(t, true).unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        unregister_on_task_exit_cb(slot).unwrap();
        assert_eq!(unregister_on_task_exit_cb(slot), Err(KernError::Invalid));
        let t = kthread_create("bye2", KthFlags::empty(), || {}).unwrap();
        kthread_join(t, true).unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        // The freed slot is reused
        assert_eq!(register_on_task_exit_cb(other), Ok(slot));
    }

    #[test]
    fn test_exit_callbacks_run_in_registration_order() {
        static ORDER: std::sync::Mutex<alloc::vec::Vec<u8>> = std::sync::Mutex::new(alloc::vec::Vec::new());
        fn first(_tid: Tid) {
            ORDER.lock().unwrap().push(1);
        }
        fn second(_tid: Tid) {
            ORDER.lock().unwrap().push(2);
        }
        fn third(_tid: Tid) {
            ORDER.lock().unwrap().push(3);
        }

        let _k = testing::boot();
        ORDER.lock().unwrap().clear();
        let a = register_on_task_exit_cb(first).unwrap();
        register_on_task_exit_cb(second).unwrap();
        unregister_on_task_exit_cb(a).unwrap();
        register_on_task_exit_cb(third).unwrap();
        // Slot 0 now holds the newest callback
        assert_eq!(register_on_task_exit_cb(first), Ok(2));

        let t = kthread_create("bye", KthFlags::empty(), || {}).unwrap();
        kthread_join(t, true).unwrap();
        assert_eq!(*ORDER.lock().unwrap(), [2, 3, 1]);
    }

    #[test]
    fn test_process_exit_and_wait_child() {
        let _k = testing::boot();
        let init = create_process(Pid::KERNEL, || {
            let child = create_process(crate::kern::sched::get_curr_pid(), || {
                task_exit(exit_status(3));
            })
            .unwrap();
            let (pid, status) = wait_child(-1, false).unwrap().unwrap();
            assert_eq!(pid, child);
            assert_eq!(status, exit_status(3));
            assert_eq!(wait_child(-1, true), Err(KernError::NoChild));
            task_exit(exit_status(0));
        })
        .unwrap();
        assert_eq!(init, Pid::INIT);

        let info = get_process(init).unwrap();
        assert_eq!((info.pgid, info.sid), (init, init));

        // The kernel process never waits: its zombie children go on their own
        testing::wait_until(|| get_process(init).is_none());
    }

    #[test]
    fn test_wait_child_nohang_and_selectors() {
        let _k = testing::boot();
        let parent = create_process(Pid::KERNEL, || {
            let me = crate::kern::sched::get_curr_pid();
            let a = create_process(me, || crate::kern::timer::kernel_sleep(5)).unwrap();
            assert_eq!(wait_child(a.0 + 100, true), Err(KernError::NoChild));
            assert_eq!(wait_child(a.0, true), Ok(None));
            assert_eq!(wait_child(0, false).unwrap().map(|(p, _)| p), Some(a));
            task_exit(0);
        })
        .unwrap();
        testing::wait_until(|| get_process(parent).is_none());
    }

    #[test]
    fn test_orphans_go_to_init() {
        let _k = testing::boot();
        let seen = Arc::new(AtomicUsize::new(0));
        let s2 = seen.clone();
        let init = create_process(Pid::KERNEL, move || {
            let me = crate::kern::sched::get_curr_pid();
            let middle = create_process(me, || {
                let me = crate::kern::sched::get_curr_pid();
                create_process(me, || task_exit(exit_status(9))).unwrap();
                task_exit(0);
            })
            .unwrap();
            // First the middle process, then the grandchild it orphaned
            let mut reaped = Vec::new();
            while let Ok(Some((pid, status))) = wait_child(-1, false) {
                reaped.push((pid, status));
            }
            assert_eq!(reaped.len(), 2);
            assert!(reaped.iter().any(|&(p, _)| p == middle));
            assert!(reaped.iter().any(|&(_, s)| s == exit_status(9)));
            s2.store(reaped.len(), Ordering::SeqCst);
            task_exit(0);
        })
        .unwrap();
        testing::wait_until(|| get_process(init).is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_process_groups() {
        let _k = testing::boot();
        let gate = Arc::new(crate::kern::sem::KSem::new(0, crate::kern::sem::KSEM_NO_MAX));
        let (g1, g2) = (gate.clone(), gate.clone());
        let a = create_process(Pid::KERNEL, move || {
            let _ = g1.wait(1, crate::kern::sem::KSEM_WAIT_FOREVER);
        })
        .unwrap();
        let b = create_process(a, move || {
            let _ = g2.wait(1, crate::kern::sem::KSEM_WAIT_FOREVER);
        })
        .unwrap();

        // b inherits a's group and session
        assert_eq!(sched_count_proc_in_group(a), 2);
        assert_eq!(sched_get_session_of_group(a), Some(a));

        set_process_group(b, Pid(0)).unwrap();
        assert_eq!(sched_count_proc_in_group(a), 1);
        assert_eq!(sched_count_proc_in_group(b), 1);
        assert_eq!(sched_get_session_of_group(b), Some(a));
        assert_eq!(set_process_group(b, Pid(999)), Err(KernError::Invalid));
        assert_eq!(sched_get_session_of_group(Pid(999)), None);

        gate.signal(2).unwrap();
        testing::wait_until(|| get_process(a).is_none() && get_process(b).is_none());
    }

    #[test]
    fn test_threads_of_a_process() {
        let _k = testing::boot();
        let pid = create_process(Pid::KERNEL, || {
            let me = crate::kern::sched::get_curr_pid();
            let t = create_thread(me, || {}).unwrap();
            assert_eq!(get_process(me).unwrap().nr_threads, 2);
            kthread_join(t, true).unwrap();
            task_exit(0);
        })
        .unwrap();
        assert_eq!(create_thread(Pid::KERNEL, || {}), Err(KernError::Invalid));
        testing::wait_until(|| get_process(pid).is_none());
    }
}
