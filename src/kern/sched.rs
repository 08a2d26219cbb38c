//! Scheduler core
//!
//! One scheduler context per kernel, created by [`init_sched`] and reached
//! through [`with_sched`] from task and interrupt context alike. It owns the
//! task and process tables, the run queue and every wait list.
//!
//! Picking: the runnable task with the lowest vruntime wins, ties going to
//! the one enqueued first. The idle task runs only when nothing else can.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};
use spin::Mutex;

use super::preempt::{
    disable_preemption, enable_preemption_nosched, get_preempt_disable_count,
    sched_clear_need_resched, sched_set_need_resched, PreemptGuard,
};
use super::registry::ExitCallback;
use super::task::{Process, Task, TaskFlags, TaskState};
use super::timer::in_irq;
use super::wait::WaitTables;
use crate::arch::{self, Arch, IrqGuard};
use crate::config::{SchedConfig, MAX_ON_EXIT_CBS};
use crate::types::{Pid, Tid};

// ============================================================================
// Run Queue
// ============================================================================

/// RUNNABLE tasks in enqueue order
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    queue: VecDeque<Tid>,
}

impl RunQueue {
    pub(crate) fn push_back(&mut self, tid: Tid) {
        crate::debug_kassert!(!self.queue.contains(&tid), "task {} queued twice", tid);
        self.queue.push_back(tid);
    }

    pub(crate) fn remove(&mut self, tid: Tid) -> bool {
        match self.queue.iter().position(|&t| t == tid) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Tid> {
        self.queue.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

// ============================================================================
// Scheduler State
// ============================================================================

pub(crate) struct SchedState {
    pub(crate) cfg: SchedConfig,
    pub(crate) tasks: BTreeMap<Tid, Task>,
    pub(crate) procs: BTreeMap<Pid, Process>,
    pub(crate) runq: RunQueue,
    pub(crate) waits: WaitTables,
    /// Tasks with an armed wake-up timer
    pub(crate) timers: Vec<Tid>,
    pub(crate) current: Tid,
    pub(crate) idle: Option<Tid>,
    /// Zombies nobody will reap, destroyed on a later schedule
    pub(crate) detached_zombies: Vec<Tid>,
    /// Exit callbacks tagged with their registration sequence number
    pub(crate) exit_cbs: heapless::Vec<Option<(u64, ExitCallback)>, MAX_ON_EXIT_CBS>,
    pub(crate) exit_cb_seq: u64,
    pub(crate) last_pid: i32,
    pub(crate) last_kernel_tid: i32,
}

/// Result of a pick that requires a context switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Switch {
    pub(crate) from: Tid,
    pub(crate) to: Tid,
    pub(crate) from_alive: bool,
}

impl SchedState {
    fn new(cfg: SchedConfig) -> Self {
        let mut s = Self {
            cfg,
            tasks: BTreeMap::new(),
            procs: BTreeMap::new(),
            runq: RunQueue::default(),
            waits: WaitTables::new(),
            timers: Vec::new(),
            current: Tid::KERNEL_MAIN,
            idle: None,
            detached_zombies: Vec::new(),
            exit_cbs: heapless::Vec::new(),
            exit_cb_seq: 0,
            last_pid: 0,
            last_kernel_tid: -1,
        };

        // The boot context becomes the main task of the kernel process
        let kernel = Process::new(Pid::KERNEL, Pid::KERNEL, Pid::KERNEL, Pid::KERNEL);
        s.procs.insert(Pid::KERNEL, kernel);
        let waiters = s.waits.new_list();
        let mut main = Task::new(Tid::KERNEL_MAIN, Pid::KERNEL, waiters, None);
        main.flags |= TaskFlags::MAIN_THREAD;
        main.name = Some("kernel");
        main.state.store(TaskState::Running);
        s.tasks.insert(Tid::KERNEL_MAIN, main);
        s
    }

    pub(crate) fn task(&self, tid: Tid) -> &Task {
        match self.tasks.get(&tid) {
            Some(t) => t,
            None => crate::kpanic!("no task {}", tid),
        }
    }

    pub(crate) fn task_mut(&mut self, tid: Tid) -> &mut Task {
        match self.tasks.get_mut(&tid) {
            Some(t) => t,
            None => crate::kpanic!("no task {}", tid),
        }
    }

    /// The one place a task changes state. Keeps the run queue holding
    /// exactly the RUNNABLE tasks.
    pub(crate) fn task_change_state(&mut self, tid: Tid, new: TaskState) {
        let old = self.task(tid).state();
        crate::kassert!(old != new, "task {} already {:?}", tid, new);
        crate::kassert!(old != TaskState::Zombie, "zombie task {} changing state", tid);

        if old == TaskState::Runnable {
            self.runq.remove(tid);
        }
        self.task(tid).state.store(new);
        if new == TaskState::Runnable {
            self.runq.push_back(tid);
        }
    }

    pub(crate) fn task_change_state_idempotent(&mut self, tid: Tid, new: TaskState) {
        if self.task(tid).state() != new {
            self.task_change_state(tid, new);
        }
    }

    /// Starting vruntime for a new task: never behind the pack, never ahead
    pub(crate) fn min_vruntime(&self) -> u64 {
        self.runq
            .iter()
            .chain(core::iter::once(&self.current))
            .filter(|&&t| Some(t) != self.idle)
            .filter_map(|t| self.tasks.get(t))
            .map(|t| t.ticks.vruntime)
            .min()
            .unwrap_or(0)
    }

    pub(crate) fn account_ticks(&mut self) {
        let slice = self.cfg.time_slice_ticks();
        let curr = self.current;
        let t = self.task_mut(curr);
        t.ticks.timeslice += 1;
        t.ticks.total += 1;
        if t.running_in_kernel() {
            t.ticks.total_kernel += 1;
        }
        if t.ticks.timeslice >= slice {
            sched_set_need_resched();
        }
    }

    fn select_runnable(&self) -> Option<Tid> {
        let mut selected: Option<(Tid, u64)> = None;
        for &tid in self.runq.iter() {
            if tid == self.current || Some(tid) == self.idle {
                continue;
            }
            let Some(t) = self.tasks.get(&tid) else {
                continue;
            };
            if t.is_stopped() {
                continue;
            }
            // Strict less-than keeps the oldest of equals
            if selected.map_or(true, |(_, v)| t.ticks.vruntime < v) {
                selected = Some((tid, t.ticks.vruntime));
            }
        }
        selected.map(|(tid, _)| tid)
    }

    /// Choose the next task and do all the bookkeeping of the switch.
    /// Returns None when the current task keeps the CPU.
    pub(crate) fn pick_next(&mut self) -> Option<Switch> {
        sched_clear_need_resched();
        self.reap_detached_zombies();

        let curr = self.current;
        let curr_state = self.task(curr).state();
        let curr_can_run = matches!(curr_state, TaskState::Running | TaskState::Runnable)
            && !self.task(curr).is_stopped();

        let next = match self.select_runnable() {
            Some(tid) => tid,
            None if curr_can_run => curr,
            None => match self.idle {
                Some(idle) => idle,
                None => crate::kpanic!("no runnable task and no idle task"),
            },
        };

        if next == curr {
            self.task_change_state_idempotent(curr, TaskState::Running);
            return None;
        }

        if curr_state == TaskState::Running {
            self.task_change_state(curr, TaskState::Runnable);
        }
        if Some(curr) != self.idle {
            let t = self.task_mut(curr);
            t.ticks.vruntime += u64::from(t.ticks.timeslice);
        }

        self.task_mut(next).ticks.timeslice = 0;
        self.task_change_state(next, TaskState::Running);
        self.current = next;
        CURRENT_TID.store(next.0, Ordering::SeqCst);

        Some(Switch {
            from: curr,
            to: next,
            from_alive: curr_state != TaskState::Zombie,
        })
    }

    /// Destroy zombies nobody will reap. Never the current task: its stack
    /// is still in use.
    fn reap_detached_zombies(&mut self) {
        if self.detached_zombies.is_empty() {
            return;
        }
        let curr = self.current;
        let pending = core::mem::take(&mut self.detached_zombies);
        for tid in pending {
            if tid == curr {
                self.detached_zombies.push(tid);
                continue;
            }
            let main_of = self
                .tasks
                .get(&tid)
                .filter(|t| t.is_main_thread() && t.pid != Pid::KERNEL)
                .map(|t| t.pid);
            match main_of {
                Some(pid) if self.procs.get(&pid).is_some_and(|p| p.threads.contains(&curr)) => {
                    self.detached_zombies.push(tid);
                }
                Some(pid) => {
                    self.destroy_process(pid);
                }
                None => self.destroy_task(tid),
            }
        }
    }
}

static SCHED: Mutex<Option<SchedState>> = Mutex::new(None);
static CURRENT_TID: AtomicI32 = AtomicI32::new(0);

/// Run `f` on the scheduler state with interrupts disabled
pub(crate) fn with_sched<R>(f: impl FnOnce(&mut SchedState) -> R) -> R {
    let _irq = IrqGuard::new();
    let mut guard = SCHED.lock();
    match guard.as_mut() {
        Some(s) => f(s),
        None => crate::kpanic!("scheduler not initialized"),
    }
}

/// Like [`with_sched`], but gives up instead of spinning (drop paths,
/// fault context)
pub(crate) fn try_with_sched<R>(f: impl FnOnce(&mut SchedState) -> R) -> Option<R> {
    let _irq = arch::try_arch().map(|_| IrqGuard::new());
    let mut guard = SCHED.try_lock()?;
    guard.as_mut().map(f)
}

// ============================================================================
// Initialization
// ============================================================================

/// Boot the scheduler on `arch`. The calling context becomes the main task
/// of the kernel process (tid 0). Calling it again starts from scratch.
pub fn init_sched(arch: &'static dyn Arch, cfg: SchedConfig) {
    crate::kassert!(cfg.is_valid(), "bad scheduler config {:?}", cfg);

    arch::install(arch);
    crate::console::init();
    super::preempt::reset();
    super::timer::reset();

    {
        let _irq = IrqGuard::new();
        *SCHED.lock() = Some(SchedState::new(cfg));
    }
    CURRENT_TID.store(Tid::KERNEL_MAIN.0, Ordering::SeqCst);
    arch.adopt_boot_context(Tid::KERNEL_MAIN);
    arch.set_timer_handler(super::timer::timer_irq_handler);

    match super::registry::create_idle_task() {
        Ok(tid) => log::info!("scheduler up, idle task {}", tid),
        Err(e) => crate::kpanic!("cannot create the idle task: {}", e),
    }
}

pub fn sched_config() -> SchedConfig {
    with_sched(|s| s.cfg)
}

// ============================================================================
// Current Task
// ============================================================================

pub fn get_curr_tid() -> Tid {
    Tid(CURRENT_TID.load(Ordering::SeqCst))
}

pub fn get_curr_pid() -> Pid {
    let curr = get_curr_tid();
    with_sched(|s| s.task(curr).pid)
}

pub fn set_current_task_in_kernel() {
    let curr = get_curr_tid();
    with_sched(|s| s.task_mut(curr).flags.insert(TaskFlags::IN_KERNEL));
}

pub fn set_current_task_in_user_mode() {
    let curr = get_curr_tid();
    with_sched(|s| s.task_mut(curr).flags.remove(TaskFlags::IN_KERNEL));
}

pub fn in_currently_dying_task() -> bool {
    let curr = get_curr_tid();
    with_sched(|s| s.task(curr).state() == TaskState::Zombie)
}

pub fn task_change_state(tid: Tid, state: TaskState) {
    with_sched(|s| s.task_change_state(tid, state));
}

pub fn task_change_state_idempotent(tid: Tid, state: TaskState) {
    with_sched(|s| s.task_change_state_idempotent(tid, state));
}

/// Number of RUNNABLE tasks, idle included
pub fn runqueue_len() -> usize {
    with_sched(|s| s.runq.len())
}

pub fn sched_account_ticks() {
    with_sched(|s| s.account_ticks());
}

// ============================================================================
// Scheduling
// ============================================================================

fn do_schedule() -> bool {
    let arch = arch::arch();
    // Interrupts stay off from the bookkeeping until the target runs
    let were_enabled = arch.disable_interrupts();

    let Some(sw) = with_sched(|s| s.pick_next()) else {
        arch.restore_interrupts(were_enabled);
        return false;
    };

    log::trace!("switch {} -> {}", sw.from, sw.to);
    enable_preemption_nosched();

    if sw.from_alive {
        arch.switch(sw.from, sw.to);
        arch.restore_interrupts(were_enabled);
        true
    } else {
        arch.switch_and_discard(sw.from, sw.to)
    }
}

/// Save the caller's state and run the picker. Returns whether another
/// task ran in between. Preemption is enabled on return either way.
pub fn save_regs_and_schedule(skip_disable_preempt: bool) -> bool {
    if !skip_disable_preempt {
        disable_preemption();
    }

    let count = get_preempt_disable_count();
    crate::kassert!(count == 1, "schedule with preemption disabled {} times", count);
    crate::kassert!(!in_irq(), "schedule from interrupt context");

    let switched = do_schedule();
    if !switched {
        enable_preemption_nosched();
    }
    switched
}

/// Run the picker now
pub fn schedule() -> bool {
    save_regs_and_schedule(false)
}

/// [`schedule`] for a caller holding the single preemption-disable level
pub fn schedule_preempt_disabled(guard: PreemptGuard) -> bool {
    guard.into_handoff();
    save_regs_and_schedule(true)
}

/// Give the CPU to another runnable task, if any
pub fn kernel_yield() -> bool {
    sched_set_need_resched();
    save_regs_and_schedule(false)
}

/// [`kernel_yield`] for a caller that disabled preemption once. Returns
/// with preemption enabled.
pub fn kernel_yield_preempt_disabled(guard: PreemptGuard) -> bool {
    guard.into_handoff();
    sched_set_need_resched();
    save_regs_and_schedule(true)
}

/// Second half of the sleep protocol: the caller already went through
/// `prepare_to_wait_on` under `guard`. Returns once woken, with
/// preemption enabled.
pub fn enter_sleep_wait_state(guard: PreemptGuard) {
    let curr = get_curr_tid();
    with_sched(|s| {
        let t = s.task(curr);
        let sleeping = t.state() == TaskState::Sleeping && !t.wobj.on.is_none();
        crate::kassert!(
            sleeping || t.timer_ready,
            "task {} sleeping without a wait object (state {:?})",
            curr,
            t.state()
        );
    });
    schedule_preempt_disabled(guard);
}
