//! Tasks and processes
//!
//! Plain data owned by the registry inside the scheduler state. Everything
//! here is mutated only with the scheduler lock held.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU8, Ordering};

use super::wait::{ListKey, WaitObj, WaitObjType};
use crate::error::{KResult, KernError};
use crate::types::{Pid, Tid};

// ============================================================================
// Task State
// ============================================================================

/// Scheduling state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Never scheduled yet, or being torn down
    Invalid = 0,
    Runnable = 1,
    Running = 2,
    Sleeping = 3,
    Zombie = 4,
}

impl TaskState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskState::Runnable,
            2 => TaskState::Running,
            3 => TaskState::Sleeping,
            4 => TaskState::Zombie,
            _ => TaskState::Invalid,
        }
    }
}

/// Task state readable without the scheduler lock
#[derive(Debug)]
pub struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub const fn new(state: TaskState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

bitflags! {
    /// Per-task flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskFlags: u32 {
        const MAIN_THREAD = 1 << 0;
        /// Executing kernel code (drives kernel-tick accounting)
        const IN_KERNEL = 1 << 1;
        const STOPPED = 1 << 2;
        const WAS_STOPPED = 1 << 3;
        const TRACED = 1 << 4;
        const VFORK_STOPPED = 1 << 5;
    }
}

bitflags! {
    /// Kernel thread creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KthFlags: u32 {
        /// Give the thread its own I/O buffers
        const ALLOC_BUFS = 1 << 0;
        /// Thread serves a worker queue
        const WORKER_THREAD = 1 << 1;
    }
}

/// Scheduling counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedTicks {
    /// Ticks since the task was last picked
    pub timeslice: u32,
    pub total: u64,
    pub total_kernel: u64,
    /// Fairness accumulator: lowest runs first
    pub vruntime: u64,
}

/// Kernel stack of a task
pub struct KernelStack {
    mem: Box<[u8]>,
}

impl KernelStack {
    pub fn alloc(size: usize) -> KResult<Self> {
        let mut mem = Vec::new();
        mem.try_reserve_exact(size).map_err(|_| KernError::NoMemory)?;
        mem.resize(size, 0u8);
        Ok(Self {
            mem: mem.into_boxed_slice(),
        })
    }

    /// Initial stack pointer (stacks grow down)
    pub fn top(&self) -> usize {
        self.mem.as_ptr() as usize + self.mem.len()
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }
}

// ============================================================================
// Task
// ============================================================================

pub struct Task {
    pub tid: Tid,
    pub pid: Pid,
    pub(crate) state: AtomicTaskState,
    pub(crate) wobj: WaitObj,
    pub ticks: SchedTicks,
    pub flags: TaskFlags,
    pub kthread_flags: KthFlags,
    pub name: Option<&'static str>,
    /// The wake-up timer expired since it was last armed
    pub(crate) timer_ready: bool,
    pub(crate) ticks_before_wake_up: u32,
    /// Tasks waiting for this one to exit
    pub(crate) waiters: ListKey,
    pub wstatus: i32,
    pub sig_pending: u64,
    pub sig_blocked: u64,
    pub(crate) fault_resume_mask: u32,
    _stack: Option<KernelStack>,
}

impl Task {
    pub(crate) fn new(tid: Tid, pid: Pid, waiters: ListKey, stack: Option<KernelStack>) -> Self {
        Self {
            tid,
            pid,
            state: AtomicTaskState::new(TaskState::Invalid),
            wobj: WaitObj::default(),
            ticks: SchedTicks::default(),
            flags: TaskFlags::IN_KERNEL,
            kthread_flags: KthFlags::empty(),
            name: None,
            timer_ready: false,
            ticks_before_wake_up: 0,
            waiters,
            wstatus: 0,
            sig_pending: 0,
            sig_blocked: 0,
            fault_resume_mask: 0,
            _stack: stack,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    pub fn wobj(&self) -> &WaitObj {
        &self.wobj
    }

    pub fn is_main_thread(&self) -> bool {
        self.flags.contains(TaskFlags::MAIN_THREAD)
    }

    pub fn is_kernel_thread(&self) -> bool {
        self.pid == Pid::KERNEL
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.contains(TaskFlags::STOPPED)
    }

    pub fn running_in_kernel(&self) -> bool {
        self.flags.contains(TaskFlags::IN_KERNEL)
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            tid: self.tid,
            pid: self.pid,
            state: self.state(),
            flags: self.flags,
            ticks: self.ticks,
            wait: self.wobj.on.wait_type(),
            name: self.name,
        }
    }
}

/// Snapshot of a task, as handed out by lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub tid: Tid,
    pub pid: Pid,
    pub state: TaskState,
    pub flags: TaskFlags,
    pub ticks: SchedTicks,
    pub wait: WaitObjType,
    pub name: Option<&'static str>,
}

// ============================================================================
// Process
// ============================================================================

pub struct Process {
    pub pid: Pid,
    pub parent_pid: Pid,
    pub pgid: Pid,
    pub sid: Pid,
    /// Main thread first
    pub threads: Vec<Tid>,
    /// Child processes, oldest first
    pub children: Vec<Pid>,
}

impl Process {
    pub(crate) fn new(pid: Pid, parent_pid: Pid, pgid: Pid, sid: Pid) -> Self {
        Self {
            pid,
            parent_pid,
            pgid,
            sid,
            threads: vec![pid.main_tid()],
            children: Vec::new(),
        }
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            parent_pid: self.parent_pid,
            pgid: self.pgid,
            sid: self.sid,
            nr_threads: self.threads.len(),
            nr_children: self.children.len(),
        }
    }
}

/// Snapshot of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub parent_pid: Pid,
    pub pgid: Pid,
    pub sid: Pid,
    pub nr_threads: usize,
    pub nr_children: usize,
}
