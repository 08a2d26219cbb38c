//! Kern subsystem - Scheduler and synchronization core
//!
//! Contains the scheduler, the task registry, the wait/wake machinery and
//! the blocking primitives built on it.

pub(crate) mod arena;
pub mod cond;
pub mod copyio;
pub mod fault;
pub mod mobj;
pub mod mutex;
pub mod preempt;
pub mod ready;
pub mod registry;
pub mod sched;
pub mod sem;
pub mod signal;
pub mod task;
pub mod timer;
pub mod wait;

pub use cond::{kcond_signal_all, kcond_signal_one, kcond_wait, KCond, KCOND_WAIT_FOREVER};
pub use copyio::{copy_from_user, copy_str_from_user, copy_to_user};
pub use fault::{
    fault_resumable_call, handle_cpu_fault, in_fault_resumable_code, is_fault_resumable,
    ResumedFault,
};
pub use mobj::{
    allocate_mobj_waiter, free_mobj_waiter, mobj_waiter_reset, mobj_waiter_set,
    prepare_to_wait_on_multi_obj, MultiObjWaiter,
};
pub use mutex::{
    kmutex_is_curr_task_holding_lock, kmutex_lock, kmutex_trylock, kmutex_unlock, KMutex,
    KMutexFlags,
};
pub use preempt::{
    disable_preemption, enable_preemption, enable_preemption_nosched, get_preempt_disable_count,
    is_preemption_enabled, PreemptGuard,
};
pub use ready::{poll_ready, PollEvents, PollItem, ReadyObject};
pub use registry::{
    create_process, create_thread, get_process, get_task, kthread_create, kthread_exit,
    kthread_join, kthread_join_all, task_exit, wait_child,
};
pub use sched::{
    get_curr_pid, get_curr_tid, init_sched, kernel_yield, kernel_yield_preempt_disabled,
    schedule, schedule_preempt_disabled,
};
pub use sem::{ksem_signal, ksem_wait, KSem, KSEM_NO_MAX, KSEM_NO_WAIT, KSEM_WAIT_FOREVER};
pub use signal::send_signal;
pub use task::{KthFlags, ProcessInfo, TaskFlags, TaskInfo, TaskState};
pub use timer::{get_ticks, kernel_sleep, timer_irq_handler};
pub use wait::{WaitList, WaitObjType, WaitOn, WaitResult, Waitable};
