//! Scheduler configuration
//!
//! Compile-time limits plus the small runtime [`SchedConfig`] handed to
//! [`crate::kern::sched::init_sched`].

/// Timer interrupt frequency
pub const TIMER_HZ: u32 = 100;

/// First tid handed to kernel threads
pub const KERNEL_TID_START: i32 = 10000;

/// Width of the kernel thread id window above [`KERNEL_TID_START`]
pub const KERNEL_MAX_TID: i32 = 1024;

/// Highest pid/tid for user tasks
pub const MAX_PID: i32 = 8191;

const _: () = assert!(MAX_PID < KERNEL_TID_START);

/// Kernel stack size per task
pub const KERNEL_STACK_SIZE: usize = 2 * 4096;

/// Capacity of the task exit callback table
pub const MAX_ON_EXIT_CBS: usize = 4;

/// Runtime scheduler configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Timer interrupt frequency
    pub timer_hz: u32,
    /// Highest user pid; lowering it is handy to exercise pid exhaustion
    pub max_pid: i32,
    /// Bytes of kernel stack allocated for every new task
    pub kernel_stack_size: usize,
}

impl SchedConfig {
    /// Ticks a task may run before it becomes preemption-eligible
    pub const fn time_slice_ticks(&self) -> u32 {
        self.timer_hz / 25
    }

    /// Check the configuration is usable
    pub fn is_valid(&self) -> bool {
        self.timer_hz >= 25
            && self.max_pid > 0
            && self.max_pid < KERNEL_TID_START
            && self.kernel_stack_size > 0
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            timer_hz: TIMER_HZ,
            max_pid: MAX_PID,
            kernel_stack_size: KERNEL_STACK_SIZE,
        }
    }
}
