//! Fault-resumable calls
//!
//! Kernel code that touches memory it cannot vouch for (user pointers)
//! runs it through [`fault_resumable_call`]. While the call is active the
//! task advertises which CPU faults it can recover from; the fault handler
//! checks that mask first and, on a match, abandons the faulting code and
//! resumes at the call boundary with an error.

use core::mem;

use super::preempt::{get_preempt_disable_count, restore_preempt_disable_count};
use super::sched::{get_curr_tid, try_with_sched, with_sched};
use crate::arch;

pub const FAULT_DIVISION_BY_ZERO: u32 = 0;
pub const FAULT_DEBUG: u32 = 1;
pub const FAULT_NMI: u32 = 2;
pub const FAULT_BREAKPOINT: u32 = 3;
pub const FAULT_INTO_OVERFLOW: u32 = 4;
pub const FAULT_OUT_OF_BOUNDS: u32 = 5;
pub const FAULT_INVALID_OPCODE: u32 = 6;
pub const FAULT_NO_COPROC: u32 = 7;
pub const FAULT_DOUBLE_FAULT: u32 = 8;
pub const FAULT_INVALID_TSS: u32 = 10;
pub const FAULT_SEG_NOT_PRESENT: u32 = 11;
pub const FAULT_STACK_FAULT: u32 = 12;
pub const FAULT_GENERAL_PROTECTION: u32 = 13;
pub const FAULT_PAGE_FAULT: u32 = 14;
pub const FAULT_FPU_ERROR: u32 = 16;
pub const FAULT_ALIGNMENT_CHECK: u32 = 17;
pub const FAULT_MACHINE_CHECK: u32 = 18;
pub const FAULT_SIMD: u32 = 19;

/// Number of CPU exception vectors
pub const FAULTS_COUNT: u32 = 32;

pub const fn fault_mask(fault: u32) -> u32 {
    1 << fault
}

pub const PAGE_FAULT_MASK: u32 = fault_mask(FAULT_PAGE_FAULT);
pub const GPF_MASK: u32 = fault_mask(FAULT_GENERAL_PROTECTION);
pub const ALL_FAULTS_MASK: u32 = u32::MAX;

pub fn fault_name(fault: u32) -> &'static str {
    match fault {
        FAULT_DIVISION_BY_ZERO => "Division by zero",
        FAULT_DEBUG => "Debug",
        FAULT_NMI => "Non-maskable interrupt",
        FAULT_BREAKPOINT => "Breakpoint",
        FAULT_INTO_OVERFLOW => "Overflow",
        FAULT_OUT_OF_BOUNDS => "Out of bounds",
        FAULT_INVALID_OPCODE => "Invalid opcode",
        FAULT_NO_COPROC => "No coprocessor",
        FAULT_DOUBLE_FAULT => "Double fault",
        FAULT_INVALID_TSS => "Invalid TSS",
        FAULT_SEG_NOT_PRESENT => "Segment not present",
        FAULT_STACK_FAULT => "Stack fault",
        FAULT_GENERAL_PROTECTION => "General protection fault",
        FAULT_PAGE_FAULT => "Page fault",
        FAULT_FPU_ERROR => "x87 floating point error",
        FAULT_ALIGNMENT_CHECK => "Alignment check",
        FAULT_MACHINE_CHECK => "Machine check",
        FAULT_SIMD => "SIMD floating point error",
        _ => "Reserved",
    }
}

/// A fault that was recovered from inside [`fault_resumable_call`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("resumed after fault {fault}")]
pub struct ResumedFault {
    pub fault: u32,
}

impl ResumedFault {
    /// The fault as a bit of a fault mask
    pub const fn mask(&self) -> u32 {
        fault_mask(self.fault)
    }
}

/// Run `f`, recovering from the CPU faults in `faults_mask`. A recovered
/// fault abandons `f` midway and is returned as the error.
pub fn fault_resumable_call<R>(faults_mask: u32, f: impl FnOnce() -> R) -> Result<R, ResumedFault> {
    let curr = get_curr_tid();
    let arch = arch::arch();
    let saved_mask = with_sched(|s| mem::replace(&mut s.task_mut(curr).fault_resume_mask, faults_mask));
    let saved_count = get_preempt_disable_count();
    let irqs_were_on = arch.are_interrupts_enabled();

    let mut f = Some(f);
    let mut out = None;
    let fault = arch.call_with_fault_recovery(&mut || {
        if let Some(f) = f.take() {
            out = Some(f());
        }
    });

    with_sched(|s| s.task_mut(curr).fault_resume_mask = saved_mask);

    match (fault, out) {
        (None, Some(r)) => Ok(r),
        (None, None) => crate::kpanic!("fault-resumable call returned without running"),
        (Some(fault), _) => {
            // The abandoned code may have left preemption or interrupts off
            restore_preempt_disable_count(saved_count);
            if irqs_were_on {
                arch.enable_interrupts();
            }
            log::debug!("task {} resumed after fault {} ({})", curr, fault, fault_name(fault));
            Err(ResumedFault { fault })
        }
    }
}

fn curr_fault_mask() -> u32 {
    let curr = get_curr_tid();
    try_with_sched(|s| s.tasks.get(&curr).map_or(0, |t| t.fault_resume_mask)).unwrap_or(0)
}

/// Is the current task inside a [`fault_resumable_call`]?
pub fn in_fault_resumable_code() -> bool {
    curr_fault_mask() != 0
}

/// Would `fault` be recovered from right now?
pub fn is_fault_resumable(fault: u32) -> bool {
    fault < FAULTS_COUNT && curr_fault_mask() & fault_mask(fault) != 0
}

/// Abandon the faulting code and resume at its [`fault_resumable_call`]
pub fn handle_resumable_fault(fault: u32) -> ! {
    crate::kassert!(is_fault_resumable(fault));
    arch::arch().resume_from_fault(fault)
}

/// CPU exception entry point
pub fn handle_cpu_fault(fault: u32) {
    if is_fault_resumable(fault) {
        handle_resumable_fault(fault);
    }
    crate::kpanic!(
        "unhandled CPU fault {} ({}) in task {}",
        fault,
        fault_name(fault),
        get_curr_tid()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::raise_fault;
    use crate::kern::preempt::{disable_preemption, is_preemption_enabled};
    use crate::testing;

    #[test]
    fn test_no_fault_returns_value() {
        let _k = testing::boot();
        assert!(!in_fault_resumable_code());
        let r = fault_resumable_call(PAGE_FAULT_MASK, || {
            assert!(in_fault_resumable_code());
            assert!(is_fault_resumable(FAULT_PAGE_FAULT));
            assert!(!is_fault_resumable(FAULT_GENERAL_PROTECTION));
            40 + 2
        });
        assert_eq!(r, Ok(42));
        assert!(!in_fault_resumable_code());
    }

    #[test]
    fn test_masked_fault_resumes() {
        let _k = testing::boot();
        let mut reached_end = false;
        let r = fault_resumable_call(PAGE_FAULT_MASK | GPF_MASK, || {
            raise_fault(FAULT_GENERAL_PROTECTION);
            reached_end = true;
        });
        assert_eq!(r, Err(ResumedFault { fault: FAULT_GENERAL_PROTECTION }));
        assert_eq!(r.unwrap_err().mask(), GPF_MASK);
        assert!(!reached_end);
        assert!(!in_fault_resumable_code());
    }

    #[test]
    fn test_nested_calls_restore_mask() {
        let _k = testing::boot();
        let outer = fault_resumable_call(PAGE_FAULT_MASK, || {
            let inner = fault_resumable_call(GPF_MASK, || raise_fault(FAULT_GENERAL_PROTECTION));
            assert!(inner.is_err());
            // Back to the outer mask
            assert!(is_fault_resumable(FAULT_PAGE_FAULT));
            raise_fault(FAULT_PAGE_FAULT);
        });
        assert_eq!(outer.map_err(|e| e.fault), Err(FAULT_PAGE_FAULT));
    }

    #[test]
    fn test_preemption_count_restored() {
        let _k = testing::boot();
        let r = fault_resumable_call(PAGE_FAULT_MASK, || {
            disable_preemption();
            raise_fault(FAULT_PAGE_FAULT);
        });
        assert!(r.is_err());
        assert!(is_preemption_enabled());
    }

    #[test]
    #[should_panic(expected = "unhandled CPU fault 13")]
    fn test_unmasked_fault_panics() {
        let _k = testing::boot();
        let _ = fault_resumable_call(PAGE_FAULT_MASK, || raise_fault(FAULT_GENERAL_PROTECTION));
    }

    #[test]
    fn test_fault_names() {
        assert_eq!(fault_name(FAULT_PAGE_FAULT), "Page fault");
        assert_eq!(fault_name(9), "Reserved");
    }
}
