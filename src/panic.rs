//! Fatal assertions
//!
//! Contract violations (unlocking a mutex not held, sleeping with preemption
//! disabled twice, ...) leave scheduler state inconsistent, so they halt the
//! kernel instead of returning an error.

use core::fmt;

#[doc(hidden)]
#[cold]
#[track_caller]
pub fn assert_failed(cond: &str, file: &str, line: u32, msg: Option<fmt::Arguments<'_>>) -> ! {
    match msg {
        Some(msg) => {
            log::error!("ASSERTION '{}' FAILED in {}:{}: {}", cond, file, line, msg);
            panic!("ASSERTION '{}' FAILED in {}:{}: {}", cond, file, line, msg)
        }
        None => {
            log::error!("ASSERTION '{}' FAILED in {}:{}", cond, file, line);
            panic!("ASSERTION '{}' FAILED in {}:{}", cond, file, line)
        }
    }
}

#[doc(hidden)]
#[cold]
#[track_caller]
pub fn fatal(file: &str, line: u32, msg: fmt::Arguments<'_>) -> ! {
    log::error!("KERNEL PANIC in {}:{}: {}", file, line, msg);
    panic!("KERNEL PANIC in {}:{}: {}", file, line, msg)
}

/// Halt the kernel if `cond` does not hold
#[macro_export]
macro_rules! kassert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::panic::assert_failed(stringify!($cond), file!(), line!(), None)
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::panic::assert_failed(
                stringify!($cond),
                file!(),
                line!(),
                Some(format_args!($($arg)+)),
            )
        }
    };
}

/// Like [`kassert!`], compiled in only with the `debug-checks` feature
#[macro_export]
macro_rules! debug_kassert {
    ($($arg:tt)+) => {
        if cfg!(feature = "debug-checks") {
            $crate::kassert!($($arg)+);
        }
    };
}

/// Unconditional kernel panic
#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)+) => {
        $crate::panic::fatal(file!(), line!(), format_args!($($arg)+))
    };
}
