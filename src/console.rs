//! Console output for ksched
//!
//! The console is the sink of the `log` facade. Bytes go to the installed
//! architecture backend; in test builds the tail of the output is also kept
//! in a small buffer so tests can look at it.

use core::fmt::{self, Write};
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Console writer interface
pub struct Console {
    #[cfg(test)]
    buffer: heapless::String<1024>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            if byte.is_ascii() && self.buffer.push(byte as char).is_err() {
                self.buffer.clear();
                let _ = self.buffer.push(byte as char);
            }
        }

        if let Some(arch) = crate::arch::try_arch() {
            arch.console_write(&[byte]);
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                // Serial consoles want CRLF
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }

    /// Clear the console
    pub fn clear(&mut self) {
        #[cfg(test)]
        self.buffer.clear();
    }

    #[cfg(test)]
    pub(crate) fn contents(&self) -> &str {
        &self.buffer
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Never spin on the console from inside a log call: a fatal
        // assertion may fire while a message is half written.
        if let Some(mut console) = CONSOLE.try_lock() {
            let _ = writeln!(console, "[{:5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

const fn max_level() -> Level {
    if cfg!(feature = "debug-checks") {
        Level::Debug
    } else {
        Level::Info
    }
}

/// Initialize the console subsystem and install it as the logger
pub fn init() {
    CONSOLE.lock().clear();
    // A second boot (tests) finds the logger already installed.
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments<'_>) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}
