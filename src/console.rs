use alloc::collections::VecDeque;
use alloc::string::String;
use lazy_static::lazy_static;
use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;

/// The kernel console. Output is accumulated in a buffer (so shutdown
/// reports and tests can inspect it) and forwarded to an optional raw
/// sink registered by the platform layer (serial, VGA).
pub struct Console {
    buffer: String,
    input: VecDeque<u8>,
    sink: Option<fn(&str)>,
}

impl Console {
    const fn new() -> Self {
        Console {
            buffer: String::new(),
            input: VecDeque::new(),
            sink: None,
        }
    }

    fn write(&mut self, s: &str) {
        self.buffer.push_str(s);
        if let Some(sink) = self.sink {
            sink(s);
        }
    }
}

lazy_static! {
    pub static ref CONSOLE: Mutex<Console> = Mutex::new(Console::new());
}

/// Register a raw output sink (e.g. the serial writer). Everything
/// printed from now on is forwarded to it as well as buffered.
pub fn set_sink(sink: fn(&str)) {
    CONSOLE.lock().sink = Some(sink);
}

/// Queue a byte of console input (fed by the keyboard layer).
pub fn push_input(byte: u8) {
    CONSOLE.lock().input.push_back(byte);
}

/// Pop one byte of console input, if any is pending.
pub fn getc() -> Option<u8> {
    CONSOLE.lock().input.pop_front()
}

/// Drain and return everything printed so far.
pub fn take_output() -> String {
    core::mem::take(&mut CONSOLE.lock().buffer)
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = CONSOLE.lock().write_fmt(args);
}

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write(s);
        Ok(())
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*));
        $crate::print!("\n");
    };
}

/// `log` backend that prints `[LEVEL] target: message` lines through
/// the console.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::println!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the console-backed logger. Safe to call more than once.
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Info);
}
