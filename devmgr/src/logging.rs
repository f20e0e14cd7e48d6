//! Colored log output through a board-supplied text sink.
use core::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError, set_logger, set_max_level};
use spin::Once;

/// Where formatted log lines go, usually a polled console UART.
pub trait LogSink: Sync {
    fn write_fmt(&self, args: fmt::Arguments<'_>);
}

static SINK: Once<&'static dyn LogSink> = Once::new();

pub struct Logger;

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        SINK.is_completed()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 37,  // White
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };
        if let Some(sink) = SINK.get() {
            sink.write_fmt(format_args!(
                "\u{1B}[{}m[{:}] {}\u{1B}[0m\n",
                color,
                record.level(),
                record.args(),
            ));
        }
    }

    fn flush(&self) {}
}

/// Route the `log` facade to `sink`.
pub fn init(sink: &'static dyn LogSink, level: LevelFilter) -> Result<(), SetLoggerError> {
    static LOGGER: Logger = Logger;
    SINK.call_once(|| sink);
    set_logger(&LOGGER)?;
    set_max_level(level);
    Ok(())
}

/// Improved debug macro,
/// only compiled in debug mode.
#[macro_export]
macro_rules! debug_ex {
    // debug_ex!(target: "my_target", "a {} event", "log")
    (target: $target:expr, $($arg:tt)+) => {
        #[cfg(debug_assertions)]
        {
            ::log::log!(target: $target, ::log::Level::Debug, $($arg)+)
        }
    };

    // debug_ex!("a {} event", "log")
    ($($arg:tt)+) => {
        #[cfg(debug_assertions)]
        {
            ::log::log!(::log::Level::Debug, $($arg)+)
        }
    }
}
