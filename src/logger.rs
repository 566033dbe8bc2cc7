//! Logging through the `log` crate
//!
//! Records are written as `[LEVEL] target: message` lines to the console
//! the embedding kernel registers with [`init`].

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use spin::Once;

/// The active console
pub trait ConsoleSink: Send + Sync {
    fn write_str(&self, s: &str);
}

struct SinkWriter<'a>(&'a dyn ConsoleSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

struct ConsoleLogger {
    sink: Once<&'static dyn ConsoleSink>,
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.get() {
            write_record(*sink, record);
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger { sink: Once::new() };

fn level_str(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31mERROR\x1b[0m",
        Level::Warn => "\x1b[33mWARN\x1b[0m ",
        Level::Info => "\x1b[32mINFO\x1b[0m ",
        Level::Debug => "\x1b[34mDEBUG\x1b[0m",
        Level::Trace => "\x1b[35mTRACE\x1b[0m",
    }
}

fn write_record(sink: &dyn ConsoleSink, record: &Record) {
    // Format: [LEVEL] target: message
    let _ = writeln!(
        SinkWriter(sink),
        "[{}] {}: {}",
        level_str(record.level()),
        record.target(),
        record.args()
    );
}

/// Install the logger on `sink`. Fails if a logger is already set.
pub fn init(sink: &'static dyn ConsoleSink, level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.sink.call_once(|| sink);
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
