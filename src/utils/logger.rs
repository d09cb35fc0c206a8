/*
 * Kernel Logger
 *
 * Backend for the log facade. Every record is formatted as "[LEVEL] message"
 * into a fixed-size buffer (no heap use, so logging works inside the
 * allocation failure path) and handed to a sink supplied by the board, for
 * example a serial port writer.
 *
 * Lines longer than the buffer are cut off; the log must never fail.
 */

use core::fmt::{self, Write};

use heapless::String;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Once;

use crate::error::KernelError;

/// Longest formatted log line, longer lines are truncated
pub const LOG_LINE_SIZE: usize = 160;

/// Where formatted log lines go
pub type LogSink = fn(&str);

pub struct KernelLogger {
    sink: LogSink,
    level: LevelFilter,
}

static LOGGER: Once<KernelLogger> = Once::new();

/// Fills the line buffer character by character until it is full
struct Truncating<'a>(&'a mut String<LOG_LINE_SIZE>);

impl Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            self.0.push(c).map_err(|_| fmt::Error)?;
        }
        Ok(())
    }
}

impl KernelLogger {
    /// Format a record the way it is written out
    pub fn format(record: &Record<'_>) -> String<LOG_LINE_SIZE> {
        let mut line = String::new();
        // A full buffer only truncates the line
        let _ = write!(Truncating(&mut line), "[{}] {}", record.level(), record.args());
        line
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            (self.sink)(&Self::format(record));
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger
///
/// Can only succeed once per boot.
pub fn init(sink: LogSink, level: LevelFilter) -> Result<(), KernelError> {
    if LOGGER.is_completed() {
        return Err(KernelError::AlreadyInitialized);
    }
    let logger = LOGGER.call_once(|| KernelLogger { sink, level });
    log::set_logger(logger).map_err(|_| KernelError::AlreadyInitialized)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;
    use alloc::vec::Vec;

    use serial_test::serial;
    use spin::Mutex;

    use super::*;

    static LINES: Mutex<Vec<alloc::string::String>> = Mutex::new(Vec::new());

    fn capture(line: &str) {
        LINES.lock().push(line.to_string());
    }

    #[test]
    fn formats_level_and_message() {
        let line = KernelLogger::format(
            &Record::builder()
                .args(format_args!("{} is ready", "cpu1"))
                .level(log::Level::Warn)
                .build(),
        );
        assert_eq!(line.as_str(), "[WARN] cpu1 is ready");
    }

    #[test]
    fn long_lines_are_truncated() {
        let long = "x".repeat(400);
        let line = KernelLogger::format(
            &Record::builder()
                .args(format_args!("{}", long))
                .level(log::Level::Info)
                .build(),
        );
        assert!(line.len() <= LOG_LINE_SIZE);
        assert!(line.starts_with("[INFO] xxx"));
    }

    #[test]
    #[serial]
    fn installs_once_and_filters_by_level() {
        init(capture, LevelFilter::Info).unwrap();
        assert_eq!(init(capture, LevelFilter::Trace), Err(KernelError::AlreadyInitialized));

        log::info!("visible");
        log::debug!("hidden");
        let lines = LINES.lock();
        assert!(lines.iter().any(|line| line == "[INFO] visible"));
        assert!(!lines.iter().any(|line| line.contains("hidden")));
    }
}
