//! Kernel log sink
//!
//! `log` records from the VM layers land in a fixed-size ring of
//! formatted lines. Nothing here allocates; when the ring is full the
//! oldest line is dropped, and over-long lines are truncated.

use core::fmt::Write;
use heapless::{Deque, String};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Maximum length of one formatted line
pub const LINE_CAPACITY: usize = 128;

/// Number of lines kept
pub const RING_DEPTH: usize = 64;

/// One formatted log line
pub type LogLine = String<LINE_CAPACITY>;

/// Ring-buffer logger
pub struct KernelLog {
    ring: Mutex<Deque<LogLine, RING_DEPTH>>,
}

impl KernelLog {
    /// Create an empty log
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(Deque::new()),
        }
    }

    /// Number of buffered lines
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// True if no lines are buffered
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Remove buffered lines, oldest first, handing each to `f`
    pub fn drain(&self, mut f: impl FnMut(&str)) {
        let mut ring = self.ring.lock();
        while let Some(line) = ring.pop_front() {
            f(&line);
        }
    }

    fn push(&self, line: LogLine) {
        let mut ring = self.ring.lock();
        if ring.is_full() {
            ring.pop_front();
        }
        // Room was made above.
        let _ = ring.push_back(line);
    }
}

impl Default for KernelLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = LogLine::new();
        // Truncation on overflow is fine.
        let _ = write!(line, "[{:<5} {}] {}", record.level(), record.target(), record.args());
        self.push(line);
    }

    fn flush(&self) {}
}

/// Global kernel log
static KLOG: KernelLog = KernelLog::new();

/// Install the global kernel log as the `log` backend
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&KLOG)?;
    log::set_max_level(level);
    Ok(())
}

/// The global kernel log
pub fn klog() -> &'static KernelLog {
    &KLOG
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use log::Level;

    fn emit(log: &KernelLog, level: Level, msg: &str) {
        log.log(
            &Record::builder()
                .level(level)
                .target("vm")
                .args(format_args!("{}", msg))
                .build(),
        );
    }

    #[test]
    fn test_ring_keeps_newest() {
        log::set_max_level(LevelFilter::Trace);
        let log = KernelLog::new();
        for i in 0..RING_DEPTH + 3 {
            emit(&log, Level::Info, &i.to_string());
        }
        assert_eq!(log.len(), RING_DEPTH);

        let mut lines = Vec::new();
        log.drain(|line| lines.push(line.to_string()));
        assert!(lines[0].ends_with(" 3"));
        assert!(lines[0].starts_with("[INFO  vm]"));
        assert!(log.is_empty());
    }

    #[test]
    fn test_long_lines_truncate() {
        log::set_max_level(LevelFilter::Trace);
        let log = KernelLog::new();
        let long = "x".repeat(LINE_CAPACITY * 2);
        emit(&log, Level::Warn, &long);
        let mut len = 0;
        log.drain(|line| len = line.len());
        assert!(len <= LINE_CAPACITY);
        assert!(len > 0);
    }
}
