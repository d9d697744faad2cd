//! Kernel logging subsystem.
//!
//! Records are formatted straight into a sink installed by whoever owns the
//! output device: the serial writer on bare metal, stderr on the host. No
//! sink means the record is dropped.
#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::{Mutex, RwLock};

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Level::Trace => "\x1b[90m", // Gray
            Level::Debug => "\x1b[36m", // Cyan
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Info,
            3 => Level::Warn,
            _ => Level::Error,
        }
    }
}

/// Output function receiving already-formatted text fragments.
pub type Sink = fn(&str);

static SINK: RwLock<Option<Sink>> = RwLock::new(None);

/// Serializes whole records so lines from different cores don't interleave.
static LINE: Mutex<()> = Mutex::new(());

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Install (or replace) the output sink.
pub fn set_sink(sink: Sink) {
    *SINK.write() = Some(sink);
}

/// Remove the output sink; subsequent records are dropped.
pub fn clear_sink() {
    *SINK.write() = None;
}

/// Records below `level` are discarded before formatting.
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn max_level() -> Level {
    Level::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

#[inline]
pub fn enabled(level: Level) -> bool {
    level >= max_level()
}

struct SinkWriter(Sink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

/// Log a message with a specific level
pub fn log(level: Level, args: fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    let Some(sink) = *SINK.read() else {
        return;
    };
    let _line = LINE.lock();
    let mut out = SinkWriter(sink);
    let _ = writeln!(out, "{}[{}]\x1b[0m {}", level.color(), level.as_str(), args);
}

/// Print to the sink without a level prefix
pub fn print(args: fmt::Arguments) {
    let Some(sink) = *SINK.read() else {
        return;
    };
    let _line = LINE.lock();
    let _ = SinkWriter(sink).write_fmt(args);
}

/// [`print`] plus a newline, as one record.
pub fn println(args: fmt::Arguments) {
    let Some(sink) = *SINK.read() else {
        return;
    };
    let _line = LINE.lock();
    let _ = writeln!(SinkWriter(sink), "{}", args);
}

// ── `log` facade bridge ─────────────────────────────────────────

struct Facade;

static FACADE: Facade = Facade;

fn from_facade(level: log::Level) -> Level {
    match level {
        log::Level::Trace => Level::Trace,
        log::Level::Debug => Level::Debug,
        log::Level::Info => Level::Info,
        log::Level::Warn => Level::Warn,
        log::Level::Error => Level::Error,
    }
}

impl log::Log for Facade {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        enabled(from_facade(metadata.level()))
    }

    fn log(&self, record: &log::Record) {
        log(from_facade(record.level()), *record.args());
    }

    fn flush(&self) {}
}

/// Route records emitted through the `log` crate into this logger.
pub fn init_log_facade() -> Result<(), log::SetLoggerError> {
    log::set_logger(&FACADE)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}

/// Log at TRACE level
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Trace, format_args!($($arg)*))
    };
}

/// Log at DEBUG level
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Debug, format_args!($($arg)*))
    };
}

/// Log at INFO level
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Info, format_args!($($arg)*))
    };
}

/// Log at WARN level
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Warn, format_args!($($arg)*))
    };
}

/// Log at ERROR level
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Error, format_args!($($arg)*))
    };
}

/// Print without newline
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::print(format_args!($($arg)*))
    };
}

/// Print with newline
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => {
        $crate::println(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use std::string::String;
    use std::sync::Mutex as StdMutex;

    /// The sink and level are global; tests that set them take turns.
    static GLOBALS: StdMutex<()> = StdMutex::new(());

    static SEEN: AtomicUsize = AtomicUsize::new(0);
    static CAPTURED: StdMutex<String> = StdMutex::new(String::new());

    fn counting_sink(s: &str) {
        SEEN.fetch_add(s.len(), Ordering::SeqCst);
    }

    fn capturing_sink(s: &str) {
        CAPTURED.lock().unwrap().push_str(s);
    }

    fn take_captured() -> String {
        core::mem::take(&mut *CAPTURED.lock().unwrap())
    }

    #[test]
    fn filter_and_sink() {
        let _globals = GLOBALS.lock().unwrap();
        set_sink(counting_sink);
        set_max_level(Level::Warn);
        info!("dropped {}", 1);
        assert_eq!(SEEN.load(Ordering::SeqCst), 0);
        warn!("kept");
        assert!(SEEN.load(Ordering::SeqCst) > "kept".len());
        clear_sink();
        let before = SEEN.load(Ordering::SeqCst);
        error!("no sink");
        assert_eq!(SEEN.load(Ordering::SeqCst), before);
        set_max_level(Level::Info);
    }

    #[test]
    fn println_writes_one_line() {
        let _globals = GLOBALS.lock().unwrap();
        set_sink(capturing_sink);
        take_captured();
        println!("core {} up", 3);
        println!();
        assert_eq!(take_captured(), "core 3 up\n\n");
        clear_sink();
    }

    #[test]
    fn facade_records_reach_the_sink() {
        let _globals = GLOBALS.lock().unwrap();
        set_sink(capturing_sink);
        set_max_level(Level::Debug);
        init_log_facade().unwrap();
        take_captured();

        log::info!("through {}", "the facade");
        log::trace!("below the level");
        let out = take_captured();
        assert!(out.contains("[ INFO]"), "{:?}", out);
        assert!(out.ends_with("through the facade\n"), "{:?}", out);
        assert!(!out.contains("below the level"));

        clear_sink();
        set_max_level(Level::Info);
    }

    #[test]
    fn level_order() {
        assert!(Level::Error > Level::Warn);
        assert_eq!(Level::from_u8(Level::Debug as u8), Level::Debug);
        assert_eq!(from_facade(log::Level::Warn), Level::Warn);
    }
}
