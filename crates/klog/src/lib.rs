//! Kernel logging subsystem.
//!
//! A [`log::Log`] backend that formats each record as
//! `[LEVEL] file@line: message` and hands the bytes to a [`ConsoleSink`],
//! normally the hypervisor console. Formatting never allocates.
#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};

use log::{Metadata, Record};
use spin::Once;

pub use log::{debug, error, info, trace, warn, Level, LevelFilter, SetLoggerError};

/// Where formatted log bytes go.
pub trait ConsoleSink: Sync {
    fn write_bytes(&self, bytes: &[u8]);
}

impl<H: khal::Hypervisor> ConsoleSink for H {
    fn write_bytes(&self, bytes: &[u8]) {
        self.console_write(bytes);
    }
}

/// Adapts a sink to `core::fmt::Write`.
struct SinkWriter<'a>(&'a dyn ConsoleSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Write one record in console format.
pub fn write_record(out: &mut dyn Write, record: &Record<'_>, color: bool) -> fmt::Result {
    let (label, ansi) = match record.level() {
        Level::Error => ("ERROR", "31"),
        Level::Warn => (" WARN", "33"),
        Level::Info => (" INFO", "32"),
        Level::Debug => ("DEBUG", "36"),
        Level::Trace => ("TRACE", "90"),
    };
    if color {
        write!(out, "\x1b[{}m[{}]\x1b[0m", ansi, label)?;
    } else {
        write!(out, "[{}]", label)?;
    }
    match (record.file(), record.line()) {
        (Some(file), Some(line)) => write!(out, " {}@{}: ", file, line)?,
        _ => write!(out, " {}: ", record.target())?,
    }
    out.write_fmt(*record.args())?;
    out.write_str("\n")
}

struct KernelLogger {
    sink: Once<&'static dyn ConsoleSink>,
}

static LOGGER: KernelLogger = KernelLogger { sink: Once::new() };

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.get() {
            let _ = write_record(&mut SinkWriter(*sink), record, true);
        }
    }

    fn flush(&self) {}
}

/// Install the console logger. Only the first call takes effect.
pub fn init(sink: &'static dyn ConsoleSink, level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.sink.call_once(|| sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Print to the console without a record header.
pub fn print(args: fmt::Arguments<'_>) {
    if let Some(sink) = LOGGER.sink.get() {
        let _ = SinkWriter(*sink).write_fmt(args);
    }
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
    ($($arg:tt)*) => {{
        $crate::print(format_args!($($arg)*));
        $crate::print(format_args!("\n"));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(level: Level, file: Option<&'static str>, line: Option<u32>, color: bool) -> String {
        let mut out = String::new();
        write_record(
            &mut out,
            &Record::builder()
                .level(level)
                .target("micropv::event")
                .file_static(file)
                .line(line)
                .args(format_args!("port {} rebound", 5))
                .build(),
            color,
        )
        .unwrap();
        out
    }

    #[test]
    fn record_carries_level_location_and_message() {
        let text = render(Level::Warn, Some("kernel/src/event/mod.rs"), Some(88), false);
        assert_eq!(text, "[ WARN] kernel/src/event/mod.rs@88: port 5 rebound\n");
    }

    #[test]
    fn record_without_location_falls_back_to_target() {
        let text = render(Level::Info, None, None, false);
        assert_eq!(text, "[ INFO] micropv::event: port 5 rebound\n");
    }

    #[test]
    fn colored_record_resets_after_label() {
        let text = render(Level::Error, Some("a.rs"), Some(1), true);
        assert!(text.starts_with("\x1b[31m[ERROR]\x1b[0m a.rs@1: "));
    }
}
