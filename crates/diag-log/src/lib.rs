//! Console logger for the [`log`] facade.
//!
//! Records are formatted as `<LEVEL> <target>: <message>` with an
//! ANSI-coloured level tag and handed to a [`Sink`], a plain function that
//! writes formatted text somewhere: a serial port, a debug console, or the
//! test harness's stderr.
//!
//! ```rust
//! use log::LevelFilter;
//!
//! fn stderr_sink(args: core::fmt::Arguments<'_>) {
//!     eprint!("{args}");
//! }
//!
//! diag_log::init(stderr_sink, LevelFilter::Debug).unwrap();
//! log::info!("frame pools ready");
//! ```

#![cfg_attr(not(test), no_std)]

use core::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Once;

/// Output function of a [`ConsoleLogger`].
pub type Sink = fn(fmt::Arguments<'_>);

pub struct ConsoleLogger {
    sink: Sink,
    max_level: LevelFilter,
    color: bool,
}

impl fmt::Debug for ConsoleLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleLogger")
            .field("max_level", &self.max_level)
            .field("color", &self.color)
            .finish_non_exhaustive()
    }
}

impl ConsoleLogger {
    #[must_use]
    pub const fn new(sink: Sink, max_level: LevelFilter) -> Self {
        Self {
            sink,
            max_level,
            color: true,
        }
    }

    /// Disables the ANSI colour codes around the level tag.
    #[must_use]
    pub const fn without_color(mut self) -> Self {
        self.color = false;
        self
    }

    #[must_use]
    pub fn max_level(&self) -> LevelFilter {
        self.max_level
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        (self.sink)(format_args!(
            "{} {}: {}\n",
            LevelFormat {
                level: record.level(),
                color: self.color,
            },
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

struct LevelFormat {
    level: Level,
    color: bool,
}

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.level {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        };
        if !self.color {
            return f.write_str(msg);
        }
        let color = match self.level {
            Level::Trace => 35,
            Level::Debug => 34,
            Level::Info => 32,
            Level::Warn => 33,
            Level::Error => 31,
        };
        write!(f, "\x1B[{color};1m{msg}\x1B[0m")
    }
}

static LOGGER: Once<ConsoleLogger> = Once::new();

/// Installs a [`ConsoleLogger`] writing to `sink` as the global logger.
///
/// Only the first call has an effect; later calls return an error and keep
/// the logger installed by the first one.
pub fn init(sink: Sink, max_level: LevelFilter) -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| ConsoleLogger::new(sink, max_level));
    log::set_logger(logger)?;
    log::set_max_level(max_level);
    Ok(())
}
