//! Structured kernel logger.
//!
//! Implements [`log::Log`] over the serial console so ordinary `log::info!`
//! / `log::warn!` / `log::error!` call sites work kernel-wide, and adds the
//! uptime timestamp and emitting-function tag spec.md §4.8 requires via the
//! `kinfo!`/`kwarn!`/`kerror!`/`kdebug!` wrapper macros.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;
static COLOR_ENABLED: AtomicBool = AtomicBool::new(true);

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31m",
        Level::Warn => "\x1b[33m",
        Level::Info => "\x1b[32m",
        Level::Debug => "\x1b[36m",
        Level::Trace => "\x1b[90m",
    }
}

const COLOR_RESET: &str = "\x1b[0m";

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ms = crate::timer::uptime_ms();
        let target = record.target();
        if COLOR_ENABLED.load(Ordering::Relaxed) {
            crate::serial_println!(
                "{}[{:>9}.{:03}][{:<5}]{} {}: {}",
                level_color(record.level()),
                ms / 1000,
                ms % 1000,
                record.level(),
                COLOR_RESET,
                target,
                record.args()
            );
        } else {
            crate::serial_println!(
                "[{:>9}.{:03}][{:<5}] {}: {}",
                ms / 1000,
                ms % 1000,
                record.level(),
                target,
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the logger and set the initial level filter. Call once at boot,
/// before any subsystem below `cpu::gdt` logs.
pub fn init(level: LevelFilter) {
    // SAFETY: log::set_logger requires the referenced logger to live for the
    // program's duration; LOGGER is a 'static zero-sized value.
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(level);
}

pub fn set_color_enabled(enabled: bool) {
    COLOR_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Leveled logging macros that tag the emitting function name, per spec.md
/// §4.8. `log::info!`/etc. remain usable directly where the call site itself
/// is informative enough.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        log::info!(target: $crate::function_name!(), $($arg)*)
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        log::warn!(target: $crate::function_name!(), $($arg)*)
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        log::error!(target: $crate::function_name!(), $($arg)*)
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        log::debug!(target: $crate::function_name!(), $($arg)*)
    };
}

/// Expands to the fully-qualified name of the enclosing function, for use as
/// a log target. Relies on `core::any::type_name` applied to a local marker
/// type, the usual no_std trick for `function!()`-style macros.
#[macro_export]
macro_rules! function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            core::any::type_name::<T>()
        }
        let name = type_name_of(f);
        &name[..name.len() - 3]
    }};
}
