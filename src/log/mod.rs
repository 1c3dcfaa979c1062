//! Component-tagged kernel logging.
//!
//! Every record is a single line of the form `[LVL ] [component] message`,
//! written to the registered console sink and mirrored to the serial port
//! when the runtime mirror flag is set. Formatting goes straight through
//! `core::fmt` into the sinks, so logging works before the heap is up.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::drivers::{console, serial};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Ok,
    Warn,
    Error,
}

impl Level {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Ok => " OK ",
            Level::Warn => "WARN",
            Level::Error => "ERR ",
        }
    }
}

static SERIAL_MIRROR: AtomicBool = AtomicBool::new(false);

/// Enable or disable mirroring of log records to the serial port.
pub fn set_serial_mirror(on: bool) {
    SERIAL_MIRROR.store(on, Ordering::SeqCst);
}

pub fn serial_mirror_enabled() -> bool {
    SERIAL_MIRROR.load(Ordering::Relaxed)
}

/// Emit one record. Prefer the `log_*!` macros over calling this directly.
pub fn record(level: Level, component: &str, args: fmt::Arguments) {
    console::with_sink(|sink| {
        let mut w = console::SinkWriter(sink);
        let _ = fmt::Write::write_fmt(
            &mut w,
            format_args!("[{}] [{}] {}\n", level.as_str(), component, args),
        );
    });

    if serial_mirror_enabled() {
        serial::with_port(|port| {
            let _ = fmt::Write::write_fmt(
                port,
                format_args!("[{}] [{}] {}\n", level.as_str(), component, args),
            );
        });
    }
}

#[macro_export]
macro_rules! log_info {
    ($component:expr, $($arg:tt)*) => {
        $crate::log::record($crate::log::Level::Info, $component, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_ok {
    ($component:expr, $($arg:tt)*) => {
        $crate::log::record($crate::log::Level::Ok, $component, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($component:expr, $($arg:tt)*) => {
        $crate::log::record($crate::log::Level::Warn, $component, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($component:expr, $($arg:tt)*) => {
        $crate::log::record($crate::log::Level::Error, $component, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_strings_are_fixed_width() {
        for level in [Level::Info, Level::Ok, Level::Warn, Level::Error] {
            assert_eq!(level.as_str().len(), 4);
        }
    }

    #[test]
    fn mirror_flag_round_trip() {
        set_serial_mirror(true);
        assert!(serial_mirror_enabled());
        set_serial_mirror(false);
        assert!(!serial_mirror_enabled());
    }
}
