use chrono::Local;
use std::env;
use std::fmt;
use std::sync::OnceLock;

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Lowest level printed: `info` (default), `warn` or `error`.
pub const LEVEL_ENV: &str = "FACTSTORE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn parse(s: &str) -> Option<Level> {
        match s.trim().to_lowercase().as_str() {
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            _ => None,
        }
    }
}

fn threshold() -> Level {
    static THRESHOLD: OnceLock<Level> = OnceLock::new();
    *THRESHOLD.get_or_init(|| env::var(LEVEL_ENV).ok().and_then(|v| Level::parse(&v)).unwrap_or(Level::Info))
}

fn emit(level: Level, args: fmt::Arguments) {
    if level < threshold() {
        return;
    }
    let ts = Local::now().format(TS_FORMAT);
    match level {
        Level::Info => println!("[{}] INFO {}", ts, args),
        Level::Warn => eprintln!("[{}] WARN {}", ts, args),
        Level::Error => eprintln!("[{}] ERROR {}", ts, args),
    }
}

pub fn info(args: fmt::Arguments) {
    emit(Level::Info, args)
}

pub fn warn(args: fmt::Arguments) {
    emit(Level::Warn, args)
}

pub fn error(args: fmt::Arguments) {
    emit(Level::Error, args)
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logger::info(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logger::warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logger::error(format_args!($($arg)*))
    };
}
