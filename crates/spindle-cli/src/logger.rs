//! Stderr logger for the `log` facade.
//!
//! Level comes from `--log-level`, then `SPINDLE_LOG`, and defaults to `warn`.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fmt;
use std::thread;

static LOGGER: StderrLogger = StderrLogger;

struct StderrLogger;

#[derive(Debug, Clone, Copy)]
enum ColorCode {
    Red = 31,
    Green = 32,
    Yellow = 33,
    Cyan = 36,
    BrightBlack = 90,
}

impl fmt::Display for ColorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\u{1B}[{}m", *self as u8)
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let color = match record.level() {
            Level::Error => ColorCode::Red,
            Level::Warn => ColorCode::Yellow,
            Level::Info => ColorCode::Green,
            Level::Debug => ColorCode::Cyan,
            Level::Trace => ColorCode::BrightBlack,
        };
        let current = thread::current();
        eprintln!(
            "{}[{:>5} {}] {}\u{1B}[0m",
            color,
            record.level(),
            current.name().unwrap_or("?"),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

pub fn init(flag: Option<&str>) -> anyhow::Result<()> {
    let requested = flag
        .map(str::to_string)
        .or_else(|| std::env::var("SPINDLE_LOG").ok());
    let level = match requested.as_deref() {
        Some(name) => parse_level(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown log level '{}'", name))?,
        None => LevelFilter::Warn,
    };

    log::set_logger(&LOGGER).map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("WARN"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }
}
