//! Node-wide logger: `env_logger` formatting plus a small in-memory ring
//! buffer so a running node can answer "show me recent log lines" without
//! re-reading its own log file.

use ansi_term::Colour;
use chrono::SecondsFormat;
use env_logger::fmt::Formatter;
use env_logger::Builder as LogBuilder;
use parking_lot::Mutex;
use regex::Regex;
use std::{
    collections::VecDeque,
    env, fs,
    io::Write,
    sync::{Arc, OnceLock, Weak},
    thread,
};

#[derive(Debug, PartialEq, Clone)]
pub struct Config {
    pub mode: Option<String>,
    pub color: bool,
    pub file: Option<String>,
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: None,
            color: true,
            file: None,
            json: true,
        }
    }
}

/// Fixed-capacity ring buffer of formatted log lines, shared by every
/// `log::Log` call through a clone of the `Arc` returned by [`setup_log`].
pub struct RotatingLogger {
    levels: String,
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl RotatingLogger {
    const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(levels: String) -> Self {
        Self {
            levels,
            lines: Mutex::new(VecDeque::with_capacity(Self::DEFAULT_CAPACITY)),
            capacity: Self::DEFAULT_CAPACITY,
        }
    }

    pub fn levels(&self) -> &str {
        &self.levels
    }

    pub fn append(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot of buffered lines, oldest first.
    pub fn logs(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

fn rotating_logger_slot() -> &'static Mutex<Weak<RotatingLogger>> {
    static SLOT: OnceLock<Mutex<Weak<RotatingLogger>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(Weak::new()))
}

/// Escapes a multiline message for JSON output (e.g. a panic backtrace).
fn escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('"', "\\\"")
}

/// Installs the process-wide logger. Returns the shared [`RotatingLogger`]
/// so callers can expose its buffered lines over a status endpoint.
pub fn setup_log(config: &Config) -> Result<Arc<RotatingLogger>, String> {
    use log::*;

    let mut levels = String::new();
    let mut builder = LogBuilder::new();
    builder.filter(Some("rusqlite"), LevelFilter::Warn);
    builder.filter(None, LevelFilter::Info);

    if let Ok(lvl) = env::var("RUST_LOG") {
        levels.push_str(&lvl);
        levels.push(',');
        builder.parse_filters(&lvl);
    }

    if let Some(ref s) = config.mode {
        levels.push_str(s);
        builder.parse_filters(s);
    }

    let isatty = atty::is(atty::Stream::Stderr);
    let enable_color = config.color && isatty;
    let enable_json = config.json;
    let logs = Arc::new(RotatingLogger::new(levels));
    let logger = logs.clone();
    let mut open_options = fs::OpenOptions::new();

    let maybe_file = match config.file.as_ref() {
        Some(f) => Some(
            open_options
                .append(true)
                .create(true)
                .open(f)
                .map_err(|e| format!("cannot write to log file {f}: {e}"))?,
        ),
        None => None,
    };

    let format = move |buf: &mut Formatter, record: &Record| {
        let name = thread::current().name().map_or_else(Default::default, |x| x.to_string());
        let utc_time = chrono::Utc::now();

        let with_color = if enable_json {
            let timestamp = utc_time.to_rfc3339_opts(SecondsFormat::Millis, true);
            format!(
                "{{\"@timestamp\":\"{}\",\"@version\":\"1\",\"node\":\"{}\",\"level\":\"{}\",\"target\":\"{}\",\"message\":\"{}\"}}",
                timestamp,
                name,
                record.level(),
                record.target(),
                escape(&record.args().to_string())
            )
        } else {
            let timestamp = utc_time.format("%Y-%m-%d %H:%M:%S %Z").to_string();
            let name = if name.is_empty() {
                name
            } else {
                format!("{}", Colour::Blue.bold().paint(name))
            };
            format!(
                "{} {} {} {}  {}",
                Colour::Black.bold().paint(timestamp),
                name,
                record.level(),
                record.target(),
                record.args()
            )
        };

        let removed_color = kill_color(with_color.as_ref());
        let ret = if enable_color { with_color.clone() } else { removed_color.clone() };

        if let Some(mut file) = maybe_file.as_ref() {
            let _ = file.write_all(removed_color.as_bytes());
            let _ = file.write_all(b"\n");
        }
        logger.append(removed_color);

        writeln!(buf, "{ret}")
    };

    builder.format(format);
    builder
        .try_init()
        .map(|_| {
            *rotating_logger_slot().lock() = Arc::downgrade(&logs);
            logs
        })
        .or_else(|err| rotating_logger_slot().lock().upgrade().ok_or_else(|| format!("{err:?}")))
}

fn kill_color(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("\x1b\\[[^m]+m").unwrap()).replace_all(s, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_remove_colour() {
        let before = "test";
        let after = kill_color(&Colour::Red.bold().paint(before).to_string());
        assert_eq!(after, "test");
    }

    #[test]
    fn should_remove_multiple_colour() {
        let t = format!("{} {}", Colour::Red.bold().paint("test"), Colour::White.normal().paint("again"));
        let after = kill_color(&t);
        assert_eq!(after, "test again");
    }

    #[test]
    fn rotating_logger_evicts_oldest_past_capacity() {
        let logger = RotatingLogger::new("info".to_string());
        for i in 0..(RotatingLogger::DEFAULT_CAPACITY + 10) {
            logger.append(format!("line {i}"));
        }
        let lines = logger.logs();
        assert_eq!(lines.len(), RotatingLogger::DEFAULT_CAPACITY);
        assert_eq!(lines[0], "line 10");
    }

    #[test]
    fn escape_handles_quotes_and_newlines() {
        assert_eq!(escape("a\nb\"c"), "a\\nb\\\"c");
    }
}
