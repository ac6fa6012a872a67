//! Logging setup and structured events
//!
//! Diagnostics that describe a record (truncations, shape mismatches,
//! load failures) go through [`emit`], which renders a message followed by
//! a JSON object of key-value fields:
//!
//! ```text
//! [WARN ] expected exactly one match {"context":{"eid":123},"found":0,"path":"./ce:surname"}
//! ```

use std::io::Write;
#[cfg(any(test, feature = "test-util"))]
use std::sync::Mutex;
#[cfg(any(test, feature = "test-util"))]
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use indicatif::MultiProgress;
use serde_json::{Map, Value};

/// Fixed-width level tag.
fn level_label(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    }
}

fn level_color(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    }
}

const RESET: &str = "\x1b[0m";

/// TTY logger: suspends the progress lines while a record is printed.
pub struct IndicatifLogger {
    inner: env_logger::Logger,
    multi: MultiProgress,
}

impl IndicatifLogger {
    pub fn new(inner: env_logger::Logger, multi: MultiProgress) -> Self {
        Self { inner, multi }
    }
}

impl log::Log for IndicatifLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.inner.matches(record) {
            return;
        }
        let level = record.level();
        let line = format!(
            "[{}{}{RESET}] {}",
            level_color(level),
            level_label(level),
            record.args()
        );
        self.multi.suspend(|| eprintln!("{line}"));
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Filter from `RUST_LOG`, defaulting to warn (quiet), info, or debug.
fn builder(quiet: bool, debug: bool) -> env_logger::Builder {
    let default_level = match (debug, quiet) {
        (true, _) => "debug",
        (false, true) => "warn",
        (false, false) => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
}

/// Install the global logger.
///
/// With `multi` (TTY) records print above the progress lines; without it
/// every record is a plain timestamped line, suited to log files.
/// Installing twice is a no-op.
pub fn init_logging(quiet: bool, debug: bool, multi: Option<&MultiProgress>) {
    match multi {
        Some(multi) => {
            let logger = builder(quiet, debug).build();
            let max_level = logger.filter();
            let boxed = Box::new(IndicatifLogger::new(logger, multi.clone()));
            if log::set_boxed_logger(boxed).is_ok() {
                log::set_max_level(max_level);
            }
        }
        None => {
            let _ = builder(quiet, debug)
                .format(|buf, record| {
                    writeln!(
                        buf,
                        "{} [{}] {}",
                        buf.timestamp_millis(),
                        level_label(record.level()),
                        record.args()
                    )
                })
                .try_init();
        }
    }
}

// =============================================================================
// Structured events
// =============================================================================

/// One structured diagnostic: a message plus key-value fields.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub level: log::Level,
    pub message: String,
    pub fields: Map<String, Value>,
}

impl LogEvent {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up `key` in the nested `context` object.
    pub fn context(&self, key: &str) -> Option<&Value> {
        self.fields.get("context").and_then(|c| c.get(key))
    }
}

/// Emit a structured event at `level`.
///
/// `fields` should be a JSON object (`serde_json::json!({...})`); any other
/// value is stored under the key `"value"`.
pub fn emit(level: log::Level, message: &str, fields: Value) {
    let fields = match fields {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    if log::log_enabled!(level) {
        if fields.is_empty() {
            log::log!(level, "{message}");
        } else {
            log::log!(level, "{message} {}", Value::Object(fields.clone()));
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    if ACTIVE_CAPTURES.load(Ordering::Acquire) > 0 {
        let event = LogEvent {
            level,
            message: message.to_string(),
            fields,
        };
        if let Ok(mut captures) = CAPTURES.lock() {
            for (_, events) in captures.iter_mut() {
                events.push(event.clone());
            }
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
static ACTIVE_CAPTURES: AtomicUsize = AtomicUsize::new(0);
#[cfg(any(test, feature = "test-util"))]
static NEXT_CAPTURE_ID: AtomicU64 = AtomicU64::new(0);
#[cfg(any(test, feature = "test-util"))]
static CAPTURES: Mutex<Vec<(u64, Vec<LogEvent>)>> = Mutex::new(Vec::new());

/// Collects every event emitted (from any thread) while it is alive.
///
/// Captures are process-wide, so concurrent tests should filter the
/// collected events by a field unique to them (an eid, a path).
#[cfg(any(test, feature = "test-util"))]
pub struct CaptureGuard {
    id: u64,
}

/// Start collecting emitted events.
#[cfg(any(test, feature = "test-util"))]
pub fn capture() -> CaptureGuard {
    let id = NEXT_CAPTURE_ID.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut captures) = CAPTURES.lock() {
        captures.push((id, Vec::new()));
    }
    ACTIVE_CAPTURES.fetch_add(1, Ordering::Release);
    CaptureGuard { id }
}

#[cfg(any(test, feature = "test-util"))]
impl CaptureGuard {
    /// Snapshot of the events collected so far.
    pub fn events(&self) -> Vec<LogEvent> {
        CAPTURES
            .lock()
            .map(|captures| {
                captures
                    .iter()
                    .find(|(id, _)| *id == self.id)
                    .map(|(_, events)| events.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if let Ok(mut captures) = CAPTURES.lock() {
            captures.retain(|(id, _)| *id != self.id);
        }
        ACTIVE_CAPTURES.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capture_collects_fields() {
        let guard = capture();
        emit(
            log::Level::Warn,
            "capture_collects_fields",
            json!({"context": {"eid": 42}, "found": 0}),
        );
        let events: Vec<_> = guard
            .events()
            .into_iter()
            .filter(|e| e.message == "capture_collects_fields")
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, log::Level::Warn);
        assert_eq!(events[0].context("eid"), Some(&json!(42)));
        assert_eq!(events[0].field("found"), Some(&json!(0)));
    }

    #[test]
    fn non_object_fields_wrapped() {
        let guard = capture();
        emit(log::Level::Info, "non_object_fields_wrapped", json!("plain"));
        let ev = guard
            .events()
            .into_iter()
            .find(|e| e.message == "non_object_fields_wrapped")
            .unwrap();
        assert_eq!(ev.field("value"), Some(&json!("plain")));
    }

    #[test]
    fn dropped_guard_stops_collecting() {
        let guard = capture();
        let id = guard.id;
        drop(guard);
        emit(log::Level::Error, "dropped_guard_stops_collecting", Value::Null);
        let still_registered = CAPTURES
            .lock()
            .unwrap()
            .iter()
            .any(|(other, _)| *other == id);
        assert!(!still_registered);
    }

    #[test]
    fn level_labels_padded() {
        for level in [log::Level::Error, log::Level::Warn, log::Level::Trace] {
            assert_eq!(level_label(level).len(), 5);
        }
        assert_eq!(level_label(log::Level::Warn), "WARN ");
        assert_eq!(level_color(log::Level::Error), "\x1b[31m");
    }
}
