//! Run-scoped JSONL logging.
//!
//! Diagnostics go through `tracing`; this module covers the persisted log
//! contract instead: one JSONL file per run, one record per line, written to
//! the directory the logging descriptor names. The engine itself persists
//! nothing else.
//!
//! Records never include the process environment. Fields are explicit JSON
//! values supplied by the caller, so secrets present in the environment
//! cannot leak into a log file.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Severity and channel of a log record.
///
/// Beyond the usual severities, the channel levels (`assistant`, `user`,
/// `tool`, `result`, `system`) mirror the SDK stream so a run log can be
/// replayed message by message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Assistant,
    User,
    Tool,
    Result,
    System,
}

/// One JSONL record: `{ts, level, msg, fields}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Epoch milliseconds.
    pub ts: u64,
    pub level: LogLevel,
    pub msg: String,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub fields: JsonValue,
}

/// Appends JSONL records to a per-run log file.
///
/// A disabled logger (no directory configured) swallows records; the run
/// proceeds identically either way.
pub struct JsonlLogger {
    sink: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl JsonlLogger {
    /// Opens `<dir>/<run_name>.jsonl` for appending, creating the directory
    /// if needed.
    pub fn create(dir: &Path, run_name: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{run_name}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            sink: Some(Mutex::new(file)),
            path: Some(path),
        })
    }

    /// A logger that drops every record.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            path: None,
        }
    }

    /// Path of the log file, if the logger is enabled.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends one record. Write failures are reported via `tracing` and
    /// otherwise ignored: logging must never fail a run.
    pub fn log(&self, level: LogLevel, msg: impl Into<String>, fields: JsonValue) {
        let Some(sink) = &self.sink else {
            return;
        };
        let record = LogRecord {
            ts: current_timestamp_ms(),
            level,
            msg: msg.into(),
            fields,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(target: "agent_harness::logging", "unserializable log record: {e}");
                return;
            }
        };
        if let Ok(mut file) = sink.lock() {
            if let Err(e) = writeln!(file, "{line}") {
                tracing::warn!(target: "agent_harness::logging", "log write failed: {e}");
            }
        }
    }

    pub fn info(&self, msg: impl Into<String>, fields: JsonValue) {
        self.log(LogLevel::Info, msg, fields);
    }

    pub fn warn(&self, msg: impl Into<String>, fields: JsonValue) {
        self.log(LogLevel::Warn, msg, fields);
    }

    pub fn error(&self, msg: impl Into<String>, fields: JsonValue) {
        self.log(LogLevel::Error, msg, fields);
    }

    pub fn assistant(&self, msg: impl Into<String>, fields: JsonValue) {
        self.log(LogLevel::Assistant, msg, fields);
    }

    pub fn tool(&self, msg: impl Into<String>, fields: JsonValue) {
        self.log(LogLevel::Tool, msg, fields);
    }

    pub fn result(&self, msg: impl Into<String>, fields: JsonValue) {
        self.log(LogLevel::Result, msg, fields);
    }
}

/// Returns the current system time in milliseconds since UNIX_EPOCH.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disabled_logger_swallows_records() {
        let logger = JsonlLogger::disabled();
        logger.info("nothing happens", JsonValue::Null);
        assert!(logger.path().is_none());
    }

    #[test]
    fn test_records_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let logger = JsonlLogger::create(dir.path(), "run-1").unwrap();
        logger.info("first", json!({"iteration": 1}));
        logger.log(LogLevel::Assistant, "hello", JsonValue::Null);

        let content = std::fs::read_to_string(logger.path().unwrap()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: LogRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.msg, "first");
        assert_eq!(first.level, LogLevel::Info);
        assert_eq!(first.fields, json!({"iteration": 1}));

        let second: LogRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.level, LogLevel::Assistant);
    }

    #[test]
    fn test_level_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&LogLevel::Assistant).unwrap(),
            "\"assistant\""
        );
        assert_eq!(serde_json::to_string(&LogLevel::Warn).unwrap(), "\"warn\"");
    }
}
