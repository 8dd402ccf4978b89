//! Run-scoped, append-only log file.
//!
//! Each record is a single `[timestamp] [LEVEL] message` line. Every record is
//! also emitted as a `tracing` event so the console and the file tell the
//! same story.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use chrono::Utc;

/// Severity of a run log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// Append-only log for one deployment run.
#[derive(Debug)]
pub struct RunLog {
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
}

impl RunLog {
    /// Open (or create) the log file at `path` in append mode.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            crate::fs::FsHandler::ensure_dir(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open run log {}", path.display()))?;

        Ok(Self {
            path: Some(path),
            file: Some(Mutex::new(file)),
        })
    }

    /// A log that only forwards records to `tracing`.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
        }
    }

    /// Default location of a run log: `<dir>/rollstack-<UTC timestamp>.log`.
    pub fn default_path(dir: &Path) -> PathBuf {
        dir.join(format!("rollstack-{}.log", Utc::now().format("%Y%m%dT%H%M%SZ")))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.record(LogLevel::Info, message.as_ref());
    }

    pub fn success(&self, message: impl AsRef<str>) {
        self.record(LogLevel::Success, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.record(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.record(LogLevel::Error, message.as_ref());
    }

    /// Append raw tool output, one record per line.
    pub fn output(&self, step: &str, output: &str) {
        for line in output.lines() {
            self.write_line(LogLevel::Info, &format!("[{step}] {line}"));
        }
    }

    pub fn record(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info | LogLevel::Success => tracing::info!(status = %level, "{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }

        self.write_line(level, message);
    }

    fn write_line(&self, level: LogLevel, message: &str) {
        let Some(file) = &self.file else {
            return;
        };

        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let line: String = message
            .lines()
            .map(|part| format!("[{timestamp}] [{level}] {part}\n"))
            .collect();

        match file.lock() {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()) {
                    tracing::warn!(err = %e, "Failed to write to run log");
                }
            }
            Err(e) => tracing::warn!(err = %e, "Run log lock poisoned"),
        }
    }
}
