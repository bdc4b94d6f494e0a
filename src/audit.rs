//! Structured audit event lines for lifecycle and tamper signals.
//!
//! Events are pipe-delimited `RXA|mod=<MOD>|evt=<EVT>|k=v|...` lines,
//! printed to stdout and, when a directory is configured, appended to
//! `events.log` inside it. Hash-mismatch and already-dispensed signals are
//! always emitted through this path — they are potential tamper/fraud
//! indicators and must never be swallowed. Emission failures are reported to
//! stderr and never fail the business operation that triggered them.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Sink for structured audit event lines.
pub struct AuditLog {
    dir: Option<PathBuf>,
    file: Mutex<()>,
}

fn sanitize(value: &str) -> String {
    value.replace(['|', '\n', '\r'], "_")
}

impl AuditLog {
    /// Stdout-only audit sink.
    pub fn stdout() -> Self {
        Self {
            dir: None,
            file: Mutex::new(()),
        }
    }

    /// Audit sink that also appends every line to `<dir>/events.log`.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            file: Mutex::new(()),
        }
    }

    /// Formats one event line without emitting it.
    pub fn format_event(module: &str, event: &str, fields: &[(&str, &str)]) -> String {
        let mut line = format!("RXA|mod={}|evt={}", sanitize(module), sanitize(event));
        for (key, value) in fields {
            line.push('|');
            line.push_str(&sanitize(key));
            line.push('=');
            line.push_str(&sanitize(value));
        }
        line
    }

    /// Emits one event line to stdout and the configured file.
    pub fn event(&self, module: &str, event: &str, fields: &[(&str, &str)]) {
        let line = Self::format_event(module, event, fields);
        println!("{line}");
        if let Some(dir) = &self.dir {
            let _guard = self.file.lock().expect("audit lock poisoned");
            if let Err(err) = append_line(dir, &line) {
                eprintln!("audit write failed: {err}");
            }
        }
    }
}

fn append_line(dir: &PathBuf, line: &str) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("events.log"))?;
    writeln!(file, "{line}")
}
