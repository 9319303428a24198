//! Structured JSONL diagnostics.
//!
//! Every diagnostic is one [`DiagEntry`] serialized to a single JSON line.
//! Entries go through a [`DiagSink`], which drops anything below its
//! threshold and writes the rest to stderr, a file or an in-memory buffer.
//!
//! The process-wide sink is created from [`crate::config::config`] on first
//! use (`MPROFILE_LOG`, `MPROFILE_LOG_LEVEL`). Use [`emit_with`] on hot paths
//! so the entry is only built when its level passes the filter.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::config;
use crate::record::{RecordKind, Timestamp};
use crate::session::ContextId;

/// Severity, ordered from chattiest to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl DiagLevel {
    /// Parse from string (case-insensitive); unknown strings mean `Warn`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "error" => Self::Error,
            "fatal" => Self::Fatal,
            _ => Self::Warn,
        }
    }
}

/// One diagnostic line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagEntry {
    pub timestamp: Timestamp,
    pub level: DiagLevel,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    /// Block address, as `0x`-prefixed hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<RecordKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl DiagEntry {
    #[must_use]
    pub fn new(level: DiagLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: Timestamp::now(),
            level,
            event: event.into(),
            context_id: None,
            address: None,
            record_id: None,
            operation: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: ContextId) -> Self {
        self.context_id = Some(context);
        self
    }

    #[must_use]
    pub fn with_address(mut self, address: usize) -> Self {
        self.address = Some(format!("{address:#x}"));
        self
    }

    #[must_use]
    pub fn with_record(mut self, record_id: u64) -> Self {
        self.record_id = Some(record_id);
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: RecordKind) -> Self {
        self.operation = Some(operation);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

enum Target {
    Stderr,
    File(BufWriter<File>),
    Buffer(Vec<u8>),
}

/// Level-filtered JSONL writer.
pub struct DiagSink {
    target: Target,
    threshold: DiagLevel,
}

impl std::fmt::Debug for DiagSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match self.target {
            Target::Stderr => "stderr",
            Target::File(_) => "file",
            Target::Buffer(_) => "buffer",
        };
        f.debug_struct("DiagSink")
            .field("target", &target)
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl DiagSink {
    #[must_use]
    pub fn to_stderr(threshold: DiagLevel) -> Self {
        Self {
            target: Target::Stderr,
            threshold,
        }
    }

    /// Create (truncating) a log file.
    pub fn to_file(path: &Path, threshold: DiagLevel) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            target: Target::File(BufWriter::new(file)),
            threshold,
        })
    }

    /// Collect lines in memory (for testing).
    #[must_use]
    pub fn to_buffer(threshold: DiagLevel) -> Self {
        Self {
            target: Target::Buffer(Vec::new()),
            threshold,
        }
    }

    #[must_use]
    pub fn enabled(&self, level: DiagLevel) -> bool {
        level >= self.threshold
    }

    /// Write `entry` if its level passes the threshold. Returns whether a
    /// line was written.
    pub fn emit(&mut self, entry: &DiagEntry) -> io::Result<bool> {
        if !self.enabled(entry.level) {
            return Ok(false);
        }
        let line = entry.to_jsonl().map_err(io::Error::other)?;
        match &mut self.target {
            Target::Stderr => writeln!(io::stderr().lock(), "{line}")?,
            Target::File(w) => {
                writeln!(w, "{line}")?;
                // Fatal entries precede an abort; nothing after them gets flushed.
                if entry.level == DiagLevel::Fatal {
                    w.flush()?;
                }
            }
            Target::Buffer(buf) => writeln!(buf, "{line}")?,
        }
        Ok(true)
    }

    /// Like [`DiagSink::emit`], but `build` only runs when `level` passes.
    pub fn emit_with(
        &mut self,
        level: DiagLevel,
        build: impl FnOnce() -> DiagEntry,
    ) -> io::Result<bool> {
        if !self.enabled(level) {
            return Ok(false);
        }
        self.emit(&build())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.target {
            Target::Stderr => io::stderr().flush(),
            Target::File(w) => w.flush(),
            Target::Buffer(_) => Ok(()),
        }
    }

    /// Lines captured by a buffer sink; `None` for other targets.
    #[must_use]
    pub fn buffered_lines(&self) -> Option<Vec<&str>> {
        match &self.target {
            Target::Buffer(buf) => std::str::from_utf8(buf).ok().map(|s| s.lines().collect()),
            _ => None,
        }
    }
}

static GLOBAL_SINK: OnceLock<Mutex<DiagSink>> = OnceLock::new();

fn sink_from_config() -> Mutex<DiagSink> {
    let cfg = config();
    let sink = cfg
        .log_path
        .as_deref()
        .and_then(|path| DiagSink::to_file(path, cfg.log_level).ok())
        .unwrap_or_else(|| DiagSink::to_stderr(cfg.log_level));
    Mutex::new(sink)
}

fn global_sink() -> &'static Mutex<DiagSink> {
    GLOBAL_SINK.get_or_init(sink_from_config)
}

/// Write `entry` to the process-wide sink. Write errors are swallowed:
/// diagnostics never change profiler behavior.
pub fn emit(entry: &DiagEntry) {
    let _ = global_sink().lock().emit(entry);
}

/// Build and write an entry only if `level` passes the filter.
pub fn emit_with(level: DiagLevel, build: impl FnOnce() -> DiagEntry) {
    let _ = global_sink().lock().emit_with(level, build);
}

/// Flush the process-wide sink.
pub fn flush() {
    let _ = global_sink().lock().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_fields_only() {
        let entry = DiagEntry::new(DiagLevel::Info, "session_start");
        let parsed: serde_json::Value = serde_json::from_str(&entry.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "session_start");
        assert!(parsed["timestamp"]["seconds"].is_u64());
        assert!(parsed.get("address").is_none());
        assert!(parsed.get("details").is_none());
    }

    #[test]
    fn builders_fill_optional_fields() {
        let entry = DiagEntry::new(DiagLevel::Fatal, "chain_violation")
            .with_context(ContextId::new(3))
            .with_address(0xdead0)
            .with_record(42)
            .with_operation(RecordKind::Free)
            .with_details(serde_json::json!({"reason": "unknown address"}));
        let parsed: serde_json::Value = serde_json::from_str(&entry.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed["context_id"], 3);
        assert_eq!(parsed["address"], "0xdead0");
        assert_eq!(parsed["record_id"], 42);
        assert_eq!(parsed["operation"], "free");
        assert_eq!(parsed["details"]["reason"], "unknown address");

        let back: DiagEntry = serde_json::from_str(&entry.to_jsonl().unwrap()).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn sink_filters_by_level() {
        let mut sink = DiagSink::to_buffer(DiagLevel::Warn);
        assert!(!sink.emit(&DiagEntry::new(DiagLevel::Debug, "noise")).unwrap());
        assert!(sink.emit(&DiagEntry::new(DiagLevel::Warn, "kept")).unwrap());
        assert!(sink.emit(&DiagEntry::new(DiagLevel::Fatal, "also_kept")).unwrap());
        let lines = sink.buffered_lines().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"kept\""));
    }

    #[test]
    fn filtered_entries_are_never_built() {
        let mut sink = DiagSink::to_buffer(DiagLevel::Info);
        let written = sink
            .emit_with(DiagLevel::Debug, || unreachable!("filtered entry was built"))
            .unwrap();
        assert!(!written);
        assert!(
            sink.emit_with(DiagLevel::Info, || DiagEntry::new(DiagLevel::Info, "session_start"))
                .unwrap()
        );
        assert_eq!(sink.buffered_lines().unwrap().len(), 1);
    }

    #[test]
    fn level_ordering_and_parsing() {
        assert!(DiagLevel::Trace < DiagLevel::Debug);
        assert!(DiagLevel::Error < DiagLevel::Fatal);
        assert_eq!(DiagLevel::from_str_loose("ERROR"), DiagLevel::Error);
        assert_eq!(DiagLevel::from_str_loose("loud"), DiagLevel::Warn);
    }

    #[test]
    fn stderr_sink_has_no_buffer() {
        assert!(DiagSink::to_stderr(DiagLevel::Info).buffered_lines().is_none());
    }
}
