//! JSONL access log of proxied chat requests.
//!
//! One [`AccessEntry`] is written per chat request when its response
//! finishes (buffered reply sent, stream ended, or client gone). The most
//! recent entries are also kept in memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

/// How a proxied request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Upstream answered 2xx and the whole reply reached the client.
    Completed,
    /// Upstream answered non-2xx; its body was relayed verbatim.
    UpstreamStatus,
    /// Rejected or failed before or while contacting upstream.
    Failed,
    /// Upstream stream broke after it had started.
    Interrupted,
    /// Client went away before the stream ended.
    Disconnected,
    /// Server shutdown ended the stream.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub dialect: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub streaming: bool,
    pub status: u16,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<usize>,
    pub bytes: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct AccessLog {
    entries: VecDeque<AccessEntry>,
    writer: Option<BufWriter<File>>,
}

impl AccessLog {
    /// Open (or create) a JSONL file, reloading its tail into memory.
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();

        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut entries = VecDeque::with_capacity(MAX_LOG_ENTRIES);

        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<AccessEntry>(&line) {
                    if entries.len() >= MAX_LOG_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(Self {
            entries,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Memory-only log.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            writer: None,
        }
    }

    pub fn record(&mut self, entry: AccessEntry) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{json}");
                let _ = writer.flush();
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<AccessEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

#[derive(Clone)]
pub struct SharedAccessLog(Arc<Mutex<AccessLog>>);

impl SharedAccessLog {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(AccessLog::open(file_path)?))))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(AccessLog::in_memory())))
    }

    pub fn record(&self, entry: AccessEntry) {
        if let Ok(mut log) = self.0.lock() {
            log.record(entry);
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<AccessEntry> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, outcome: Outcome) -> AccessEntry {
        AccessEntry {
            timestamp: Utc::now(),
            session_id: id.to_string(),
            dialect: "anthropic".to_string(),
            model: Some("claude-sonnet-4-20250514".to_string()),
            streaming: true,
            status: 200,
            outcome,
            frames: Some(3),
            bytes: 120,
            duration_ms: 5,
            error: None,
        }
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("access.jsonl");

        let log = SharedAccessLog::open(&path).unwrap();
        log.record(entry("a", Outcome::Completed));
        log.record(entry("b", Outcome::Disconnected));

        let reopened = SharedAccessLog::open(&path).unwrap();
        let recent = reopened.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].session_id, "b");
        assert_eq!(recent[0].outcome, Outcome::Disconnected);
        assert_eq!(recent[1].session_id, "a");
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&entry("x", Outcome::UpstreamStatus)).unwrap();
        assert!(json.contains("\"outcome\":\"upstream_status\""));
        assert!(!json.contains("\"error\""));
    }
}
