//! Transcript files written by the agent subprocess, read by the Health
//! Supervisor (§4.5, §6 "Transcript file format").
//!
//! The agent (not this crate) appends one JSON object per turn to
//! `<base_dir>/<sanitized session_name>.jsonl`: `{type, timestamp,
//! message:{content:[...]}}`. This module only reads that file — the
//! supervisor needs the tail (~128 KiB) to regex-scan for fatal patterns
//! and the last few minutes of assistant text for the deep classifier —
//! plus a thin writer used by tests and by the master/background sessions
//! that do keep their own transcript.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sa_domain::error::{Error, Result};

/// Bytes read from EOF for the Tier 1 regex scan (§4.5).
pub const TAIL_SCAN_BYTES: u64 = 128 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub message: TranscriptMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub content: Vec<serde_json::Value>,
}

pub struct TranscriptReader {
    base_dir: PathBuf,
}

impl TranscriptReader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, session_name: &str) -> PathBuf {
        path_for_dir(&self.base_dir, session_name)
    }

    /// Read the last `TAIL_SCAN_BYTES` of the session's transcript as raw
    /// text, for a fatal-pattern regex scan. Missing files read as empty —
    /// a brand-new session simply has nothing fatal yet.
    pub fn tail_raw(&self, session_name: &str) -> Result<String> {
        let path = self.path_for(session_name);
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let len = file.metadata().map_err(Error::Io)?.len();
        let start = len.saturating_sub(TAIL_SCAN_BYTES);
        file.seek(SeekFrom::Start(start)).map_err(Error::Io)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf).map_err(Error::Io)?;
        Ok(buf)
    }

    /// Concatenated assistant text blocks from records timestamped within
    /// `since` of now, for the Tier 2 classifier prompt (§4.5).
    pub fn recent_assistant_text(&self, session_name: &str, since: chrono::Duration) -> Result<String> {
        let raw = self.tail_raw(session_name)?;
        let cutoff = Utc::now() - since;
        let mut out = String::new();
        for line in raw.lines() {
            let Ok(record) = serde_json::from_str::<TranscriptRecord>(line) else {
                continue;
            };
            if record.kind != "assistant" || record.timestamp < cutoff {
                continue;
            }
            for part in &record.message.content {
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    out.push_str(text);
                    out.push('\n');
                }
            }
        }
        Ok(out)
    }
}

/// Thin append-only writer, used by sessions that maintain their own
/// transcript file directly (master/background) rather than relying on the
/// agent subprocess to have written one.
pub struct TranscriptWriter {
    base_dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn append(&self, session_name: &str, kind: &str, text: &str) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir).map_err(Error::Io)?;
        let path = path_for_dir(&self.base_dir, session_name);
        let record = TranscriptRecord {
            kind: kind.to_string(),
            timestamp: Utc::now(),
            message: TranscriptMessage {
                content: vec![serde_json::json!({"type": "text", "text": text})],
            },
        };
        let line = serde_json::to_string(&record)?;

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;
        writeln!(file, "{line}").map_err(Error::Io)?;
        Ok(())
    }
}

fn path_for_dir(dir: &Path, session_name: &str) -> PathBuf {
    dir.join(session_name.replace('/', "_")).with_extension("jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_line(dir: &Path, session_name: &str, kind: &str, timestamp: DateTime<Utc>, text: &str) {
        let path = path_for_dir(dir, session_name);
        let record = TranscriptRecord {
            kind: kind.into(),
            timestamp,
            message: TranscriptMessage {
                content: vec![serde_json::json!({"type": "text", "text": text})],
            },
        };
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        writeln!(file, "{}", serde_json::to_string(&record).unwrap()).unwrap();
    }

    #[test]
    fn missing_file_tails_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reader = TranscriptReader::new(dir.path());
        assert_eq!(reader.tail_raw("imessage/+15555551234").unwrap(), "");
    }

    #[test]
    fn tail_raw_contains_fatal_pattern() {
        let dir = tempfile::tempdir().unwrap();
        write_line(
            dir.path(),
            "imessage/+15555551234",
            "system",
            Utc::now(),
            "API Error: 400 invalid_request_error occurred",
        );
        let reader = TranscriptReader::new(dir.path());
        let tail = reader.tail_raw("imessage/+15555551234").unwrap();
        assert!(tail.contains("invalid_request_error"));
    }

    #[test]
    fn recent_assistant_text_excludes_old_records() {
        let dir = tempfile::tempdir().unwrap();
        write_line(
            dir.path(),
            "imessage/+1",
            "assistant",
            Utc::now() - chrono::Duration::minutes(30),
            "stale text",
        );
        write_line(dir.path(), "imessage/+1", "assistant", Utc::now(), "fresh text");
        let reader = TranscriptReader::new(dir.path());
        let text = reader
            .recent_assistant_text("imessage/+1", chrono::Duration::minutes(5))
            .unwrap();
        assert!(text.contains("fresh text"));
        assert!(!text.contains("stale text"));
    }

    #[test]
    fn recent_assistant_text_ignores_non_assistant_records() {
        let dir = tempfile::tempdir().unwrap();
        write_line(dir.path(), "imessage/+1", "user", Utc::now(), "user said hi");
        let reader = TranscriptReader::new(dir.path());
        let text = reader
            .recent_assistant_text("imessage/+1", chrono::Duration::minutes(5))
            .unwrap();
        assert!(text.is_empty());
    }

    #[test]
    fn writer_then_reader_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer.append("imessage/+1", "assistant", "hello there").unwrap();
        let reader = TranscriptReader::new(dir.path());
        let text = reader
            .recent_assistant_text("imessage/+1", chrono::Duration::minutes(5))
            .unwrap();
        assert!(text.contains("hello there"));
    }
}
