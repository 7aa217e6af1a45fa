//! Append-only JSON-lines event log.
//!
//! Single writer (the daemon), many readers: consumers seek to the end and
//! tail newline-framed lines. An SSE bridge frames each line as
//! `data: <line>\n\n` with periodic comment heartbeats so idle HTTP clients
//! stay alive.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::Result;
use crate::util;

pub const SSE_HEARTBEAT: &[u8] = b": heartbeat\n\n";
pub const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// The daemon's event emitter.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        EventLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `{ts, event, ...fields}` as one line. Logging the event must
    /// never take the daemon down; failures are warned and dropped.
    pub fn emit(&self, kind: &str, fields: Value) {
        if let Err(e) = self.try_emit(kind, fields) {
            warn!(event = kind, error = %e, "event log append failed");
        }
    }

    fn try_emit(&self, kind: &str, fields: Value) -> Result<()> {
        let mut line = Map::new();
        line.insert("ts".into(), Value::from(util::unix_ts()));
        line.insert("event".into(), Value::from(kind));
        if let Value::Object(extra) = fields {
            for (k, v) in extra {
                line.insert(k, v);
            }
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut encoded = serde_json::to_vec(&Value::Object(line))?;
        encoded.push(b'\n');
        file.write_all(&encoded)?;
        Ok(())
    }
}

/// Reader that follows the log from its current end.
pub struct EventTail {
    file: std::fs::File,
    partial: Vec<u8>,
}

impl EventTail {
    /// Open and seek to the end; only lines appended afterwards are seen.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        file.seek(SeekFrom::End(0))?;
        Ok(EventTail {
            file,
            partial: Vec::new(),
        })
    }

    /// Drain any complete lines appended since the last poll.
    pub fn poll_lines(&mut self) -> Result<Vec<String>> {
        let mut chunk = Vec::new();
        self.file.read_to_end(&mut chunk)?;
        self.partial.extend_from_slice(&chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        Ok(lines)
    }
}

/// One SSE frame for a log line.
pub fn sse_frame(line: &str) -> String {
    format!("data: {line}\n\n")
}

/// Pump the tail into an SSE consumer until the write side fails (client
/// gone) — the normal way this returns.
pub async fn tail_to_sse<W: AsyncWrite + Unpin>(path: &Path, mut out: W) -> Result<()> {
    let mut tail = EventTail::open(path)?;
    let mut heartbeat = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut poll = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            _ = poll.tick() => {
                for line in tail.poll_lines()? {
                    out.write_all(sse_frame(&line).as_bytes()).await?;
                }
                out.flush().await?;
            }
            _ = heartbeat.tick() => {
                out.write_all(SSE_HEARTBEAT).await?;
                out.flush().await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emit_appends_json_lines_with_ts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = EventLog::new(&path);
        log.emit("MODE", json!({"mode": "BRIDGE"}));
        log.emit("RECORD_START", json!({}));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "MODE");
        assert_eq!(first["mode"], "BRIDGE");
        assert!(first["ts"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn tail_sees_only_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = EventLog::new(&path);
        log.emit("OLD", json!({}));

        let mut tail = EventTail::open(&path).unwrap();
        assert!(tail.poll_lines().unwrap().is_empty());

        log.emit("NEW", json!({"n": 1}));
        log.emit("NEW", json!({"n": 2}));
        let lines = tail.poll_lines().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"n\":1") || lines[0].contains("\"n\": 1"));
    }

    #[test]
    fn sse_framing() {
        assert_eq!(sse_frame("{\"a\":1}"), "data: {\"a\":1}\n\n");
        assert_eq!(SSE_HEARTBEAT, b": heartbeat\n\n");
    }
}
