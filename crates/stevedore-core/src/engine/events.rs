use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Normalized event kinds emitted over the run's event stream and
/// persisted to the optional events.jsonl log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunFinished,
    NodeStarted,
    NodeFinished,
    NodeSkipped,
    HandlerStarted,
    HandlerFinished,
}

/// A single event, one JSON object per line on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub node: Option<String>,
    pub data: serde_json::Value,
}

impl RunEvent {
    pub fn new(kind: EventKind, node: Option<String>, data: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            node,
            data,
        }
    }
}

/// Append-only writer for events.jsonl.
pub struct EventWriter {
    file: std::fs::File,
}

impl EventWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::Internal(format!("opening event log '{}': {e}", path.display())))?;
        Ok(Self { file })
    }

    pub fn write_event(&mut self, event: &RunEvent) -> Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| Error::Internal(format!("serializing event: {e}")))?;
        writeln!(self.file, "{line}")
            .map_err(|e| Error::Internal(format!("writing event log: {e}")))?;
        self.file
            .flush()
            .map_err(|e| Error::Internal(format!("flushing event log: {e}")))?;
        Ok(())
    }
}

/// Reader for replaying a persisted event log.
pub struct EventReader;

impl EventReader {
    pub fn read_all(path: &Path) -> Result<Vec<RunEvent>> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Internal(format!("opening event log '{}': {e}", path.display())))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.map_err(|e| Error::Internal(format!("reading event log: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: RunEvent = serde_json::from_str(&line)
                .map_err(|e| Error::Internal(format!("parsing event log line: {e}")))?;
            events.push(event);
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn event_write_and_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.jsonl");

        let mut writer = EventWriter::create(&path).unwrap();
        writer
            .write_event(&RunEvent::new(
                EventKind::RunStarted,
                None,
                serde_json::json!({"workflow_id": "wf"}),
            ))
            .unwrap();
        writer
            .write_event(&RunEvent::new(
                EventKind::NodeStarted,
                Some("build".to_string()),
                serde_json::json!({}),
            ))
            .unwrap();
        writer
            .write_event(&RunEvent::new(
                EventKind::RunFinished,
                None,
                serde_json::json!({"success": true}),
            ))
            .unwrap();
        drop(writer);

        let events = EventReader::read_all(&path).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::RunStarted);
        assert_eq!(events[1].node.as_deref(), Some("build"));
        assert_eq!(events[2].kind, EventKind::RunFinished);
    }

    #[test]
    fn one_line_per_event() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.jsonl");

        let mut writer = EventWriter::create(&path).unwrap();
        for _ in 0..2 {
            writer
                .write_event(&RunEvent::new(EventKind::NodeSkipped, None, serde_json::json!({})))
                .unwrap();
        }
        drop(writer);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            let _: RunEvent = serde_json::from_str(line).unwrap();
        }
    }
}
