//! Task store change events.
//!
//! Every mutation of the task store publishes a [`StoreEvent`] on a
//! broadcast channel. Consumers either subscribe in-process or have the
//! events written as JSON lines to stdout or a file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::task::{BackendId, LocalId, Task, TaskStatus};

pub const EVENT_SCHEMA_VERSION: &str = "fleetjobs.event.v1";

/// Change notifications published by the task store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    TaskInserted {
        task: Box<Task>,
    },
    TaskUpdated {
        task: Box<Task>,
    },
    TaskBound {
        id: LocalId,
        backend_id: BackendId,
    },
    TaskRemoved {
        id: LocalId,
    },
    TaskMarkedUnknown {
        id: LocalId,
        previous: TaskStatus,
    },
    TaskTimedOut {
        id: LocalId,
    },
    SnapshotApplied {
        records: usize,
        changed: usize,
    },
    StoreReset,
}

impl StoreEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreEvent::TaskInserted { .. } => "task_inserted",
            StoreEvent::TaskUpdated { .. } => "task_updated",
            StoreEvent::TaskBound { .. } => "task_bound",
            StoreEvent::TaskRemoved { .. } => "task_removed",
            StoreEvent::TaskMarkedUnknown { .. } => "task_marked_unknown",
            StoreEvent::TaskTimedOut { .. } => "task_timed_out",
            StoreEvent::SnapshotApplied { .. } => "snapshot_applied",
            StoreEvent::StoreReset => "store_reset",
        }
    }

    /// The local task this event concerns, if any.
    pub fn task_id(&self) -> Option<&LocalId> {
        match self {
            StoreEvent::TaskInserted { task } | StoreEvent::TaskUpdated { task } => Some(&task.id),
            StoreEvent::TaskBound { id, .. }
            | StoreEvent::TaskRemoved { id }
            | StoreEvent::TaskMarkedUnknown { id, .. }
            | StoreEvent::TaskTimedOut { id } => Some(id),
            StoreEvent::SnapshotApplied { .. } | StoreEvent::StoreReset => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EventDestination {
    Stdout,
    File(PathBuf),
}

impl EventDestination {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        raw.and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed == "-" {
                return Some(EventDestination::Stdout);
            }
            Some(EventDestination::File(PathBuf::from(trimmed)))
        })
    }

    pub fn open(&self) -> Result<EventSink> {
        match self {
            EventDestination::Stdout => Ok(EventSink::stdout()),
            EventDestination::File(path) => EventSink::file(path),
        }
    }
}

/// A store event stamped for external consumers.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    pub schema_version: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: &'a StoreEvent,
}

impl<'a> Envelope<'a> {
    pub fn new(event: &'a StoreEvent) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Event sink that writes JSONL output to a destination.
pub struct EventSink {
    writer: Box<dyn Write + Send>,
}

impl EventSink {
    pub fn stdout() -> Self {
        Self {
            writer: Box::new(std::io::stdout()),
        }
    }

    /// Emit events to a file, creating it if necessary.
    pub fn file(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Box::new(file),
        })
    }

    /// Write a single event as JSONL.
    pub fn emit(&mut self, event: &StoreEvent) -> Result<()> {
        let serialized = serde_json::to_vec(&Envelope::new(event))?;
        self.writer.write_all(&serialized)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush().map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_parsing() {
        assert!(EventDestination::parse(None).is_none());
        assert!(EventDestination::parse(Some("  ")).is_none());
        assert!(matches!(
            EventDestination::parse(Some("-")),
            Some(EventDestination::Stdout)
        ));
        assert!(matches!(
            EventDestination::parse(Some("events.jsonl")),
            Some(EventDestination::File(_))
        ));
    }

    #[test]
    fn sink_writes_tagged_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let mut sink = EventSink::file(&path).expect("sink");
        sink.emit(&StoreEvent::TaskBound {
            id: LocalId::from("t-a"),
            backend_id: BackendId(4),
        })
        .expect("emit");
        sink.emit(&StoreEvent::SnapshotApplied {
            records: 3,
            changed: 1,
        })
        .expect("emit");

        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["schema_version"], EVENT_SCHEMA_VERSION);
        assert_eq!(lines[0]["event"], "task_bound");
        assert_eq!(lines[0]["backend_id"], 4);
        assert_eq!(lines[1]["event"], "snapshot_applied");
        assert_eq!(lines[1]["changed"], 1);
    }
}
