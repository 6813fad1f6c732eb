//! Audit feed of scheduler events.
//!
//! One JSON object per line in `<root>/.runtime/events.jsonl`. Recording is
//! best effort: a failed append is logged and never fails the operation
//! that produced the event.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use fleet_state::RUNTIME_DIR;

pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Enqueue,
    Dispatch,
    DispatchFailed,
    Quarantine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub actor: String,
    pub item: String,
    pub partition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<u32>,
}

impl Event {
    pub fn new(kind: EventKind, actor: &str, item: &str, partition: &str) -> Self {
        Self {
            ts: Utc::now(),
            kind,
            actor: actor.to_string(),
            item: item.to_string(),
            partition: partition.to_string(),
            worker: None,
            reason: None,
            failures: None,
        }
    }

    pub fn with_worker(mut self, worker: Option<String>) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_failures(mut self, failures: u32) -> Self {
        self.failures = Some(failures);
        self
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Appends events to the fleet's JSON-lines feed.
#[derive(Debug)]
pub struct FileEventLog {
    path: PathBuf,
    write: Mutex<()>,
}

impl FileEventLog {
    pub fn for_root(root: &Path) -> Self {
        Self::at(root.join(RUNTIME_DIR).join(EVENTS_FILE))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &Event) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)
    }
}

impl EventSink for FileEventLog {
    fn record(&self, event: Event) {
        if let Err(e) = self.append(&event) {
            warn!(path = %self.path.display(), error = %e, "failed to append event");
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

impl EventSink for MemoryEventLog {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
