//! Outbound job events — plain structured records the host can forward
//! to a message bus. The core only publishes; transport is external.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::definition::RunStatus;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Registered,
    Fired,
    Succeeded,
    Failed,
    Skipped,
    Paused,
    Resumed,
    Deleted,
    ProjectionFailed,
}

/// One structured event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub name: String,
    pub kind: JobEventKind,
    pub at: DateTime<Utc>,
    /// Error message, skip reason, or other free-form detail.
    pub detail: Option<String>,
}

impl JobEvent {
    pub fn new(job_id: &str, name: &str, kind: JobEventKind) -> Self {
        Self {
            job_id: job_id.to_string(),
            name: name.to_string(),
            kind,
            at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn from_status(job_id: &str, name: &str, status: RunStatus) -> Self {
        let kind = match status {
            RunStatus::Success => JobEventKind::Succeeded,
            RunStatus::Failure => JobEventKind::Failed,
            RunStatus::Skipped => JobEventKind::Skipped,
        };
        Self::new(job_id, name, kind)
    }
}

/// Fan-out point for job events, with a bounded in-memory history ring
/// for dashboards and diagnostics.
pub struct EventHub {
    tx: broadcast::Sender<JobEvent>,
    history: Mutex<Vec<JobEvent>>,
    history_cap: usize,
}

impl EventHub {
    pub fn new(history_cap: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            history: Mutex::new(Vec::new()),
            history_cap,
        }
    }

    /// Publish an event. Lagging or absent subscribers are fine.
    pub fn publish(&self, event: JobEvent) {
        {
            let mut history = self.history.lock().expect("event history poisoned");
            history.push(event.clone());
            let cap = self.history_cap.max(1);
            if history.len() > cap {
                let overflow = history.len() - cap;
                history.drain(..overflow);
            }
        }
        let _ = self.tx.send(event);
    }

    /// Subscribe to the live stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Snapshot of recent events, oldest first.
    pub fn history(&self) -> Vec<JobEvent> {
        self.history.lock().expect("event history poisoned").clone()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(100)
    }
}
