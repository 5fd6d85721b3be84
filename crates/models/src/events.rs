use crate::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a progress event pushed to the transport layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskStarted,
    TaskProgress,
    TaskProblemCompleted,
    TaskCompleted,
    TaskFailed,
}

/// Ephemeral progress event. Per-problem events are emitted in
/// state-machine order; ordering across problems is unspecified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub task_id: Uuid,
    #[serde(default)]
    pub problem_id: Option<String>,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress_pct: Option<u8>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    pub ts: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, task_id: Uuid) -> Self {
        Self {
            kind,
            task_id,
            problem_id: None,
            stage: None,
            status: None,
            progress_pct: None,
            payload: None,
            ts: Utc::now(),
        }
    }

    pub fn with_problem(mut self, pid: impl Into<String>) -> Self {
        self.problem_id = Some(pid.into());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
