use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::distance::{Algorithm, RankedWord};

/// Lifecycle position of a search task. Only the worker running the task
/// moves it forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Started,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Status-specific part of a notification, tagged by `status` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    Started {
        word: String,
        algorithm: Algorithm,
    },
    Progress {
        progress: u8,
        current_word: String,
    },
    Completed {
        execution_time: f64,
        results: Vec<RankedWord>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub task_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(task_id: &str, payload: EventPayload) -> Self {
        Self {
            task_id: task_id.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self.payload {
            EventPayload::Started { .. } => TaskStatus::Started,
            EventPayload::Progress { .. } => TaskStatus::Running,
            EventPayload::Completed { .. } => TaskStatus::Completed,
            EventPayload::Failed { .. } => TaskStatus::Failed,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
