//! Transfer tasks and their outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::sync::event::{EventKind, FileEvent};

/// What a task does to a path on one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// Copy local content to the target.
    Push,
    /// Remove the path on the target.
    Delete,
    /// Copy the target's content into the watched tree.
    Pull,
    /// Remove the path from the watched tree.
    DeleteLocal,
}

impl SyncAction {
    /// Action for a coalesced event.
    pub fn for_event(kind: EventKind) -> Self {
        match kind {
            EventKind::Delete | EventKind::MoveFrom => Self::Delete,
            EventKind::Create | EventKind::Modify | EventKind::MoveTo | EventKind::AttribChange => {
                Self::Push
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Delete => "delete",
            Self::Pull => "pull",
            Self::DeleteLocal => "delete_local",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transfer of one path to one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: Uuid,
    pub target_id: String,
    pub relative_path: String,
    pub action: SyncAction,
    pub is_dir: bool,
    /// Event that produced the task; absent for retries and resolutions.
    pub source_event: Option<FileEvent>,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl SyncTask {
    pub fn new(target_id: impl Into<String>, relative_path: impl Into<String>, action: SyncAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id: target_id.into(),
            relative_path: relative_path.into(),
            action,
            is_dir: false,
            source_event: None,
            attempt: 1,
            created_at: Utc::now(),
        }
    }

    pub fn from_event(target_id: impl Into<String>, event: &FileEvent) -> Self {
        Self {
            is_dir: event.is_dir,
            source_event: Some(event.clone()),
            ..Self::new(target_id, event.path.clone(), SyncAction::for_event(event.kind))
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub task: SyncTask,
    pub success: bool,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    /// Retrying will not help (authentication, unknown module).
    #[serde(default)]
    pub permanent: bool,
}

impl SyncResult {
    pub fn succeeded(task: SyncTask, duration_ms: u64) -> Self {
        Self {
            task,
            success: true,
            duration_ms,
            error_message: None,
            permanent: false,
        }
    }

    pub fn failed(task: SyncTask, duration_ms: u64, message: impl Into<String>, permanent: bool) -> Self {
        Self {
            task,
            success: false,
            duration_ms,
            error_message: Some(message.into()),
            permanent,
        }
    }
}
