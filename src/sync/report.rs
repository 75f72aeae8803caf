//! Fan-out of results and conflicts to observers.
//!
//! Built on a broadcast channel: a subscriber that falls behind loses the
//! oldest messages, the pipeline never waits for it.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::sync::conflict::ConflictRecord;
use crate::sync::task::SyncResult;

const DEFAULT_CAPACITY: usize = 1024;

/// A failure that will not be retried.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalFailure {
    pub target: Option<String>,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncReport {
    Transfer(SyncResult),
    Conflict(ConflictRecord),
    TerminalFailure(TerminalFailure),
}

#[derive(Debug, Clone)]
pub struct Reporter {
    sender: broadcast::Sender<SyncReport>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Reporter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncReport> {
        self.sender.subscribe()
    }

    /// Fire and forget; having no subscribers is fine.
    pub fn publish(&self, report: SyncReport) {
        let _ = self.sender.send(report);
    }

    pub fn transfer(&self, result: SyncResult) {
        self.publish(SyncReport::Transfer(result));
    }

    pub fn conflict(&self, record: ConflictRecord) {
        self.publish(SyncReport::Conflict(record));
    }

    pub fn terminal(&self, target: Option<&str>, path: &str, reason: impl Into<String>) {
        self.publish(SyncReport::TerminalFailure(TerminalFailure {
            target: target.map(str::to_string),
            path: path.to_string(),
            reason: reason.into(),
        }));
    }
}

/// Log every report until the channel closes.
pub async fn log_reports(mut receiver: broadcast::Receiver<SyncReport>) {
    loop {
        match receiver.recv().await {
            Ok(SyncReport::Transfer(result)) => {
                if result.success {
                    debug!(
                        target_id = %result.task.target_id,
                        path = %result.task.relative_path,
                        action = %result.task.action,
                        duration_ms = result.duration_ms,
                        "transfer succeeded"
                    );
                } else {
                    warn!(
                        target_id = %result.task.target_id,
                        path = %result.task.relative_path,
                        action = %result.task.action,
                        attempt = result.task.attempt,
                        error = result.error_message.as_deref().unwrap_or(""),
                        "transfer failed"
                    );
                }
            }
            Ok(SyncReport::Conflict(record)) => {
                warn!(
                    path = %record.relative_path,
                    conflict = %record.conflict_type,
                    resolution = record.resolution.map(|r| r.as_str()).unwrap_or("pending"),
                    "conflict detected"
                );
            }
            Ok(SyncReport::TerminalFailure(failure)) => {
                error!(
                    target_id = failure.target.as_deref().unwrap_or("-"),
                    path = %failure.path,
                    reason = %failure.reason,
                    "giving up"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "report logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
