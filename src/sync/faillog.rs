//! Durable retry log for failed transfers.
//!
//! The log is a JSON Lines file. Every state change appends one line:
//! `pending` when a task fails and will be retried, `resolved` when a later
//! attempt succeeds, `abandoned` when the attempt cap is reached. Lines are
//! folded by (target, path), last one wins: only the latest action for a
//! path is ever retried. Start-up and every retry tick rewrite the file
//! atomically with only the pending entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::sync::atomic::write_atomic;
use crate::sync::dispatcher::{Dispatcher, Submission};
use crate::sync::report::Reporter;
use crate::sync::task::{SyncAction, SyncResult, SyncTask};

/// Cap for failures classified as permanent.
const PERMANENT_ATTEMPT_CAP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Resolved,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailEntry {
    pub target: String,
    pub relative_path: String,
    pub action: SyncAction,
    pub attempt_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub permanent: bool,
    pub state: EntryState,
}

impl FailEntry {
    fn key(&self) -> FailKey {
        (self.target.clone(), self.relative_path.clone())
    }

    /// The next attempt of this entry.
    pub fn to_task(&self) -> SyncTask {
        let mut task = SyncTask::new(&self.target, &self.relative_path, self.action)
            .with_attempt(self.attempt_count + 1);
        task.is_dir = self.is_dir;
        task
    }
}

/// What happened to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Scheduled { attempt_count: u32 },
    Abandoned { attempt_count: u32 },
    /// A retry failed after a newer task for the same path took its place.
    Superseded,
}

type FailKey = (String, String);

fn task_key(task: &SyncTask) -> FailKey {
    (task.target_id.clone(), task.relative_path.clone())
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<FailKey, FailEntry>,
    /// Entries handed to the dispatcher and not yet reported back.
    retrying: HashSet<FailKey>,
}

#[derive(Debug)]
pub struct FailLog {
    path: PathBuf,
    max_attempts: u32,
    inner: Mutex<Inner>,
}

impl FailLog {
    /// Load the log, dropping resolved and abandoned entries.
    pub fn open(path: impl Into<PathBuf>, max_attempts: u32) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(e, "creating", parent))?;
        }

        let entries = load_entries(&path)?;
        if !entries.is_empty() {
            info!(pending = entries.len(), path = %path.display(), "loaded fail log");
        }
        rewrite(&path, &entries)?;

        Ok(Self {
            path,
            max_attempts: max_attempts.max(1),
            inner: Mutex::new(Inner {
                entries,
                retrying: HashSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record a failed attempt and decide whether it will be retried.
    pub async fn record_failure(&self, result: &SyncResult) -> Result<FailOutcome> {
        let task = &result.task;
        let key = task_key(task);
        let now = Utc::now();
        let message = result.error_message.clone().unwrap_or_default();

        let mut inner = self.inner.lock().await;

        let current = inner.entries.get(&key).map(|e| e.action);
        if task.attempt > 1 && current != Some(task.action) {
            debug!(
                target_id = %task.target_id,
                path = %task.relative_path,
                action = %task.action,
                "stale retry failed, newer task owns the path"
            );
            return Ok(FailOutcome::Superseded);
        }
        inner.retrying.remove(&key);

        // A fresh failure of another action replaces the pending one.
        let existing = inner.entries.remove(&key).filter(|e| e.action == task.action);
        let mut entry = existing.unwrap_or_else(|| FailEntry {
            target: task.target_id.clone(),
            relative_path: task.relative_path.clone(),
            action: task.action,
            attempt_count: 0,
            first_failed_at: now,
            last_failed_at: now,
            last_error: String::new(),
            is_dir: task.is_dir,
            permanent: false,
            state: EntryState::Pending,
        });
        entry.attempt_count = entry.attempt_count.max(task.attempt);
        entry.last_failed_at = now;
        entry.last_error = message;
        entry.permanent = result.permanent;

        let cap = if result.permanent {
            self.max_attempts.min(PERMANENT_ATTEMPT_CAP)
        } else {
            self.max_attempts
        };

        if entry.attempt_count >= cap {
            entry.state = EntryState::Abandoned;
            self.append(&entry)?;
            warn!(
                target_id = %entry.target,
                path = %entry.relative_path,
                action = %entry.action,
                attempts = entry.attempt_count,
                "task abandoned"
            );
            return Ok(FailOutcome::Abandoned {
                attempt_count: entry.attempt_count,
            });
        }

        entry.state = EntryState::Pending;
        self.append(&entry)?;
        let attempt_count = entry.attempt_count;
        inner.entries.insert(key, entry);
        debug!(target_id = %task.target_id, path = %task.relative_path, attempt_count, "task scheduled for retry");
        Ok(FailOutcome::Scheduled { attempt_count })
    }

    /// Clear the pending entry of the path after a successful attempt,
    /// whatever its action: the path now matches the latest local state.
    /// Returns whether one existed.
    pub async fn record_success(&self, task: &SyncTask) -> Result<bool> {
        self.finish(task, EntryState::Resolved, None).await
    }

    /// Drop a pending entry that can no longer be retried.
    pub async fn abandon(&self, task: &SyncTask, reason: &str) -> Result<bool> {
        self.finish(task, EntryState::Abandoned, Some(reason)).await
    }

    async fn finish(&self, task: &SyncTask, state: EntryState, reason: Option<&str>) -> Result<bool> {
        let key = task_key(task);
        let mut inner = self.inner.lock().await;
        let owned = inner
            .entries
            .get(&key)
            .is_some_and(|e| state == EntryState::Resolved || e.action == task.action);
        if !owned {
            return Ok(false);
        }
        inner.retrying.remove(&key);
        match inner.entries.remove(&key) {
            Some(mut entry) => {
                entry.state = state;
                if let Some(reason) = reason {
                    entry.last_error = reason.to_string();
                }
                self.append(&entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Hand back an entry taken by [`FailLog::due`] that was never submitted.
    pub async fn release(&self, task: &SyncTask) {
        self.inner.lock().await.retrying.remove(&task_key(task));
    }

    /// Pending entries not already being retried, as next-attempt tasks.
    pub async fn due(&self) -> Vec<SyncTask> {
        let mut inner = self.inner.lock().await;
        let mut due: Vec<(DateTime<Utc>, SyncTask)> = Vec::new();
        let keys: Vec<FailKey> = inner
            .entries
            .keys()
            .filter(|k| !inner.retrying.contains(*k))
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = inner.entries.get(&key) {
                due.push((entry.first_failed_at, entry.to_task()));
            }
            inner.retrying.insert(key);
        }
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, task)| task).collect()
    }

    pub async fn pending(&self) -> Vec<FailEntry> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<FailEntry> = inner.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.first_failed_at);
        entries
    }

    pub async fn contains(&self, target: &str, path: &str, action: SyncAction) -> bool {
        let key = (target.to_string(), path.to_string());
        self.inner
            .lock()
            .await
            .entries
            .get(&key)
            .is_some_and(|e| e.action == action)
    }

    /// Rewrite the file with pending entries only.
    pub async fn compact(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        rewrite(&self.path, &inner.entries)
    }

    fn append(&self, entry: &FailEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SyncError::io(e, "opening", &self.path))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| SyncError::io(e, "appending to", &self.path))
    }
}

/// Read only the pending entries of a log file, e.g. for inspection while
/// a daemon owns it.
pub fn read_pending(path: &Path) -> Result<Vec<FailEntry>> {
    let mut entries: Vec<FailEntry> = load_entries(path)?.into_values().collect();
    entries.sort_by_key(|e| e.first_failed_at);
    Ok(entries)
}

fn load_entries(path: &Path) -> Result<HashMap<FailKey, FailEntry>> {
    let mut entries = HashMap::new();
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(SyncError::io(e, "opening", path)),
    };

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| SyncError::io(e, "reading", path))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: FailEntry = match serde_json::from_str(&line) {
            Ok(entry) => entry,
            Err(e) => {
                // A torn final line after a crash is expected.
                warn!(path = %path.display(), line = index + 1, error = %e, "skipping malformed fail log line");
                continue;
            }
        };
        match entry.state {
            EntryState::Pending => {
                entries.insert(entry.key(), entry);
            }
            EntryState::Resolved | EntryState::Abandoned => {
                entries.remove(&entry.key());
            }
        }
    }
    Ok(entries)
}

fn rewrite(path: &Path, entries: &HashMap<FailKey, FailEntry>) -> Result<()> {
    let mut sorted: Vec<&FailEntry> = entries.values().collect();
    sorted.sort_by_key(|e| e.first_failed_at);
    let mut buffer = Vec::new();
    for entry in sorted {
        serde_json::to_writer(&mut buffer, entry)?;
        buffer.push(b'\n');
    }
    write_atomic(path, &buffer)
}

/// Periodically re-submits pending entries to the dispatcher.
pub struct RetryExecutor {
    faillog: Arc<FailLog>,
    dispatcher: Arc<Dispatcher>,
    reporter: Reporter,
    interval: Duration,
}

impl RetryExecutor {
    pub fn new(faillog: Arc<FailLog>, dispatcher: Arc<Dispatcher>, reporter: Reporter, interval: Duration) -> Self {
        Self {
            faillog,
            dispatcher,
            reporter,
            interval,
        }
    }

    /// Compact the log and re-submit everything due. Returns the number of
    /// tasks handed to the dispatcher.
    pub async fn tick(&self) -> Result<usize> {
        self.faillog.compact().await?;

        let mut submitted = 0;
        for task in self.faillog.due().await {
            match self.dispatcher.submit(task.clone()) {
                Ok(Submission::Queued) | Ok(Submission::Waiting) => submitted += 1,
                Ok(Submission::Excluded) => {
                    debug!(target_id = %task.target_id, path = %task.relative_path, "retry now excluded, dropping");
                    self.faillog.record_success(&task).await?;
                }
                Err(SyncError::ShuttingDown) => {
                    self.faillog.release(&task).await;
                    return Err(SyncError::ShuttingDown);
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.faillog.abandon(&task, &reason).await?;
                    self.reporter
                        .terminal(Some(&task.target_id), &task.relative_path, reason);
                }
            }
        }
        if submitted > 0 {
            info!(submitted, "re-submitted failed tasks");
        }
        Ok(submitted)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; retries wait one interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(_) => {}
                        Err(SyncError::ShuttingDown) => break,
                        Err(e) => error!(error = %e, "retry tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("retry executor stopped");
    }
}
