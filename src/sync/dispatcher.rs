//! Per-target worker pools.
//!
//! Each target owns an unbounded task channel drained by `threads` workers.
//! A path that is already being transferred to a target is parked in that
//! target's waiting list and released when the running attempt finishes,
//! so a (target, path) pair never has two transfers in flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TargetConfig};
use crate::error::{Result, SyncError};
use crate::sync::faillog::{FailLog, FailOutcome};
use crate::sync::queue::CoalescedBatch;
use crate::sync::report::Reporter;
use crate::sync::task::{SyncAction, SyncResult, SyncTask};
use crate::sync::transfer::Transport;

/// Where a submitted task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Handed to a worker.
    Queued,
    /// Parked behind an in-flight transfer of the same path.
    Waiting,
    /// The target excludes the path.
    Excluded,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: u64,
    pub queued_behind: u64,
    pub excluded: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub given_up: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    queued_behind: AtomicU64,
    excluded: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    given_up: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            queued_behind: self.queued_behind.load(Ordering::Relaxed),
            excluded: self.excluded.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            given_up: self.given_up.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct InFlight {
    active: HashSet<String>,
    waiting: HashMap<String, VecDeque<SyncTask>>,
}

struct Lane {
    target: TargetConfig,
    sender: async_channel::Sender<SyncTask>,
    in_flight: Mutex<InFlight>,
}

impl Lane {
    fn enqueue(&self, task: SyncTask, counters: &Counters) -> Result<Submission> {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.active.contains(&task.relative_path) {
                debug!(
                    target_id = %self.target.id,
                    path = %task.relative_path,
                    "path in flight, task parked"
                );
                in_flight
                    .waiting
                    .entry(task.relative_path.clone())
                    .or_default()
                    .push_back(task);
                counters.queued_behind.fetch_add(1, Ordering::Relaxed);
                return Ok(Submission::Waiting);
            }
            in_flight.active.insert(task.relative_path.clone());
        }

        let path = task.relative_path.clone();
        if self.sender.try_send(task).is_err() {
            self.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .active
                .remove(&path);
            return Err(SyncError::ShuttingDown);
        }
        Ok(Submission::Queued)
    }

    /// Next parked task for `path`, or mark the path idle.
    fn release(&self, path: &str) -> Option<SyncTask> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(queue) = in_flight.waiting.get_mut(path) {
            if let Some(next) = queue.pop_front() {
                if queue.is_empty() {
                    in_flight.waiting.remove(path);
                }
                return Some(next);
            }
        }
        in_flight.waiting.remove(path);
        in_flight.active.remove(path);
        None
    }

    fn is_idle(&self) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.active.is_empty() && in_flight.waiting.is_empty()
    }
}

struct Shared {
    root: PathBuf,
    transport: Arc<dyn Transport>,
    faillog: Arc<FailLog>,
    reporter: Reporter,
    counters: Counters,
    cancel: watch::Receiver<bool>,
}

impl Shared {
    async fn run_task(&self, target: &TargetConfig, task: SyncTask) -> SyncResult {
        let started = Instant::now();
        if *self.cancel.borrow() {
            return SyncResult::failed(task, 0, "cancelled by shutdown", false);
        }

        let outcome = match task.action {
            SyncAction::DeleteLocal => remove_local(&self.root, &task.relative_path).await,
            _ => self.transport.execute(&task, target, self.cancel.clone()).await,
        };
        let elapsed = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => SyncResult::succeeded(task, elapsed),
            Err(e) => {
                let permanent = matches!(e, SyncError::PermanentTransfer { .. });
                SyncResult::failed(task, elapsed, e.to_string(), permanent)
            }
        }
    }

    async fn handle_result(&self, result: SyncResult) {
        if result.success {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.faillog.record_success(&result.task).await {
                error!(error = %e, "failed to update fail log");
            }
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            match self.faillog.record_failure(&result).await {
                Ok(FailOutcome::Scheduled { .. }) | Ok(FailOutcome::Superseded) => {}
                Ok(FailOutcome::Abandoned { attempt_count }) => {
                    self.counters.given_up.fetch_add(1, Ordering::Relaxed);
                    self.reporter.terminal(
                        Some(&result.task.target_id),
                        &result.task.relative_path,
                        format!(
                            "{} abandoned after {} attempts: {}",
                            result.task.action,
                            attempt_count,
                            result.error_message.as_deref().unwrap_or("unknown error")
                        ),
                    );
                }
                Err(e) => {
                    error!(
                        target_id = %result.task.target_id,
                        path = %result.task.relative_path,
                        error = %e,
                        "failed to record transfer failure"
                    );
                }
            }
        }
        self.reporter.transfer(result);
    }
}

/// Owns the worker pools of every target.
pub struct Dispatcher {
    lanes: HashMap<String, Arc<Lane>>,
    shared: Arc<Shared>,
    accepting: AtomicBool,
    cancel: watch::Sender<bool>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the worker pools. Must run inside a tokio runtime.
    pub fn start(
        config: &Config,
        transport: Arc<dyn Transport>,
        faillog: Arc<FailLog>,
        reporter: Reporter,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            root: config.watch.root.clone(),
            transport,
            faillog,
            reporter,
            counters: Counters::default(),
            cancel: cancel_rx,
        });

        let mut lanes = HashMap::new();
        let mut workers = Vec::new();
        for target in &config.targets {
            let (sender, receiver) = async_channel::unbounded();
            let lane = Arc::new(Lane {
                target: target.clone(),
                sender,
                in_flight: Mutex::new(InFlight::default()),
            });
            for worker_id in 0..target.threads {
                workers.push(tokio::spawn(worker(
                    worker_id,
                    lane.clone(),
                    receiver.clone(),
                    shared.clone(),
                )));
            }
            info!(
                target_id = %target.id,
                remote = %target.display_name(),
                threads = target.threads,
                "target ready"
            );
            lanes.insert(target.id.clone(), lane);
        }

        Self {
            lanes,
            shared,
            accepting: AtomicBool::new(true),
            cancel: cancel_tx,
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    pub fn submit(&self, task: SyncTask) -> Result<Submission> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        let lane = self
            .lanes
            .get(&task.target_id)
            .ok_or_else(|| SyncError::Config(format!("unknown target '{}'", task.target_id)))?;

        if !task.relative_path.is_empty() && lane.target.excludes.check(&task.relative_path)? {
            self.shared.counters.excluded.fetch_add(1, Ordering::Relaxed);
            return Ok(Submission::Excluded);
        }

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        lane.enqueue(task, &self.shared.counters)
    }

    /// Turn a batch into tasks for every one-way target. Bidirectional
    /// targets are reconciled through metadata instead.
    pub fn dispatch_batch(&self, batch: &CoalescedBatch) -> usize {
        let mut accepted = 0;
        for event in batch.iter() {
            for lane in self.lanes.values().filter(|l| !l.target.bidirectional) {
                match self.submit(SyncTask::from_event(&lane.target.id, event)) {
                    Ok(Submission::Queued) | Ok(Submission::Waiting) => accepted += 1,
                    Ok(Submission::Excluded) => {}
                    Err(e) => warn!(
                        target_id = %lane.target.id,
                        path = %event.path,
                        error = %e,
                        "task not submitted"
                    ),
                }
            }
        }
        accepted
    }

    /// Run a task right away and hand back its result.
    ///
    /// Used by the bidirectional coordinator, which must know the outcome
    /// before recording an agreement. Failures are reported but stay out of
    /// the fail log: the next reconciliation cycle re-evaluates the path.
    pub async fn execute(&self, task: SyncTask) -> Result<SyncResult> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        let lane = self
            .lanes
            .get(&task.target_id)
            .ok_or_else(|| SyncError::Config(format!("unknown target '{}'", task.target_id)))?;

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let result = self.shared.run_task(&lane.target, task).await;
        if result.success {
            self.shared.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                target_id = %result.task.target_id,
                path = %result.task.relative_path,
                action = %result.task.action,
                error = result.error_message.as_deref().unwrap_or("unknown error"),
                "reconciliation transfer failed"
            );
        }
        self.shared.reporter.transfer(result.clone());
        Ok(result)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetConfig> {
        self.lanes.values().map(|l| &l.target)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// No task is running or parked on any target.
    pub fn is_idle(&self) -> bool {
        self.lanes.values().all(|l| l.is_idle() && l.sender.is_empty())
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.counters.snapshot()
    }

    /// Stop accepting tasks and let workers drain. Transfers still running
    /// after `grace` are cancelled and recorded as failed.
    pub async fn shutdown(&self, grace: Duration) -> DispatchStats {
        self.accepting.store(false, Ordering::SeqCst);
        for lane in self.lanes.values() {
            lane.sender.close();
        }

        let handles = std::mem::take(&mut *self.workers.lock().await);
        let all = futures::future::join_all(handles);
        tokio::pin!(all);

        if tokio::time::timeout(grace, &mut all).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "grace period over, cancelling transfers");
            let _ = self.cancel.send(true);
            all.await;
        }

        let stats = self.stats();
        info!(
            submitted = stats.submitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            given_up = stats.given_up,
            "dispatcher stopped"
        );
        stats
    }
}

async fn worker(id: usize, lane: Arc<Lane>, receiver: async_channel::Receiver<SyncTask>, shared: Arc<Shared>) {
    debug!(target_id = %lane.target.id, worker = id, "worker started");

    while let Ok(task) = receiver.recv().await {
        let path = task.relative_path.clone();
        let result = shared.run_task(&lane.target, task).await;
        shared.handle_result(result).await;

        while let Some(next) = lane.release(&path) {
            match lane.sender.try_send(next) {
                Ok(()) => break,
                Err(e) => {
                    // Channel closed by shutdown: keep the task for the next start.
                    let parked = e.into_inner();
                    let result = SyncResult::failed(parked, 0, "dispatcher stopped before transfer", false);
                    shared.handle_result(result).await;
                }
            }
        }
    }

    debug!(target_id = %lane.target.id, worker = id, "worker stopped");
}

/// Remove a path from the watched tree. Missing paths are fine.
async fn remove_local(root: &Path, relative: &str) -> Result<()> {
    let rel = Path::new(relative);
    if relative.is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(SyncError::FilterEvaluation {
            path: relative.to_string(),
            reason: "refusing to delete outside the watched root".to_string(),
        });
    }

    let path = root.join(rel);
    let metadata = match tokio::fs::symlink_metadata(&path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SyncError::io(e, "inspecting", &path)),
    };
    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(&path).await
    } else {
        tokio::fs::remove_file(&path).await
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io(e, "removing", &path)),
    }
}
