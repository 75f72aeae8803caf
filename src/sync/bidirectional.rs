//! Reconciliation of bidirectional targets.
//!
//! Each cycle fetches the peer's exported records, then walks every path
//! known to either side. A path is handled under its metadata lock from the
//! first read to the last write: observe local, load remote, classify,
//! resolve, transfer, agree.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TargetConfig};
use crate::error::{Result, SyncError};
use crate::sync::backup::BackupManager;
use crate::sync::conflict::{ConflictDetector, ConflictRecord, ConflictType};
use crate::sync::dispatcher::Dispatcher;
use crate::sync::event::{EventKind, FileEvent};
use crate::sync::metadata::{Baseline, Delta, MetadataManager, MetadataRecord, StateExport, EXPORT_FILE};
use crate::sync::report::Reporter;
use crate::sync::resolver::{ConflictResolver, Resolution};
use crate::sync::task::{SyncAction, SyncTask};
use crate::sync::transfer::Transport;
use crate::sync::watcher::relative_string;

/// Source of the peer's metadata for a target.
#[async_trait]
pub trait RemoteStateSource: Send + Sync {
    /// `Ok(None)` when the target publishes no state.
    async fn fetch(&self, target: &TargetConfig) -> Result<Option<StateExport>>;
}

/// Pulls the peer's `state.json` from the target's state module.
pub struct TransportStateSource {
    transport: Arc<dyn Transport>,
    staging: PathBuf,
}

impl TransportStateSource {
    pub fn new(transport: Arc<dyn Transport>, staging: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            staging: staging.into(),
        }
    }
}

#[async_trait]
impl RemoteStateSource for TransportStateSource {
    async fn fetch(&self, target: &TargetConfig) -> Result<Option<StateExport>> {
        let Some(module) = target.state_module.as_deref() else {
            return Ok(None);
        };
        let dest = self.staging.join(format!("{}.json", target.id));
        self.transport.fetch(target, module, EXPORT_FILE, &dest).await?;

        let bytes = tokio::fs::read(&dest)
            .await
            .map_err(|e| SyncError::io(e, "reading", &dest))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SyncError::MetadataCorruption {
                path: EXPORT_FILE.to_string(),
                reason: format!("export from {}: {}", target.id, e),
            })
    }
}

/// How one path ended up after evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOutcome {
    InSync,
    Pushed,
    Pulled,
    Deleted,
    Conflict,
    Suspended,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub in_sync: usize,
    pub pushed: usize,
    pub pulled: usize,
    pub deleted: usize,
    pub conflicts: usize,
    pub suspended: usize,
    pub errors: usize,
}

impl CycleSummary {
    fn add(&mut self, outcome: PathOutcome) {
        match outcome {
            PathOutcome::InSync => self.in_sync += 1,
            PathOutcome::Pushed => self.pushed += 1,
            PathOutcome::Pulled => self.pulled += 1,
            PathOutcome::Deleted => self.deleted += 1,
            PathOutcome::Conflict => self.conflicts += 1,
            PathOutcome::Suspended => self.suspended += 1,
            PathOutcome::Failed => self.errors += 1,
        }
    }

    fn merge(&mut self, other: CycleSummary) {
        self.in_sync += other.in_sync;
        self.pushed += other.pushed;
        self.pulled += other.pulled;
        self.deleted += other.deleted;
        self.conflicts += other.conflicts;
        self.suspended += other.suspended;
        self.errors += other.errors;
    }

    pub fn total(&self) -> usize {
        self.in_sync + self.pushed + self.pulled + self.deleted + self.conflicts + self.suspended + self.errors
    }
}

pub struct BidirectionalCoordinator {
    config: Arc<Config>,
    metadata: Arc<MetadataManager>,
    backups: BackupManager,
    dispatcher: Arc<Dispatcher>,
    remote: Arc<dyn RemoteStateSource>,
    reporter: Reporter,
    resolver: ConflictResolver,
    /// Remote node id per target, learned from the last import.
    peers: Mutex<HashMap<String, String>>,
}

impl BidirectionalCoordinator {
    pub fn new(
        config: Arc<Config>,
        metadata: Arc<MetadataManager>,
        dispatcher: Arc<Dispatcher>,
        transport: Arc<dyn Transport>,
        remote: Arc<dyn RemoteStateSource>,
        reporter: Reporter,
    ) -> Self {
        let backups = BackupManager::new(
            config.bidirectional.backup_dir.clone(),
            config.watch.root.clone(),
            config.bidirectional.max_backups,
            transport,
        );
        Self {
            config,
            metadata,
            backups,
            dispatcher,
            remote,
            reporter,
            resolver: ConflictResolver::default(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn metadata(&self) -> &Arc<MetadataManager> {
        &self.metadata
    }

    fn targets(&self) -> impl Iterator<Item = &TargetConfig> {
        self.config.targets.iter().filter(|t| t.bidirectional)
    }

    fn peer(&self, target: &str) -> Option<String> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .cloned()
    }

    /// Reconcile every bidirectional target once.
    pub async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        for target in self.targets() {
            match self.sync_target(target).await {
                Ok(part) => {
                    info!(
                        target_id = %target.id,
                        in_sync = part.in_sync,
                        pushed = part.pushed,
                        pulled = part.pulled,
                        deleted = part.deleted,
                        conflicts = part.conflicts,
                        suspended = part.suspended,
                        errors = part.errors,
                        "reconciliation cycle complete"
                    );
                    summary.merge(part);
                }
                Err(e) => {
                    warn!(target_id = %target.id, error = %e, "reconciliation skipped");
                    summary.errors += 1;
                }
            }
        }
        summary
    }

    /// Reconcile one target against the peer's current export.
    pub async fn sync_target(&self, target: &TargetConfig) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();
        let Some(remote_node) = self.refresh_remote(target).await? else {
            warn!(target_id = %target.id, "no remote state available, target skipped");
            return Ok(summary);
        };

        let paths = self.collect_paths(target, &remote_node).await?;
        debug!(target_id = %target.id, paths = paths.len(), "evaluating paths");

        let remote_node = remote_node.as_str();
        let outcomes: Vec<PathOutcome> = stream::iter(paths)
            .map(|path| async move { self.evaluate_path(target, remote_node, &path, None).await })
            .buffer_unordered(target.threads.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            summary.add(outcome);
        }

        self.metadata.write_export()?;
        Ok(summary)
    }

    /// Evaluate the paths of a coalesced batch against every bidirectional
    /// target whose peer is known.
    pub async fn evaluate_events(&self, events: &[FileEvent]) -> CycleSummary {
        let mut summary = CycleSummary::default();
        for target in self.targets() {
            let Some(remote_node) = self.peer(&target.id) else {
                debug!(target_id = %target.id, "peer state not loaded yet, events left to the next cycle");
                continue;
            };
            for event in events.iter().filter(|e| !e.is_dir) {
                if target.excludes.is_excluded(&event.path) {
                    continue;
                }
                let moved_to = match event.kind {
                    EventKind::MoveFrom => event.moved_to.as_deref(),
                    _ => None,
                };
                summary.add(self.evaluate_path(target, &remote_node, &event.path, moved_to).await);
            }
        }
        if summary.total() > 0 {
            if let Err(e) = self.metadata.write_export() {
                error!(error = %e, "failed to write state export");
            }
        }
        summary
    }

    /// Run cycles on the configured interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.bidirectional.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("bidirectional coordinator stopped");
    }

    async fn refresh_remote(&self, target: &TargetConfig) -> Result<Option<String>> {
        let Some(export) = self.remote.fetch(target).await? else {
            return Ok(None);
        };
        let stored = self.metadata.import(&export)?;
        debug!(target_id = %target.id, node = %export.node_id, stored, "remote state imported");

        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = peers.insert(target.id.clone(), export.node_id.clone()) {
            if previous != export.node_id {
                warn!(target_id = %target.id, previous = %previous, current = %export.node_id, "peer node id changed");
            }
        }
        Ok(Some(export.node_id))
    }

    /// Files on disk plus every path either side has a record for.
    async fn collect_paths(&self, target: &TargetConfig, remote_node: &str) -> Result<BTreeSet<String>> {
        let root = self.config.watch.root.clone();
        let mut paths = tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .map_err(|e| SyncError::io(std::io::Error::other(e), "walking", &self.config.watch.root))?;

        for record in self.metadata.local_records()? {
            paths.insert(record.relative_path);
        }
        for record in self.metadata.records_for(remote_node)? {
            paths.insert(record.relative_path);
        }
        paths.retain(|p| !target.excludes.is_excluded(p));
        Ok(paths)
    }

    /// Reconcile one path. Errors are logged and reported, never returned.
    pub async fn evaluate_path(
        &self,
        target: &TargetConfig,
        remote_node: &str,
        path: &str,
        moved_to: Option<&str>,
    ) -> PathOutcome {
        match self.reconcile(target, remote_node, path, moved_to).await {
            Ok(outcome) => outcome,
            Err(e) => {
                match &e {
                    SyncError::BackupWrite { .. } | SyncError::MetadataCorruption { .. } => {
                        self.reporter.terminal(Some(&target.id), path, e.to_string());
                    }
                    _ => {}
                }
                warn!(target_id = %target.id, path, error = %e, "path not reconciled");
                PathOutcome::Failed
            }
        }
    }

    async fn reconcile(
        &self,
        target: &TargetConfig,
        remote_node: &str,
        path: &str,
        moved_to: Option<&str>,
    ) -> Result<PathOutcome> {
        let _guard = self.metadata.lock(path).await;

        let full = self.config.watch.root.join(path);
        if tokio::fs::metadata(&full).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(PathOutcome::InSync);
        }

        let local = self.metadata.observe(path, moved_to).await?;
        let remote = self.metadata.load_or_absent(path, remote_node)?;
        if remote.is_directory() {
            return Ok(PathOutcome::InSync);
        }

        let baseline = self.metadata.baseline(&target.id, path)?;
        if let Some(b) = &baseline {
            if b.holds_suspension(&local, &remote) {
                debug!(target_id = %target.id, path, "path suspended");
                return Ok(PathOutcome::Suspended);
            }
        }

        match ConflictDetector::delta(&local, &remote, baseline.as_ref()) {
            Delta::InSync => {
                self.settle(target, &local, &remote, baseline.as_ref())?;
                Ok(PathOutcome::InSync)
            }
            Delta::PushLocal => self.propagate(target, &local, &remote, SyncAction::Push, false).await,
            Delta::DeleteRemote => self.propagate(target, &local, &remote, SyncAction::Delete, false).await,
            Delta::PullRemote => self.propagate(target, &local, &remote, SyncAction::Pull, false).await,
            Delta::DeleteLocal => self.propagate(target, &local, &remote, SyncAction::DeleteLocal, false).await,
            Delta::Conflict(kind) => self.resolve(target, local, remote, kind).await,
        }
    }

    /// Record agreement for a path both sides already match on.
    fn settle(
        &self,
        target: &TargetConfig,
        local: &MetadataRecord,
        remote: &MetadataRecord,
        baseline: Option<&Baseline>,
    ) -> Result<()> {
        if !local.is_known() && !remote.is_known() {
            return Ok(());
        }
        let current = baseline.is_some_and(|b| {
            b.local_revision == local.revision && b.remote_revision == remote.revision && b.suspended.is_none()
        });
        if !current {
            self.metadata.agree(&target.id, local, remote, local.content_key())?;
        }
        Ok(())
    }

    /// Run the transfer and, once it succeeded, record the agreement.
    async fn propagate(
        &self,
        target: &TargetConfig,
        local: &MetadataRecord,
        remote: &MetadataRecord,
        action: SyncAction,
        adopt: bool,
    ) -> Result<PathOutcome> {
        let path = &local.relative_path;
        let task = SyncTask::new(&target.id, path, action);
        let result = self.dispatcher.execute(task).await?;
        if !result.success {
            return Ok(PathOutcome::Failed);
        }

        let local = if adopt {
            self.metadata.adopt(path, remote)?
        } else {
            local.clone()
        };
        let signature = match action {
            SyncAction::Push | SyncAction::Delete => local.content_key(),
            SyncAction::Pull | SyncAction::DeleteLocal => remote.content_key(),
        };
        self.metadata.agree(&target.id, &local, remote, signature)?;

        Ok(match action {
            SyncAction::Push => PathOutcome::Pushed,
            SyncAction::Pull => PathOutcome::Pulled,
            SyncAction::Delete | SyncAction::DeleteLocal => PathOutcome::Deleted,
        })
    }

    async fn resolve(
        &self,
        target: &TargetConfig,
        local: MetadataRecord,
        remote: MetadataRecord,
        kind: ConflictType,
    ) -> Result<PathOutcome> {
        let Some(mut record) = ConflictRecord::new(local.clone(), remote.clone(), kind) else {
            return Ok(PathOutcome::InSync);
        };
        let resolution = self.resolver.resolve(&mut record, Some(target.strategy));
        let path = record.relative_path.clone();
        info!(
            target_id = %target.id,
            path = %path,
            conflict = %kind,
            resolution = %resolution,
            "conflict detected"
        );
        // A failed backup aborts the resolution before it is published.
        let backup_first = self.config.bidirectional.backup_before_overwrite;
        match resolution {
            Resolution::KeepLocal if backup_first && remote.exists() => {
                self.backups.backup_remote(target, &path).await?;
            }
            Resolution::KeepRemote if backup_first && local.exists() => {
                self.backups.backup_local(&path).await?;
            }
            Resolution::KeepBoth => {
                if local.exists() {
                    self.backups.backup_local(&path).await?;
                }
                if remote.exists() {
                    self.backups.backup_remote(target, &path).await?;
                }
            }
            _ => {}
        }
        self.reporter.conflict(record);

        match resolution {
            Resolution::KeepLocal => {
                let winner = self.metadata.bump(&path)?;
                let action = if winner.deleted { SyncAction::Delete } else { SyncAction::Push };
                self.conflict_outcome(self.propagate(target, &winner, &remote, action, false).await?)
            }
            Resolution::KeepRemote => {
                let action = if remote.deleted { SyncAction::DeleteLocal } else { SyncAction::Pull };
                self.conflict_outcome(self.propagate(target, &local, &remote, action, true).await?)
            }
            Resolution::KeepBoth => {
                self.metadata.suspend(&target.id, &local, &remote)?;
                Ok(PathOutcome::Conflict)
            }
            Resolution::RequiresManual => {
                self.metadata.suspend(&target.id, &local, &remote)?;
                let err = SyncError::ConflictUnresolvable { path: path.clone() };
                self.reporter.terminal(Some(&target.id), &path, err.to_string());
                Ok(PathOutcome::Conflict)
            }
            Resolution::Skip => {
                debug!(target_id = %target.id, path = %path, "conflict skipped");
                Ok(PathOutcome::Conflict)
            }
        }
    }

    fn conflict_outcome(&self, outcome: PathOutcome) -> Result<PathOutcome> {
        Ok(match outcome {
            PathOutcome::Failed => PathOutcome::Failed,
            _ => PathOutcome::Conflict,
        })
    }
}

/// Relative paths of every regular file under `root`.
fn walk_files(root: &Path) -> BTreeSet<String> {
    let mut files = BTreeSet::new();
    for entry in jwalk::WalkDir::new(root)
        .skip_hidden(false)
        .follow_links(false)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "error walking watched tree");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if let Some(rel) = path.strip_prefix(root).ok().and_then(relative_string) {
            files.insert(rel);
        }
    }
    files
}
