//! Integration tests for the sync pipeline.
//!
//! Remote targets are plain directories: `FakeTransport` copies files
//! between the watched root and `<remote>/<target id>/`, and `PeerState`
//! plays the peer node by running its own metadata store over that
//! directory.

mod bidirectional;
mod daemon;
mod pipeline;
mod retry;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, watch};

use rillsync::config::{Config, TargetConfig};
use rillsync::error::{Result, SyncError};
use rillsync::sync::bidirectional::RemoteStateSource;
use rillsync::sync::dispatcher::Dispatcher;
use rillsync::sync::hash::SignatureConfig;
use rillsync::sync::metadata::{MetadataManager, StateExport};
use rillsync::sync::report::SyncReport;
use rillsync::sync::task::{SyncAction, SyncTask};
use rillsync::sync::transfer::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub target: String,
    pub path: String,
    pub action: SyncAction,
    pub attempt: u32,
}

#[derive(Default)]
pub struct FakeTransport {
    local: PathBuf,
    remote: PathBuf,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<Call>>,
    mirrors: Mutex<Vec<String>>,
    /// Remaining transient failures per path.
    failures: Mutex<HashMap<String, u32>>,
    permanent: Mutex<HashSet<String>>,
    in_flight: Mutex<HashSet<(String, String)>>,
    overlapped: AtomicBool,
}

impl FakeTransport {
    pub fn new(local: &Path, remote: &Path) -> Self {
        Self {
            local: local.to_path_buf(),
            remote: remote.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fail(&self, path: &str, times: u32) {
        self.failures.lock().unwrap().insert(path.to_string(), times);
    }

    pub fn fail_permanently(&self, path: &str) {
        self.permanent.lock().unwrap().insert(path.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, target: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.target == target).collect()
    }

    pub fn mirrors(&self) -> Vec<String> {
        self.mirrors.lock().unwrap().clone()
    }

    /// Whether two transfers of one (target, path) ever ran at once.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn remote_dir(&self, target: &str) -> PathBuf {
        self.remote.join(target)
    }

    fn injected_failure(&self, target: &TargetConfig, path: &str) -> Option<SyncError> {
        if self.permanent.lock().unwrap().contains(path) {
            return Some(SyncError::PermanentTransfer {
                target: target.id.clone(),
                path: path.to_string(),
                message: "@ERROR: auth failed on module data".to_string(),
            });
        }
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Some(SyncError::TransientTransfer {
                    target: target.id.clone(),
                    path: path.to_string(),
                    message: "connection reset".to_string(),
                })
            }
            _ => None,
        }
    }

    async fn perform(&self, task: &SyncTask, target: &TargetConfig) -> Result<()> {
        let local = self.local.join(&task.relative_path);
        let remote = self.remote_dir(&target.id).join(&task.relative_path);
        match task.action {
            SyncAction::Push => copy_if_present(&local, &remote),
            SyncAction::Pull => copy_if_present(&remote, &local),
            SyncAction::Delete => remove_any(&remote),
            SyncAction::DeleteLocal => remove_any(&local),
        }
        .map_err(|e| SyncError::io(e, task.action.as_str(), &task.relative_path))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, task: &SyncTask, target: &TargetConfig, mut cancel: watch::Receiver<bool>) -> Result<()> {
        self.calls.lock().unwrap().push(Call {
            target: task.target_id.clone(),
            path: task.relative_path.clone(),
            action: task.action,
            attempt: task.attempt,
        });
        let key = (task.target_id.clone(), task.relative_path.clone());
        if !self.in_flight.lock().unwrap().insert(key.clone()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }

        let delay = *self.delay.lock().unwrap();
        let outcome = tokio::select! {
            _ = tokio::time::sleep(delay) => match self.injected_failure(target, &task.relative_path) {
                Some(err) => Err(err),
                None => self.perform(task, target).await,
            },
            _ = cancelled(&mut cancel) => Err(SyncError::TransientTransfer {
                target: target.id.clone(),
                path: task.relative_path.clone(),
                message: "cancelled by shutdown".to_string(),
            }),
        };

        self.in_flight.lock().unwrap().remove(&key);
        outcome
    }

    async fn fetch(&self, target: &TargetConfig, _module: &str, remote_path: &str, dest: &Path) -> Result<()> {
        let source = self.remote_dir(&target.id).join(remote_path);
        if !source.exists() {
            return Err(SyncError::TransientTransfer {
                target: target.id.clone(),
                path: remote_path.to_string(),
                message: "No such file or directory".to_string(),
            });
        }
        copy_if_present(&source, dest).map_err(|e| SyncError::io(e, "fetching", dest))
    }

    async fn mirror(&self, target: &TargetConfig) -> Result<()> {
        self.mirrors.lock().unwrap().push(target.id.clone());
        Ok(())
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return std::future::pending::<()>().await;
        }
    }
}

fn copy_if_present(from: &Path, to: &Path) -> std::io::Result<()> {
    if !from.exists() {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if from.is_dir() {
        return std::fs::create_dir_all(to);
    }
    std::fs::copy(from, to).map(|_| ())
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// The peer node: its own metadata store over the remote directory.
pub struct PeerState {
    pub store: MetadataManager,
    root: PathBuf,
    _dir: TempDir,
}

impl PeerState {
    pub fn new(root: &Path) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root).unwrap();
        let store = MetadataManager::open(dir.path(), root, Some("beta"), SignatureConfig::default()).unwrap();
        Self {
            store,
            root: root.to_path_buf(),
            _dir: dir,
        }
    }

    /// What the peer's own reconciliation would record right now.
    async fn scan(&self) -> Result<StateExport> {
        let mut paths: HashSet<String> = self
            .store
            .local_records()?
            .into_iter()
            .map(|r| r.relative_path)
            .collect();
        for entry in jwalk::WalkDir::new(&self.root).into_iter().flatten() {
            if entry.file_type().is_file() {
                let rel = entry.path().strip_prefix(&self.root).unwrap().to_string_lossy().replace('\\', "/");
                paths.insert(rel);
            }
        }
        for path in paths {
            self.store.observe(&path, None).await?;
        }
        self.store.export()
    }
}

#[async_trait]
impl RemoteStateSource for PeerState {
    async fn fetch(&self, _target: &TargetConfig) -> Result<Option<StateExport>> {
        self.scan().await.map(Some)
    }
}

/// Scratch directories for one test.
pub struct Dirs {
    pub root: TempDir,
    pub remote: TempDir,
    pub state: TempDir,
}

impl Dirs {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            remote: tempfile::tempdir().unwrap(),
            state: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn write_local(&self, rel: &str, content: &[u8]) {
        write_file(&self.root.path().join(rel), content);
    }

    pub fn read_local(&self, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(self.root.path().join(rel)).ok()
    }

    pub fn write_remote(&self, target: &str, rel: &str, content: &[u8]) {
        write_file(&self.remote.path().join(target).join(rel), content);
    }

    pub fn read_remote(&self, target: &str, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(self.remote.path().join(target).join(rel)).ok()
    }

    /// Configuration with the given `[[targets]]` tables and extra sections.
    pub fn config(&self, targets: &str, extra: &str) -> Arc<Config> {
        let toml = format!(
            r#"
[watch]
root = "{root}"
window_secs = 1

[retry]
fail_log = "{state}/faillog.jsonl"
interval_secs = 1
max_attempts = 3

[bidirectional]
metadata_dir = "{state}/meta"
backup_dir = "{state}/backups"

[shutdown]
grace_secs = 1

{targets}

{extra}
"#,
            root = self.root.path().display(),
            state = self.state.path().display(),
        );
        Arc::new(Config::from_toml_str(&toml).unwrap())
    }
}

pub fn write_file(path: &Path, content: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

pub fn set_mtime(path: &Path, secs: u64) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(std::time::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

/// Wait until the dispatcher has nothing running or parked.
pub async fn wait_idle(dispatcher: &Dispatcher) {
    for _ in 0..500 {
        if dispatcher.is_idle() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dispatcher did not become idle");
}

pub fn drain(rx: &mut broadcast::Receiver<SyncReport>) -> Vec<SyncReport> {
    let mut reports = Vec::new();
    while let Ok(report) = rx.try_recv() {
        reports.push(report);
    }
    reports
}
