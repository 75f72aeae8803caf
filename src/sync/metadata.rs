//! Per-path, per-node metadata store.
//!
//! Layout under the metadata directory:
//!
//! ```text
//! node_id                         local node identity
//! records/<node>/<key>.json       one MetadataRecord per (path, node)
//! baselines/<target>/<key>.json   last agreed state per (path, target)
//! export/state.json               local records, fetched by peers
//! ```
//!
//! `<key>` is derived from the relative path with BLAKE3. Every write goes
//! through a temp file and a rename. Compare-then-write sequences must hold
//! the path lock from [`MetadataManager::lock`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::sync::atomic::{write_atomic, write_json_atomic};
use crate::sync::conflict::{ConflictDetector, ConflictType};
use crate::sync::hash::{content_signature_async, SignatureConfig};

const NODE_ID_FILE: &str = "node_id";
const RECORDS_DIR: &str = "records";
const BASELINES_DIR: &str = "baselines";
const EXPORT_DIR: &str = "export";
/// Name of the exported state document inside the export directory.
pub const EXPORT_FILE: &str = "state.json";
/// Signature recorded for directories; they carry no content.
const DIRECTORY_SIGNATURE: &str = "dir";
/// Lock map size above which idle entries are dropped.
const LOCK_PRUNE_THRESHOLD: usize = 4096;

/// Snapshot of one path as seen by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub relative_path: String,
    pub node_id: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub content_hash: String,
    pub revision: u64,
    pub deleted: bool,
    /// Destination when the path disappeared through a rename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_to: Option<String>,
}

impl MetadataRecord {
    /// Placeholder for a path the node has never reported.
    pub fn absent(path: &str, node_id: &str) -> Self {
        Self {
            relative_path: path.to_string(),
            node_id: node_id.to_string(),
            size: 0,
            mtime: DateTime::<Utc>::UNIX_EPOCH,
            content_hash: String::new(),
            revision: 0,
            deleted: true,
            moved_to: None,
        }
    }

    /// Whether the node has ever reported this path.
    pub fn is_known(&self) -> bool {
        self.revision > 0
    }

    pub fn exists(&self) -> bool {
        !self.deleted
    }

    /// Content identity: `None` for a deleted path.
    pub fn content_key(&self) -> Option<&str> {
        if self.deleted {
            None
        } else {
            Some(&self.content_hash)
        }
    }

    pub fn same_content(&self, other: &MetadataRecord) -> bool {
        self.deleted == other.deleted
            && (self.deleted || (self.content_hash == other.content_hash && self.size == other.size))
    }

    pub fn is_directory(&self) -> bool {
        !self.deleted && self.content_hash == DIRECTORY_SIGNATURE
    }
}

/// Revisions at which a path was suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    pub local_revision: u64,
    pub remote_revision: u64,
    pub since: DateTime<Utc>,
}

/// Last state both sides agreed on for (path, target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub relative_path: String,
    pub local_revision: u64,
    pub remote_revision: u64,
    /// Agreed content; `None` when both sides agreed on absence.
    pub signature: Option<String>,
    pub agreed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended: Option<Suspension>,
}

impl Baseline {
    /// Whether `record` diverged from the agreed state since the baseline.
    pub fn changed(&self, record: &MetadataRecord, agreed_revision: u64) -> bool {
        record.revision > agreed_revision && record.content_key() != self.signature.as_deref()
    }

    /// Whether the suspension still holds for these revisions.
    pub fn holds_suspension(&self, local: &MetadataRecord, remote: &MetadataRecord) -> bool {
        match &self.suspended {
            Some(s) => local.revision <= s.local_revision && remote.revision <= s.remote_revision,
            None => false,
        }
    }
}

/// What has to happen for a path to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    InSync,
    PushLocal,
    PullRemote,
    DeleteRemote,
    DeleteLocal,
    Conflict(ConflictType),
}

/// Records a node publishes for its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateExport {
    pub node_id: String,
    pub exported_at: DateTime<Utc>,
    pub records: Vec<MetadataRecord>,
}

/// Sole owner of the metadata directory.
#[derive(Debug)]
pub struct MetadataManager {
    dir: PathBuf,
    root: PathBuf,
    node_id: String,
    signature: SignatureConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MetadataManager {
    /// Open (or create) the store. Failures here are process-fatal.
    pub fn open(
        dir: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        configured_node_id: Option<&str>,
        signature: SignatureConfig,
    ) -> Result<Self> {
        let dir = dir.into();
        let init_error = |reason: String| SyncError::MetadataStoreInit {
            path: dir.clone(),
            reason,
        };

        for sub in [RECORDS_DIR, BASELINES_DIR, EXPORT_DIR] {
            std::fs::create_dir_all(dir.join(sub))
                .map_err(|e| init_error(format!("cannot create {}: {}", sub, e)))?;
        }

        let id_path = dir.join(NODE_ID_FILE);
        let stored = match std::fs::read_to_string(&id_path) {
            Ok(text) => Some(text.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(init_error(format!("cannot read node id: {}", e))),
        };

        let node_id = match (configured_node_id, stored) {
            (Some(configured), Some(stored)) if configured != stored => {
                warn!(configured, stored = %stored, "configured node id differs from stored one, using configured");
                configured.to_string()
            }
            (Some(configured), _) => configured.to_string(),
            (None, Some(stored)) => stored,
            (None, None) => {
                let generated = format!("node-{}", &Uuid::new_v4().simple().to_string()[..8]);
                info!(node_id = %generated, "generated node identity");
                generated
            }
        };
        write_atomic(&id_path, node_id.as_bytes())
            .map_err(|e| init_error(format!("cannot persist node id: {}", e)))?;

        Ok(Self {
            dir,
            root: root.into(),
            node_id,
            signature,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Exclusive access to one path for a compare-then-write sequence.
    pub async fn lock(&self, path: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > LOCK_PRUNE_THRESHOLD {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Observe the path on disk. The returned record carries the stored
    /// revision; nothing is written.
    pub async fn snapshot(&self, path: &str) -> Result<MetadataRecord> {
        let stored = self.load(path, &self.node_id)?;
        let revision = stored.as_ref().map(|r| r.revision).unwrap_or(0);
        let full = self.root.join(path);

        let metadata = match tokio::fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mtime = match &stored {
                    Some(r) if r.deleted => r.mtime,
                    _ => Utc::now(),
                };
                return Ok(MetadataRecord {
                    relative_path: path.to_string(),
                    node_id: self.node_id.clone(),
                    size: 0,
                    mtime,
                    content_hash: String::new(),
                    revision,
                    deleted: true,
                    moved_to: None,
                });
            }
            Err(e) => return Err(SyncError::io(e, "inspecting", &full)),
        };

        let mtime: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let (size, content_hash) = if metadata.is_dir() {
            (0, DIRECTORY_SIGNATURE.to_string())
        } else {
            let unchanged = stored
                .as_ref()
                .filter(|r| !r.deleted && r.size == metadata.len() && r.mtime == mtime);
            match unchanged {
                // Same size and mtime as last time: reuse the signature.
                Some(r) => (r.size, r.content_hash.clone()),
                None => (metadata.len(), content_signature_async(&full, self.signature).await?),
            }
        };

        Ok(MetadataRecord {
            relative_path: path.to_string(),
            node_id: self.node_id.clone(),
            size,
            mtime,
            content_hash,
            revision,
            deleted: false,
            moved_to: None,
        })
    }

    /// Persist a record. The revision advances only when the content
    /// (signature, size or existence) differs from the stored record.
    pub fn record(&self, path: &str, mut metadata: MetadataRecord) -> Result<MetadataRecord> {
        metadata.relative_path = path.to_string();
        let stored = self.load(path, &metadata.node_id)?;

        match &stored {
            Some(current) if current.same_content(&metadata) => {
                if current.deleted || (current.mtime == metadata.mtime && current.moved_to == metadata.moved_to) {
                    return Ok(current.clone());
                }
                metadata.revision = current.revision;
            }
            Some(current) => {
                metadata.revision = (current.revision + 1).max(metadata.revision);
            }
            None => {
                metadata.revision = metadata.revision.max(1);
            }
        }
        if !metadata.deleted {
            metadata.moved_to = None;
        }

        self.write_record(&metadata)?;
        Ok(metadata)
    }

    /// Snapshot and record in one step.
    ///
    /// A path that is missing and was never recorded yields an unsaved
    /// absent record.
    pub async fn observe(&self, path: &str, moved_to: Option<&str>) -> Result<MetadataRecord> {
        let mut snapshot = self.snapshot(path).await?;
        if snapshot.deleted {
            if snapshot.revision == 0 {
                return Ok(MetadataRecord::absent(path, &self.node_id));
            }
            snapshot.moved_to = moved_to.map(str::to_string);
        }
        self.record(path, snapshot)
    }

    /// Stored record for (path, node).
    pub fn load(&self, path: &str, node_id: &str) -> Result<Option<MetadataRecord>> {
        let file = self.record_path(node_id, path);
        let bytes = match std::fs::read(&file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(e, "reading", &file)),
        };
        let record: MetadataRecord = serde_json::from_slice(&bytes).map_err(|e| SyncError::MetadataCorruption {
            path: path.to_string(),
            reason: format!("{}: {}", file.display(), e),
        })?;
        if record.relative_path != path || record.node_id != node_id {
            return Err(SyncError::MetadataCorruption {
                path: path.to_string(),
                reason: format!("{} belongs to {}@{}", file.display(), record.relative_path, record.node_id),
            });
        }
        Ok(Some(record))
    }

    /// Stored remote record, or an absent placeholder.
    pub fn load_or_absent(&self, path: &str, node_id: &str) -> Result<MetadataRecord> {
        Ok(self
            .load(path, node_id)?
            .unwrap_or_else(|| MetadataRecord::absent(path, node_id)))
    }

    /// Classify the divergence between two snapshots against the agreed
    /// baseline of `target`.
    pub fn compare(&self, target: &str, local: &MetadataRecord, remote: &MetadataRecord) -> Result<Delta> {
        let baseline = self.baseline(target, &local.relative_path)?;
        Ok(ConflictDetector::delta(local, remote, baseline.as_ref()))
    }

    /// Advance the local revision without a content change.
    pub fn bump(&self, path: &str) -> Result<MetadataRecord> {
        let mut record = self.load_or_absent(path, &self.node_id)?;
        record.revision += 1;
        self.write_record(&record)?;
        Ok(record)
    }

    /// Make the local record carry `winner`'s content at a new revision.
    pub fn adopt(&self, path: &str, winner: &MetadataRecord) -> Result<MetadataRecord> {
        let current = self.load_or_absent(path, &self.node_id)?;
        let record = MetadataRecord {
            relative_path: path.to_string(),
            node_id: self.node_id.clone(),
            size: winner.size,
            mtime: winner.mtime,
            content_hash: winner.content_hash.clone(),
            revision: current.revision + 1,
            deleted: winner.deleted,
            moved_to: None,
        };
        self.write_record(&record)?;
        Ok(record)
    }

    pub fn baseline(&self, target: &str, path: &str) -> Result<Option<Baseline>> {
        let file = self.baseline_path(target, path);
        let bytes = match std::fs::read(&file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(e, "reading", &file)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SyncError::MetadataCorruption {
                path: path.to_string(),
                reason: format!("{}: {}", file.display(), e),
            })
    }

    /// Record that both sides now hold `signature`.
    pub fn agree(
        &self,
        target: &str,
        local: &MetadataRecord,
        remote: &MetadataRecord,
        signature: Option<&str>,
    ) -> Result<Baseline> {
        let baseline = Baseline {
            relative_path: local.relative_path.clone(),
            local_revision: local.revision,
            remote_revision: remote.revision,
            signature: signature.map(str::to_string),
            agreed_at: Utc::now(),
            suspended: None,
        };
        write_json_atomic(&self.baseline_path(target, &local.relative_path), &baseline)?;
        Ok(baseline)
    }

    /// Pause automatic handling of a path until either side moves on or
    /// [`MetadataManager::resume`] is called.
    pub fn suspend(&self, target: &str, local: &MetadataRecord, remote: &MetadataRecord) -> Result<Baseline> {
        let path = &local.relative_path;
        let mut baseline = self.baseline(target, path)?.unwrap_or_else(|| Baseline {
            relative_path: path.clone(),
            local_revision: 0,
            remote_revision: 0,
            signature: None,
            agreed_at: Utc::now(),
            suspended: None,
        });
        baseline.suspended = Some(Suspension {
            local_revision: local.revision,
            remote_revision: remote.revision,
            since: Utc::now(),
        });
        write_json_atomic(&self.baseline_path(target, path), &baseline)?;
        Ok(baseline)
    }

    /// Lift the suspension of `path` on every target. Returns how many
    /// targets were suspended.
    pub fn resume(&self, path: &str) -> Result<usize> {
        let key = path_key(path);
        let dir = self.dir.join(BASELINES_DIR);
        let targets = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SyncError::io(e, "listing", &dir)),
        };

        let mut resumed = 0;
        for entry in targets.flatten() {
            let Some(target) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let file = entry.path().join(format!("{}.json", key));
            if !file.exists() {
                continue;
            }
            if let Some(mut baseline) = self.baseline(&target, path)? {
                if baseline.suspended.take().is_some() {
                    write_json_atomic(&file, &baseline)?;
                    info!(target_id = %target, path, "suspension lifted");
                    resumed += 1;
                }
            }
        }
        Ok(resumed)
    }

    /// Every record stored for `node_id`.
    pub fn records_for(&self, node_id: &str) -> Result<Vec<MetadataRecord>> {
        let dir = self.dir.join(RECORDS_DIR).join(node_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::io(e, "listing", &dir)),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let file = entry.path();
            if file.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&file).map_err(|e| SyncError::io(e, "reading", &file))?;
            match serde_json::from_slice::<MetadataRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(file = %file.display(), error = %e, "skipping corrupt metadata record"),
            }
        }
        records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(records)
    }

    pub fn local_records(&self) -> Result<Vec<MetadataRecord>> {
        self.records_for(&self.node_id)
    }

    pub fn export(&self) -> Result<StateExport> {
        Ok(StateExport {
            node_id: self.node_id.clone(),
            exported_at: Utc::now(),
            records: self.local_records()?,
        })
    }

    /// Write the export document peers fetch. Returns its path.
    pub fn write_export(&self) -> Result<PathBuf> {
        let export = self.export()?;
        let path = self.export_path();
        write_json_atomic(&path, &export)?;
        debug!(records = export.records.len(), path = %path.display(), "state exported");
        Ok(path)
    }

    pub fn export_path(&self) -> PathBuf {
        self.dir.join(EXPORT_DIR).join(EXPORT_FILE)
    }

    /// Store a peer's records. Records that would move a revision backwards
    /// or escape the root are skipped. Returns the number stored.
    pub fn import(&self, export: &StateExport) -> Result<usize> {
        if export.node_id == self.node_id {
            return Err(SyncError::MetadataCorruption {
                path: EXPORT_FILE.to_string(),
                reason: format!("peer reports the local node id '{}'", export.node_id),
            });
        }
        if !valid_node_id(&export.node_id) {
            return Err(SyncError::MetadataCorruption {
                path: EXPORT_FILE.to_string(),
                reason: format!("invalid node id '{}'", export.node_id),
            });
        }

        let mut stored = 0;
        for incoming in &export.records {
            if incoming.node_id != export.node_id || !valid_relative(&incoming.relative_path) {
                warn!(path = %incoming.relative_path, node = %incoming.node_id, "ignoring foreign or invalid record");
                continue;
            }
            let current = match self.load(&incoming.relative_path, &export.node_id) {
                Ok(current) => current,
                Err(SyncError::MetadataCorruption { .. }) => None,
                Err(e) => return Err(e),
            };
            match current {
                Some(current) if current.revision > incoming.revision => {
                    debug!(path = %incoming.relative_path, "stale remote record ignored");
                }
                Some(current) if current == *incoming => {}
                _ => {
                    self.write_record(incoming)?;
                    stored += 1;
                }
            }
        }
        Ok(stored)
    }

    fn write_record(&self, record: &MetadataRecord) -> Result<()> {
        write_json_atomic(&self.record_path(&record.node_id, &record.relative_path), record)
    }

    fn record_path(&self, node_id: &str, path: &str) -> PathBuf {
        self.dir
            .join(RECORDS_DIR)
            .join(node_id)
            .join(format!("{}.json", path_key(path)))
    }

    fn baseline_path(&self, target: &str, path: &str) -> PathBuf {
        self.dir
            .join(BASELINES_DIR)
            .join(target)
            .join(format!("{}.json", path_key(path)))
    }
}

fn path_key(path: &str) -> String {
    blake3::hash(path.as_bytes()).to_hex().as_str()[..32].to_string()
}

fn valid_node_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/') && !id.contains('\\') && id != "." && id != ".."
}

fn valid_relative(path: &str) -> bool {
    !path.is_empty() && Path::new(path).components().all(|c| matches!(c, Component::Normal(_)))
}
