//! Pre-resolution copies of conflicted files.
//!
//! Backups mirror the relative layout of the watched tree under the backup
//! directory and are named `<stem>_<local|remote>_<timestamp>.<ext>`.

use chrono::{NaiveDateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TargetConfig;
use crate::error::{Result, SyncError};
use crate::sync::transfer::Transport;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";
const TIMESTAMP_LEN: usize = 19;
const STAGING_DIR: &str = ".staging";

/// Which variant a backup holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupSide {
    Local,
    Remote,
}

impl BackupSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for BackupSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct BackupManager {
    dir: PathBuf,
    root: PathBuf,
    max_backups: usize,
    transport: Arc<dyn Transport>,
}

impl BackupManager {
    pub fn new(
        dir: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        max_backups: usize,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            dir: dir.into(),
            root: root.into(),
            max_backups: max_backups.max(1),
            transport,
        }
    }

    /// Copy the local variant. Returns `None` when the file does not exist.
    pub async fn backup_local(&self, relative: &str) -> Result<Option<PathBuf>> {
        let source = self.root.join(relative);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Ok(None);
        }

        let dest = self.reserve(relative, BackupSide::Local).await?;
        if let Err(e) = tokio::fs::copy(&source, &dest).await {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(SyncError::BackupWrite {
                path: relative.to_string(),
                backup: dest,
                source: e,
            });
        }
        info!(path = relative, backup = %dest.display(), "local variant backed up");
        self.prune(relative, BackupSide::Local).await;
        Ok(Some(dest))
    }

    /// Fetch the remote variant from `target` into the backup directory.
    pub async fn backup_remote(&self, target: &TargetConfig, relative: &str) -> Result<PathBuf> {
        let staging = self.dir.join(STAGING_DIR).join(Uuid::new_v4().simple().to_string());
        let dest = self.reserve(relative, BackupSide::Remote).await?;

        let fetched = self
            .transport
            .fetch(target, &target.module, relative, &staging)
            .await;
        if let Err(e) = fetched {
            let _ = tokio::fs::remove_file(&staging).await;
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(SyncError::BackupWrite {
                path: relative.to_string(),
                backup: dest,
                source: std::io::Error::other(e.to_string()),
            });
        }

        if let Err(e) = tokio::fs::rename(&staging, &dest).await {
            let _ = tokio::fs::remove_file(&staging).await;
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(SyncError::BackupWrite {
                path: relative.to_string(),
                backup: dest,
                source: e,
            });
        }
        info!(target_id = %target.id, path = relative, backup = %dest.display(), "remote variant backed up");
        self.prune(relative, BackupSide::Remote).await;
        Ok(dest)
    }

    /// Existing backups of `relative`, oldest first.
    pub async fn list(&self, relative: &str) -> Vec<PathBuf> {
        self.sorted(relative, None).await
    }

    async fn sorted(&self, relative: &str, side: Option<BackupSide>) -> Vec<PathBuf> {
        let (dir, stem, ext) = self.layout(relative);
        let mut found: Vec<_> = self
            .scan(&dir, &stem, ext.as_deref())
            .await
            .into_iter()
            .filter(|(s, _, _)| side.map_or(true, |side| *s == side))
            .collect();
        found.sort_by(|a, b| a.1.cmp(&b.1));
        found.into_iter().map(|(_, _, path)| path).collect()
    }

    async fn keys(&self, dir: &Path, stem: &str, ext: Option<&str>) -> Vec<(NaiveDateTime, u32)> {
        self.scan(dir, stem, ext).await.into_iter().map(|(_, key, _)| key).collect()
    }

    async fn scan(
        &self,
        dir: &Path,
        stem: &str,
        ext: Option<&str>,
    ) -> Vec<(BackupSide, (NaiveDateTime, u32), PathBuf)> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut found = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((side, key)) = parse_backup_name(name, stem, ext) {
                found.push((side, key, entry.path()));
            }
        }
        found
    }

    /// Drop the oldest backups of one side beyond the retention cap.
    ///
    /// Each side is capped on its own so the two halves of a `backup_both`
    /// never evict each other.
    async fn prune(&self, relative: &str, side: BackupSide) {
        let backups = self.sorted(relative, Some(side)).await;
        if backups.len() <= self.max_backups {
            return;
        }
        let excess = backups.len() - self.max_backups;
        for old in backups.into_iter().take(excess) {
            match tokio::fs::remove_file(&old).await {
                Ok(()) => debug!(backup = %old.display(), "old backup pruned"),
                Err(e) => warn!(backup = %old.display(), error = %e, "failed to prune backup"),
            }
        }
    }

    /// Pick a free backup name and create the parent directory.
    async fn reserve(&self, relative: &str, side: BackupSide) -> Result<PathBuf> {
        let (dir, stem, ext) = self.layout(relative);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SyncError::BackupWrite {
                path: relative.to_string(),
                backup: dir.clone(),
                source: e,
            })?;
        tokio::fs::create_dir_all(self.dir.join(STAGING_DIR))
            .await
            .map_err(|e| SyncError::BackupWrite {
                path: relative.to_string(),
                backup: self.dir.join(STAGING_DIR),
                source: e,
            })?;

        let stamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let base = format!("{}_{}_{}", stem, side, stamp);

        // Within one millisecond, order by a collision index above any
        // existing one so pruning stays oldest-first.
        let mut next = self
            .keys(&dir, &stem, ext.as_deref())
            .await
            .into_iter()
            .filter(|(time, _)| time.format(TIMESTAMP_FORMAT).to_string() == stamp)
            .map(|(_, index)| index + 1)
            .max()
            .unwrap_or(0);
        loop {
            let name = match next {
                0 => base.clone(),
                n => format!("{}_{}", base, n),
            };
            let candidate = dir.join(with_extension(&name, ext.as_deref()));
            if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Ok(candidate);
            }
            next += 1;
        }
    }

    fn layout(&self, relative: &str) -> (PathBuf, String, Option<String>) {
        let rel = Path::new(relative);
        let dir = match rel.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.dir.join(parent),
            _ => self.dir.clone(),
        };
        let stem = rel
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = rel.extension().map(|e| e.to_string_lossy().into_owned());
        (dir, stem, ext)
    }
}

fn with_extension(base: &str, ext: Option<&str>) -> String {
    match ext {
        Some(ext) => format!("{}.{}", base, ext),
        None => base.to_string(),
    }
}

/// Side and sort key `(timestamp, collision index)` of a backup file name.
fn parse_backup_name(name: &str, stem: &str, ext: Option<&str>) -> Option<(BackupSide, (NaiveDateTime, u32))> {
    let body = match ext {
        Some(ext) => name.strip_suffix(ext)?.strip_suffix('.')?,
        None => name,
    };
    let rest = body.strip_prefix(stem)?.strip_prefix('_')?;
    let (side, rest) = [BackupSide::Local, BackupSide::Remote]
        .into_iter()
        .find_map(|side| Some((side, rest.strip_prefix(side.as_str())?.strip_prefix('_')?)))?;

    if rest.len() < TIMESTAMP_LEN {
        return None;
    }
    let (stamp, suffix) = rest.split_at(TIMESTAMP_LEN);
    let time = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    let index = match suffix {
        "" => 0,
        s => s.strip_prefix('_')?.parse().ok()?,
    };
    Some((side, (time, index)))
}
