//! Conflict detection for bidirectional targets.
//!
//! A path is classified from three inputs: the local snapshot, the remote
//! snapshot and the baseline both sides last agreed on. Without a baseline
//! the two sides have never been reconciled, so any difference between two
//! existing files is a `BothCreated` conflict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sync::metadata::{Baseline, Delta, MetadataRecord};
use crate::sync::resolver::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    BothModified,
    LocalDeletedRemoteModified,
    RemoteDeletedLocalModified,
    BothCreated,
    MoveConflict,
    NoConflict,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BothModified => "both_modified",
            Self::LocalDeletedRemoteModified => "local_deleted_remote_modified",
            Self::RemoteDeletedLocalModified => "remote_deleted_local_modified",
            Self::BothCreated => "both_created",
            Self::MoveConflict => "move_conflict",
            Self::NoConflict => "no_conflict",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected divergence, reported once and then dropped.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    pub relative_path: String,
    pub local: MetadataRecord,
    pub remote: MetadataRecord,
    pub conflict_type: ConflictType,
    pub detected_at: DateTime<Utc>,
    pub resolution: Option<Resolution>,
}

impl ConflictRecord {
    /// Returns `None` for [`ConflictType::NoConflict`].
    pub fn new(local: MetadataRecord, remote: MetadataRecord, conflict_type: ConflictType) -> Option<Self> {
        if conflict_type == ConflictType::NoConflict {
            return None;
        }
        Some(Self {
            relative_path: local.relative_path.clone(),
            local,
            remote,
            conflict_type,
            detected_at: Utc::now(),
            resolution: None,
        })
    }
}

/// Stateless classifier.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Conflict category of a path, `NoConflict` when the divergence (if any)
    /// can be propagated in one direction.
    pub fn classify(local: &MetadataRecord, remote: &MetadataRecord, baseline: Option<&Baseline>) -> ConflictType {
        match Self::delta(local, remote, baseline) {
            Delta::Conflict(kind) => kind,
            _ => ConflictType::NoConflict,
        }
    }

    /// What has to happen for the path to converge.
    pub fn delta(local: &MetadataRecord, remote: &MetadataRecord, baseline: Option<&Baseline>) -> Delta {
        let Some(baseline) = baseline else {
            return match (local.content_key(), remote.content_key()) {
                (None, None) => Delta::InSync,
                (Some(_), None) => Delta::PushLocal,
                (None, Some(_)) => Delta::PullRemote,
                (Some(l), Some(r)) if l == r => Delta::InSync,
                (Some(_), Some(_)) => Delta::Conflict(ConflictType::BothCreated),
            };
        };

        let local_changed = baseline.changed(local, baseline.local_revision);
        let remote_changed = baseline.changed(remote, baseline.remote_revision);

        match (local_changed, remote_changed) {
            (false, false) => Delta::InSync,
            (true, false) if local.deleted => Delta::DeleteRemote,
            (true, false) => Delta::PushLocal,
            (false, true) if remote.deleted => Delta::DeleteLocal,
            (false, true) => Delta::PullRemote,
            (true, true) => {
                // Equal content (or both gone): nothing actionable.
                if local.content_key() == remote.content_key() {
                    return Delta::InSync;
                }
                let moved = (local.deleted && local.moved_to.is_some() && remote.exists())
                    || (remote.deleted && remote.moved_to.is_some() && local.exists());
                let kind = if moved {
                    ConflictType::MoveConflict
                } else if local.deleted {
                    ConflictType::LocalDeletedRemoteModified
                } else if remote.deleted {
                    ConflictType::RemoteDeletedLocalModified
                } else {
                    ConflictType::BothModified
                };
                Delta::Conflict(kind)
            }
        }
    }
}
