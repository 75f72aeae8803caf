//! Conflict resolution strategies.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sync::conflict::ConflictRecord;
use crate::sync::metadata::MetadataRecord;

/// Strategy for resolving a conflicted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Side with the most recent modification time wins (default).
    #[default]
    KeepNewer,
    KeepOlder,
    /// Side with the bigger file wins, ties fall back to `KeepNewer`.
    KeepLarger,
    KeepLocal,
    KeepRemote,
    /// Preserve both variants as backups and leave the tree untouched.
    BackupBoth,
    /// Suspend the path until an operator resumes it.
    Manual,
    /// Log and re-evaluate next cycle.
    Skip,
}

impl ConflictStrategy {
    pub fn description(&self) -> &'static str {
        match self {
            Self::KeepNewer => "Use most recently modified file",
            Self::KeepOlder => "Use least recently modified file",
            Self::KeepLarger => "Use larger file",
            Self::KeepLocal => "Always use local",
            Self::KeepRemote => "Always use remote",
            Self::BackupBoth => "Back up both and suspend",
            Self::Manual => "Wait for operator",
            Self::Skip => "Skip conflicting files",
        }
    }
}

/// Outcome of applying a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    /// Both variants go to the backup directory; nothing propagates.
    KeepBoth,
    Skip,
    RequiresManual,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepRemote => "keep_remote",
            Self::KeepBoth => "keep_both",
            Self::Skip => "skip",
            Self::RequiresManual => "requires_manual",
        }
    }

    /// Whether content crosses the link.
    pub fn propagates(&self) -> bool {
        matches!(self, Self::KeepLocal | Self::KeepRemote)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies a strategy to conflict records.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self { default_strategy }
    }

    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    /// Pure decision for the given strategy.
    pub fn decide(local: &MetadataRecord, remote: &MetadataRecord, strategy: ConflictStrategy) -> Resolution {
        match strategy {
            ConflictStrategy::KeepNewer => keep_newer(local, remote),
            ConflictStrategy::KeepOlder => {
                if remote.mtime < local.mtime {
                    Resolution::KeepRemote
                } else {
                    Resolution::KeepLocal
                }
            }
            ConflictStrategy::KeepLarger => {
                if local.size > remote.size {
                    Resolution::KeepLocal
                } else if remote.size > local.size {
                    Resolution::KeepRemote
                } else {
                    keep_newer(local, remote)
                }
            }
            ConflictStrategy::KeepLocal => Resolution::KeepLocal,
            ConflictStrategy::KeepRemote => Resolution::KeepRemote,
            ConflictStrategy::BackupBoth => Resolution::KeepBoth,
            ConflictStrategy::Manual => Resolution::RequiresManual,
            ConflictStrategy::Skip => Resolution::Skip,
        }
    }

    /// Decide and attach the resolution to the record.
    pub fn resolve(&self, record: &mut ConflictRecord, strategy: Option<ConflictStrategy>) -> Resolution {
        let resolution = Self::decide(&record.local, &record.remote, strategy.unwrap_or(self.default_strategy));
        record.resolution = Some(resolution);
        resolution
    }
}

fn keep_newer(local: &MetadataRecord, remote: &MetadataRecord) -> Resolution {
    if remote.mtime > local.mtime {
        Resolution::KeepRemote
    } else {
        Resolution::KeepLocal
    }
}
