//! Uniform file change events.
//!
//! Every notification source is normalised into [`FileEvent`] before it
//! reaches the coalescing queue. Paths are always relative to the watched
//! root and use `/` as separator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of change observed on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Modify,
    Delete,
    /// Path was renamed away (source side of a move).
    MoveFrom,
    /// Path appeared through a rename (destination side of a move).
    MoveTo,
    AttribChange,
}

impl EventKind {
    /// Whether the event removes the path from the tree.
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Delete | Self::MoveFrom)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::MoveFrom => "move_from",
            Self::MoveTo => "move_to",
            Self::AttribChange => "attrib",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single normalised filesystem change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    /// Path relative to the watched root.
    pub path: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub is_dir: bool,
    /// Rename tracker shared by the two halves of a move, when the source
    /// reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_cookie: Option<usize>,
    /// Destination of a paired `MoveFrom` inside the watched tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_to: Option<String>,
}

impl FileEvent {
    pub fn new(path: impl Into<String>, kind: EventKind, is_dir: bool) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: Utc::now(),
            is_dir,
            move_cookie: None,
            moved_to: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_cookie(mut self, cookie: usize) -> Self {
        self.move_cookie = Some(cookie);
        self
    }
}

/// `path` lies strictly below `ancestor` (both relative, `/`-separated).
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return !path.is_empty();
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Which event kinds the normaliser lets through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMask {
    pub create: bool,
    pub modify: bool,
    pub delete: bool,
    pub move_from: bool,
    pub move_to: bool,
    pub attrib: bool,
}

impl Default for EventMask {
    fn default() -> Self {
        Self {
            create: true,
            modify: true,
            delete: true,
            move_from: true,
            move_to: true,
            attrib: false,
        }
    }
}

impl EventMask {
    pub fn all() -> Self {
        Self {
            attrib: true,
            ..Self::default()
        }
    }

    pub fn allows(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Create => self.create,
            EventKind::Modify => self.modify,
            EventKind::Delete => self.delete,
            EventKind::MoveFrom => self.move_from,
            EventKind::MoveTo => self.move_to,
            EventKind::AttribChange => self.attrib,
        }
    }
}
