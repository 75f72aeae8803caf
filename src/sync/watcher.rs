//! File system watcher and event normalisation.
//!
//! [`FileWatcher`] wraps `notify` and forwards raw events over a tokio
//! channel. [`EventNormalizer`] turns them into relative, filtered
//! [`FileEvent`]s ready for the coalescing queue.

use anyhow::{Context, Result};
use chrono::Utc;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sync::event::{EventKind, EventMask, FileEvent};
use crate::sync::exclude::ExcludePatterns;

/// Recursive watcher over the daemon's root, delivering raw events.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl FileWatcher {
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
        })
    }

    /// Next raw event; `None` once the watcher is gone.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

/// Converts raw notifications into uniform, filtered events.
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    root: PathBuf,
    excludes: ExcludePatterns,
    mask: EventMask,
}

impl EventNormalizer {
    pub fn new(root: impl Into<PathBuf>, excludes: ExcludePatterns, mask: EventMask) -> Self {
        Self {
            root: root.into(),
            excludes,
            mask,
        }
    }

    /// Map one `notify` event to zero or more normalised events.
    pub fn normalize(&self, event: &Event) -> Vec<FileEvent> {
        let cookie = event.attrs.tracker();
        let mut raw: Vec<(PathBuf, EventKind, bool)> = Vec::new();

        match event.kind {
            NotifyKind::Create(kind) => {
                for path in &event.paths {
                    let is_dir = matches!(kind, CreateKind::Folder) || path.is_dir();
                    raw.push((path.clone(), EventKind::Create, is_dir));
                }
            }
            NotifyKind::Remove(kind) => {
                for path in &event.paths {
                    raw.push((path.clone(), EventKind::Delete, matches!(kind, RemoveKind::Folder)));
                }
            }
            NotifyKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::Both if event.paths.len() == 2 => {
                    let is_dir = event.paths[1].is_dir();
                    raw.push((event.paths[0].clone(), EventKind::MoveFrom, is_dir));
                    raw.push((event.paths[1].clone(), EventKind::MoveTo, is_dir));
                }
                RenameMode::From => {
                    for path in &event.paths {
                        raw.push((path.clone(), EventKind::MoveFrom, false));
                    }
                }
                RenameMode::To => {
                    for path in &event.paths {
                        raw.push((path.clone(), EventKind::MoveTo, path.is_dir()));
                    }
                }
                _ => {
                    // Backends that cannot tell the direction: decide by existence.
                    for path in &event.paths {
                        if path.exists() {
                            raw.push((path.clone(), EventKind::MoveTo, path.is_dir()));
                        } else {
                            raw.push((path.clone(), EventKind::MoveFrom, false));
                        }
                    }
                }
            },
            NotifyKind::Modify(ModifyKind::Metadata(_)) => {
                for path in &event.paths {
                    raw.push((path.clone(), EventKind::AttribChange, path.is_dir()));
                }
            }
            NotifyKind::Modify(_) => {
                for path in &event.paths {
                    raw.push((path.clone(), EventKind::Modify, path.is_dir()));
                }
            }
            NotifyKind::Access(_) | NotifyKind::Any | NotifyKind::Other => {}
        }

        let mut out: Vec<FileEvent> = raw
            .into_iter()
            .filter_map(|(path, kind, is_dir)| {
                let mut normalized = self.accept_absolute(&path, kind, is_dir)?;
                normalized.move_cookie = cookie;
                Some(normalized)
            })
            .collect();

        // Both halves of a rename in one notification.
        if let [from, to] = out.as_mut_slice() {
            if from.kind == EventKind::MoveFrom && to.kind == EventKind::MoveTo {
                from.moved_to = Some(to.path.clone());
            }
        }
        out
    }

    fn accept_absolute(&self, path: &Path, kind: EventKind, is_dir: bool) -> Option<FileEvent> {
        let relative = match path.strip_prefix(&self.root) {
            Ok(rel) => rel,
            Err(_) => {
                debug!(path = %path.display(), "event outside watched root dropped");
                return None;
            }
        };
        let relative = relative_string(relative)?;
        if relative.is_empty() {
            return None;
        }
        self.accept(FileEvent {
            path: relative,
            kind,
            timestamp: Utc::now(),
            is_dir,
            move_cookie: None,
            moved_to: None,
        })
    }

    /// Apply the kind mask and exclude filters to an already-relative event.
    ///
    /// A filter that cannot evaluate the path drops the event; it never
    /// becomes a task.
    pub fn accept(&self, event: FileEvent) -> Option<FileEvent> {
        if !self.mask.allows(event.kind) {
            return None;
        }
        match self.excludes.check(&event.path) {
            Ok(true) => {
                debug!(path = %event.path, kind = %event.kind, "event excluded");
                None
            }
            Ok(false) => Some(event),
            Err(e) => {
                warn!(path = %event.path, error = %e, "filter evaluation failed, event dropped");
                None
            }
        }
    }
}

/// Relative path with `/` separators, or `None` if it is not valid UTF-8.
pub fn relative_string(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component.as_os_str().to_str() {
            Some(part) => parts.push(part),
            None => {
                warn!(path = %path.display(), "non UTF-8 path dropped");
                return None;
            }
        }
    }
    Some(parts.join("/"))
}
