//! Event coalescing.
//!
//! [`Coalescer`] groups events per path and releases a group once the path
//! has been quiet for the window. [`EventQueue`] drives it on a tokio task
//! between a bounded event channel and a bounded batch channel, so a slow
//! consumer eventually blocks the producers instead of growing memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::{Result, SyncError};
use crate::sync::event::{is_descendant, EventKind, FileEvent};

const EVENT_CHANNEL_CAPACITY: usize = 4096;
const BATCH_CHANNEL_CAPACITY: usize = 16;

/// Events that survived merging, in causal order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescedBatch {
    pub events: Vec<FileEvent>,
    /// At least one group was released early by the backlog limit.
    pub forced: bool,
}

impl CoalescedBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEvent> {
        self.events.iter()
    }
}

/// Counters since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub received: u64,
    /// Events folded into an existing group.
    pub merged: u64,
    /// Events dropped because an ancestor directory was removed.
    pub suppressed: u64,
    pub emitted: u64,
    /// Groups released by the backlog limit.
    pub forced: u64,
}

#[derive(Debug)]
struct PendingGroup {
    event: FileEvent,
    /// Removal of a directory that `event` recreated. It is released ahead
    /// of `event` so the old contents are deleted on the target.
    replaced: Option<(u64, FileEvent)>,
    first_seen: Instant,
    last_seen: Instant,
    seq: u64,
}

impl PendingGroup {
    fn into_events(self) -> impl Iterator<Item = (u64, FileEvent)> {
        self.replaced.into_iter().chain(std::iter::once((self.seq, self.event)))
    }
}

/// Per-path merge state.
#[derive(Debug)]
pub struct Coalescer {
    window: Duration,
    max_backlog: usize,
    groups: HashMap<String, PendingGroup>,
    forced: Vec<(u64, FileEvent)>,
    /// Rename cookie -> source path of an unpaired `MoveFrom`.
    moves: HashMap<usize, String>,
    next_seq: u64,
    stats: QueueStats,
}

impl Coalescer {
    pub fn new(window: Duration, max_backlog: usize) -> Self {
        Self {
            window,
            max_backlog: max_backlog.max(1),
            groups: HashMap::new(),
            forced: Vec::new(),
            moves: HashMap::new(),
            next_seq: 0,
            stats: QueueStats::default(),
        }
    }

    pub fn push(&mut self, event: FileEvent, now: Instant) {
        self.stats.received += 1;

        if self.under_removed_dir(&event.path) {
            trace!(path = %event.path, "event below removed directory dropped");
            self.stats.suppressed += 1;
            return;
        }

        match event.kind {
            EventKind::MoveFrom => {
                if let Some(cookie) = event.move_cookie {
                    self.moves.insert(cookie, event.path.clone());
                }
            }
            EventKind::MoveTo => self.pair_move(&event),
            _ => {}
        }

        if event.is_dir && event.kind.is_removal() {
            self.drop_descendants(&event.path);
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        match self.groups.remove(&event.path) {
            Some(group) => {
                self.stats.merged += 1;
                let mut replaced = group.replaced;
                if recreates_dir(&group.event, &event) {
                    replaced = Some((group.seq, group.event.clone()));
                }
                let event = merge(group.event, event);
                if event.kind.is_removal() {
                    replaced = None;
                }
                self.groups.insert(
                    event.path.clone(),
                    PendingGroup {
                        event,
                        replaced,
                        first_seen: group.first_seen,
                        last_seen: now,
                        seq,
                    },
                );
            }
            None => {
                self.groups.insert(
                    event.path.clone(),
                    PendingGroup {
                        event,
                        replaced: None,
                        first_seen: now,
                        last_seen: now,
                        seq,
                    },
                );
            }
        }

        if self.groups.len() > self.max_backlog {
            self.force_oldest();
        }
    }

    /// Release every group that has been idle for the window, plus any
    /// group forced out by the backlog limit.
    pub fn poll_ready(&mut self, now: Instant) -> Option<CoalescedBatch> {
        let window = self.window;
        let ready: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, g)| now.saturating_duration_since(g.last_seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();

        let mut released = std::mem::take(&mut self.forced);
        let forced = !released.is_empty();
        for path in ready {
            if let Some(group) = self.groups.remove(&path) {
                released.extend(group.into_events());
            }
        }
        self.finish(released, forced)
    }

    /// Release everything regardless of the window.
    pub fn flush(&mut self) -> Option<CoalescedBatch> {
        let mut released = std::mem::take(&mut self.forced);
        let forced = !released.is_empty();
        released.extend(self.groups.drain().flat_map(|(_, g)| g.into_events()));
        self.finish(released, forced)
    }

    pub fn has_forced(&self) -> bool {
        !self.forced.is_empty()
    }

    /// Paths waiting for their window to close.
    pub fn pending(&self) -> usize {
        self.groups.len() + self.forced.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    fn finish(&mut self, mut released: Vec<(u64, FileEvent)>, forced: bool) -> Option<CoalescedBatch> {
        let groups = &self.groups;
        self.moves.retain(|_, path| groups.contains_key(path));

        if released.is_empty() {
            return None;
        }
        released.sort_by_key(|(seq, _)| *seq);
        self.stats.emitted += released.len() as u64;
        Some(CoalescedBatch {
            events: released.into_iter().map(|(_, e)| e).collect(),
            forced,
        })
    }

    fn under_removed_dir(&self, path: &str) -> bool {
        let mut current = path;
        while let Some(idx) = current.rfind('/') {
            current = &current[..idx];
            if let Some(group) = self.groups.get(current) {
                if group.event.is_dir && group.event.kind.is_removal() {
                    return true;
                }
            }
        }
        false
    }

    fn drop_descendants(&mut self, dir: &str) {
        let before = self.groups.len() + self.forced.len();
        self.groups.retain(|path, _| !is_descendant(path, dir));
        self.forced.retain(|(_, e)| !is_descendant(&e.path, dir));
        let removed = before - (self.groups.len() + self.forced.len());
        if removed > 0 {
            debug!(dir, removed, "directory removal suppressed pending descendants");
            self.stats.suppressed += removed as u64;
        }
    }

    fn pair_move(&mut self, to: &FileEvent) {
        let Some(cookie) = to.move_cookie else { return };
        let Some(from) = self.moves.remove(&cookie) else { return };
        if let Some(group) = self.groups.get_mut(&from) {
            if group.event.kind == EventKind::MoveFrom && group.event.moved_to.is_none() {
                group.event.moved_to = Some(to.path.clone());
            }
        }
    }

    fn force_oldest(&mut self) {
        let oldest = self
            .groups
            .iter()
            .min_by_key(|(_, g)| (g.first_seen, g.seq))
            .map(|(path, _)| path.clone());
        if let Some(path) = oldest {
            if let Some(group) = self.groups.remove(&path) {
                debug!(path = %path, "backlog full, releasing oldest group early");
                self.stats.forced += 1;
                self.forced.extend(group.into_events());
            }
        }
    }
}

/// A directory removal followed by a newer creation of the same path.
fn recreates_dir(existing: &FileEvent, incoming: &FileEvent) -> bool {
    existing.is_dir
        && existing.kind.is_removal()
        && matches!(incoming.kind, EventKind::Create | EventKind::MoveTo)
        && incoming.timestamp >= existing.timestamp
}

/// Fold two events for one path into the net change.
///
/// Events are ordered by timestamp first, so late delivery of an older
/// event does not override a newer one.
fn merge(existing: FileEvent, incoming: FileEvent) -> FileEvent {
    let (older, newer) = if incoming.timestamp < existing.timestamp {
        (incoming, existing)
    } else {
        (existing, incoming)
    };

    let kind = match newer.kind {
        EventKind::Delete | EventKind::MoveFrom | EventKind::Create | EventKind::MoveTo => newer.kind,
        EventKind::Modify => match older.kind {
            EventKind::Create | EventKind::MoveTo => older.kind,
            _ => EventKind::Modify,
        },
        EventKind::AttribChange => match older.kind {
            EventKind::Create | EventKind::MoveTo | EventKind::Modify => older.kind,
            _ => EventKind::AttribChange,
        },
    };

    let moved_to = if kind == EventKind::MoveFrom {
        newer.moved_to
    } else {
        None
    };

    FileEvent {
        path: newer.path,
        kind,
        timestamp: newer.timestamp,
        is_dir: newer.is_dir,
        move_cookie: newer.move_cookie,
        moved_to,
    }
}

/// Consumer side of the queue: pulls completed batches.
#[derive(Debug)]
pub struct BatchReceiver {
    receiver: mpsc::Receiver<CoalescedBatch>,
}

impl BatchReceiver {
    /// Next batch; `None` once the queue has shut down and drained.
    pub async fn next_batch(&mut self) -> Option<CoalescedBatch> {
        self.receiver.recv().await
    }
}

/// A [`Coalescer`] running on its own task.
pub struct EventQueue {
    sender: mpsc::Sender<FileEvent>,
    stats: Arc<Mutex<QueueStats>>,
    task: JoinHandle<()>,
}

impl EventQueue {
    pub fn spawn(window: Duration, max_backlog: usize) -> (Self, BatchReceiver) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let stats = Arc::new(Mutex::new(QueueStats::default()));

        let tick = (window / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let coalescer = Coalescer::new(window, max_backlog);
        let task = tokio::spawn(run_queue(coalescer, event_rx, batch_tx, stats.clone(), tick));

        (
            Self {
                sender: event_tx,
                stats,
                task,
            },
            BatchReceiver { receiver: batch_rx },
        )
    }

    /// Producer handle; blocks when the queue is saturated.
    pub fn sender(&self) -> mpsc::Sender<FileEvent> {
        self.sender.clone()
    }

    pub async fn push(&self, event: FileEvent) -> Result<()> {
        self.sender.send(event).await.map_err(|_| SyncError::ShuttingDown)
    }

    pub fn stats(&self) -> QueueStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop accepting events, flush what is pending and wait for the task.
    ///
    /// Other clones of the sender must be dropped for this to return.
    pub async fn close(self) -> QueueStats {
        let EventQueue { sender, stats, task } = self;
        drop(sender);
        if let Err(e) = task.await {
            warn!(error = %e, "event queue task failed");
        }
        let snapshot = *stats.lock().unwrap_or_else(|e| e.into_inner());
        snapshot
    }
}

async fn run_queue(
    mut coalescer: Coalescer,
    mut events: mpsc::Receiver<FileEvent>,
    batches: mpsc::Sender<CoalescedBatch>,
    stats: Arc<Mutex<QueueStats>>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let batch = tokio::select! {
            received = events.recv() => match received {
                Some(event) => {
                    coalescer.push(event, Instant::now());
                    if coalescer.has_forced() {
                        coalescer.poll_ready(Instant::now())
                    } else {
                        None
                    }
                }
                None => break,
            },
            _ = ticker.tick() => coalescer.poll_ready(Instant::now()),
        };

        *stats.lock().unwrap_or_else(|e| e.into_inner()) = coalescer.stats();

        if let Some(batch) = batch {
            debug!(events = batch.len(), forced = batch.forced, "batch ready");
            if batches.send(batch).await.is_err() {
                debug!("batch consumer gone, stopping queue");
                return;
            }
        }
    }

    if let Some(batch) = coalescer.flush() {
        debug!(events = batch.len(), "flushing pending events");
        let _ = batches.send(batch).await;
    }
    *stats.lock().unwrap_or_else(|e| e.into_inner()) = coalescer.stats();
}
