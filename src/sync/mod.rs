//! Event-to-sync pipeline.
//!
//! Watcher events are normalised and coalesced, then fanned out to per-target
//! worker pools. Bidirectional targets go through the metadata store and the
//! conflict engine instead of being pushed blindly.

pub mod atomic;
pub mod backup;
pub mod bidirectional;
pub mod conflict;
pub mod dispatcher;
pub mod event;
pub mod exclude;
pub mod faillog;
pub mod hash;
pub mod metadata;
pub mod queue;
pub mod report;
pub mod resolver;
pub mod task;
pub mod transfer;
pub mod watcher;

pub use backup::{BackupManager, BackupSide};
pub use bidirectional::{BidirectionalCoordinator, CycleSummary, PathOutcome, RemoteStateSource, TransportStateSource};
pub use conflict::{ConflictDetector, ConflictRecord, ConflictType};
pub use dispatcher::{DispatchStats, Dispatcher, Submission};
pub use event::{EventKind, EventMask, FileEvent};
pub use exclude::ExcludePatterns;
pub use faillog::{FailEntry, FailLog, FailOutcome, RetryExecutor};
pub use hash::{content_signature, hash_bytes, SignatureAlgorithm, SignatureConfig};
pub use metadata::{Baseline, Delta, MetadataManager, MetadataRecord, StateExport};
pub use queue::{CoalescedBatch, Coalescer, EventQueue, QueueStats};
pub use report::{Reporter, SyncReport, TerminalFailure};
pub use resolver::{ConflictResolver, ConflictStrategy, Resolution};
pub use task::{SyncAction, SyncResult, SyncTask};
pub use transfer::{RsyncTransport, Transport};
pub use watcher::{EventNormalizer, FileWatcher};
