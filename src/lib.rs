//! rillsync: watch a directory tree and keep remote targets in step.
//!
//! Re-exports modules for use in integration tests and the binary.

pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod sync;

pub use config::Config;
pub use daemon::{Daemon, DaemonStats};
pub use error::{Result, SyncError};
