//! Daemon configuration.
//!
//! The TOML file is deserialised into `Raw*` structs with defaults, then
//! [`RawConfig::validate`] turns it into an immutable [`Config`] that is
//! shared as `Arc<Config>` by every component.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::sync::event::EventMask;
use crate::sync::exclude::ExcludePatterns;
use crate::sync::hash::{SignatureAlgorithm, SignatureConfig};
use crate::sync::resolver::ConflictStrategy;

const APP_DIR: &str = "rillsync";

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    pub watch: RawWatch,
    #[serde(default)]
    pub transfer: RawTransfer,
    #[serde(default)]
    pub targets: Vec<RawTarget>,
    #[serde(default)]
    pub retry: RawRetry,
    #[serde(default)]
    pub bidirectional: RawBidirectional,
    #[serde(default)]
    pub full_sync: RawFullSync,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shutdown: RawShutdown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawWatch {
    pub root: PathBuf,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,
    #[serde(default)]
    pub events: EventMask,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_true")]
    pub temp_file_filter: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawTransfer {
    pub binary: String,
    pub common_flags: String,
    pub timeout_secs: Option<u64>,
    pub ssh: bool,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password_file: Option<PathBuf>,
    pub bwlimit_kbps: Option<u64>,
}

impl Default for RawTransfer {
    fn default() -> Self {
        Self {
            binary: "rsync".to_string(),
            common_flags: "-artuz".to_string(),
            timeout_secs: Some(100),
            ssh: false,
            port: None,
            user: None,
            password_file: None,
            bwlimit_kbps: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawTarget {
    pub id: String,
    pub address: String,
    pub module: String,
    #[serde(default)]
    pub state_module: Option<String>,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub strategy: Option<ConflictStrategy>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawRetry {
    pub fail_log: Option<PathBuf>,
    pub interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for RawRetry {
    fn default() -> Self {
        Self {
            fail_log: None,
            interval_secs: 60,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawBidirectional {
    pub node_id: Option<String>,
    pub strategy: ConflictStrategy,
    pub interval_secs: u64,
    pub metadata_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub max_backups: usize,
    pub backup_before_overwrite: bool,
    pub signature_algorithm: SignatureAlgorithm,
    pub full_hash_limit: u64,
    pub sample_bytes: u64,
}

impl Default for RawBidirectional {
    fn default() -> Self {
        let signature = SignatureConfig::default();
        Self {
            node_id: None,
            strategy: ConflictStrategy::KeepNewer,
            interval_secs: 60,
            metadata_dir: None,
            backup_dir: None,
            max_backups: 10,
            backup_before_overwrite: true,
            signature_algorithm: signature.algorithm,
            full_hash_limit: signature.full_hash_limit,
            sample_bytes: signature.sample_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawFullSync {
    pub enabled: bool,
    pub interval_mins: u64,
    pub on_start: bool,
}

impl Default for RawFullSync {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_mins: 600,
            on_start: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawShutdown {
    pub grace_secs: u64,
}

impl Default for RawShutdown {
    fn default() -> Self {
        Self { grace_secs: 30 }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

fn default_window_secs() -> u64 {
    20
}

fn default_max_backlog() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub root: PathBuf,
    pub window: Duration,
    pub max_backlog: usize,
    pub events: EventMask,
    pub excludes: ExcludePatterns,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub binary: String,
    pub common_flags: Vec<String>,
    pub timeout: Option<Duration>,
    pub ssh: bool,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password_file: Option<PathBuf>,
    pub bwlimit_kbps: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub id: String,
    pub address: String,
    pub module: String,
    pub state_module: Option<String>,
    pub threads: usize,
    /// Global excludes layered with the target's own.
    pub excludes: ExcludePatterns,
    pub bidirectional: bool,
    pub strategy: ConflictStrategy,
}

impl TargetConfig {
    /// `address::module`, used in log lines.
    pub fn display_name(&self) -> String {
        format!("{}::{}", self.address, self.module)
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub fail_log: PathBuf,
    pub interval: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct BidirectionalConfig {
    pub node_id: Option<String>,
    pub interval: Duration,
    pub metadata_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub max_backups: usize,
    pub backup_before_overwrite: bool,
    pub signature: SignatureConfig,
}

#[derive(Debug, Clone)]
pub struct FullSyncConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub on_start: bool,
}

/// Fully validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub watch: WatchConfig,
    pub transfer: TransferConfig,
    pub targets: Vec<TargetConfig>,
    pub retry: RetryConfig,
    pub bidirectional: BidirectionalConfig,
    pub full_sync: FullSyncConfig,
    pub logging: LoggingConfig,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Arc<Config>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(Arc::new(config))
    }

    pub fn from_toml_str(content: &str) -> Result<Config> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))?;
        raw.validate()
    }

    pub fn target(&self, id: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.id == id)
    }

    pub fn has_bidirectional_targets(&self) -> bool {
        self.targets.iter().any(|t| t.bidirectional)
    }
}

impl RawConfig {
    pub fn validate(self) -> Result<Config> {
        let root = absolute(&self.watch.root)?;
        if !root.is_dir() {
            return Err(SyncError::Config(format!(
                "watch root {} does not exist or is not a directory",
                root.display()
            )));
        }
        if self.watch.window_secs == 0 {
            return Err(SyncError::Config("watch.window_secs must be greater than 0".into()));
        }
        if self.watch.max_backlog == 0 {
            return Err(SyncError::Config("watch.max_backlog must be greater than 0".into()));
        }

        let global_excludes = ExcludePatterns::build(&self.watch.exclude, self.watch.temp_file_filter)?;

        if self.targets.is_empty() {
            return Err(SyncError::Config("at least one [[targets]] entry is required".into()));
        }

        let default_threads = num_cpus::get().clamp(1, 10);
        let mut targets = Vec::with_capacity(self.targets.len());
        for raw in &self.targets {
            if raw.id.trim().is_empty() {
                return Err(SyncError::Config("target id must not be empty".into()));
            }
            if targets.iter().any(|t: &TargetConfig| t.id == raw.id) {
                return Err(SyncError::Config(format!("duplicate target id '{}'", raw.id)));
            }
            let threads = raw.threads.unwrap_or(default_threads);
            if threads == 0 {
                return Err(SyncError::Config(format!("target '{}' needs at least one thread", raw.id)));
            }
            let own = ExcludePatterns::from_patterns(&raw.exclude)?;
            targets.push(TargetConfig {
                id: raw.id.clone(),
                address: raw.address.clone(),
                module: raw.module.clone(),
                state_module: raw.state_module.clone(),
                threads,
                excludes: global_excludes.merged(&own)?,
                bidirectional: raw.bidirectional,
                strategy: raw.strategy.unwrap_or(self.bidirectional.strategy),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".into()));
        }

        let base = default_base_dir(&root);
        let metadata_dir = match &self.bidirectional.metadata_dir {
            Some(dir) => absolute(dir)?,
            None => base.join("state"),
        };
        let backup_dir = match &self.bidirectional.backup_dir {
            Some(dir) => absolute(dir)?,
            None => base.join("conflicts"),
        };
        let fail_log = match &self.retry.fail_log {
            Some(path) => absolute(path)?,
            None => base.join("faillog.jsonl"),
        };
        for (name, dir) in [
            ("bidirectional.metadata_dir", &metadata_dir),
            ("bidirectional.backup_dir", &backup_dir),
            ("retry.fail_log", &fail_log),
        ] {
            if dir.starts_with(&root) {
                return Err(SyncError::Config(format!(
                    "{} ({}) must lie outside the watched root {}",
                    name,
                    dir.display(),
                    root.display()
                )));
            }
        }

        if let Some(node_id) = &self.bidirectional.node_id {
            if node_id.trim().is_empty() || node_id.contains('/') {
                return Err(SyncError::Config(format!("invalid node id '{}'", node_id)));
            }
        }

        Ok(Config {
            watch: WatchConfig {
                root,
                window: Duration::from_secs(self.watch.window_secs),
                max_backlog: self.watch.max_backlog,
                events: self.watch.events,
                excludes: global_excludes,
            },
            transfer: TransferConfig {
                binary: self.transfer.binary,
                common_flags: self
                    .transfer
                    .common_flags
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
                timeout: self.transfer.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
                ssh: self.transfer.ssh,
                port: self.transfer.port,
                user: self.transfer.user,
                password_file: self.transfer.password_file,
                bwlimit_kbps: self.transfer.bwlimit_kbps,
            },
            targets,
            retry: RetryConfig {
                fail_log,
                interval: Duration::from_secs(self.retry.interval_secs.max(1)),
                max_attempts: self.retry.max_attempts,
            },
            bidirectional: BidirectionalConfig {
                node_id: self.bidirectional.node_id,
                interval: Duration::from_secs(self.bidirectional.interval_secs.max(1)),
                metadata_dir,
                backup_dir,
                max_backups: self.bidirectional.max_backups.max(1),
                backup_before_overwrite: self.bidirectional.backup_before_overwrite,
                signature: SignatureConfig {
                    algorithm: self.bidirectional.signature_algorithm,
                    full_hash_limit: self.bidirectional.full_hash_limit,
                    sample_bytes: self.bidirectional.sample_bytes,
                },
            },
            full_sync: FullSyncConfig {
                enabled: self.full_sync.enabled,
                interval: Duration::from_secs(self.full_sync.interval_mins.max(1) * 60),
                on_start: self.full_sync.on_start,
            },
            logging: self.logging,
            shutdown_grace: Duration::from_secs(self.shutdown.grace_secs),
        })
    }
}

/// Per-root state directory under the platform data dir.
fn default_base_dir(root: &Path) -> PathBuf {
    let digest = blake3::hash(root.to_string_lossy().as_bytes()).to_hex();
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join(&digest.as_str()[..8])
}

/// Make a path absolute and lexically normalised without touching the disk.
fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| SyncError::io(e, "resolving", path))?
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}
