//! Content signatures for metadata snapshots.
//!
//! Small files are hashed in full. Files above `full_hash_limit` get a
//! sampled signature: size plus the first and last `sample_bytes`. Sampling
//! is a throughput heuristic, not a guarantee: an edit confined to the middle
//! of a large file that keeps its size goes unnoticed.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::Xxh3;

use crate::error::{Result, SyncError};

/// Hash algorithm used for signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    /// BLAKE3 (default).
    #[default]
    Blake3,
    /// XXH3-128, faster and non-cryptographic.
    Xxh3,
}

impl SignatureAlgorithm {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Blake3 => "b3",
            Self::Xxh3 => "xx3",
        }
    }
}

/// How deep signatures look into file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureConfig {
    pub algorithm: SignatureAlgorithm,
    /// Files up to this size are hashed in full.
    pub full_hash_limit: u64,
    /// Bytes sampled from each end of larger files.
    pub sample_bytes: u64,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            algorithm: SignatureAlgorithm::Blake3,
            full_hash_limit: 10 * 1024 * 1024,
            sample_bytes: 64 * 1024,
        }
    }
}

impl SignatureConfig {
    /// Always hash complete content.
    pub fn full(algorithm: SignatureAlgorithm) -> Self {
        Self {
            algorithm,
            full_hash_limit: u64::MAX,
            sample_bytes: 0,
        }
    }
}

enum Hasher {
    Blake3(Box<blake3::Hasher>),
    Xxh3(Box<Xxh3>),
}

impl Hasher {
    fn new(algorithm: SignatureAlgorithm) -> Self {
        match algorithm {
            SignatureAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
            SignatureAlgorithm::Xxh3 => Self::Xxh3(Box::new(Xxh3::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            // Use parallel hashing for data > 128KB
            Self::Blake3(h) if data.len() > 128 * 1024 => {
                h.update_rayon(data);
            }
            Self::Blake3(h) => {
                h.update(data);
            }
            Self::Xxh3(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
            Self::Xxh3(h) => format!("{:032x}", h.digest128()),
        }
    }
}

/// Hash bytes using BLAKE3.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Hasher::new(SignatureAlgorithm::Blake3);
    hasher.update(data);
    hasher.finish()
}

/// Compute the signature of a file on disk.
///
/// Returns strings like `b3:full:<hex>` or `xx3:sample:<hex>`; signatures
/// produced under different modes never compare equal.
pub fn content_signature(path: &Path, config: &SignatureConfig) -> Result<String> {
    let mut file = File::open(path).map_err(|e| SyncError::io(e, "opening", path))?;
    let size = file
        .metadata()
        .map_err(|e| SyncError::io(e, "reading metadata of", path))?
        .len();

    let mut hasher = Hasher::new(config.algorithm);
    let mode = if size <= config.full_hash_limit {
        let mut buffer = [0u8; 65536]; // 64KB buffer
        loop {
            let bytes_read = file
                .read(&mut buffer)
                .map_err(|e| SyncError::io(e, "hashing", path))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        "full"
    } else {
        let sample = config.sample_bytes.min(size / 2) as usize;
        hasher.update(&size.to_le_bytes());

        let mut head = vec![0u8; sample];
        file.read_exact(&mut head)
            .map_err(|e| SyncError::io(e, "sampling head of", path))?;
        hasher.update(&head);

        let mut tail = vec![0u8; sample];
        file.seek(SeekFrom::End(-(sample as i64)))
            .and_then(|_| file.read_exact(&mut tail))
            .map_err(|e| SyncError::io(e, "sampling tail of", path))?;
        hasher.update(&tail);
        "sample"
    };

    Ok(format!("{}:{}:{}", config.algorithm.prefix(), mode, hasher.finish()))
}

/// Compute a signature off the async runtime.
pub async fn content_signature_async(path: &Path, config: SignatureConfig) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || content_signature(&path, &config))
        .await
        .map_err(|e| SyncError::io(std::io::Error::other(e), "hashing", PathBuf::new()))?
}
