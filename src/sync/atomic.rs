//! Write-new-then-replace file updates.

use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::{Result, SyncError};

/// Replace `path` with `bytes`; readers see either the old or the new file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| SyncError::io(e, "creating", dir))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| SyncError::io(e, "creating temp file in", dir))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| SyncError::io(e, "writing", tmp.path()))?;
    tmp.persist(path)
        .map_err(|e| SyncError::io(e.error, "replacing", path))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}
