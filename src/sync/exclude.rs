//! Exclude pattern matching for watched paths.
//!
//! Patterns are globs (`*.log`, `cache/**`). A pattern matches the full
//! relative path, the file name, or any single path component, so `.git`
//! excludes the directory and everything below it.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path};

use crate::error::{Result, SyncError};

/// Editor swap files, partial downloads and OS metadata.
pub const TEMP_FILE_PATTERNS: &[&str] = &[
    "*.swp",
    "*.swo",
    "*~",
    "*.tmp",
    "*.temp",
    "*.bak",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "*.crdownload",
    "*.part",
    "*.filepart",
];

/// Compiled set of exclude globs.
#[derive(Debug, Clone)]
pub struct ExcludePatterns {
    glob_set: GlobSet,
    patterns: Vec<String>,
}

impl Default for ExcludePatterns {
    fn default() -> Self {
        Self::new()
    }
}

impl ExcludePatterns {
    /// An empty set that excludes nothing.
    pub fn new() -> Self {
        Self {
            glob_set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    /// The temp-file patterns only.
    pub fn temp_files() -> Self {
        // The built-in list is static and known to compile.
        Self::from_patterns(TEMP_FILE_PATTERNS).unwrap_or_default()
    }

    /// Build from user patterns, optionally prefixed by the temp-file list.
    pub fn build<S: AsRef<str>>(patterns: &[S], include_temp_files: bool) -> Result<Self> {
        let mut all: Vec<&str> = Vec::new();
        if include_temp_files {
            all.extend_from_slice(TEMP_FILE_PATTERNS);
        }
        all.extend(patterns.iter().map(|p| p.as_ref()));
        Self::from_patterns(&all)
    }

    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut pattern_list = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern)
                .map_err(|e| SyncError::Config(format!("invalid exclude pattern '{}': {}", pattern, e)))?;
            builder.add(glob);
            pattern_list.push(pattern.to_string());
        }

        let glob_set = builder
            .build()
            .map_err(|e| SyncError::Config(format!("failed to compile exclude patterns: {}", e)))?;

        Ok(Self {
            glob_set,
            patterns: pattern_list,
        })
    }

    /// Check a relative path, rejecting paths that escape the root.
    pub fn check(&self, path: &str) -> Result<bool> {
        let candidate = Path::new(path);
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                other => {
                    return Err(SyncError::FilterEvaluation {
                        path: path.to_string(),
                        reason: format!("unexpected path component {:?}", other),
                    })
                }
            }
        }
        Ok(self.is_excluded(path))
    }

    /// Check if a path should be excluded.
    pub fn is_excluded(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        if self.glob_set.is_match(path) {
            return true;
        }

        // Directory patterns such as `node_modules` apply at any depth.
        for component in Path::new(path).components() {
            if let Component::Normal(name) = component {
                if self.glob_set.is_match(name.to_string_lossy().as_ref()) {
                    return true;
                }
            }
        }

        false
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Combine two sets; used to layer per-target excludes over the global ones.
    pub fn merged(&self, other: &ExcludePatterns) -> Result<Self> {
        let mut all = self.patterns.clone();
        for pattern in &other.patterns {
            if !all.contains(pattern) {
                all.push(pattern.clone());
            }
        }
        Self::from_patterns(&all)
    }
}
