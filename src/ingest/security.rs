//! Secure path handling (spec §4.3.1). Paths are canonicalized and must
//! resolve under one of the configured allowed roots; traversal attempts
//! are rejected before a file is ever opened.

use std::path::{Path, PathBuf};

use crate::error::Error;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

pub struct PathGuard {
    allowed_roots: Vec<PathBuf>,
    max_file_size: u64,
}

impl PathGuard {
    pub fn new(allowed_roots: Vec<PathBuf>) -> Self {
        Self { allowed_roots, max_file_size: DEFAULT_MAX_FILE_SIZE }
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Canonicalizes `path` and verifies it resolves under an allowed root,
    /// is a regular, readable file, and is no larger than `max_file_size`.
    /// Rejects `..`/drive-prefix traversal by relying on canonicalization
    /// rather than string inspection.
    pub fn admit(&self, path: &Path) -> Result<PathBuf, Error> {
        let canonical = path
            .canonicalize()
            .map_err(|e| Error::path_security(format!("cannot canonicalize {}: {e}", path.display())))?;

        let under_allowed_root = self
            .allowed_roots
            .iter()
            .any(|root| canonical.starts_with(root));
        if !under_allowed_root {
            return Err(Error::path_security(format!(
                "{} does not resolve under an allowed root",
                canonical.display()
            )));
        }

        let meta = std::fs::metadata(&canonical)
            .map_err(|e| Error::path_security(format!("cannot stat {}: {e}", canonical.display())))?;

        if !meta.is_file() {
            return Err(Error::path_security(format!("{} is not a regular file", canonical.display())));
        }

        if meta.len() > self.max_file_size {
            return Err(Error::path_security(format!(
                "{} is {} bytes, exceeds max_file_size {}",
                canonical.display(),
                meta.len(),
                self.max_file_size
            )));
        }

        Ok(canonical)
    }
}
