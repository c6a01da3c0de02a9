//! Filesystem discovery and manifest construction (spec §4.3.2). Grounded
//! on the teacher's `view::data::all_ledger_files_with_ts` — enumerate
//! candidate files and order them by recency — generalized from a single
//! ledger directory to a recursive scan of arbitrary allowed roots with a
//! `*.jsonl` pattern and an explicit per-file classification.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClassification {
    Valid,
    TooLarge,
    Unreadable,
    Corrupt,
}

#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub classification: FileClassification,
    pub size_bytes: u64,
    pub modified: SystemTime,
    pub index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn valid(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.classification == FileClassification::Valid)
    }
}

/// Recursively scans `roots` for `*.jsonl` files, classifies each, and
/// orders the manifest by recency then size (both descending) so the
/// busiest, freshest sessions are processed first.
pub fn discover(roots: &[PathBuf], max_file_size: u64) -> Result<Manifest, Error> {
    let mut candidates = Vec::new();
    for root in roots {
        if root.is_dir() {
            walk(root, &mut candidates)?;
        }
    }

    let mut entries: Vec<(PathBuf, FileClassification, u64, SystemTime)> =
        candidates.into_iter().map(|path| classify(&path, max_file_size)).collect();

    entries.sort_by(|a, b| b.3.cmp(&a.3).then(b.2.cmp(&a.2)));

    let entries = entries
        .into_iter()
        .enumerate()
        .map(|(index, (path, classification, size_bytes, modified))| ManifestEntry {
            path,
            classification,
            size_bytes,
            modified,
            index,
        })
        .collect();

    Ok(Manifest { entries })
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            out.push(path);
        }
    }
    Ok(())
}

fn classify(path: &Path, max_file_size: u64) -> (PathBuf, FileClassification, u64, SystemTime) {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return (path.to_path_buf(), FileClassification::Unreadable, 0, SystemTime::UNIX_EPOCH),
    };
    let size = meta.len();
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    if size > max_file_size {
        return (path.to_path_buf(), FileClassification::TooLarge, size, modified);
    }

    match peek_first_line_valid(path) {
        Some(true) => (path.to_path_buf(), FileClassification::Valid, size, modified),
        Some(false) => (path.to_path_buf(), FileClassification::Corrupt, size, modified),
        None => (path.to_path_buf(), FileClassification::Unreadable, size, modified),
    }
}

/// A lightweight corruption probe: the first non-empty line must parse as
/// JSON. An empty file is considered valid (nothing to tail yet).
fn peek_first_line_valid(path: &Path) -> Option<bool> {
    let file = std::fs::File::open(path).ok()?;
    let mut reader = std::io::BufReader::new(file);
    let mut line = String::new();
    let read = reader.read_line(&mut line).ok()?;
    if read == 0 {
        return Some(true);
    }
    Some(serde_json::from_str::<serde_json::Value>(line.trim()).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_valid_corrupt_and_too_large() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("valid.jsonl"), "{\"a\":1}\n").unwrap();
        std::fs::write(dir.path().join("corrupt.jsonl"), "{not json\n").unwrap();
        std::fs::write(dir.path().join("big.jsonl"), vec![b'x'; 200]).unwrap();
        std::fs::write(dir.path().join("skip.txt"), "ignored").unwrap();

        let manifest = discover(&[dir.path().to_path_buf()], 100).unwrap();
        assert_eq!(manifest.entries.len(), 3);

        let by_name = |name: &str| manifest.entries.iter().find(|e| e.path.file_name().unwrap() == name).unwrap();
        assert_eq!(by_name("valid.jsonl").classification, FileClassification::Valid);
        assert_eq!(by_name("corrupt.jsonl").classification, FileClassification::Corrupt);
        assert_eq!(by_name("big.jsonl").classification, FileClassification::TooLarge);
    }

    #[test]
    fn empty_file_is_valid_not_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.jsonl"), "").unwrap();
        let manifest = discover(&[dir.path().to_path_buf()], 100).unwrap();
        assert_eq!(manifest.entries[0].classification, FileClassification::Valid);
    }

    #[test]
    fn manifest_orders_by_recency_then_size_descending() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.jsonl");
        let new = dir.path().join("new.jsonl");
        std::fs::write(&old, "{}\n").unwrap();
        std::fs::write(&new, "{}\n").unwrap();

        let now = filetime::FileTime::now();
        let earlier = filetime::FileTime::from_unix_time(now.unix_seconds() - 3600, 0);
        filetime::set_file_mtime(&old, earlier).unwrap();
        filetime::set_file_mtime(&new, now).unwrap();

        let manifest = discover(&[dir.path().to_path_buf()], 1024).unwrap();
        assert_eq!(manifest.entries[0].path, new);
        assert_eq!(manifest.entries[0].index, 0);
    }

    #[test]
    fn nested_directories_are_scanned_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("project/session");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("a.jsonl"), "{}\n").unwrap();

        let manifest = discover(&[dir.path().to_path_buf()], 1024).unwrap();
        assert_eq!(manifest.entries.len(), 1);
    }
}
