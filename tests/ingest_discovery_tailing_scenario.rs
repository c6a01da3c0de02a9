//! Cross-module scenario: discovery classifies a mixed directory, and only
//! the files it marks `Valid` are handed to the tailer, which in turn
//! advances per-file cursors as those files grow across two passes.

use context_cleaner_core::crypto::EncryptionKey;
use context_cleaner_core::ingest::pipeline::tail_file;
use context_cleaner_core::ingest::{discover, CursorStore, FileClassification, PathGuard};

fn line(uuid: &str, session: &str, text: &str) -> String {
    format!(
        "{{\"uuid\":\"{uuid}\",\"sessionId\":\"{session}\",\"timestamp\":\"2024-01-01T00:00:00Z\",\"message\":{{\"role\":\"user\",\"content\":\"{text}\"}}}}\n"
    )
}

#[tokio::test]
async fn only_manifest_valid_files_are_tailed_and_classification_is_respected() {
    let dir = tempfile::tempdir().unwrap();

    std::fs::write(
        dir.path().join("session.jsonl"),
        line("3fa85f64-5717-4562-b3fc-2c963f66afa6", "3fa85f64-5717-4562-b3fc-2c963f66afa7", "hello"),
    )
    .unwrap();
    std::fs::write(dir.path().join("corrupt.jsonl"), "{not json\n").unwrap();
    std::fs::write(dir.path().join("oversized.jsonl"), vec![b'x'; 4096]).unwrap();

    let manifest = discover(&[dir.path().to_path_buf()], 1024).unwrap();
    assert_eq!(manifest.valid().count(), 1);
    assert!(manifest.entries.iter().any(|e| e.classification == FileClassification::Corrupt));
    assert!(manifest.entries.iter().any(|e| e.classification == FileClassification::TooLarge));

    let guard = PathGuard::new(vec![dir.path().canonicalize().unwrap()]);
    let cursor_store = CursorStore::load(dir.path().join("cursors.enc"), EncryptionKey::from_bytes([9u8; 32])).await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel(1024);

    for entry in manifest.valid() {
        tail_file(&entry.path, &cursor_store, &guard, &tx).await.unwrap();
    }
    drop(tx);

    let mut lines = Vec::new();
    while let Some(event) = rx.recv().await {
        lines.push(event.line);
    }
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("hello"));
}

#[tokio::test]
async fn a_growing_file_is_picked_up_incrementally_across_discovery_passes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.jsonl");
    std::fs::write(&path, line("3fa85f64-5717-4562-b3fc-2c963f66afa6", "3fa85f64-5717-4562-b3fc-2c963f66afa7", "first")).unwrap();

    let guard = PathGuard::new(vec![dir.path().canonicalize().unwrap()]);
    let cursor_store = CursorStore::load(dir.path().join("cursors.enc"), EncryptionKey::from_bytes([9u8; 32])).await.unwrap();

    let first_pass = discover(&[dir.path().to_path_buf()], 1024 * 1024).unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel(1024);
    for entry in first_pass.valid() {
        tail_file(&entry.path, &cursor_store, &guard, &tx).await.unwrap();
    }
    drop(tx);
    let mut seen = 0;
    while rx.recv().await.is_some() {
        seen += 1;
    }
    assert_eq!(seen, 1);

    use std::io::Write;
    let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(line("3fa85f64-5717-4562-b3fc-2c963f66afa8", "3fa85f64-5717-4562-b3fc-2c963f66afa7", "second").as_bytes()).unwrap();
    drop(f);

    let second_pass = discover(&[dir.path().to_path_buf()], 1024 * 1024).unwrap();
    let (tx2, mut rx2) = tokio::sync::mpsc::channel(1024);
    for entry in second_pass.valid() {
        tail_file(&entry.path, &cursor_store, &guard, &tx2).await.unwrap();
    }
    drop(tx2);
    let mut new_lines = Vec::new();
    while let Some(event) = rx2.recv().await {
        new_lines.push(event.line);
    }
    assert_eq!(new_lines.len(), 1);
    assert!(new_lines[0].contains("second"));
}
