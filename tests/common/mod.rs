#![allow(dead_code)]

use audit_ledger::audit::{AuditLedger, LedgerEntry, LedgerStore};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// An initialized ledger in a fresh temp directory. Keep the `TempDir` alive.
pub async fn setup_ledger(fsync: bool) -> (TempDir, AuditLedger) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = LedgerStore::new(temp_dir.path().join("audit.jsonl"), fsync);
    let ledger = AuditLedger::new(store);
    ledger.init().await.expect("Failed to init ledger");
    (temp_dir, ledger)
}

/// Append `count` events with actors `svc-0`, `svc-1`, ...
pub async fn append_events(ledger: &AuditLedger, count: usize) -> Vec<LedgerEntry> {
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let payload = format!(r#"{{"actor":"svc-{}","index":{}}}"#, i, i);
        entries.push(
            ledger
                .submit_json("audit", &payload)
                .await
                .expect("Failed to append event"),
        );
    }
    entries
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .expect("Failed to read ledger")
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn write_lines(path: &Path, lines: &[String]) {
    let mut contents = lines.join("\n");
    if !lines.is_empty() {
        contents.push('\n');
    }
    fs::write(path, contents).expect("Failed to rewrite ledger");
}

/// Rewrite one stored record in place, the way an attacker with file access would.
pub fn tamper_line(path: &Path, index: usize, edit: impl FnOnce(&mut Value)) {
    let mut lines = read_lines(path);
    let mut record: Value = serde_json::from_str(&lines[index]).expect("Stored line is not JSON");
    edit(&mut record);
    lines[index] = record.to_string();
    write_lines(path, &lines);
}

pub fn remove_line(path: &Path, index: usize) {
    let mut lines = read_lines(path);
    lines.remove(index);
    write_lines(path, &lines);
}

pub fn insert_line(path: &Path, index: usize, line: String) {
    let mut lines = read_lines(path);
    lines.insert(index, line);
    write_lines(path, &lines);
}
