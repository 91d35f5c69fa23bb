//! Ledger Store
//!
//! Append-only JSON Lines file holding the ordered ledger. Every committed
//! record ends with `\n`; bytes after the last newline belong to an append
//! that never returned and are invisible to readers.
//!
//! The store enforces append-only discipline through its API only. The
//! filesystem still permits out-of-band edits; detecting those is the
//! verifier's job.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::audit::entry::LedgerEntry;
use crate::audit::hasher::Digest;
use crate::error::{StoreError, StoreResult};

const TAIL_CHUNK: u64 = 8 * 1024;

/// A committed line as read back from disk.
#[derive(Debug, Clone)]
pub enum ScannedRecord {
    Entry(LedgerEntry),
    Malformed { reason: String },
}

/// Result of a full read of the backing file.
#[derive(Debug, Clone, Default)]
pub struct LedgerScan {
    /// Committed records in storage order; index is the storage position.
    pub records: Vec<ScannedRecord>,
    /// Uncommitted bytes trailing the last newline.
    pub torn_tail_bytes: u64,
    /// Set when those trailing bytes are a whole entry with its newline stripped.
    pub unterminated_entry: Option<LedgerEntry>,
}

impl LedgerScan {
    /// Parsed entries up to (not including) the first malformed record.
    pub fn leading_entries(&self) -> Vec<LedgerEntry> {
        self.records
            .iter()
            .map_while(|record| match record {
                ScannedRecord::Entry(entry) => Some(entry.clone()),
                ScannedRecord::Malformed { .. } => None,
            })
            .collect()
    }
}

/// Exclusive hold on the ledger's writer lock. Released when dropped.
#[derive(Debug)]
pub struct WriterLock {
    _file: File,
}

/// File-backed append-only store.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
    fsync: bool,
}

impl LedgerStore {
    /// Create a handle. No I/O happens until a method is called.
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            path: path.into(),
            fsync,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Create an empty ledger file. Returns `false` if one already exists.
    pub fn init(&self) -> StoreResult<bool> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io("create directory for", parent, e))?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => {
                file.sync_all()
                    .map_err(|e| StoreError::io("sync", &self.path, e))?;
                info!("Initialized empty ledger at {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Ledger already initialized at {}", self.path.display());
                Ok(false)
            }
            Err(e) => Err(StoreError::io("create", &self.path, e)),
        }
    }

    fn open_for_read(&self) -> StoreResult<File> {
        File::open(&self.path).map_err(|e| self.classify_open_error("open", e))
    }

    fn classify_open_error(&self, op: &'static str, e: io::Error) -> StoreError {
        if e.kind() == ErrorKind::NotFound {
            StoreError::NotInitialized(self.path.clone())
        } else {
            StoreError::io(op, &self.path, e)
        }
    }

    /// Sibling file carrying the advisory writer lock: `<ledger>.lock`.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Take the cross-process writer lock, blocking until it is free.
    ///
    /// Held from reading the head until the new entry is synced, so producers
    /// in separate processes cannot extend the same head twice.
    pub fn lock_writer(&self) -> StoreResult<WriterLock> {
        if !self.exists() {
            return Err(StoreError::NotInitialized(self.path.clone()));
        }

        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::io("open lock file", &lock_path, e))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| StoreError::io("lock", &lock_path, e))?;

        Ok(WriterLock { _file: file })
    }

    /// Shared hold on the writer lock. `None` when no writer ever ran.
    fn lock_shared(&self) -> StoreResult<Option<File>> {
        let lock_path = self.lock_path();
        match File::open(&lock_path) {
            Ok(file) => {
                FileExt::lock_shared(&file)
                    .map_err(|e| StoreError::io("lock", &lock_path, e))?;
                Ok(Some(file))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("open lock file", &lock_path, e)),
        }
    }

    /// Read every committed line, keeping malformed lines in place so that a
    /// damaged ledger stays inspectable.
    ///
    /// Trailing bytes may belong to an append still in progress, so a scan
    /// that finds them waits for the writer and reads again.
    pub fn scan(&self) -> StoreResult<LedgerScan> {
        let scan = self.scan_once()?;
        if scan.torn_tail_bytes == 0 {
            return Ok(scan);
        }

        let _shared = self.lock_shared()?;
        let scan = self.scan_once()?;
        if let Some(entry) = &scan.unterminated_entry {
            warn!(
                "Ledger {} ends with entry {} missing its newline",
                self.path.display(),
                entry.sequence
            );
        } else if scan.torn_tail_bytes > 0 {
            warn!(
                "Ignoring {} uncommitted trailing bytes in {}",
                scan.torn_tail_bytes,
                self.path.display()
            );
        }
        Ok(scan)
    }

    fn scan_once(&self) -> StoreResult<LedgerScan> {
        let mut reader = BufReader::new(self.open_for_read()?);
        let mut scan = LedgerScan::default();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| StoreError::io("read", &self.path, e))?;
            if read == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                scan.torn_tail_bytes = buf.len() as u64;
                scan.unterminated_entry = parse_unterminated(&buf);
                break;
            }

            let line = match std::str::from_utf8(&buf[..buf.len() - 1]) {
                Ok(line) => line,
                Err(e) => {
                    scan.records.push(ScannedRecord::Malformed {
                        reason: format!("invalid UTF-8: {}", e),
                    });
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            scan.records.push(match LedgerEntry::from_line(line) {
                Ok(entry) => ScannedRecord::Entry(entry),
                Err(e) => ScannedRecord::Malformed {
                    reason: e.to_string(),
                },
            });
        }

        Ok(scan)
    }

    /// All committed entries in storage order. Fails on the first malformed record.
    pub fn read_all(&self) -> StoreResult<Vec<LedgerEntry>> {
        self.scan()?
            .records
            .into_iter()
            .enumerate()
            .map(|(position, record)| match record {
                ScannedRecord::Entry(entry) => Ok(entry),
                ScannedRecord::Malformed { reason } => Err(StoreError::Corrupt {
                    position: position as u64,
                    reason,
                }),
            })
            .collect()
    }

    /// Number of committed records.
    pub fn count(&self) -> StoreResult<u64> {
        Ok(self.scan()?.records.len() as u64)
    }

    /// The most recently committed entry, read from the end of the file.
    pub fn last_entry(&self) -> StoreResult<Option<LedgerEntry>> {
        let mut file = self.open_for_read()?;
        let line = match last_committed_line(&mut file)
            .map_err(|e| StoreError::io("read tail of", &self.path, e))?
        {
            Some(line) => line,
            None => return Ok(None),
        };

        let text = String::from_utf8(line)
            .map_err(|e| StoreError::UnreadableTail(format!("invalid UTF-8: {}", e)))?;
        LedgerEntry::from_line(&text)
            .map(Some)
            .map_err(|e| StoreError::UnreadableTail(e.to_string()))
    }

    /// Digest of the last committed entry, or the genesis sentinel.
    pub fn last_digest(&self) -> StoreResult<Digest> {
        Ok(self
            .last_entry()?
            .map(|entry| entry.entry_digest)
            .unwrap_or(Digest::GENESIS))
    }

    /// Durably append one entry. Callers serialize through [`lock_writer`].
    ///
    /// [`lock_writer`]: LedgerStore::lock_writer
    ///
    /// On failure the file is cut back to its length before the call, so a
    /// failed append leaves no partial record behind.
    pub fn append(&self, entry: &LedgerEntry) -> StoreResult<()> {
        let mut line = serde_json::to_string(entry).map_err(StoreError::Serialize)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.classify_open_error("open for append", e))?;

        let committed = self.discard_torn_tail(&mut file)?;

        let written = file
            .write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| if self.fsync { file.sync_data() } else { Ok(()) });

        if let Err(e) = written {
            error!(
                "Append of sequence {} to {} failed: {}",
                entry.sequence,
                self.path.display(),
                e
            );
            if let Err(rollback) = file.set_len(committed) {
                error!("Failed to roll back partial append: {}", rollback);
            }
            return Err(StoreError::io("append to", &self.path, e));
        }

        debug!("Stored ledger entry: {}", entry.summary());
        Ok(())
    }

    /// Truncate bytes left by an append that never completed. Returns the
    /// committed length of the file.
    ///
    /// A whole entry with only its newline missing was acknowledged at some
    /// point and is never truncated.
    fn discard_torn_tail(&self, file: &mut File) -> StoreResult<u64> {
        let len = file
            .metadata()
            .map_err(|e| StoreError::io("stat", &self.path, e))?
            .len();
        let committed = committed_len(file, len)
            .map_err(|e| StoreError::io("read tail of", &self.path, e))?;

        if committed < len {
            let mut tail = vec![0u8; (len - committed) as usize];
            file.seek(SeekFrom::Start(committed))
                .and_then(|_| file.read_exact(&mut tail))
                .map_err(|e| StoreError::io("read tail of", &self.path, e))?;
            if parse_unterminated(&tail).is_some() {
                return Err(StoreError::UnterminatedEntry { offset: committed });
            }

            warn!(
                "Truncating {} uncommitted trailing bytes from {}",
                len - committed,
                self.path.display()
            );
            file.set_len(committed)
                .map_err(|e| StoreError::io("truncate", &self.path, e))?;
            file.sync_all()
                .map_err(|e| StoreError::io("sync", &self.path, e))?;
        }
        Ok(committed)
    }

    /// Entries matching `filter`, in storage order. Malformed records are
    /// skipped so a damaged ledger can still be browsed.
    pub fn query(&self, filter: &EntryFilter) -> StoreResult<Vec<LedgerEntry>> {
        let scan = self.scan()?;
        let total = scan.records.len();
        let entries: Vec<LedgerEntry> = scan
            .records
            .into_iter()
            .filter_map(|record| match record {
                ScannedRecord::Entry(entry) => Some(entry),
                ScannedRecord::Malformed { .. } => None,
            })
            .collect();

        if entries.len() < total {
            warn!(
                "Skipped {} malformed records in {}",
                total - entries.len(),
                self.path.display()
            );
        }
        Ok(entries.into_iter().filter(|entry| filter.matches(entry)).collect())
    }

    pub fn get(&self, sequence: u64) -> StoreResult<Option<LedgerEntry>> {
        Ok(self
            .query(&EntryFilter::default())?
            .into_iter()
            .find(|entry| entry.sequence == sequence))
    }
}

/// Read-side selection over committed entries.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub event_type: Option<String>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub until: Option<DateTime<Utc>>,
}

impl EntryFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.event_type
            .as_deref()
            .map_or(true, |event_type| entry.event_type == event_type)
            && self.since.map_or(true, |since| entry.timestamp >= since)
            && self.until.map_or(true, |until| entry.timestamp <= until)
    }
}

fn parse_unterminated(tail: &[u8]) -> Option<LedgerEntry> {
    let text = std::str::from_utf8(tail).ok()?;
    if text.trim().is_empty() {
        return None;
    }
    LedgerEntry::from_line(text).ok()
}

/// Length of the file up to and including its last newline.
fn committed_len(file: &mut File, len: u64) -> io::Result<u64> {
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK);
        let mut chunk = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk)?;
        if let Some(idx) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(start + idx as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Read backwards from the end of the file to the last non-blank,
/// newline-terminated line.
fn last_committed_line(file: &mut File) -> io::Result<Option<Vec<u8>>> {
    let len = file.metadata()?.len();
    let mut start = len;
    let mut tail: Vec<u8> = Vec::new();

    while start > 0 {
        let read_from = start.saturating_sub(TAIL_CHUNK);
        let mut chunk = vec![0u8; (start - read_from) as usize];
        file.seek(SeekFrom::Start(read_from))?;
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&tail);
        tail = chunk;
        start = read_from;

        if let Some(line) = last_complete_line(&tail, start == 0) {
            return Ok(Some(line.to_vec()));
        }
    }
    Ok(None)
}

/// Find the last non-blank complete line in `buf`. A line whose start lies
/// before `buf` is only trusted when `buf` begins at offset 0.
fn last_complete_line(buf: &[u8], at_file_start: bool) -> Option<&[u8]> {
    let committed_end = buf.iter().rposition(|&b| b == b'\n')?;
    let committed = &buf[..committed_end];
    let mut end = committed.len();

    loop {
        match committed[..end].iter().rposition(|&b| b == b'\n') {
            Some(newline) => {
                let line = &committed[newline + 1..end];
                if !is_blank(line) {
                    return Some(line);
                }
                end = newline;
            }
            None => {
                let line = &committed[..end];
                return (at_file_start && !is_blank(line)).then_some(line);
            }
        }
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::parse_payload;
    use tempfile::tempdir;

    fn entry(sequence: u64, previous: Digest) -> LedgerEntry {
        let payload = parse_payload(&format!(r#"{{"n":{}}}"#, sequence)).unwrap();
        LedgerEntry::seal(sequence, Utc::now(), "test".to_string(), payload, previous)
    }

    fn store_in(dir: &Path) -> LedgerStore {
        let store = LedgerStore::new(dir.join("nested").join("ledger.jsonl"), true);
        assert!(store.init().unwrap());
        store
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(!store.init().unwrap());
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.last_digest().unwrap(), Digest::GENESIS);
    }

    #[test]
    fn test_uninitialized_store() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("missing.jsonl"), false);
        assert!(matches!(store.read_all(), Err(StoreError::NotInitialized(_))));
        let e = entry(0, Digest::GENESIS);
        assert!(matches!(store.append(&e), Err(StoreError::NotInitialized(_))));
    }

    #[test]
    fn test_append_and_read_back_in_order() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let mut previous = Digest::GENESIS;
        let mut appended = Vec::new();
        for i in 0..5 {
            let e = entry(i, previous);
            store.append(&e).unwrap();
            previous = e.entry_digest;
            appended.push(e);
        }

        assert_eq!(store.read_all().unwrap(), appended);
        assert_eq!(store.last_digest().unwrap(), previous);
        assert_eq!(store.last_entry().unwrap().unwrap().sequence, 4);
    }

    #[test]
    fn test_unterminated_entry_is_never_truncated() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let first = entry(0, Digest::GENESIS);
        let second = entry(1, first.entry_digest);
        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let len = fs::metadata(store.path()).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(store.path())
            .unwrap()
            .set_len(len - 1)
            .unwrap();
        let before = fs::read(store.path()).unwrap();

        let scan = store.scan().unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.unterminated_entry, Some(second.clone()));

        let third = entry(1, first.entry_digest);
        assert!(matches!(
            store.append(&third),
            Err(StoreError::UnterminatedEntry { .. })
        ));
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn test_writer_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let held = store.lock_writer().unwrap();
        let contender = File::open(store.lock_path()).unwrap();
        assert!(FileExt::try_lock_exclusive(&contender).is_err());
        assert!(FileExt::try_lock_shared(&contender).is_err());

        drop(held);
        assert!(FileExt::try_lock_exclusive(&contender).is_ok());
    }

    #[test]
    fn test_writer_lock_requires_initialized_ledger() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("missing.jsonl"), false);
        assert!(matches!(store.lock_writer(), Err(StoreError::NotInitialized(_))));
        assert!(!store.lock_path().exists());
    }

    #[test]
    fn test_torn_tail_is_invisible_then_discarded() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let first = entry(0, Digest::GENESIS);
        store.append(&first).unwrap();

        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(b"{\"sequence\":1,\"timest").unwrap();
        drop(file);

        let scan = store.scan().unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.torn_tail_bytes, 21);
        assert_eq!(store.last_digest().unwrap(), first.entry_digest);

        let second = entry(1, first.entry_digest);
        store.append(&second).unwrap();
        assert_eq!(store.read_all().unwrap(), vec![first, second]);
    }

    #[test]
    fn test_malformed_line_is_reported_in_place() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let first = entry(0, Digest::GENESIS);
        store.append(&first).unwrap();

        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(b"\nnot json at all\n").unwrap();
        drop(file);

        let scan = store.scan().unwrap();
        assert_eq!(scan.records.len(), 2);
        assert!(matches!(scan.records[1], ScannedRecord::Malformed { .. }));
        assert_eq!(scan.leading_entries(), vec![first]);
        assert!(matches!(
            store.read_all(),
            Err(StoreError::Corrupt { position: 1, .. })
        ));
        assert!(matches!(store.last_entry(), Err(StoreError::UnreadableTail(_))));
    }

    #[test]
    fn test_last_line_spanning_chunks() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let big = "x".repeat((TAIL_CHUNK as usize) * 2 + 17);
        let payload = parse_payload(&format!(r#"{{"blob":"{}"}}"#, big)).unwrap();
        let first = entry(0, Digest::GENESIS);
        store.append(&first).unwrap();
        let second =
            LedgerEntry::seal(1, Utc::now(), "big".to_string(), payload, first.entry_digest);
        store.append(&second).unwrap();

        assert_eq!(store.last_entry().unwrap(), Some(second));
    }

    #[test]
    fn test_last_complete_line() {
        assert_eq!(last_complete_line(b"a\nb\n", true), Some(&b"b"[..]));
        assert_eq!(last_complete_line(b"a\nb\npartial", true), Some(&b"b"[..]));
        assert_eq!(last_complete_line(b"a\n\n  \n", true), Some(&b"a"[..]));
        assert_eq!(last_complete_line(b"tail-of-a\n", false), None);
        assert_eq!(last_complete_line(b"partial", true), None);
    }

    #[test]
    fn test_queries() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let first = entry(0, Digest::GENESIS);
        store.append(&first).unwrap();
        let payload = parse_payload("{}").unwrap();
        let later = first.timestamp + chrono::Duration::seconds(1);
        let second =
            LedgerEntry::seal(1, later, "other".to_string(), payload, first.entry_digest);
        store.append(&second).unwrap();

        let by_type = EntryFilter {
            event_type: Some("test".to_string()),
            ..EntryFilter::default()
        };
        assert_eq!(store.query(&by_type).unwrap(), vec![first.clone()]);

        let since = EntryFilter {
            since: Some(second.timestamp),
            ..EntryFilter::default()
        };
        assert_eq!(store.query(&since).unwrap(), vec![second.clone()]);

        let until = EntryFilter {
            until: Some(first.timestamp),
            ..EntryFilter::default()
        };
        assert_eq!(store.query(&until).unwrap(), vec![first]);

        assert_eq!(store.get(1).unwrap(), Some(second));
        assert_eq!(store.get(7).unwrap(), None);
    }
}
