//! Ledger Verification
//!
//! Walks the stored sequence from position 0, recomputing each digest and
//! checking each link against a running expected digest that starts at the
//! genesis sentinel. Halts at the first divergence and reports it; damage is
//! never skipped or repaired.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::audit::entry::LedgerEntry;
use crate::audit::hasher::Digest;
use crate::audit::store::{LedgerScan, LedgerStore, ScannedRecord};
use crate::error::StoreResult;

/// Why verification stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    /// The stored line is not a parseable entry.
    MalformedRecord,
    /// The entry's content no longer matches its own digest.
    DigestMismatch,
    /// `previous_digest` does not match the prior entry's digest.
    BrokenLink,
    /// `sequence` does not match the entry's storage position.
    SequenceMismatch,
    /// The timestamp is earlier than its predecessor's.
    TimestampRegression,
    /// A whole entry ends the file without its newline.
    UnterminatedRecord,
}

impl BreakReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedRecord => "malformed record",
            Self::DigestMismatch => "entry digest mismatch (content altered)",
            Self::BrokenLink => "broken chain link (entry deleted, inserted or reordered)",
            Self::SequenceMismatch => "sequence number out of place",
            Self::TimestampRegression => "timestamp earlier than predecessor",
            Self::UnterminatedRecord => "last entry is missing its line terminator",
        }
    }
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a verification pass.
///
/// `first_break` is the storage position of the offending record, which is
/// the sequence number an intact ledger carries at that slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub first_break: Option<u64>,
    pub reason: Option<BreakReason>,
    pub detail: Option<String>,
    /// Committed records examined, including any past the break.
    pub entry_count: u64,
    /// Records that passed every check before the break.
    pub verified_count: u64,
    /// Digest of the last verified entry (the genesis sentinel if none).
    pub head_digest: Digest,
    /// Bytes after the last newline that were not part of any record.
    pub torn_tail_bytes: u64,
}

impl VerificationResult {
    fn intact(entry_count: u64, head_digest: Digest) -> Self {
        Self {
            valid: true,
            first_break: None,
            reason: None,
            detail: None,
            entry_count,
            verified_count: entry_count,
            head_digest,
            torn_tail_bytes: 0,
        }
    }

    fn broken(
        position: u64,
        reason: BreakReason,
        detail: String,
        entry_count: u64,
        head_digest: Digest,
    ) -> Self {
        Self {
            valid: false,
            first_break: Some(position),
            reason: Some(reason),
            detail: Some(detail),
            entry_count,
            verified_count: position,
            head_digest,
            torn_tail_bytes: 0,
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        match (self.first_break, self.reason) {
            (Some(sequence), Some(reason)) => format!(
                "INTEGRITY BROKEN at sequence {}: {} ({} of {} entries verified)",
                sequence, reason, self.verified_count, self.entry_count
            ),
            _ if self.torn_tail_bytes > 0 => format!(
                "Integrity verified ({} entries; {} uncommitted trailing bytes ignored)",
                self.entry_count, self.torn_tail_bytes
            ),
            _ => format!("Integrity verified ({} entries)", self.entry_count),
        }
    }

    /// Get detailed status
    pub fn detailed_status(&self) -> String {
        format!(
            "Entries: {}\nVerified: {}\nHead digest: {}\nStatus: {}\nDetail: {}",
            self.entry_count,
            self.verified_count,
            self.head_digest,
            if self.valid { "PASS" } else { "FAIL" },
            self.detail.as_deref().unwrap_or("None")
        )
    }
}

/// Check one entry against the chain state carried from its predecessor.
fn check_entry(
    position: u64,
    entry: &LedgerEntry,
    expected_previous: &Digest,
    previous_timestamp: Option<DateTime<Utc>>,
) -> Result<(), (BreakReason, String)> {
    let computed = entry.calculate_digest();
    if computed != entry.entry_digest {
        return Err((
            BreakReason::DigestMismatch,
            format!(
                "stored digest {} but content hashes to {}",
                entry.entry_digest, computed
            ),
        ));
    }

    if entry.previous_digest != *expected_previous {
        return Err((
            BreakReason::BrokenLink,
            format!(
                "expected previous digest {}, found {} (stored sequence {})",
                expected_previous, entry.previous_digest, entry.sequence
            ),
        ));
    }

    if entry.sequence != position {
        return Err((
            BreakReason::SequenceMismatch,
            format!(
                "record at position {} carries sequence {}",
                position, entry.sequence
            ),
        ));
    }

    if let Some(previous) = previous_timestamp {
        if entry.timestamp < previous {
            return Err((
                BreakReason::TimestampRegression,
                format!(
                    "timestamp {} precedes predecessor's {}",
                    entry.timestamp.to_rfc3339(),
                    previous.to_rfc3339()
                ),
            ));
        }
    }

    Ok(())
}

/// Verify records as read from storage, malformed lines included.
pub fn verify_records(records: &[ScannedRecord]) -> VerificationResult {
    let entry_count = records.len() as u64;
    let mut expected_previous = Digest::GENESIS;
    let mut previous_timestamp = None;

    for (position, record) in records.iter().enumerate() {
        let position = position as u64;
        let outcome = match record {
            ScannedRecord::Entry(entry) => {
                check_entry(position, entry, &expected_previous, previous_timestamp)
                    .map(|()| entry)
            }
            ScannedRecord::Malformed { reason } => {
                Err((BreakReason::MalformedRecord, reason.clone()))
            }
        };

        match outcome {
            Ok(entry) => {
                expected_previous = entry.entry_digest;
                previous_timestamp = Some(entry.timestamp);
            }
            Err((reason, detail)) => {
                warn!(
                    "Ledger chain break at sequence {}: {} ({})",
                    position, reason, detail
                );
                return VerificationResult::broken(
                    position,
                    reason,
                    detail,
                    entry_count,
                    expected_previous,
                );
            }
        }
    }

    VerificationResult::intact(entry_count, expected_previous)
}

/// Verify a full scan, including what trails the last committed record.
///
/// A whole entry missing only its newline was written out completely, so it
/// counts as a break at the next position rather than as an ignored tail.
pub fn verify_scan(scan: &LedgerScan) -> VerificationResult {
    let mut result = verify_records(&scan.records);

    if let (true, Some(entry)) = (result.valid, &scan.unterminated_entry) {
        let position = scan.records.len() as u64;
        warn!(
            "Ledger chain break at sequence {}: {}",
            position,
            BreakReason::UnterminatedRecord
        );
        result = VerificationResult::broken(
            position,
            BreakReason::UnterminatedRecord,
            format!(
                "entry with stored sequence {} ends the file without a newline",
                entry.sequence
            ),
            result.entry_count,
            result.head_digest,
        );
    }
    result.torn_tail_bytes = scan.torn_tail_bytes;
    result
}

/// Verify complete ledger hash chain
pub fn verify_entries(entries: &[LedgerEntry]) -> VerificationResult {
    let records: Vec<ScannedRecord> = entries.iter().cloned().map(ScannedRecord::Entry).collect();
    verify_records(&records)
}

/// Verify the ledger behind a store. Read-only and repeatable.
pub fn verify_store(store: &LedgerStore) -> StoreResult<VerificationResult> {
    info!("Verifying ledger: {}", store.path().display());
    let scan = store.scan()?;
    let result = verify_scan(&scan);
    if result.valid {
        info!("Ledger verification successful: {} entries", result.entry_count);
    }
    Ok(result)
}

/// Verify ledger file
pub fn verify_ledger_file(path: impl AsRef<Path>) -> StoreResult<VerificationResult> {
    verify_store(&LedgerStore::new(path.as_ref(), false))
}
