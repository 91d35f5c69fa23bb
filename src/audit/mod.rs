//! Audit Ledger System
//!
//! Append-only, hash-chained ledger of application and operational events.
//! Tampering with the backing file is detected by verification, not
//! prevented by the storage layer.

pub mod entry;
pub mod export;
pub mod hasher;
pub mod ledger;
pub mod merkle;
pub mod store;
pub mod verify;

pub use entry::{LedgerEntry, Payload};
pub use export::{build_report, export_report, LedgerReport, ReportFormat};
pub use hasher::{compute_digest, Digest, GENESIS_DIGEST_HEX};
pub use ledger::AuditLedger;
pub use merkle::{generate_merkle_proof, merkle_root, verify_merkle_root, MerkleProof};
pub use store::{EntryFilter, LedgerScan, LedgerStore, ScannedRecord, WriterLock};
pub use verify::{
    verify_entries, verify_ledger_file, verify_records, verify_scan, verify_store, BreakReason,
    VerificationResult,
};
