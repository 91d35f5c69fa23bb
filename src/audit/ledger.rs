//! Audit Ledger
//!
//! The single writer. Every append runs under two exclusive locks, an async
//! mutex for producers sharing this process and the store's file lock for
//! producers in other processes. Under them the prior digest is re-read from
//! the store, the new entry is sealed and persisted, and only then are the
//! locks released. Nothing about the chain head is cached in memory, so a
//! failed append leaves no state to roll back.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::audit::entry::{self, LedgerEntry, Payload};
use crate::audit::export::{self, LedgerReport, ReportFormat};
use crate::audit::hasher::Digest;
use crate::audit::store::LedgerStore;
use crate::audit::verify::{self, VerificationResult};
use crate::config::LedgerConfig;
use crate::error::{AppendError, AppendResult, StoreError, StoreResult};

/// Append coordinator plus read-side conveniences.
///
/// Clones share the same writer lock.
#[derive(Clone)]
pub struct AuditLedger {
    writer: Arc<Mutex<LedgerStore>>,
    reader: LedgerStore,
}

impl AuditLedger {
    pub fn new(store: LedgerStore) -> Self {
        Self {
            writer: Arc::new(Mutex::new(store.clone())),
            reader: store,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(LedgerStore::new(&config.ledger_path, config.fsync))
    }

    /// Create the backing file if needed. Idempotent.
    pub async fn init(&self) -> StoreResult<bool> {
        let store = self.writer.lock().await;
        store.init()
    }

    pub fn store(&self) -> &LedgerStore {
        &self.reader
    }

    /// Submit one event and return the committed entry.
    pub async fn submit(&self, event_type: &str, payload: Payload) -> AppendResult<LedgerEntry> {
        entry::validate_event_type(event_type)?;

        let store = self.writer.lock().await;
        let file_lock = store.lock_writer()?;

        let last = store.last_entry().map_err(chain_error)?;

        let (sequence, previous_digest, floor) = match &last {
            Some(last) => {
                let sequence = last.sequence.checked_add(1).ok_or_else(|| {
                    AppendError::Chain("sequence space exhausted".to_string())
                })?;
                (sequence, last.entry_digest, Some(last.timestamp))
            }
            None => (0, Digest::GENESIS, None),
        };

        let now = Utc::now();
        let timestamp = match floor {
            Some(floor) if floor > now => {
                warn!(
                    "Clock is behind the ledger head ({} < {}); reusing head timestamp",
                    now.to_rfc3339(),
                    floor.to_rfc3339()
                );
                floor
            }
            _ => now,
        };

        let entry = LedgerEntry::seal(
            sequence,
            timestamp,
            event_type.to_string(),
            payload,
            previous_digest,
        );
        store.append(&entry).map_err(chain_error)?;
        drop(file_lock);
        drop(store);

        debug!("Appended ledger entry: {}", entry.summary());
        Ok(entry)
    }

    /// Submit an event whose payload is raw JSON text.
    pub async fn submit_json(&self, event_type: &str, raw_payload: &str) -> AppendResult<LedgerEntry> {
        let payload = entry::parse_payload(raw_payload)?;
        self.submit(event_type, payload).await
    }

    /// Run the chain verifier. Does not take the writer lock.
    pub fn verify(&self) -> StoreResult<VerificationResult> {
        verify::verify_store(&self.reader)
    }

    pub fn export(
        &self,
        destination: &std::path::Path,
        format: ReportFormat,
    ) -> StoreResult<LedgerReport> {
        export::export_report(&self.reader, destination, format)
    }

    pub fn entries(&self) -> StoreResult<Vec<LedgerEntry>> {
        self.reader.read_all()
    }

    pub fn head(&self) -> StoreResult<Option<LedgerEntry>> {
        self.reader.last_entry()
    }
}

/// Damage at the head of the ledger means there is no trustworthy digest to
/// extend.
fn chain_error(e: StoreError) -> AppendError {
    match e {
        StoreError::UnreadableTail(reason) => {
            AppendError::Chain(format!("cannot read prior digest: {}", reason))
        }
        e @ StoreError::UnterminatedEntry { .. } => AppendError::Chain(e.to_string()),
        other => AppendError::Store(other),
    }
}
