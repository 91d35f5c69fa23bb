//! Ledger Export
//!
//! Renders every committed record in storage order together with the
//! verifier's verdict. Rendering and verification share one scan, so the
//! report describes a single consistent snapshot. Nothing here writes to
//! the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::audit::entry::LedgerEntry;
use crate::audit::hasher::{Digest, GENESIS_DIGEST_HEX};
use crate::audit::merkle::merkle_root;
use crate::audit::store::{LedgerStore, ScannedRecord};
use crate::audit::verify::{verify_scan, VerificationResult};
use crate::error::{StoreError, StoreResult};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

/// One row of the report, in storage order.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub position: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<LedgerEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub malformed: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerReport {
    pub ledger_path: String,
    pub generated_at: DateTime<Utc>,
    pub genesis_digest: &'static str,
    /// Merkle root over the entries that passed verification.
    pub merkle_root: Option<Digest>,
    pub rows: Vec<ReportRow>,
    pub verification: VerificationResult,
}

impl LedgerReport {
    pub fn render(&self, format: ReportFormat) -> StoreResult<String> {
        match format {
            ReportFormat::Text => Ok(self.render_text()),
            ReportFormat::Json => {
                let mut json =
                    serde_json::to_string_pretty(self).map_err(StoreError::Serialize)?;
                json.push('\n');
                Ok(json)
            }
        }
    }

    pub fn render_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LedgerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Audit Ledger Report")?;
        writeln!(f, "===================")?;
        writeln!(f, "Ledger:       {}", self.ledger_path)?;
        writeln!(f, "Generated at: {}", self.generated_at.to_rfc3339())?;
        writeln!(f, "Entries:      {}", self.verification.entry_count)?;
        writeln!(f, "Genesis:      {}", self.genesis_digest)?;
        writeln!(f)?;

        for row in &self.rows {
            match (&row.entry, &row.malformed) {
                (Some(entry), _) => {
                    writeln!(
                        f,
                        "[{}] {}  {}",
                        entry.sequence,
                        entry.timestamp.to_rfc3339(),
                        entry.event_type
                    )?;
                    writeln!(
                        f,
                        "    payload:  {}",
                        serde_json::Value::Object(entry.payload.clone())
                    )?;
                    writeln!(f, "    previous: {}", entry.previous_digest)?;
                    writeln!(f, "    digest:   {}", entry.entry_digest)?;
                }
                (None, Some(reason)) => {
                    writeln!(f, "[position {}] <malformed record: {}>", row.position, reason)?;
                }
                (None, None) => {}
            }
        }

        let verification = &self.verification;
        writeln!(f)?;
        writeln!(f, "Integrity")?;
        writeln!(f, "---------")?;
        writeln!(f, "Status:       {}", if verification.valid { "PASS" } else { "FAIL" })?;
        if let (Some(sequence), Some(reason)) = (verification.first_break, verification.reason) {
            writeln!(f, "First break:  sequence {}", sequence)?;
            writeln!(f, "Reason:       {}", reason)?;
            if let Some(detail) = &verification.detail {
                writeln!(f, "Detail:       {}", detail)?;
            }
        }
        writeln!(
            f,
            "Verified:     {} of {}",
            verification.verified_count, verification.entry_count
        )?;
        if verification.torn_tail_bytes > 0 {
            writeln!(f, "Trailing:     {} bytes after the last record", verification.torn_tail_bytes)?;
        }
        writeln!(f, "Head digest:  {}", verification.head_digest)?;
        if let Some(root) = &self.merkle_root {
            writeln!(f, "Merkle root:  {}", root)?;
        }
        Ok(())
    }
}

/// Build a report from one scan of the store.
pub fn build_report(store: &LedgerStore) -> StoreResult<LedgerReport> {
    let scan = store.scan()?;
    let verification = verify_scan(&scan);

    let verified: Vec<LedgerEntry> = scan
        .leading_entries()
        .into_iter()
        .take(verification.verified_count as usize)
        .collect();

    let rows = scan
        .records
        .into_iter()
        .enumerate()
        .map(|(position, record)| {
            let position = position as u64;
            match record {
                ScannedRecord::Entry(entry) => ReportRow {
                    position,
                    entry: Some(entry),
                    malformed: None,
                },
                ScannedRecord::Malformed { reason } => ReportRow {
                    position,
                    entry: None,
                    malformed: Some(reason),
                },
            }
        })
        .collect();

    Ok(LedgerReport {
        ledger_path: store.path().display().to_string(),
        generated_at: Utc::now(),
        genesis_digest: GENESIS_DIGEST_HEX,
        merkle_root: merkle_root(&verified),
        rows,
        verification,
    })
}

/// Write a report to `destination`. Refuses to overwrite the ledger itself.
pub fn export_report(
    store: &LedgerStore,
    destination: &Path,
    format: ReportFormat,
) -> StoreResult<LedgerReport> {
    if same_file(store.path(), destination) {
        return Err(StoreError::ExportTarget(destination.to_path_buf()));
    }

    let report = build_report(store)?;
    let rendered = report.render(format)?;

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StoreError::io("create directory for", parent, e))?;
    }
    fs::write(destination, rendered).map_err(|e| StoreError::io("write report to", destination, e))?;

    info!(
        "Exported {} ledger entries to {} ({:?})",
        report.verification.entry_count,
        destination.display(),
        format
    );
    Ok(report)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
