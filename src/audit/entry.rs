//! Ledger Entry
//!
//! The immutable record type of the ledger. Each entry is bound to its
//! predecessor through `previous_digest` and to its own content through
//! `entry_digest`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::audit::hasher::{self, Digest};
use crate::error::EncodingError;

/// Opaque structured event document: a JSON object.
pub type Payload = Map<String, Value>;

/// One committed ledger record.
///
/// Field order here is the on-disk field order. Lines carrying any other
/// field do not parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub payload: Payload,
    pub previous_digest: Digest,
    pub entry_digest: Digest,
}

impl LedgerEntry {
    /// Build an entry and compute its digest.
    pub fn seal(
        sequence: u64,
        timestamp: DateTime<Utc>,
        event_type: String,
        payload: Payload,
        previous_digest: Digest,
    ) -> Self {
        let entry_digest =
            hasher::compute_digest(&timestamp, &event_type, &payload, &previous_digest);

        Self {
            sequence,
            timestamp,
            event_type,
            payload,
            previous_digest,
            entry_digest,
        }
    }

    /// Recompute the digest from the stored fields.
    pub fn calculate_digest(&self) -> Digest {
        hasher::compute_digest(
            &self.timestamp,
            &self.event_type,
            &self.payload,
            &self.previous_digest,
        )
    }

    /// Verify this entry's own digest
    pub fn verify_digest(&self) -> bool {
        self.entry_digest == self.calculate_digest()
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence == 0
    }

    /// Encode as a single JSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, EncodingError> {
        serde_json::to_string(self).map_err(EncodingError::Serialize)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "#{} {} {} [{}]",
            self.sequence,
            self.timestamp.to_rfc3339(),
            self.event_type,
            self.entry_digest.short()
        )
    }
}

/// Check a producer-supplied event type. The vocabulary is open; only empty
/// tags and control characters are refused.
pub fn validate_event_type(event_type: &str) -> Result<(), EncodingError> {
    if event_type.trim().is_empty() {
        return Err(EncodingError::EmptyEventType);
    }
    if event_type.chars().any(char::is_control) {
        return Err(EncodingError::InvalidEventType(event_type.to_string()));
    }
    Ok(())
}

/// Accept an already-parsed JSON value as a payload.
pub fn payload_from_value(value: Value) -> Result<Payload, EncodingError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Err(EncodingError::PayloadNotObject("null")),
        Value::Bool(_) => Err(EncodingError::PayloadNotObject("a boolean")),
        Value::Number(_) => Err(EncodingError::PayloadNotObject("a number")),
        Value::String(_) => Err(EncodingError::PayloadNotObject("a string")),
        Value::Array(_) => Err(EncodingError::PayloadNotObject("an array")),
    }
}

/// Parse raw producer text into a payload.
///
/// Numbers that would not survive parsing unchanged are rejected rather
/// than silently rounded.
pub fn parse_payload(raw: &str) -> Result<Payload, EncodingError> {
    let value: Value = serde_json::from_str(raw).map_err(EncodingError::InvalidJson)?;
    check_numbers(raw)?;
    payload_from_value(value)
}

/// Most significant digits an `f64` carries without rounding.
const MAX_FLOAT_DIGITS: usize = 17;

/// Walk the number tokens of already-validated JSON text.
fn check_numbers(raw: &str) -> Result<(), EncodingError> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += if bytes[i] == b'\\' { 2 } else { 1 };
                }
                i += 1;
            }
            b'-' | b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && matches!(bytes[i], b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9') {
                    i += 1;
                }
                check_number_token(&raw[start..i])?;
            }
            _ => i += 1,
        }
    }
    Ok(())
}

fn check_number_token(token: &str) -> Result<(), EncodingError> {
    let is_integer = !token.contains(['.', 'e', 'E']);
    let representable = if is_integer {
        token.parse::<i64>().is_ok() || token.parse::<u64>().is_ok()
    } else {
        let mantissa = token
            .trim_start_matches('-')
            .split(['e', 'E'])
            .next()
            .unwrap_or_default();
        let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
        digits.trim_start_matches('0').trim_end_matches('0').len() <= MAX_FLOAT_DIGITS
    };

    if representable {
        Ok(())
    } else {
        Err(EncodingError::UnsupportedNumber(token.to_string()))
    }
}
