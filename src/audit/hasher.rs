//! Ledger Hasher
//!
//! Deterministic SHA-256 digests over a canonical encoding of an entry's
//! hashed fields. The encoding is a compact JSON object with a fixed field
//! order (`timestamp`, `event_type`, `payload`, `previous_digest`), payload
//! keys sorted at every depth and timestamps rendered as RFC 3339 UTC with
//! nine fractional digits, so any reimplementation can reproduce it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::audit::entry::Payload;

/// Hex form of the genesis sentinel: the `previous_digest` of entry 0.
pub const GENESIS_DIGEST_HEX: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// A 256-bit SHA-256 digest, rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The all-zero sentinel used as the genesis entry's predecessor.
    pub const GENESIS: Digest = Digest([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn is_genesis(&self) -> bool {
        *self == Self::GENESIS
    }

    /// Short prefix for log lines and listings.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(|e| de::Error::custom(format!("invalid digest {:?}: {}", s, e)))
    }
}

/// Canonical timestamp rendering used inside the hash input.
pub fn canonical_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Rebuild a JSON value with object keys inserted in sorted order at every depth.
fn sorted_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sorted_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(sorted_value).collect()),
        other => other.clone(),
    }
}

fn sorted_map(map: &Map<String, Value>) -> Map<String, Value> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut sorted = Map::new();
    for key in keys {
        sorted.insert(key.clone(), sorted_value(&map[key.as_str()]));
    }
    sorted
}

/// Canonical payload encoding: compact JSON, lexicographically sorted keys.
pub fn canonical_payload(payload: &Payload) -> String {
    Value::Object(sorted_map(payload)).to_string()
}

/// Canonical byte encoding of the hashed fields of an entry.
pub fn canonical_string(
    timestamp: &DateTime<Utc>,
    event_type: &str,
    payload: &Payload,
    previous_digest: &Digest,
) -> String {
    format!(
        "{{\"timestamp\":{},\"event_type\":{},\"payload\":{},\"previous_digest\":{}}}",
        Value::String(canonical_timestamp(timestamp)),
        Value::String(event_type.to_string()),
        canonical_payload(payload),
        Value::String(previous_digest.to_hex()),
    )
}

/// Compute an entry digest. Pure and deterministic.
pub fn compute_digest(
    timestamp: &DateTime<Utc>,
    event_type: &str,
    payload: &Payload,
    previous_digest: &Digest,
) -> Digest {
    let canonical = canonical_string(timestamp, event_type, payload, previous_digest);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Digest(hasher.finalize().into())
}
