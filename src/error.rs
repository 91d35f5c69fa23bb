use std::path::PathBuf;
use thiserror::Error;

/// Durable-storage failures surfaced by the ledger store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O failure while trying to {op} {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt ledger record at position {position}: {reason}")]
    Corrupt { position: u64, reason: String },

    #[error("Last ledger record is unreadable: {0}")]
    UnreadableTail(String),

    #[error("Failed to serialize ledger entry: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Refusing to write a report over the ledger itself: {0:?}")]
    ExportTarget(PathBuf),

    #[error("Ledger not initialized at {0:?} (run `init` first)")]
    NotInitialized(PathBuf),

    #[error("Ledger ends with a complete entry missing its newline at byte {offset}; refusing to truncate it")]
    UnterminatedEntry { offset: u64 },
}

impl StoreError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Rejections raised before a digest is ever computed.
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Payload must be a JSON object, got {0}")]
    PayloadNotObject(&'static str),

    #[error("Event type must not be empty")]
    EmptyEventType,

    #[error("Event type must not contain control characters: {0:?}")]
    InvalidEventType(String),

    #[error("Number {0} cannot be stored without losing precision")]
    UnsupportedNumber(String),

    #[error("Failed to serialize ledger entry: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Failures of the append path. An append that errors has committed nothing.
#[derive(Error, Debug)]
pub enum AppendError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("Cannot extend chain: {0}")]
    Chain(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type AppendResult<T> = Result<T, AppendError>;
