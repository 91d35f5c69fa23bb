pub mod audit;
pub mod config;
pub mod error;
pub mod logging;

pub use audit::{AuditLedger, BreakReason, Digest, LedgerEntry, LedgerStore, VerificationResult};
pub use config::LedgerConfig;
pub use error::{AppendError, ConfigError, EncodingError, StoreError};
