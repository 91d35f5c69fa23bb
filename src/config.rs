//! Ledger configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `AUDIT_LEDGER_*` environment variables.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::audit::export::ReportFormat;
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "audit-ledger.toml";
pub const ENV_PREFIX: &str = "AUDIT_LEDGER";
pub const DEFAULT_LEDGER_PATH: &str = "audit-ledger.jsonl";
pub const DEFAULT_LOG_FILTER: &str = "audit_ledger=info";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path of the append-only ledger file.
    pub ledger_path: PathBuf,
    /// Sync file data to the medium before an append is acknowledged.
    pub fsync: bool,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Default export format.
    pub report_format: ReportFormat,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from(DEFAULT_LEDGER_PATH),
            fsync: true,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            report_format: ReportFormat::Text,
        }
    }
}

impl LedgerConfig {
    /// Load configuration. An explicit `config_file` must exist; otherwise
    /// `audit-ledger.toml` in the working directory is used if present.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let builder = Config::builder()
            .set_default("ledger_path", defaults.ledger_path.to_string_lossy().to_string())?
            .set_default("fsync", defaults.fsync)?
            .set_default("log_filter", defaults.log_filter)?
            .set_default("report_format", "text")?;

        let builder = match config_file {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let config: Self = builder
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        debug!("Loaded ledger configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("ledger_path must not be empty".to_string()));
        }
        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::Invalid("log_filter must not be empty".to_string()));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
