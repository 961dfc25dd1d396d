use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::official::OfficialRange;

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Official step must be positive, got {0}")]
    InvalidOfficialStep(i64),

    #[error("Official range is invalid: min={min}, max={max}, step={step}")]
    InvalidOfficialRange { min: i64, max: i64, step: i64 },

    #[error("Official min {min} must be one past a multiple of step {step}")]
    MisalignedOfficialMin { min: i64, step: i64 },

    #[error("Database count must be at least 1")]
    InvalidDbCount,

    #[error("Expected {expected} database urls, got {actual}")]
    DbUrlMismatch { expected: u32, actual: usize },

    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// One URL per physical database, indexed by `id mod db_count`
    #[serde(default)]
    pub postgres_urls: Vec<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
}

/// Kind of ledger entity the engine instance manages.
///
/// One engine handles one kind; the kind only changes table naming so that
/// wallets, accounts and bags can share a database.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    #[default]
    Wallet,
    Account,
    Bag,
}

impl LedgerKind {
    pub fn table_prefix(&self) -> &'static str {
        match self {
            LedgerKind::Wallet => "wallet",
            LedgerKind::Account => "account",
            LedgerKind::Bag => "bag",
        }
    }
}

/// Engine configuration, owned by a `TransferCoordinator` for its lifetime
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub ledger_kind: LedgerKind,
    /// saga_state tables per database, routed by transfer id
    pub state_split_num: u32,
    /// record tables per database, routed by holder id
    pub record_split_num: u32,
    /// balance tables per database, routed by holder id
    pub balance_split_num: u32,
    /// Physical databases, routed by `id mod db_count`
    pub db_count: u32,
    pub official_step: i64,
    pub official_min: i64,
    pub official_max: i64,
}

pub const DEFAULT_OFFICIAL_STEP: i64 = 100_000_000;
pub const DEFAULT_OFFICIAL_MAX: i64 = 100_000_000_000;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_kind: LedgerKind::Wallet,
            state_split_num: 1,
            record_split_num: 1,
            balance_split_num: 1,
            db_count: 1,
            official_step: DEFAULT_OFFICIAL_STEP,
            official_min: 1,
            official_max: DEFAULT_OFFICIAL_MAX,
        }
    }
}

impl EngineConfig {
    /// Check ranges and normalise split numbers (0 means a single table)
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        OfficialRange::from_config(&self)?;
        if self.db_count == 0 {
            return Err(ConfigError::InvalidDbCount);
        }
        self.state_split_num = self.state_split_num.max(1);
        self.record_split_num = self.record_split_num.max(1);
        self.balance_split_num = self.balance_split_num.max(1);
        Ok(self)
    }
}

/// Inspection daemon settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    pub scan_interval_secs: u64,
    pub stale_threshold_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
        }
    }
}

impl WorkerSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|e| ConfigError::Read {
            path: config_path.clone(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&config_path, &content)
    }

    pub fn from_yaml(path: &str, content: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        config.engine = config.engine.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log_level: info
log_dir: ./logs
log_file: ledger.log
use_json: false
rotation: daily
postgres_urls:
  - postgres://localhost/ledger_0
  - postgres://localhost/ledger_1
engine:
  ledger_kind: bag
  record_split_num: 4
  db_count: 2
  official_step: 1000
  official_max: 1000000
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let config = AppConfig::from_yaml("inline", SAMPLE).unwrap();
        assert_eq!(config.engine.ledger_kind, LedgerKind::Bag);
        assert_eq!(config.engine.record_split_num, 4);
        assert_eq!(config.engine.state_split_num, 1);
        assert_eq!(config.engine.db_count, 2);
        assert_eq!(config.engine.official_min, 1);
        assert_eq!(config.postgres_urls.len(), 2);
        assert_eq!(config.worker.scan_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let bad_step = EngineConfig {
            official_step: 0,
            ..Default::default()
        };
        assert_eq!(
            bad_step.validate(),
            Err(ConfigError::InvalidOfficialStep(0))
        );

        let max_below_step = EngineConfig {
            official_step: 1000,
            official_max: 10,
            ..Default::default()
        };
        assert!(matches!(
            max_below_step.validate(),
            Err(ConfigError::InvalidOfficialRange { .. })
        ));

        let misaligned_min = EngineConfig {
            official_step: 1000,
            official_min: 1000,
            official_max: 1_000_000,
            ..Default::default()
        };
        assert_eq!(
            misaligned_min.validate(),
            Err(ConfigError::MisalignedOfficialMin {
                min: 1000,
                step: 1000
            })
        );

        let no_db = EngineConfig {
            db_count: 0,
            ..Default::default()
        };
        assert_eq!(no_db.validate(), Err(ConfigError::InvalidDbCount));
    }

    #[test]
    fn test_zero_split_normalises_to_single_table() {
        let config = EngineConfig {
            state_split_num: 0,
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(config.state_split_num, 1);
    }

    #[test]
    fn test_table_prefix() {
        assert_eq!(LedgerKind::Wallet.table_prefix(), "wallet");
        assert_eq!(LedgerKind::Account.table_prefix(), "account");
        assert_eq!(LedgerKind::Bag.table_prefix(), "bag");
    }
}
