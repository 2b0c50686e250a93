use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::quote::FeePolicy;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Credential key missing: environment variable {0} is not set")]
    MissingCredentialKey(String),

    #[error("Credential key must be {expected} bytes of hex, got {actual} bytes")]
    CredentialKeyLength { expected: usize, actual: usize },

    #[error("Credential key is not valid hex: {0}")]
    CredentialKeyEncoding(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL for the job/credential store
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub fees: FeePolicy,
    /// Ledgers in preference order (lower-fee ledgers first)
    pub ledgers: Vec<LedgerConfig>,
    pub destination_ledger: String,
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    pub id: String,
    pub native_asset: String,
    #[serde(default)]
    pub supports_conversion: bool,
    /// Native balance left untouched to pay for the ledger's own gas
    #[serde(default)]
    pub gas_reserve: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SettlementConfig {
    pub contract_address: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OrchestratorConfig {
    pub scan_attempts: u32,
    pub scan_delay_ms: u64,
    pub confirmation_ttl_secs: u64,
    pub stall_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scan_attempts: 5,
            scan_delay_ms: 3000,
            confirmation_ttl_secs: 900,
            stall_threshold_secs: 1800,
            sweep_interval_secs: 30,
            sweep_batch_size: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn scan_delay(&self) -> Duration {
        Duration::from_millis(self.scan_delay_ms)
    }

    pub fn confirmation_ttl(&self) -> Duration {
        Duration::from_secs(self.confirmation_ttl_secs)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Retry policies for each class of external wait
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    /// Conversion/bridge/settlement calls signed by a delegated identity
    pub adapter: RetryPolicy,
    /// Calls signed by the raw payer credential (indexer lag)
    pub indexer_lag: RetryPolicy,
    /// Attestation availability polling
    pub attestation: RetryPolicy,
    /// Destination balance polling after bridging
    pub destination_balance: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            adapter: RetryPolicy::fixed(3, Duration::from_secs(2)),
            indexer_lag: RetryPolicy::exponential(
                8,
                Duration::from_secs(2),
                Duration::from_secs(30),
            ),
            attestation: RetryPolicy::exponential(
                40,
                Duration::from_secs(5),
                Duration::from_secs(30),
            )
            .with_timeout(Duration::from_secs(1200)),
            destination_balance: RetryPolicy::fixed(30, Duration::from_secs(5))
                .with_timeout(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CredentialConfig {
    /// Environment variable holding the hex-encoded 32-byte encryption key
    pub key_env: String,
    pub default_ttl_secs: u64,
    pub default_spend_limit: Decimal,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            key_env: "PAYFLOW_CREDENTIAL_KEY".to_string(),
            default_ttl_secs: 86_400,
            default_spend_limit: Decimal::from(10_000),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would only fail later, mid-job.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledgers.is_empty() {
            return Err(ConfigError::Invalid("no ledgers configured".into()));
        }
        if !self.ledgers.iter().any(|l| l.id == self.destination_ledger) {
            return Err(ConfigError::Invalid(format!(
                "destination ledger {} is not in the ledger list",
                self.destination_ledger
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for ledger in &self.ledgers {
            if !seen.insert(ledger.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate ledger id {}",
                    ledger.id
                )));
            }
        }
        if self.settlement.contract_address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "settlement contract address is required".into(),
            ));
        }
        if self.orchestrator.scan_attempts == 0 {
            return Err(ConfigError::Invalid("scan_attempts must be >= 1".into()));
        }
        self.fees.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}
