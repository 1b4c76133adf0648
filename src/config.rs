//! Engine configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```json
//! { "rpc_url": "https://api.devnet.solana.com", "loader": { "batch_delay_ms": 5 } }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use solana_sdk::commitment_config::CommitmentConfig;

use crate::{
    account_caching::rpc_cache::FetcherConfig,
    error::SyncError,
    transaction::{PipelineConfig, confirmation::ConfirmationConfig},
};

/// Staleness tolerance requested from the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl From<Commitment> for CommitmentConfig {
    fn from(commitment: Commitment) -> Self {
        match commitment {
            Commitment::Processed => CommitmentConfig::processed(),
            Commitment::Confirmed => CommitmentConfig::confirmed(),
            Commitment::Finalized => CommitmentConfig::finalized(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub max_batch_size: usize,
    pub batch_delay_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_delay_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationSettings {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub max_poll_errors: u32,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 4000,
            multiplier: 1.5,
            max_poll_errors: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rpc_url: String,
    pub ws_url: String,
    /// Commitment for reads, blockhashes and confirmation.
    pub commitment: Commitment,
    pub loader: LoaderConfig,
    /// Server limit on pubkeys per `getMultipleAccounts` call.
    pub max_accounts_per_request: usize,
    pub subscription_commitment: Commitment,
    pub confirmation: ConfirmationSettings,
    pub simulate: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8899".to_string(),
            ws_url: "ws://127.0.0.1:8900".to_string(),
            commitment: Commitment::Confirmed,
            loader: LoaderConfig::default(),
            max_accounts_per_request: 100,
            subscription_commitment: Commitment::Confirmed,
            confirmation: ConfirmationSettings::default(),
            simulate: true,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.loader.max_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "loader.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_accounts_per_request == 0 {
            return Err(SyncError::InvalidConfig(
                "max_accounts_per_request must be at least 1".to_string(),
            ));
        }
        if self.confirmation.multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(
                "confirmation.multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            max_batch_size: self.loader.max_batch_size,
            batch_delay: Duration::from_millis(self.loader.batch_delay_ms),
            max_accounts_per_request: self.max_accounts_per_request,
            commitment: self.commitment.into(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            commitment: self.commitment.into(),
            simulate: self.simulate,
            confirmation: ConfirmationConfig {
                initial_interval: Duration::from_millis(self.confirmation.initial_interval_ms),
                max_interval: Duration::from_millis(self.confirmation.max_interval_ms),
                multiplier: self.confirmation.multiplier,
                max_poll_errors: self.confirmation.max_poll_errors,
            },
        }
    }
}
