//! Top-level errors for building and using a [`crate::engine::SyncEngine`].
//!
//! Layer errors stay with their layer: cache lookups return
//! [`AccountCacheError`] and submissions return
//! [`crate::transaction::error::TransactionPipelineError`]. `SyncError` covers
//! setup, plus the engine helpers that turn a tombstone into an error.

use solana_pubkey::Pubkey;
use thiserror::Error;

use crate::account_caching::AccountCacheError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The account is confirmed absent on chain.
    #[error("No account found for pubkey: {0}")]
    NoAccountFound(Pubkey),

    #[error("Account cache error: {0}")]
    AccountCache(#[from] AccountCacheError),
}

/// Ensures `SyncError` satisfies `Send + Sync` at compile time.
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<SyncError>();
};
