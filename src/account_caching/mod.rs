pub mod decoder;
pub mod loader;
pub mod rpc_cache;
pub mod subscription;

use std::sync::Arc;

use solana_account::Account;
use solana_client::client_error::ClientError;
use thiserror::Error;

use async_trait::async_trait;
use solana_pubkey::Pubkey;

/// Outcome of a single account lookup.
///
/// - `Ok(Some(record))` the account exists
/// - `Ok(None)` the account is confirmed absent (a tombstone)
/// - `Err(_)` the lookup failed for this key or for its whole batch
pub type AccountLookup = Result<Option<AccountRecord>, AccountCacheError>;

/// Normalized, provider-independent view of an on-chain account.
///
/// Produced by the batch fetcher from bulk-read responses and by the
/// subscription manager from decoded push notifications. Both write the same
/// shape into the shared cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub address: Pubkey,
    pub data: Vec<u8>,
    pub executable: bool,
    pub lamports: u64,
    pub owner: Pubkey,
    /// Byte length of the account data as reported by the provider.
    pub space: u64,
}

impl AccountRecord {
    pub fn from_account(address: Pubkey, account: Account) -> Self {
        let space = account.data.len() as u64;
        Self {
            address,
            data: account.data,
            executable: account.executable,
            lamports: account.lamports,
            owner: account.owner,
            space,
        }
    }
}

/// Trait that abstracts account retrieval and cache administration.
///
/// The transaction pipeline and the consumer-facing engine only see a
/// `dyn AccountsCache`, so the batching fetcher can be swapped for a fixed map
/// or any other source in tests.
///
/// Implementers must satisfy the following:
///
/// - **Thread-safety:** Trait objects must be `Send + Sync`.
/// - **Deterministic ordering:** `get_accounts()` returns one result per input
///   pubkey, in input order.
/// - **Per-item failure:** one failing key never aborts the others.
/// - **Set and delete only:** cache mutation is whole-entry replacement or
///   removal, never a partial merge.
#[async_trait]
pub trait AccountsCache: Send + Sync {
    /// Retrieve a single account by pubkey.
    ///
    /// Returns:
    /// - `Ok(Some(AccountRecord))` if the account exists
    /// - `Ok(None)` if the account is known to be missing
    async fn get_account(&self, pubkey: &Pubkey) -> AccountLookup;

    /// Retrieve multiple accounts.
    ///
    /// The returned vector has the same length and ordering as `pubkeys`.
    async fn get_accounts(&self, pubkeys: &[Pubkey]) -> Vec<AccountLookup>;

    /// Resolved cache contents for `pubkey`, without scheduling any fetch.
    ///
    /// `None` means "never looked up" or "still in flight"; `Some(Ok(None))`
    /// is a tombstone.
    fn cached(&self, pubkey: &Pubkey) -> Option<AccountLookup>;

    /// Drop the cache entry for `pubkey`.
    fn invalidate(&self, pubkey: &Pubkey);

    /// Drop the cache entries for every key in `pubkeys`.
    fn invalidate_many(&self, pubkeys: &[Pubkey]);

    /// Drop every cache entry.
    fn invalidate_all(&self);

    /// Seed the cache without a fetch. Existing entries are left untouched.
    fn prime(&self, pubkey: Pubkey, value: AccountLookup);

    /// Replace whatever is cached for `pubkey` with `value`.
    fn overwrite(&self, pubkey: Pubkey, value: Option<AccountRecord>);
}

/// Errors that may occur in the account-fetching layer.
///
/// One batch failure is delivered to every caller waiting in that batch, so
/// the type is `Clone` and keeps foreign sources behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum AccountCacheError {
    /// A bulk-read RPC call for one chunk of a batch failed.
    #[error("Failed to fetch {count} accounts starting at {first}")]
    FailedToFetchAccounts {
        count: usize,
        first: Pubkey,
        #[source]
        source: Arc<ClientError>,
    },

    /// The bulk-fetch function broke the one-result-per-key contract.
    #[error("Batch function returned {actual} results for {expected} keys")]
    BatchLengthMismatch { expected: usize, actual: usize },

    /// The batch owning this key went away without resolving it.
    #[error("Batch was dropped before resolving")]
    BatchDropped,

    /// A key-level lookup failure reported by a bulk-fetch function.
    #[error("Lookup failed for {key}: {reason}")]
    LookupFailed { key: String, reason: String },

    /// A pushed or fetched account payload could not be decoded.
    #[error("Failed to decode account {address}: {reason}")]
    DecodeFailed { address: Pubkey, reason: String },

    /// The push channel could not be opened or failed while open.
    #[error("Account subscription for {address} failed: {reason}")]
    SubscriptionFailed { address: Pubkey, reason: String },

    /// Failure acquiring a write lock, if the cache uses lock-based concurrency.
    #[error("Failed to acquire write lock")]
    FailedToAcquireWriteLock,
}

/// Ensures `AccountCacheError` satisfies `Send + Sync` at compile time.
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<AccountCacheError>();
};
