//! An RPC-backed, batching account cache.
//!
//! `AccountBatchFetcher` specializes [`BatchLoader`] with a bulk-fetch
//! function that reads accounts through `getMultipleAccounts`. Lookups issued
//! within one batch window become one batch; the batch is split into chunks
//! no larger than the server's per-request limit, each chunk is read at the
//! configured commitment, and the chunk results are flattened back into input
//! order.
//!
//! Chunks are awaited one after another rather than in parallel, which bounds
//! the RPC load a single batch can generate.
//!
//! The cache stores `Some(AccountRecord)` for found accounts and `None` for
//! known-missing accounts, so a missing account is not re-fetched on every
//! request.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::debug;
use solana_account::Account;
use solana_client::client_error::ClientError;
use solana_pubkey::Pubkey;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;

use crate::account_caching::{
    AccountCacheError, AccountLookup, AccountRecord, AccountsCache,
    loader::{BatchFn, BatchLoader, LoaderOptions},
};

/// The bulk-read RPC the fetcher depends on.
///
/// Returns one entry per requested pubkey, in request order, with `None` for
/// accounts that do not exist.
#[async_trait]
pub trait AccountsRpc: Send + Sync + 'static {
    async fn fetch_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
        commitment: CommitmentConfig,
    ) -> Result<Vec<Option<Account>>, ClientError>;
}

#[async_trait]
impl AccountsRpc for RpcClient {
    async fn fetch_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
        commitment: CommitmentConfig,
    ) -> Result<Vec<Option<Account>>, ClientError> {
        let response = self
            .get_multiple_accounts_with_commitment(pubkeys, commitment)
            .await?;
        Ok(response.value)
    }
}

/// Settings for an [`AccountBatchFetcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherConfig {
    pub max_batch_size: usize,
    pub batch_delay: Duration,
    /// Server-imposed maximum number of pubkeys per `getMultipleAccounts` call.
    pub max_accounts_per_request: usize,
    pub commitment: CommitmentConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_delay: Duration::from_millis(10),
            max_accounts_per_request: 100,
            commitment: CommitmentConfig::confirmed(),
        }
    }
}

/// Bulk-fetch function that reads a batch of accounts in chunks.
///
/// Chunks are requested one after another. A transport error on any chunk
/// fails the whole batch: results already read for earlier chunks are
/// discarded, later chunks are not requested, and every key in the batch is
/// evicted so the next lookup fetches it again.
pub struct AccountBatchFn {
    rpc: Arc<dyn AccountsRpc>,
    max_accounts_per_request: usize,
    commitment: CommitmentConfig,
}

#[async_trait]
impl BatchFn<Pubkey, Option<AccountRecord>> for AccountBatchFn {
    async fn load(&self, keys: &[Pubkey]) -> Result<Vec<AccountLookup>, AccountCacheError> {
        let mut results = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(self.max_accounts_per_request) {
            debug!("getMultipleAccounts for {} keys", chunk.len());

            let accounts = self
                .rpc
                .fetch_multiple_accounts(chunk, self.commitment)
                .await
                .map_err(|e| AccountCacheError::FailedToFetchAccounts {
                    count: chunk.len(),
                    first: chunk.first().copied().unwrap_or_default(),
                    source: Arc::new(e),
                })?;

            if accounts.len() != chunk.len() {
                return Err(AccountCacheError::BatchLengthMismatch {
                    expected: chunk.len(),
                    actual: accounts.len(),
                });
            }

            results.extend(
                chunk
                    .iter()
                    .zip(accounts)
                    .map(|(pubkey, account)| {
                        Ok(account.map(|account| AccountRecord::from_account(*pubkey, account)))
                    }),
            );
        }

        Ok(results)
    }
}

/// A batching, caching layer around a bulk-read RPC.
///
/// - **Coalescing**: concurrent lookups within one window share one batch.
/// - **Chunking**: a batch never sends more than `max_accounts_per_request`
///   pubkeys in one call.
/// - **Caching negative lookups**: missing accounts are stored as tombstones.
/// - **Retry after transport failure**: a failed batch evicts its keys.
#[derive(Clone)]
pub struct AccountBatchFetcher {
    loader: BatchLoader<Pubkey, Option<AccountRecord>, AccountBatchFn>,
    commitment: CommitmentConfig,
}

impl AccountBatchFetcher {
    /// Construct a fetcher with default settings from an existing `RpcClient`.
    pub fn new(rpc_client: RpcClient) -> Self {
        Self::with_config(Arc::new(rpc_client), FetcherConfig::default())
    }

    pub fn with_config(rpc: Arc<dyn AccountsRpc>, config: FetcherConfig) -> Self {
        let batch_fn = AccountBatchFn {
            rpc,
            max_accounts_per_request: config.max_accounts_per_request.max(1),
            commitment: config.commitment,
        };
        let options = LoaderOptions {
            max_batch_size: config.max_batch_size,
            batch_delay: config.batch_delay,
        };

        Self {
            loader: BatchLoader::new(batch_fn, options),
            commitment: config.commitment,
        }
    }

    pub fn commitment(&self) -> CommitmentConfig {
        self.commitment
    }

    pub fn load(&self, address: Pubkey) -> BoxFuture<'static, AccountLookup> {
        self.loader.load(address)
    }

    pub fn load_many(&self, addresses: &[Pubkey]) -> BoxFuture<'static, Vec<AccountLookup>> {
        self.loader.load_many(addresses)
    }

    /// Resolved cache contents for each pubkey, without making RPC requests.
    pub fn get_multiple(&self, pubkeys: &[Pubkey]) -> Vec<Option<AccountLookup>> {
        pubkeys.iter().map(|pubkey| self.loader.peek(pubkey)).collect()
    }

    pub fn clear(&self, address: &Pubkey) {
        self.loader.clear(address);
    }

    pub fn clear_many(&self, addresses: &[Pubkey]) {
        self.loader.clear_many(addresses);
    }

    /// Drop every cached account, resolved or in flight. The next lookup of
    /// any address goes back to the RPC.
    pub fn clear_all(&self) {
        self.loader.clear_all();
    }

    pub fn prime(&self, address: Pubkey, value: AccountLookup) {
        self.loader.prime(address, value);
    }

    pub fn set(&self, address: Pubkey, value: Option<AccountRecord>) {
        self.loader.set(address, Ok(value));
    }

    pub fn is_cached(&self, address: &Pubkey) -> bool {
        self.loader.contains(address)
    }
}

#[async_trait]
impl AccountsCache for AccountBatchFetcher {
    async fn get_account(&self, pubkey: &Pubkey) -> AccountLookup {
        self.load(*pubkey).await
    }

    async fn get_accounts(&self, pubkeys: &[Pubkey]) -> Vec<AccountLookup> {
        self.load_many(pubkeys).await
    }

    fn cached(&self, pubkey: &Pubkey) -> Option<AccountLookup> {
        self.loader.peek(pubkey)
    }

    fn invalidate(&self, pubkey: &Pubkey) {
        self.clear(pubkey);
    }

    fn invalidate_many(&self, pubkeys: &[Pubkey]) {
        self.clear_many(pubkeys);
    }

    fn invalidate_all(&self) {
        self.clear_all();
    }

    fn prime(&self, pubkey: Pubkey, value: AccountLookup) {
        AccountBatchFetcher::prime(self, pubkey, value);
    }

    fn overwrite(&self, pubkey: Pubkey, value: Option<AccountRecord>) {
        self.set(pubkey, value);
    }
}
