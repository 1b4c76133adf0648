//! Client-side synchronization of remote ledger account state.
//!
//! - [`account_caching::loader`]: generic batch-and-cache loader
//! - [`account_caching::rpc_cache`]: chunked `getMultipleAccounts` fetcher
//! - [`account_caching::subscription`]: reference-counted account watchers
//! - [`transaction`]: submission pipeline with post-write cache refetch
//! - [`engine`]: the consumer-facing facade over all of the above

pub mod account_caching;
pub mod config;
pub mod engine;
pub mod error;
pub mod transaction;
