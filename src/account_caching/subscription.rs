//! Reference-counted account subscriptions feeding the shared cache.
//!
//! Any number of watchers may watch the same address; only one push channel
//! exists per address. The entry for an address holds the watcher count, the
//! decoder of the most recent watcher, and a cancellation token for the
//! channel's receive loop. The channel is cancelled exactly when the count
//! drops to zero.
//!
//! Pushed updates bypass the loader's batching and are written straight into
//! the cache under the same key the loader uses. A zero-lamport update is a
//! closed account and is written as a `None` tombstone without decoding.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::{StreamExt, stream::BoxStream};
use log::{debug, error, info, warn};
use solana_account_decoder::{UiAccount, UiAccountEncoding};
use solana_client::{nonblocking::pubsub_client::PubsubClient, rpc_config::RpcAccountInfoConfig};
use solana_pubkey::Pubkey;
use solana_sdk::commitment_config::CommitmentConfig;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::account_caching::{AccountCacheError, AccountsCache, decoder::AccountDecoder};

/// Stream of raw account notifications for one address.
///
/// An `Err` item means the channel failed; the stream is not polled again.
pub type AccountNotificationStream = BoxStream<'static, Result<UiAccount, AccountCacheError>>;

/// The push-subscription channel the manager depends on.
///
/// Dropping the returned stream must tear the underlying subscription down.
#[async_trait]
pub trait AccountSubscriptionSource: Send + Sync + 'static {
    async fn subscribe(
        &self,
        address: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<AccountNotificationStream, AccountCacheError>;
}

/// [`AccountSubscriptionSource`] over a websocket `PubsubClient`.
///
/// Each subscription runs a forwarding task that owns the pubsub stream and
/// calls the server-side unsubscribe once the consumer drops its end.
pub struct PubsubAccountSource {
    client: Arc<PubsubClient>,
    buffer: usize,
}

impl PubsubAccountSource {
    pub fn new(client: PubsubClient) -> Self {
        Self {
            client: Arc::new(client),
            buffer: 64,
        }
    }
}

#[async_trait]
impl AccountSubscriptionSource for PubsubAccountSource {
    async fn subscribe(
        &self,
        address: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<AccountNotificationStream, AccountCacheError> {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let (ready_tx, ready_rx) = oneshot::channel();
        let client = Arc::clone(&self.client);
        let address = *address;

        tokio::spawn(async move {
            let config = RpcAccountInfoConfig {
                commitment: Some(commitment),
                encoding: Some(UiAccountEncoding::Base64),
                ..RpcAccountInfoConfig::default()
            };

            let (mut updates, unsubscribe) =
                match client.account_subscribe(&address, Some(config)).await {
                    Ok(subscription) => {
                        let _ = ready_tx.send(Ok(()));
                        subscription
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(AccountCacheError::SubscriptionFailed {
                            address,
                            reason: e.to_string(),
                        }));
                        return;
                    }
                };

            loop {
                tokio::select! {
                    _ = sender.closed() => break,
                    update = updates.next() => match update {
                        Some(response) => {
                            if sender.send(Ok(response.value)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sender
                                .send(Err(AccountCacheError::SubscriptionFailed {
                                    address,
                                    reason: "stream closed by server".to_string(),
                                }))
                                .await;
                            break;
                        }
                    },
                }
            }

            drop(updates);
            unsubscribe().await;
        });

        ready_rx
            .await
            .map_err(|_| AccountCacheError::SubscriptionFailed {
                address,
                reason: "subscription task exited".to_string(),
            })??;

        Ok(ReceiverStream::new(receiver).boxed())
    }
}

struct SubscriptionEntry {
    watchers: usize,
    decoder: Arc<dyn AccountDecoder>,
    cancel: CancellationToken,
}

struct ManagerInner {
    source: Arc<dyn AccountSubscriptionSource>,
    cache: Arc<dyn AccountsCache>,
    commitment: CommitmentConfig,
    entries: DashMap<Pubkey, SubscriptionEntry>,
}

/// Multiplexes account watchers onto one push channel per address.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

/// Handle returned by [`SubscriptionManager::subscribe`].
///
/// Teardown is explicit: dropping the handle without calling
/// [`Unsubscribe::unsubscribe`] keeps the watcher counted.
#[must_use = "the watcher stays registered until `unsubscribe` is called"]
pub struct Unsubscribe {
    inner: Arc<ManagerInner>,
    address: Pubkey,
}

impl Unsubscribe {
    pub fn address(&self) -> Pubkey {
        self.address
    }

    pub fn unsubscribe(self) {
        self.inner.release(&self.address);
    }
}

impl SubscriptionManager {
    pub fn new(
        source: Arc<dyn AccountSubscriptionSource>,
        cache: Arc<dyn AccountsCache>,
        commitment: CommitmentConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                source,
                cache,
                commitment,
                entries: DashMap::new(),
            }),
        }
    }

    /// Watch `address`, decoding pushes with `decoder`.
    ///
    /// The first watcher opens the push channel. Later watchers only bump the
    /// count, and their decoder replaces the previous one for all subsequent
    /// pushes to this address.
    pub fn subscribe(&self, address: Pubkey, decoder: Arc<dyn AccountDecoder>) -> Unsubscribe {
        let opened = match self.inner.entries.entry(address) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.watchers += 1;
                entry.decoder = decoder;
                debug!("Account {address} now has {} watchers", entry.watchers);
                None
            }
            Entry::Vacant(vacant) => {
                let cancel = CancellationToken::new();
                vacant.insert(SubscriptionEntry {
                    watchers: 1,
                    decoder,
                    cancel: cancel.clone(),
                });
                Some(cancel)
            }
        };

        // Spawned outside the entry guard so the task never waits on this shard.
        if let Some(cancel) = opened {
            tokio::spawn(Arc::clone(&self.inner).run_channel(address, cancel));
            info!("Opened account subscription for {address}");
        }

        Unsubscribe {
            inner: Arc::clone(&self.inner),
            address,
        }
    }

    /// Number of watchers currently registered for `address`.
    pub fn get_subscription_count(&self, address: &Pubkey) -> usize {
        self.inner
            .entries
            .get(address)
            .map(|entry| entry.watchers)
            .unwrap_or(0)
    }

    /// Number of addresses with a live push channel.
    pub fn active_channels(&self) -> usize {
        self.inner.entries.len()
    }
}

impl ManagerInner {
    fn release(&self, address: &Pubkey) {
        let Entry::Occupied(mut occupied) = self.entries.entry(*address) else {
            warn!("Unsubscribe for {address} without a live subscription");
            return;
        };

        let entry = occupied.get_mut();
        entry.watchers = entry.watchers.saturating_sub(1);
        if entry.watchers == 0 {
            let entry = occupied.remove();
            entry.cancel.cancel();
            info!("Closed account subscription for {address}");
        } else {
            debug!("Account {address} now has {} watchers", entry.watchers);
        }
    }

    async fn run_channel(self: Arc<Self>, address: Pubkey, cancel: CancellationToken) {
        let mut updates = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = self.source.subscribe(&address, self.commitment) => match opened {
                Ok(updates) => updates,
                Err(e) => {
                    error!("Failed to open account subscription for {address}: {e}");
                    return;
                }
            },
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                update = updates.next() => match update {
                    Some(Ok(account)) => self.handle_notification(&address, &account),
                    Some(Err(e)) => {
                        error!("Account subscription for {address} ended: {e}");
                        break;
                    }
                    None => {
                        warn!("Account subscription for {address} ended");
                        break;
                    }
                },
            }
        }
    }

    fn handle_notification(&self, address: &Pubkey, account: &UiAccount) {
        // The entry is gone once the last watcher left.
        let Some(decoder) = self
            .entries
            .get(address)
            .map(|entry| Arc::clone(&entry.decoder))
        else {
            return;
        };

        if account.lamports == 0 {
            debug!("Account {address} closed, caching tombstone");
            self.cache.overwrite(*address, None);
            return;
        }

        match decoder.decode(address, account) {
            Ok(record) => self.cache.overwrite(*address, Some(record)),
            Err(e) => error!("Failed to decode account update for {address}: {e}"),
        }
    }
}
