//! A generic batch-and-cache request loader.
//!
//! `BatchLoader` coalesces individual `load` calls issued within one batch
//! window into a single call to a caller-supplied [`BatchFn`], and memoizes
//! both in-flight and resolved results by key.
//!
//! A batch is either *open* (held in the loader state, still accepting keys)
//! or *dispatched* (moved out of the state into a dispatch task, immutable
//! from then on). It moves from open to dispatched exactly once: when it
//! reaches `max_batch_size` keys, or when its scheduling timer fires.
//!
//! Every cache entry is a shared future. A miss inserts the future before the
//! batch is dispatched, so a second miss for the same key in the same window
//! joins the first one instead of adding a duplicate key to the batch.
//!
//! Cache hits do not resolve synchronously. They register with the currently
//! open batch and resolve in the same pass as that batch's fetched values,
//! which keeps the ordering of hits and misses issued together deterministic.

use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    FutureExt,
    future::{self, BoxFuture, Shared},
};
use log::{debug, error, warn};
use tokio::sync::oneshot;

use crate::account_caching::AccountCacheError;

/// Result delivered to each caller of [`BatchLoader::load`].
pub type LoadResult<V> = Result<V, AccountCacheError>;

type SharedLoad<V> = Shared<BoxFuture<'static, LoadResult<V>>>;

/// The bulk-fetch function behind a [`BatchLoader`].
///
/// Given the ordered list of keys in a batch, return exactly one result per
/// key in the same order. A per-key `Err` fails only that key; an outer `Err`
/// fails (and evicts) every key in the batch.
#[async_trait]
pub trait BatchFn<K, V>: Send + Sync + 'static {
    async fn load(&self, keys: &[K]) -> Result<Vec<LoadResult<V>>, AccountCacheError>;
}

/// Tuning knobs for a [`BatchLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    /// A batch is dispatched as soon as it holds this many keys.
    pub max_batch_size: usize,
    /// How long a batch stays open after its first key.
    pub batch_delay: Duration,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_delay: Duration::from_millis(10),
        }
    }
}

struct CacheEntry<V> {
    /// Identifies which load created the entry, so a failed batch only evicts
    /// entries it still owns.
    id: u64,
    value: SharedLoad<V>,
}

struct PendingKey<K, V> {
    key: K,
    entry_id: u64,
    sender: oneshot::Sender<LoadResult<V>>,
}

struct Batch<K, V> {
    id: u64,
    keys: Vec<PendingKey<K, V>>,
    cache_hits: Vec<oneshot::Sender<()>>,
}

struct LoaderState<K, V> {
    cache: HashMap<K, CacheEntry<V>>,
    batch: Option<Batch<K, V>>,
    next_id: u64,
}

impl<K, V> LoaderState<K, V> {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// The open batch, creating it if none is open. The flag is `true` when
    /// the batch was created by this call and needs a dispatch timer.
    fn current_batch(&mut self) -> (&mut Batch<K, V>, bool) {
        let opened = self.batch.is_none();
        let id = if opened { self.allocate_id() } else { 0 };
        let batch = self.batch.get_or_insert_with(|| Batch {
            id,
            keys: Vec::new(),
            cache_hits: Vec::new(),
        });
        (batch, opened)
    }
}

struct LoaderInner<K, V, F> {
    batch_fn: F,
    options: LoaderOptions,
    state: Mutex<LoaderState<K, V>>,
}

/// Coalescing, memoizing loader over a [`BatchFn`].
///
/// Cloning is cheap and shares the cache and the open batch. Loads must be
/// issued from within a Tokio runtime, since dispatch runs on spawned tasks.
pub struct BatchLoader<K, V, F> {
    inner: Arc<LoaderInner<K, V, F>>,
}

impl<K, V, F> Clone for BatchLoader<K, V, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, F> BatchLoader<K, V, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: BatchFn<K, V>,
{
    pub fn new(batch_fn: F, options: LoaderOptions) -> Self {
        let state = LoaderState {
            cache: HashMap::new(),
            batch: None,
            next_id: 0,
        };

        Self {
            inner: Arc::new(LoaderInner {
                batch_fn,
                options: LoaderOptions {
                    max_batch_size: options.max_batch_size.max(1),
                    ..options
                },
                state: Mutex::new(state),
            }),
        }
    }

    pub fn options(&self) -> LoaderOptions {
        self.inner.options
    }

    pub fn batch_fn(&self) -> &F {
        &self.inner.batch_fn
    }

    /// Load one key.
    ///
    /// The key is registered with the cache and the open batch when this is
    /// called, not when the returned future is first polled, so the order of
    /// `load` calls is the order of keys handed to the batch function.
    pub fn load(&self, key: K) -> BoxFuture<'static, LoadResult<V>> {
        let mut schedule = None;
        let mut dispatch_now = None;

        let waiter = {
            let mut state = match self.inner.lock_state() {
                Ok(state) => state,
                Err(e) => return future::ready(Err(e)).boxed(),
            };

            if let Some(entry) = state.cache.get(&key) {
                let value = entry.value.clone();
                let (pass_tx, pass_rx) = oneshot::channel();
                let (batch, opened) = state.current_batch();
                batch.cache_hits.push(pass_tx);
                if opened {
                    schedule = Some(batch.id);
                }

                async move {
                    // Sender dropped only when the batch task died; the value
                    // itself is still valid.
                    let _ = pass_rx.await;
                    value.await
                }
                .boxed()
            } else {
                let entry_id = state.allocate_id();
                let (sender, receiver) = oneshot::channel();
                let value: SharedLoad<V> = receiver
                    .map(|received| received.unwrap_or(Err(AccountCacheError::BatchDropped)))
                    .boxed()
                    .shared();
                state.cache.insert(
                    key.clone(),
                    CacheEntry {
                        id: entry_id,
                        value: value.clone(),
                    },
                );

                let max_batch_size = self.inner.options.max_batch_size;
                let (batch, opened) = state.current_batch();
                batch.keys.push(PendingKey {
                    key,
                    entry_id,
                    sender,
                });
                if opened {
                    schedule = Some(batch.id);
                }
                if batch.keys.len() >= max_batch_size {
                    dispatch_now = state.batch.take();
                }

                value.boxed()
            }
        };

        if let Some(batch) = dispatch_now {
            tokio::spawn(Arc::clone(&self.inner).dispatch(batch));
        } else if let Some(batch_id) = schedule {
            tokio::spawn(Arc::clone(&self.inner).dispatch_after_delay(batch_id));
        }

        waiter
    }

    /// Load many keys. Individual failures are returned in place; they never
    /// abort the whole call.
    pub fn load_many(&self, keys: &[K]) -> BoxFuture<'static, Vec<LoadResult<V>>> {
        let loads: Vec<_> = keys.iter().cloned().map(|key| self.load(key)).collect();
        future::join_all(loads).boxed()
    }

    /// Resolved cache contents for `key`, without scheduling a fetch.
    pub fn peek(&self, key: &K) -> Option<LoadResult<V>> {
        let state = self.inner.lock_state().ok()?;
        state
            .cache
            .get(key)
            .and_then(|entry| entry.value.peek().cloned())
    }

    /// Whether `key` has a cache entry, resolved or in flight.
    pub fn contains(&self, key: &K) -> bool {
        self.inner
            .lock_state()
            .map(|state| state.cache.contains_key(key))
            .unwrap_or(false)
    }

    pub fn clear(&self, key: &K) {
        if let Some(mut state) = self.inner.lock_state_or_log() {
            state.cache.remove(key);
        }
    }

    pub fn clear_many(&self, keys: &[K]) {
        if let Some(mut state) = self.inner.lock_state_or_log() {
            for key in keys {
                state.cache.remove(key);
            }
        }
    }

    pub fn clear_all(&self) {
        if let Some(mut state) = self.inner.lock_state_or_log() {
            state.cache.clear();
        }
    }

    /// Seed `key` with `value` unless it already has an entry.
    pub fn prime(&self, key: K, value: LoadResult<V>) {
        if let Some(mut state) = self.inner.lock_state_or_log() {
            if state.cache.contains_key(&key) {
                return;
            }
            let id = state.allocate_id();
            state.cache.insert(key, ready_entry(id, value));
        }
    }

    /// Replace whatever is cached for `key` with `value`.
    ///
    /// A load of `key` still in flight keeps its own waiters, but its result
    /// no longer owns the cache entry.
    pub fn set(&self, key: K, value: LoadResult<V>) {
        if let Some(mut state) = self.inner.lock_state_or_log() {
            let id = state.allocate_id();
            state.cache.insert(key, ready_entry(id, value));
        }
    }
}

fn ready_entry<V>(id: u64, value: LoadResult<V>) -> CacheEntry<V>
where
    V: Clone + Send + Sync + 'static,
{
    let value = future::ready(value).boxed().shared();
    // Drive a clone to completion so `peek` sees the value immediately.
    let _ = value.clone().now_or_never();
    CacheEntry { id, value }
}

impl<K, V, F> LoaderInner<K, V, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: BatchFn<K, V>,
{
    fn lock_state(&self) -> Result<MutexGuard<'_, LoaderState<K, V>>, AccountCacheError> {
        self.state
            .lock()
            .map_err(|_| AccountCacheError::FailedToAcquireWriteLock)
    }

    fn lock_state_or_log(&self) -> Option<MutexGuard<'_, LoaderState<K, V>>> {
        match self.lock_state() {
            Ok(state) => Some(state),
            Err(e) => {
                error!("Loader state unavailable: {e}");
                None
            }
        }
    }

    async fn dispatch_after_delay(self: Arc<Self>, batch_id: u64) {
        if self.options.batch_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.options.batch_delay).await;
        }

        let batch = match self.lock_state() {
            Ok(mut state) => match &state.batch {
                // Already dispatched for being full; a newer batch is not ours.
                Some(batch) if batch.id == batch_id => state.batch.take(),
                _ => None,
            },
            Err(e) => {
                error!("Failed to dispatch batch {batch_id}: {e}");
                None
            }
        };

        if let Some(batch) = batch {
            self.dispatch(batch).await;
        }
    }

    async fn dispatch(self: Arc<Self>, batch: Batch<K, V>) {
        let Batch {
            id,
            keys,
            cache_hits,
        } = batch;

        if !keys.is_empty() {
            let key_list: Vec<K> = keys.iter().map(|pending| pending.key.clone()).collect();
            debug!("Dispatching batch {id} with {} keys", key_list.len());

            let outcome = self
                .batch_fn
                .load(&key_list)
                .await
                .and_then(|values| {
                    if values.len() == key_list.len() {
                        Ok(values)
                    } else {
                        Err(AccountCacheError::BatchLengthMismatch {
                            expected: key_list.len(),
                            actual: values.len(),
                        })
                    }
                });

            match outcome {
                Ok(values) => {
                    let owners: Vec<(K, u64)> = keys
                        .iter()
                        .map(|pending| (pending.key.clone(), pending.entry_id))
                        .collect();
                    for (pending, value) in keys.into_iter().zip(values) {
                        let _ = pending.sender.send(value);
                    }
                    self.settle(&owners);
                }
                Err(e) => {
                    warn!("Batch {id} of {} keys failed: {e}", key_list.len());
                    self.evict(&keys);
                    for pending in keys {
                        let _ = pending.sender.send(Err(e.clone()));
                    }
                }
            }
        }

        for hit in cache_hits {
            let _ = hit.send(());
        }
    }

    /// Resolve the entries this batch still owns, so `peek` sees them even
    /// when every caller dropped its load future.
    fn settle(&self, owners: &[(K, u64)]) {
        let Some(state) = self.lock_state_or_log() else {
            return;
        };
        for (key, entry_id) in owners {
            if let Some(entry) = state.cache.get(key).filter(|entry| entry.id == *entry_id) {
                let _ = entry.value.clone().now_or_never();
            }
        }
    }

    /// Remove the entries created by this batch so a retry fetches again.
    fn evict(&self, keys: &[PendingKey<K, V>]) {
        let Some(mut state) = self.lock_state_or_log() else {
            return;
        };
        for pending in keys {
            let owned = state
                .cache
                .get(&pending.key)
                .is_some_and(|entry| entry.id == pending.entry_id);
            if owned {
                state.cache.remove(&pending.key);
            }
        }
    }
}
