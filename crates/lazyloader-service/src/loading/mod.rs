//! # Loading infrastructure
//!
//! A [`LazyLoader`] fetches values by id through loader functions registered per resource type.
//! A request goes through the following steps:
//!
//! - First, the value cache is consulted under the item's cache key, which defaults to
//!   `{type}:{id}`.
//! - On miss, the item store is consulted. An item that is still loading is shared with the new
//!   caller, which waits for the same outcome (request coalescing).
//! - Otherwise a new item is queued. Queued items are dispatched by priority, and first-come
//!   first-served within a priority, whenever one of the `max_concurrent` slots is free.
//! - A dispatched attempt calls the loader under a timeout. A failed attempt is retried after a
//!   fixed delay until the configured number of attempts is used up.
//! - Every caller waiting for the item is resolved with the final outcome. Successful values are
//!   cached for their time-to-live.
//!
//! Expired cache entries are never served, but they are only evicted by
//! [`LazyLoader::cleanup_cache`], either called directly or periodically through
//! [`LazyLoader::start_cache_cleanup`].
//!
//! ## Episodes
//!
//! Each time an item starts loading it gets a new epoch. Queue entries, running attempts and
//! scheduled retries remember the epoch they belong to, and anything arriving for an epoch that
//! is no longer current is discarded. Clearing an item also cancels the token handed to its
//! loader and drops the loader future.
//!
//! ## Metrics
//!
//! All metrics are tagged with the `loader` name:
//!
//! - `loader.access`: All calls to `load`.
//! - `loader.cache.hit`: Loads served by the value cache.
//! - `loader.item.hit`: Loads served by a fresh item in the item store.
//! - `loader.dedup`: Loads attached to an item that was already loading.
//! - `loader.attempt`: Finished attempts, tagged with a `status`.
//! - `loader.retry`: Failed attempts that will be retried.
//! - `loader.failed`: Items that failed for good.
//! - `loader.active`: A gauge of the attempts currently holding a slot.
//! - `loader.cache.evicted`: Expired cache entries removed by a cleanup sweep.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LoaderConfig;
use crate::utils::futures::CancelOnDrop;

mod attempt;
mod cache;
mod error;
mod options;
mod queue;
mod registry;

use attempt::Attempt;
use cache::TtlCache;
use queue::{ConcurrencyGate, DispatchQueue};
use registry::LoaderRegistry;

pub use error::{LoadError, LoadResult};
pub use options::{
    CacheStats, LoadItem, LoadOptions, LoadPhase, LoaderStats, PreloadItem, PreloadSummary,
};

/// The bookkeeping of a single tracked item.
struct Slot<T> {
    item: LoadItem<T>,
    epoch: u64,
    cache_key: String,
    /// The cache deadline of `item.data`.
    fresh_until: Option<Instant>,
    token: CancellationToken,
    /// Resolves every caller waiting for this episode.
    done: watch::Sender<Option<LoadResult<T>>>,
}

impl<T> Slot<T> {
    fn fresh_data(&self, now: Instant) -> Option<&T> {
        match self.fresh_until {
            Some(deadline) if deadline > now => self.item.data.as_ref(),
            _ => None,
        }
    }
}

struct State<T> {
    items: HashMap<String, Slot<T>>,
    queue: DispatchQueue,
    gate: ConcurrencyGate,
}

/// The outcome of looking an id up in the item store.
enum Lookup<T> {
    Ready(T),
    Waiting(watch::Receiver<Option<LoadResult<T>>>),
    Missing,
}

struct Inner<T> {
    name: String,
    config: LoaderConfig,
    registry: LoaderRegistry<T>,
    cache: TtlCache<T>,
    state: Mutex<State<T>>,
    /// The source of item epochs.
    epochs: AtomicU64,
    expired_evictions: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new episode for `id` and queues it.
    fn enqueue(
        &self,
        state: &mut State<T>,
        id: &str,
        resource_type: &str,
        options: LoadOptions,
        cache_key: String,
    ) -> watch::Receiver<Option<LoadResult<T>>> {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let priority = options.priority;
        let (done, receiver) = watch::channel(None);

        let slot = Slot {
            item: LoadItem::new(id, resource_type, options),
            epoch,
            cache_key,
            fresh_until: None,
            token: CancellationToken::new(),
            done,
        };
        state.items.insert(id.to_owned(), slot);
        state.queue.push(id.to_owned(), epoch, priority);

        tracing::trace!(loader = %self.name, id, resource_type, priority, "queued item");
        receiver
    }

    /// Dispatches queued items while there are free slots.
    fn drain(self: &Arc<Self>) {
        let attempts = {
            let mut guard = self.state();
            let state = &mut *guard;

            let mut attempts = Vec::new();
            while state.gate.has_capacity() {
                let Some((id, epoch)) = state.queue.pop() else {
                    break;
                };
                let Some(slot) = state.items.get_mut(&id) else {
                    continue;
                };
                if slot.epoch != epoch {
                    continue;
                }
                if slot.item.phase != LoadPhase::Queued {
                    // every queue entry of the current episode pairs with one `Queued` transition
                    tracing::error!(
                        loader = %self.name,
                        id,
                        phase = ?slot.item.phase,
                        "dequeued item is not queued"
                    );
                    continue;
                }

                slot.item.set_phase(LoadPhase::Dispatched);
                slot.item.error = None;
                state.gate.acquire(epoch, &id);

                attempts.push(Attempt {
                    resource_type: slot.item.resource_type.clone(),
                    timeout: slot.item.options.timeout(&self.config),
                    token: slot.token.clone(),
                    epoch,
                    id,
                });
            }

            metric!(gauge("loader.active") = state.gate.active() as u64, "loader" => &self.name);
            attempts
        };

        for attempt in attempts {
            self.spawn_attempt(attempt);
        }
    }

    fn cleanup_cache(&self) -> u64 {
        let evicted = self.cache.sweep();
        self.expired_evictions.fetch_add(evicted, Ordering::Relaxed);

        if evicted > 0 {
            metric!(counter("loader.cache.evicted") += evicted as i64, "loader" => &self.name);
            tracing::info!(loader = %self.name, evicted, "evicted expired cache entries");
        }
        evicted
    }
}

/// Waits until `receiver` carries the outcome of its episode.
async fn wait_for_outcome<T: Clone>(
    mut receiver: watch::Receiver<Option<LoadResult<T>>>,
    id: &str,
) -> LoadResult<T> {
    match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => match &*outcome {
            Some(result) => result.clone(),
            None => Err(LoadError::ItemNotFound(id.to_owned())),
        },
        // The item was cleared before it settled.
        Err(_) => Err(LoadError::ItemNotFound(id.to_owned())),
    }
}

/// Stops the periodic cache cleanup when dropped.
///
/// See [`LazyLoader::start_cache_cleanup`].
#[derive(Debug)]
pub struct CleanupHandle {
    task: CancelOnDrop<()>,
}

impl CleanupHandle {
    /// Whether the cleanup is still scheduled.
    ///
    /// The cleanup ends on its own once every handle to its loader is gone.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the cleanup.
    pub fn stop(self) {
        drop(self.task);
    }
}

/// Loads items on demand, with request coalescing, bounded concurrency, retries and caching.
///
/// Cloning is cheap, and all clones share the same items, cache and slots.
///
/// All operations that can start a load must be called from within a tokio runtime.
pub struct LazyLoader<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for LazyLoader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for LazyLoader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyLoader")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> LazyLoader<T> {
    /// Creates a new loader.
    ///
    /// The `name` is used for logging, metrics and the name of the cache.
    pub fn new(name: impl Into<String>, config: LoaderConfig) -> Self {
        let name = name.into();
        let cache = TtlCache::new(&name, config.cache_capacity);
        let state = State {
            items: HashMap::new(),
            queue: DispatchQueue::default(),
            gate: ConcurrencyGate::new(config.max_concurrent),
        };

        Self {
            inner: Arc::new(Inner {
                name,
                config,
                registry: LoaderRegistry::default(),
                cache,
                state: Mutex::new(state),
                epochs: AtomicU64::new(0),
                expired_evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Registers the loader for `resource_type`, replacing any previous one.
    ///
    /// Attempts that are already running keep using the loader they started with.
    pub fn register_loader<F, Fut, E>(&self, resource_type: &str, f: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        self.register_cancellable_loader(resource_type, move |id, _token| f(id));
    }

    /// Registers a loader that is also handed a [`CancellationToken`].
    ///
    /// The token is cancelled once the item is cleared. The loader future is dropped at that
    /// point anyway, the token is meant for work the loader spawned on its own.
    pub fn register_cancellable_loader<F, Fut, E>(&self, resource_type: &str, f: F)
    where
        F: Fn(String, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        if self.inner.registry.register(resource_type, f) {
            tracing::debug!(loader = %self.inner.name, resource_type, "replaced loader");
        }
    }

    /// Loads the item `id` of `resource_type`.
    ///
    /// Concurrent loads of the same id share a single episode, and the `options` of the load
    /// that started it. The error is only returned once all attempts have failed.
    pub async fn load(&self, id: &str, resource_type: &str, options: LoadOptions) -> LoadResult<T> {
        let inner = &self.inner;
        metric!(counter("loader.access") += 1, "loader" => &inner.name);

        let cache_key = options.cache_key(resource_type, id);
        if let Some(value) = inner.cache.get(&cache_key) {
            metric!(counter("loader.cache.hit") += 1, "loader" => &inner.name);
            tracing::trace!(loader = %inner.name, id, %cache_key, "served from cache");
            return Ok(value);
        }

        let receiver = {
            let mut state = inner.state();
            let now = Instant::now();
            let lookup = match state.items.get(id) {
                Some(slot) if slot.item.loading => Lookup::Waiting(slot.done.subscribe()),
                Some(slot) => match slot.fresh_data(now) {
                    Some(data) => Lookup::Ready(data.clone()),
                    None => Lookup::Missing,
                },
                None => Lookup::Missing,
            };

            match lookup {
                Lookup::Ready(data) => {
                    metric!(counter("loader.item.hit") += 1, "loader" => &inner.name);
                    return Ok(data);
                }
                Lookup::Waiting(receiver) => {
                    metric!(counter("loader.dedup") += 1, "loader" => &inner.name);
                    tracing::trace!(loader = %inner.name, id, "attached to item in flight");
                    receiver
                }
                Lookup::Missing => {
                    inner.enqueue(&mut state, id, resource_type, options, cache_key)
                }
            }
        };

        inner.drain();
        wait_for_outcome(receiver, id).await
    }

    /// Loads all `items` concurrently and waits for every one of them to settle.
    ///
    /// Failures are logged and counted, but never returned.
    pub async fn preload(&self, items: Vec<PreloadItem>) -> PreloadSummary {
        let loads = items.into_iter().map(|item| async move {
            let result = self
                .load(&item.id, &item.resource_type, item.options)
                .await;
            if let Err(error) = &result {
                tracing::warn!(
                    loader = %self.inner.name,
                    id = %item.id,
                    resource_type = %item.resource_type,
                    error = error as &dyn std::error::Error,
                    "failed to preload item",
                );
            }
            result.is_ok()
        });

        let results = futures::future::join_all(loads).await;
        let succeeded = results.iter().filter(|ok| **ok).count();
        PreloadSummary {
            succeeded,
            failed: results.len() - succeeded,
        }
    }

    /// A snapshot of the item `id`.
    pub fn get(&self, id: &str) -> Option<LoadItem<T>> {
        let state = self.inner.state();
        state.items.get(id).map(|slot| slot.item.clone())
    }

    /// Whether `id` holds a loaded value.
    pub fn is_loaded(&self, id: &str) -> bool {
        let state = self.inner.state();
        state
            .items
            .get(id)
            .is_some_and(|slot| slot.item.phase == LoadPhase::Loaded)
    }

    /// Whether `id` is queued, loading, or waiting to be retried.
    pub fn is_loading(&self, id: &str) -> bool {
        let state = self.inner.state();
        state.items.get(id).is_some_and(|slot| slot.item.loading)
    }

    /// The error of the last failed attempt for `id`.
    pub fn get_error(&self, id: &str) -> Option<LoadError> {
        let state = self.inner.state();
        state.items.get(id).and_then(|slot| slot.item.error.clone())
    }

    /// Stops tracking `id` and drops its cached value.
    ///
    /// A running attempt is canceled, and callers waiting for the item resolve with
    /// [`LoadError::ItemNotFound`]. Returns whether the item was tracked.
    pub fn clear(&self, id: &str) -> bool {
        let Some(slot) = self.inner.state().items.remove(id) else {
            return false;
        };
        slot.token.cancel();
        self.inner.cache.invalidate(&slot.cache_key);

        tracing::debug!(loader = %self.inner.name, id, phase = ?slot.item.phase, "cleared item");
        true
    }

    /// Stops tracking all items and empties the cache.
    pub fn clear_all(&self) {
        let slots: Vec<_> = {
            let mut state = self.inner.state();
            state.queue.clear();
            state.items.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            slot.token.cancel();
        }
        self.inner.cache.invalidate_all();

        tracing::debug!(loader = %self.inner.name, items = slots.len(), "cleared all items");
    }

    pub fn stats(&self) -> LoaderStats {
        let mut stats = {
            let state = self.inner.state();
            let mut stats = LoaderStats {
                total_items: state.items.len(),
                active_loaders: state.gate.active(),
                ..Default::default()
            };
            for slot in state.items.values() {
                let item = &slot.item;
                stats.loaded_items += item.data.is_some() as usize;
                stats.loading_items += item.loading as usize;
                stats.error_items += item.error.is_some() as usize;
                stats.queued_items += (item.phase == LoadPhase::Queued) as usize;
            }
            stats
        };
        stats.cache_size = self.inner.cache.live_len();
        stats
    }

    /// Evicts all expired cache entries and returns how many were evicted.
    pub fn cleanup_cache(&self) -> u64 {
        self.inner.cleanup_cache()
    }

    /// Runs [`cleanup_cache`](Self::cleanup_cache) every `interval`, starting one `interval`
    /// from now.
    ///
    /// The cleanup runs until the returned handle is dropped, or until the loader itself is gone.
    pub fn start_cache_cleanup(&self, interval: Duration) -> CleanupHandle {
        let inner = Arc::downgrade(&self.inner);
        let period = interval.max(Duration::from_millis(1));

        let task = async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.cleanup_cache();
            }
        };

        CleanupHandle {
            task: CancelOnDrop::new(tokio::spawn(task)),
        }
    }

    /// Starts the periodic cleanup at the configured
    /// [`cache_cleanup_interval`](LoaderConfig::cache_cleanup_interval), if there is one.
    pub fn start_configured_cache_cleanup(&self) -> Option<CleanupHandle> {
        self.inner
            .config
            .cache_cleanup_interval
            .map(|interval| self.start_cache_cleanup(interval))
    }

    pub fn cache_stats(&self) -> CacheStats {
        let keys = self.inner.cache.live_keys();
        CacheStats {
            size: keys.len(),
            keys,
            expired_evictions: self.inner.expired_evictions.load(Ordering::Relaxed),
        }
    }
}
