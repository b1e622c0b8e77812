use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use crate::config::LoaderConfig;

use super::LoadError;

/// Per-load settings.
///
/// Every `Option` falls back to the corresponding value of the loader's [`LoaderConfig`]. The
/// options are captured when an item starts loading; callers that attach to an item already in
/// flight do not change them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Items with a higher priority are dispatched first. Defaults to `0`.
    pub priority: i64,
    /// Overrides [`LoaderConfig::timeout`].
    pub timeout: Option<Duration>,
    /// Overrides [`LoaderConfig::retry_attempts`].
    pub retry_attempts: Option<u32>,
    /// Overrides [`LoaderConfig::retry_delay`].
    pub retry_delay: Option<Duration>,
    /// Overrides [`LoaderConfig::cache_ttl`].
    pub cache_ttl: Option<Duration>,
    /// Caches the value under this key instead of `{type}:{id}`.
    pub cache_key: Option<String>,
    /// Opaque caller data, kept on the item.
    pub metadata: BTreeMap<String, String>,
}

impl LoadOptions {
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = Some(retry_attempts);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = Some(cache_ttl);
        self
    }

    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self, config: &LoaderConfig) -> Duration {
        self.timeout.unwrap_or(config.timeout)
    }

    /// The total number of attempts, which is at least one.
    pub fn max_attempts(&self, config: &LoaderConfig) -> u32 {
        self.retry_attempts.unwrap_or(config.retry_attempts).max(1)
    }

    pub fn retry_delay(&self, config: &LoaderConfig) -> Duration {
        self.retry_delay.unwrap_or(config.retry_delay)
    }

    pub fn cache_ttl(&self, config: &LoaderConfig) -> Duration {
        self.cache_ttl.unwrap_or(config.cache_ttl)
    }

    /// The key the loaded value is cached under.
    pub fn cache_key(&self, resource_type: &str, id: &str) -> String {
        match &self.cache_key {
            Some(key) => key.clone(),
            None => format!("{resource_type}:{id}"),
        }
    }
}

/// Where an item is in its lifecycle.
///
/// ```text
/// Queued -> Dispatched -> Loaded
///              |   ^
///              v   |
///         RetryPending (-> Queued)
///              |
///              v
///            Failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadPhase {
    /// Waiting in the dispatch queue for a free slot.
    Queued,
    /// An attempt is running.
    Dispatched,
    /// The last attempt failed and the next one is scheduled.
    RetryPending,
    /// The value was loaded.
    Loaded,
    /// All attempts failed.
    Failed,
}

impl LoadPhase {
    /// Whether a load is still in progress.
    pub fn is_loading(self) -> bool {
        matches!(self, Self::Queued | Self::Dispatched | Self::RetryPending)
    }
}

/// A snapshot of a tracked item.
#[derive(Clone, Debug)]
pub struct LoadItem<T> {
    pub id: String,
    pub resource_type: String,
    /// The value, once an attempt succeeded.
    pub data: Option<T>,
    /// The error of the last failed attempt, cleared once the next attempt starts.
    pub error: Option<LoadError>,
    /// `true` while the item is queued, loading, or waiting to be retried.
    pub loading: bool,
    pub phase: LoadPhase,
    /// The number of failed attempts.
    pub retry_count: u32,
    pub loaded_at: Option<SystemTime>,
    pub options: LoadOptions,
}

impl<T> LoadItem<T> {
    pub(super) fn new(id: &str, resource_type: &str, options: LoadOptions) -> Self {
        Self {
            id: id.to_owned(),
            resource_type: resource_type.to_owned(),
            data: None,
            error: None,
            loading: true,
            phase: LoadPhase::Queued,
            retry_count: 0,
            loaded_at: None,
            options,
        }
    }

    /// Moves the item into `phase`, keeping `loading` in sync.
    pub(super) fn set_phase(&mut self, phase: LoadPhase) {
        self.phase = phase;
        self.loading = phase.is_loading();
    }
}

/// A single request of a [`preload`](super::LazyLoader::preload) batch.
#[derive(Clone, Debug)]
pub struct PreloadItem {
    pub id: String,
    pub resource_type: String,
    pub options: LoadOptions,
}

impl PreloadItem {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            options: LoadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }
}

/// The settled outcome of a [`preload`](super::LazyLoader::preload) batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreloadSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Counters over all tracked items.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub total_items: usize,
    /// Items holding a value.
    pub loaded_items: usize,
    /// Items queued, in flight, or waiting to be retried.
    pub loading_items: usize,
    /// Items holding an error.
    pub error_items: usize,
    /// Items waiting for a free slot.
    pub queued_items: usize,
    /// Attempts currently occupying a slot.
    pub active_loaders: usize,
    /// Cache entries that have not expired.
    pub cache_size: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// The number of cache entries that have not expired.
    pub size: usize,
    /// Their keys, sorted.
    pub keys: Vec<String>,
    /// Expired entries removed by cleanup sweeps so far.
    pub expired_evictions: u64,
}
