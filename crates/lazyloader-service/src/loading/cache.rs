use std::time::Duration;

use moka::ops::compute::{CompResult, Op};
use tokio::time::Instant;

/// A value saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct CachedValue<T> {
    /// When this value stops being served.
    deadline: Instant,
    /// The actual data.
    value: T,
}

impl<T> CachedValue<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// The cache of loaded values, keyed by cache key.
///
/// Expiry is enforced lazily: a read never returns a value past its deadline, but the entry
/// itself stays in memory until [`sweep`](Self::sweep) removes it. Deadlines are measured on the
/// tokio clock.
pub(super) struct TtlCache<T> {
    cache: moka::sync::Cache<String, CachedValue<T>>,
}

impl<T> std::fmt::Debug for TtlCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> TtlCache<T> {
    pub fn new(name: &str, capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .name(name)
            .max_capacity(capacity)
            .build();
        Self { cache }
    }

    /// Returns the value for `key` unless it is missing or expired.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        self.cache
            .get(key)
            .filter(|cached| !cached.is_expired(now))
            .map(|cached| cached.value)
    }

    /// Caches `value` for `ttl`, replacing any previous value, and returns its deadline.
    pub fn insert(&self, key: String, value: T, ttl: Duration) -> Instant {
        let deadline = Instant::now() + ttl;
        self.cache.insert(key, CachedValue { deadline, value });
        deadline
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Removes all expired entries and returns how many were removed.
    pub fn sweep(&self) -> u64 {
        let now = Instant::now();
        let expired: Vec<_> = self
            .cache
            .iter()
            .filter(|(_, cached)| cached.is_expired(now))
            .map(|(key, _)| key)
            .collect();

        let mut removed = 0;
        for key in expired {
            // The entry may have been refreshed since it was collected.
            let result = self.cache.entry_by_ref(key.as_str()).and_compute_with(|entry| {
                match entry {
                    Some(entry) if entry.value().is_expired(now) => Op::Remove,
                    _ => Op::Nop,
                }
            });
            if matches!(result, CompResult::Removed(_)) {
                removed += 1;
            }
        }
        removed
    }

    /// The keys of all entries that have not expired, sorted.
    pub fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<_> = self
            .cache
            .iter()
            .filter(|(_, cached)| !cached.is_expired(now))
            .map(|(key, _)| String::clone(&key))
            .collect();
        keys.sort();
        keys
    }

    pub fn live_len(&self) -> usize {
        let now = Instant::now();
        self.cache
            .iter()
            .filter(|(_, cached)| !cached.is_expired(now))
            .count()
    }
}
