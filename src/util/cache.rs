// =============================================================================
// TTL Cache — expiring key/value store with hit/miss statistics
// =============================================================================
//
// Used for balance snapshots and instrument metadata. A write-through
// `invalidate` supports WebSocket-driven cache busting; `get_stale` supports
// the stale-on-error balance policy.
// =============================================================================

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Counters exposed for the statistics surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub updates: u64,
}

/// Thread-safe TTL cache.
pub struct TtlCache<K, V> {
    default_ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
    stats: Mutex<CacheStats>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Fresh value for `key`, or `None` when missing or expired. Expired
    /// entries are kept (not evicted) so `get_stale` can still serve them.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock();
        let mut stats = self.stats.lock();
        match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                stats.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                stats.expired += 1;
                stats.misses += 1;
                None
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Value for `key` regardless of expiry. Used for the stale-on-error
    /// fallback when a refresh query fails.
    pub fn get_stale(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).map(|e| e.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.entries.lock().insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
        self.stats.lock().updates += 1;
    }

    /// Drop an entry entirely (e.g. a WebSocket balance update arrived and
    /// the next read must hit the venue).
    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }
}
