//! Bounded cache - key to sized value with a byte ceiling and idle timeout.
//!
//! Reads never evict. Eviction happens in batched sweeps, after a number of
//! insertions or as soon as an insertion pushes the total over the ceiling,
//! so lookup latency stays flat. A sweep drops idle entries first, then the
//! least recently accessed until the total fits.
//!
//! The cache does not special-case values larger than the ceiling. Callers
//! check that before inserting.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Anything that can report its memory footprint.
pub trait CacheValue {
    fn estimated_memory_footprint(&self) -> usize;
}

impl<T: CacheValue + ?Sized> CacheValue for Arc<T> {
    fn estimated_memory_footprint(&self) -> usize {
        (**self).estimated_memory_footprint()
    }
}

/// One cached value.
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    size_bytes: usize,
    last_access: Instant,
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub ceiling: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    total_bytes: usize,
    ceiling: usize,
    idle_timeout: Duration,
    sweep_every: usize,
    painful_eviction: usize,
    /// Fraction of the ceiling `painful_eviction` is derived from
    painful_fraction: f64,
    insertions_since_sweep: usize,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Keys oldest access first.
    fn lru_order(&self) -> Vec<(K, Instant, usize)> {
        let mut order: Vec<_> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_access, e.size_bytes))
            .collect();
        order.sort_by_key(|(_, last_access, _)| *last_access);
        order
    }

    fn sweep(&mut self, now: Instant) {
        self.insertions_since_sweep = 0;

        let idle_timeout = self.idle_timeout;
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_access) > idle_timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
            self.stats.evictions += 1;
        }

        if self.total_bytes <= self.ceiling {
            return;
        }
        for (key, _, _) in self.lru_order() {
            if self.total_bytes <= self.ceiling {
                break;
            }
            self.remove(&key);
            self.stats.evictions += 1;
        }
    }
}

/// Thread-safe bounded cache.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: CacheValue + Clone,
{
    pub fn new(ceiling: usize, idle_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total_bytes: 0,
                ceiling,
                idle_timeout,
                sweep_every: 16,
                painful_eviction: ceiling / 4,
                painful_fraction: 0.25,
                insertions_since_sweep: 0,
                stats: CacheStats {
                    ceiling,
                    ..Default::default()
                },
            }),
        }
    }

    pub fn from_config(config: &crate::config::CacheFlavorConfig) -> Self {
        let cache = Self::new(config.ceiling_bytes, config.idle_timeout);
        {
            let mut state = cache.lock();
            state.sweep_every = config.sweep_every.max(1);
            state.painful_eviction = config.painful_eviction_bytes();
            state.painful_fraction = config.painful_eviction_fraction;
        }
        cache
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        // A panic while holding the lock leaves the map consistent, so keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: K, value: V) {
        self.add_at(key, value, Instant::now());
    }

    pub(crate) fn add_at(&self, key: K, value: V, now: Instant) {
        let size_bytes = value.estimated_memory_footprint();
        let mut state = self.lock();

        state.remove(&key);
        state.entries.insert(
            key,
            CacheEntry {
                value,
                size_bytes,
                last_access: now,
            },
        );
        state.total_bytes += size_bytes;
        state.insertions_since_sweep += 1;

        if state.total_bytes > state.ceiling || state.insertions_since_sweep >= state.sweep_every {
            state.sweep(now);
        }
    }

    /// Look up a value, refreshing its access time.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut state = self.lock();
        let found = state.entries.get_mut(key).map(|entry| {
            entry.last_access = now;
            entry.value.clone()
        });
        match found {
            Some(_) => state.stats.hits += 1,
            None => state.stats.misses += 1,
        }
        found
    }

    /// Membership check that does not count as an access.
    pub fn has(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        self.lock().remove(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.total_bytes = 0;
        state.insertions_since_sweep = 0;
    }

    pub fn all_keys(&self) -> Vec<K> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Change ceiling and idle timeout; sweeps immediately.
    pub fn configure(&self, ceiling: usize, idle_timeout: Duration) {
        let mut state = self.lock();
        state.ceiling = ceiling;
        state.idle_timeout = idle_timeout;
        state.painful_eviction = (ceiling as f64 * state.painful_fraction) as usize;
        state.stats.ceiling = ceiling;
        state.sweep(Instant::now());
    }

    /// Periodic sweep for idle entries.
    pub fn maintain(&self) {
        self.lock().sweep(Instant::now());
    }

    /// Make room for `n_bytes` by evicting least recently used entries.
    ///
    /// Refuses, evicting nothing, if `n_bytes` can never fit or if freeing it
    /// would mean evicting more than the painful-eviction cap.
    pub fn reserve_space(&self, n_bytes: usize) -> bool {
        let mut state = self.lock();

        if n_bytes > state.ceiling {
            return false;
        }
        let free = state.ceiling.saturating_sub(state.total_bytes);
        if free >= n_bytes {
            return true;
        }
        let needed = n_bytes - free;
        if needed > state.painful_eviction {
            return false;
        }

        let mut freed = 0;
        for (key, _, _) in state.lru_order() {
            if freed >= needed {
                break;
            }
            if let Some(entry) = state.remove(&key) {
                freed += entry.size_bytes;
                state.stats.evictions += 1;
            }
        }
        freed >= needed
    }

    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    pub fn ceiling(&self) -> usize {
        self.lock().ceiling
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.total_bytes,
            ..state.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Blob(usize);

    impl CacheValue for Blob {
        fn estimated_memory_footprint(&self) -> usize {
            self.0
        }
    }

    fn secs(base: Instant, s: u64) -> Instant {
        base + Duration::from_secs(s)
    }

    #[test]
    fn test_over_ceiling_evicts_oldest() {
        let cache = BoundedCache::new(1_000, Duration::from_secs(10));
        let t0 = Instant::now();

        cache.add_at("a", Blob(600), t0);
        cache.add_at("b", Blob(600), secs(t0, 1));

        assert!(!cache.has(&"a"));
        assert!(cache.has(&"b"));
        assert_eq!(cache.total_bytes(), 600);
    }

    #[test]
    fn test_get_refreshes_access() {
        let cache = BoundedCache::new(1_000, Duration::from_secs(100));
        let t0 = Instant::now();

        cache.add_at("a", Blob(400), t0);
        cache.add_at("b", Blob(400), secs(t0, 1));
        assert_eq!(cache.get_at(&"a", secs(t0, 2)), Some(Blob(400)));

        cache.add_at("c", Blob(400), secs(t0, 3));
        assert!(cache.has(&"a"));
        assert!(!cache.has(&"b"));
        assert!(cache.has(&"c"));
    }

    #[test]
    fn test_idle_entries_swept() {
        let cache = BoundedCache::new(10_000, Duration::from_secs(10));
        let t0 = Instant::now();

        cache.add_at("old", Blob(10), t0);
        // Force a sweep by overflowing briefly
        cache.add_at("big", Blob(10_000), secs(t0, 30));

        assert!(!cache.has(&"old"));
        assert!(cache.has(&"big"));
    }

    #[test]
    fn test_sweep_never_leaves_total_over_ceiling() {
        let cache = BoundedCache::new(1_000, Duration::from_secs(1_000));
        let t0 = Instant::now();
        for i in 0..50u64 {
            cache.add_at(i, Blob(37 + (i as usize * 13) % 200), secs(t0, i));
            assert!(cache.total_bytes() <= 1_000);
        }
        let stats = cache.stats();
        assert!(stats.evictions > 0);
        assert_eq!(stats.bytes, cache.total_bytes());
    }

    #[test]
    fn test_replacing_key_adjusts_total() {
        let cache = BoundedCache::new(1_000, Duration::from_secs(10));
        cache.add("a", Blob(300));
        cache.add("a", Blob(100));
        assert_eq!(cache.total_bytes(), 100);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reserve_space() {
        let cache = BoundedCache::new(1_000, Duration::from_secs(100));
        let t0 = Instant::now();
        cache.add_at("a", Blob(300), t0);
        cache.add_at("b", Blob(300), secs(t0, 1));
        cache.add_at("c", Blob(300), secs(t0, 2));

        // 100 free already
        assert!(cache.reserve_space(100));
        assert_eq!(cache.len(), 3);

        // needs 200 more, cap is 250: evicts "a"
        assert!(cache.reserve_space(300));
        assert!(!cache.has(&"a"));
        assert!(cache.has(&"b"));

        // would need 500 evicted: too painful, nothing touched
        assert!(!cache.reserve_space(900));
        assert_eq!(cache.len(), 2);

        assert!(!cache.reserve_space(5_000));
    }

    #[test]
    fn test_configure_shrinks() {
        let cache = BoundedCache::new(1_000, Duration::from_secs(100));
        cache.add("a", Blob(400));
        cache.add("b", Blob(400));
        cache.configure(500, Duration::from_secs(100));
        assert!(cache.total_bytes() <= 500);
        assert_eq!(cache.ceiling(), 500);
    }

    #[test]
    fn test_configure_grows_painful_cap() {
        let cache = BoundedCache::new(1_000, Duration::from_secs(100));
        cache.add("a", Blob(400));
        cache.add("b", Blob(400));

        // cap 250 of 1_000: freeing 600 is too painful
        assert!(!cache.reserve_space(800));
        cache.configure(4_000, Duration::from_secs(100));

        // cap 1_000 of 4_000: 600 must go, both entries are evicted
        assert!(cache.reserve_space(3_800));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stats_and_clear() {
        let cache = BoundedCache::new(1_000, Duration::from_secs(100));
        cache.add(1, Blob(10));
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&2).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.all_keys().is_empty());
    }
}
