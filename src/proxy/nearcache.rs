//! Bounded member-side cache of map `get` results.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::cluster::{Address, Data};
use crate::config::MapConfig;
use crate::engine::{EntryEvent, EventService};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Hit/miss counters of a near cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NearCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct CachedValue {
    value: Data,
    stored_at: Instant,

    /// Insertion stamp; an `order` slot only counts if its stamp matches.
    stamp: u64,
}

#[derive(Debug, Default)]
struct NearCacheInner {
    entries: HashMap<Data, CachedValue>,

    /// Insertion order, for first-in-first-out eviction. Slots left behind
    /// by invalidated or re-inserted keys carry an outdated stamp and are
    /// skipped on eviction.
    order: VecDeque<(Data, u64)>,
    next_stamp: u64,

    /// Bumped by every invalidation; a fill that started under an older
    /// epoch is dropped.
    epoch: u64,

    hits: u64,
    misses: u64,
}

/// Serialized key -> serialized value cache shared by every proxy of one
/// map on a member. Evicts the oldest insertion once `max_size` entries
/// are held, and treats entries older than `ttl` as absent.
#[derive(Debug)]
pub struct NearCache {
    max_size: usize,
    ttl: Option<Duration>,
    inner: Mutex<NearCacheInner>,
}

impl NearCache {
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        NearCache {
            max_size: max_size.max(1),
            ttl,
            inner: Mutex::new(NearCacheInner::default()),
        }
    }

    /// Looks up a key, counting the hit or miss. Expired entries are
    /// dropped on the way.
    pub fn get(&self, key: &Data) -> Option<Data> {
        let mut inner = self.lock();
        let expired = match (inner.entries.get(key), self.ttl) {
            (Some(cached), Some(ttl)) => cached.stored_at.elapsed() >= ttl,
            _ => false,
        };
        if expired {
            inner.entries.remove(key);
        }
        match inner.entries.get(key).map(|cached| cached.value.clone()) {
            Some(value) => {
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Current invalidation epoch. Read it before fetching a value to be
    /// cached, and hand it to `fill`.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Caches a value fetched under `epoch`, unless some invalidation
    /// happened since. Returns whether the value was stored.
    pub fn fill(&self, key: Data, value: Data, epoch: u64) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        self.store(&mut inner, key, value);
        true
    }

    pub fn put(&self, key: Data, value: Data) {
        let mut inner = self.lock();
        self.store(&mut inner, key, value);
    }

    pub fn invalidate(&self, key: &Data) {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> NearCacheStats {
        let inner = self.lock();
        NearCacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
        }
    }

    fn store(&self, inner: &mut NearCacheInner, key: Data, value: Data) {
        let stamp = inner.next_stamp;
        inner.next_stamp += 1;
        inner.entries.insert(
            key.clone(),
            CachedValue {
                value,
                stored_at: Instant::now(),
                stamp,
            },
        );
        inner.order.push_back((key, stamp));

        let NearCacheInner { entries, order, .. } = inner;
        while entries.len() > self.max_size {
            match order.pop_front() {
                Some((oldest, stamp)) => {
                    if entries.get(&oldest).map_or(false, |c| c.stamp == stamp) {
                        entries.remove(&oldest);
                    }
                }
                None => break,
            }
        }
        // keep the order queue from growing with outdated slots
        if order.len() > 2 * self.max_size {
            order.retain(|(k, stamp)| {
                entries.get(k).map_or(false, |c| c.stamp == *stamp)
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NearCacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The near caches of one member, one per map. Each cache is kept
/// coherent with the entry events of partitions executing on this member;
/// changes made elsewhere show up once the entry's TTL runs out.
pub struct NearCaches {
    me: Address,
    events: Arc<EventService>,
    caches: Mutex<HashMap<String, (Arc<NearCache>, JoinHandle<()>)>>,
}

impl NearCaches {
    pub fn new(me: Address, events: Arc<EventService>) -> Self {
        NearCaches {
            me,
            events,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Cache of map `name`, created on first use. `None` if the map has
    /// no near cache configured.
    pub fn cache_for(
        &self,
        name: &str,
        config: &MapConfig,
    ) -> Option<Arc<NearCache>> {
        if !config.near_cache_enabled {
            return None;
        }
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let (cache, _) = caches.entry(name.into()).or_insert_with(|| {
            let ttl = (config.near_cache_ttl_ms > 0)
                .then(|| Duration::from_millis(config.near_cache_ttl_ms));
            let cache = Arc::new(NearCache::new(config.near_cache_max_size, ttl));
            let handle = tokio::spawn(Self::invalidator_thread(
                self.me,
                name.to_string(),
                cache.clone(),
                self.events.subscribe(name),
            ));
            (cache, handle)
        });
        Some(cache.clone())
    }

    /// Stops every invalidator thread and drops the caches.
    pub fn shutdown(&self) {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        for (_, (_, handle)) in caches.drain() {
            handle.abort();
        }
    }

    async fn invalidator_thread(
        me: Address,
        name: String,
        cache: Arc<NearCache>,
        mut rx_event: broadcast::Receiver<EntryEvent>,
    ) {
        pf_debug!(me; "near cache invalidator for '{}' spawned", name);
        loop {
            match rx_event.recv().await {
                Ok(EntryEvent { key: Some(key), .. }) => cache.invalidate(&key),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    pf_debug!(me; "near cache of '{}' missed {} events", name, missed);
                    cache.invalidate_all();
                }
                Err(RecvError::Closed) => break,
            }
        }
        pf_debug!(me; "near cache invalidator for '{}' exitted", name);
    }
}

#[cfg(test)]
mod nearcache_tests {
    use super::*;
    use bytes::Bytes;

    fn data(s: &'static str) -> Data {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn hit_miss_and_eviction() {
        let cache = NearCache::new(2, None);
        assert_eq!(cache.get(&data("a")), None);
        cache.put(data("a"), data("1"));
        cache.put(data("b"), data("2"));
        assert_eq!(cache.get(&data("a")), Some(data("1")));
        cache.put(data("c"), data("3"));
        // oldest insertion went first
        assert_eq!(cache.get(&data("a")), None);
        assert_eq!(cache.get(&data("c")), Some(data("3")));
        assert_eq!(
            cache.stats(),
            NearCacheStats {
                hits: 2,
                misses: 2,
                entries: 2
            }
        );
    }

    #[test]
    fn invalidation() {
        let cache = NearCache::new(4, None);
        cache.put(data("a"), data("1"));
        cache.put(data("b"), data("2"));
        cache.invalidate(&data("a"));
        assert_eq!(cache.get(&data("a")), None);
        assert_eq!(cache.get(&data("b")), Some(data("2")));
        cache.invalidate_all();
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn reinserted_key_counts_as_newest() {
        let cache = NearCache::new(2, None);
        cache.put(data("a"), data("1"));
        cache.put(data("b"), data("2"));
        cache.invalidate(&data("a"));
        cache.put(data("a"), data("3"));
        // "b" is now the oldest insertion, the stale "a" slot is skipped
        cache.put(data("c"), data("4"));
        assert_eq!(cache.get(&data("a")), Some(data("3")));
        assert_eq!(cache.get(&data("b")), None);
        assert_eq!(cache.get(&data("c")), Some(data("4")));

        // overwrite in place also refreshes the position
        cache.put(data("a"), data("5"));
        cache.put(data("d"), data("6"));
        assert_eq!(cache.get(&data("a")), Some(data("5")));
        assert_eq!(cache.get(&data("c")), None);
    }

    #[test]
    fn fill_after_invalidation_dropped() {
        let cache = NearCache::new(4, None);
        let epoch = cache.epoch();
        cache.invalidate(&data("a"));
        assert!(!cache.fill(data("a"), data("old"), epoch));
        assert_eq!(cache.get(&data("a")), None);

        let epoch = cache.epoch();
        assert!(cache.fill(data("a"), data("new"), epoch));
        assert_eq!(cache.get(&data("a")), Some(data("new")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn events_invalidate_shared_cache() {
        let events = Arc::new(EventService::new());
        let caches =
            NearCaches::new(Address::from(([127, 0, 0, 1], 5701)), events.clone());
        let config = MapConfig {
            near_cache_enabled: true,
            ..Default::default()
        };
        assert!(caches.cache_for("m", &MapConfig::default()).is_none());
        let a = caches.cache_for("m", &config).unwrap();
        let b = caches.cache_for("m", &config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.put(data("k"), data("1"));
        events.publish(
            "m",
            EntryEvent {
                kind: crate::engine::EntryEventKind::Updated,
                key: Some(data("k")),
                value: Some(data("2")),
                old_value: Some(data("1")),
            },
        );
        for _ in 0..50 {
            if b.stats().entries == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(b.get(&data("k")), None);
        caches.shutdown();
    }

    #[test]
    fn entries_expire() {
        let cache = NearCache::new(4, Some(Duration::from_millis(30)));
        cache.put(data("a"), data("1"));
        assert_eq!(cache.get(&data("a")), Some(data("1")));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&data("a")), None);
        assert_eq!(cache.stats().entries, 0);
    }
}
