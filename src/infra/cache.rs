//! Key -> value cache with expiry over a pluggable backing store
//!
//! `TtlCache` owns the expiry policy; `CacheStore` only holds entries, so
//! the in-process map can be replaced by a shared cache without touching
//! callers.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Stored value with its expiry
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

/// Backing store for `TtlCache`
pub trait CacheStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<CacheEntry<V>>;
    fn put(&self, key: K, entry: CacheEntry<V>);
    fn remove(&self, key: &K);
    /// Drop entries that expired before `now`, returning how many were removed
    fn purge_expired(&self, now: Instant) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store
pub struct MemoryCacheStore<K, V> {
    entries: Mutex<FxHashMap<K, CacheEntry<V>>>,
}

impl<K, V> Default for MemoryCacheStore<K, V> {
    fn default() -> Self {
        Self { entries: Mutex::new(FxHashMap::default()) }
    }
}

impl<K, V> CacheStore<K, V> for MemoryCacheStore<K, V>
where
    K: Eq + Hash + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<CacheEntry<V>> {
        self.entries.lock().get(key).cloned()
    }

    fn put(&self, key: K, entry: CacheEntry<V>) {
        self.entries.lock().insert(key, entry);
    }

    fn remove(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    fn purge_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub struct TtlCache<K, V, S = MemoryCacheStore<K, V>> {
    store: S,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    _marker: std::marker::PhantomData<fn(K) -> V>,
}

impl<K, V> TtlCache<K, V, MemoryCacheStore<K, V>>
where
    K: Eq + Hash + Send,
    V: Clone + Send,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self::with_store(MemoryCacheStore::default(), ttl, max_entries)
    }
}

impl<K, V, S> TtlCache<K, V, S>
where
    S: CacheStore<K, V>,
    V: Clone,
{
    pub fn with_store(store: S, ttl: Duration, max_entries: usize) -> Self {
        Self {
            store,
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live value for `key`; expired entries are evicted on read
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        match self.store.get(key) {
            Some(entry) if entry.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
            Some(_) => {
                self.store.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        if self.store.len() >= self.max_entries {
            self.store.purge_expired(now);
        }
        if self.store.len() < self.max_entries {
            self.store.put(key, CacheEntry { value, expires_at: now + self.ttl });
        }
    }

    pub fn invalidate(&self, key: &K) {
        self.store.remove(key);
    }

    /// Cached value, or compute, store and return it
    pub fn get_or_insert_with<F>(&self, key: K, load: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(v) = self.get(&key) {
            return v;
        }
        let value = load();
        self.insert(key, value.clone());
        value
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
