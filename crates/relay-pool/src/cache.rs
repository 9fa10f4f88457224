//! Bounded in-process caches.
//!
//! Each cache is bounded by the summed cost of its entries and evicts least
//! recently used entries to make room. Keys are hashed from the last 16 hex
//! characters of an identifier: ids and pubkeys may carry proof-of-work
//! prefixes, so the leading bytes are the clustered ones.

use lru::LruCache;
use nostr_sdk::Event;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

use crate::directory::{Follow, Profile};

const SHORT_KEY_LEN: usize = 16;

/// Hash key for an identifier, built from its suffix.
pub fn short_key(id: &str) -> u64 {
    let start = id
        .char_indices()
        .rev()
        .nth(SHORT_KEY_LEN - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let suffix = &id[start..];
    u64::from_str_radix(suffix, 16).unwrap_or_else(|_| {
        let mut hasher = DefaultHasher::new();
        suffix.hash(&mut hasher);
        hasher.finish()
    })
}

struct Entry<V> {
    key: String,
    value: V,
    cost: u64,
    expires_at: Option<Instant>,
}

struct Inner<V> {
    entries: LruCache<u64, Entry<V>>,
    used: u64,
}

impl<V> Inner<V> {
    fn remove(&mut self, hash: u64) {
        if let Some(old) = self.entries.pop(&hash) {
            self.used -= old.cost;
        }
    }
}

/// Cost-bounded LRU cache with optional per-entry TTL.
pub struct TtlCache<V> {
    max_cost: u64,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(max_cost: u64) -> Self {
        Self {
            max_cost,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let hash = short_key(key);
        let mut inner = self.inner.lock();
        let live = match inner.entries.peek(&hash) {
            None => return None,
            Some(entry) if entry.key != key => return None,
            Some(entry) => entry.expires_at.is_none_or(|at| Instant::now() < at),
        };
        if !live {
            inner.remove(hash);
            return None;
        }
        inner.entries.get(&hash).map(|entry| entry.value.clone())
    }

    /// Store without expiry. Returns false when `cost` alone exceeds capacity.
    pub fn set(&self, key: &str, value: V, cost: u64) -> bool {
        self.insert(key, value, cost, None)
    }

    pub fn set_with_ttl(&self, key: &str, value: V, cost: u64, ttl: Duration) -> bool {
        self.insert(key, value, cost, Some(Instant::now() + ttl))
    }

    pub fn delete(&self, key: &str) {
        let hash = short_key(key);
        let mut inner = self.inner.lock();
        if inner.entries.peek(&hash).is_some_and(|e| e.key == key) {
            inner.remove(hash);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: &str, value: V, cost: u64, expires_at: Option<Instant>) -> bool {
        if cost > self.max_cost {
            return false;
        }
        let hash = short_key(key);
        let mut inner = self.inner.lock();
        inner.remove(hash);
        while inner.used + cost > self.max_cost {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.used -= evicted.cost,
                None => break,
            }
        }
        inner.used += cost;
        inner.entries.put(
            hash,
            Entry {
                key: key.to_string(),
                value,
                cost,
                expires_at,
            },
        );
        true
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub events: u64,
    pub profiles: u64,
    pub contact_lists: u64,
    /// TTL of cached misses.
    pub not_found_ttl: Duration,
    /// TTL of cached hits.
    pub found_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            events: 8000,
            profiles: 8000,
            contact_lists: 8000,
            not_found_ttl: Duration::from_secs(30 * 60),
            found_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// The per-category caches. A `None` value is a remembered miss.
pub struct Caches {
    pub events: TtlCache<Option<Event>>,
    pub profiles: TtlCache<Option<Profile>>,
    pub contact_lists: TtlCache<Option<Vec<Follow>>>,
    settings: CacheSettings,
}

impl Caches {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            events: TtlCache::new(settings.events),
            profiles: TtlCache::new(settings.profiles),
            contact_lists: TtlCache::new(settings.contact_lists),
            settings,
        }
    }

    /// Cache a lookup outcome, hits with the long TTL and misses with the short one.
    pub fn remember<V: Clone>(&self, cache: &TtlCache<Option<V>>, key: &str, value: Option<V>) {
        let ttl = if value.is_some() {
            self.settings.found_ttl
        } else {
            self.settings.not_found_ttl
        };
        cache.set_with_ttl(key, value, 1, ttl);
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new(CacheSettings::default())
    }
}
