//! Bounded TTL cache for short-lived device answers
//!
//! Used for transport decisions (2s, one entry) and status reads (15s, ten
//! entries). Entries carry their own expiry and are dropped lazily on access
//! or eagerly when the cache is full.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CachedEntry<V> {
    value: V,
    expires_at: Instant,
    inserted_at: Instant,
}

#[derive(Debug, Clone)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<K, CachedEntry<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live value for `key`, dropping it if expired
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.max_entries {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        self.entries.remove(&k);
                    }
                    None => break,
                }
            }
        }
        self.entries.insert(
            key,
            CachedEntry {
                value,
                expires_at: now + self.ttl,
                inserted_at: now,
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drop every entry
    pub fn invalidate(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, including ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let mut cache = TtlCache::new(Duration::from_secs(2), 1);
        cache.insert("user_interaction", 1);
        assert_eq!(cache.get(&"user_interaction"), Some(1));

        tokio::time::advance(Duration::from_millis(2001)).await;
        assert_eq!(cache.get(&"user_interaction"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_evicts_oldest() {
        let mut cache = TtlCache::new(Duration::from_secs(15), 2);
        cache.insert("a", 1);
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert("b", 2);
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate() {
        let mut cache = TtlCache::new(Duration::from_secs(15), 10);
        cache.insert(1, "x");
        cache.insert(2, "y");
        cache.invalidate();
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
    }
}
