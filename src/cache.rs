//! Short-lived cache for evaluation results obtained from the server.
//!
//! Unlike the snapshot, cached results are independent entries with their own expiry. A stale
//! entry is simply a miss.
use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
    time::{Duration, Instant},
};

use crate::EntityContext;

/// Key/value cache with per-entry time-to-live.
pub trait EvaluationCache<V>: Send + Sync {
    /// Return the value for `key` unless it is missing or expired.
    fn get(&self, key: &str) -> Option<V>;

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    fn set(&self, key: String, value: V, ttl: Duration);

    /// Remove the entry for `key`.
    fn delete(&self, key: &str);

    /// Remove all entries.
    fn clear(&self);

    /// Remove all expired entries.
    fn evict_expired(&self);

    /// Number of stored entries, including expired entries that were not evicted yet.
    fn len(&self) -> usize;

    /// Return `true` if no entries are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct CacheEntry<V> {
    value: V,
    /// `None` if the TTL is too large to represent, in which case the entry never expires.
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// [`EvaluationCache`] backed by a `HashMap` under a read/write lock.
pub struct InMemoryCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V> InMemoryCache<V> {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        InMemoryCache {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> Default for InMemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> EvaluationCache<V> for InMemoryCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    fn set(&self, key: String, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now().checked_add(ttl),
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, entry);
        }
    }

    fn delete(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        if let Ok(mut entries) = self.entries.write() {
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            log::trace!(target: "flagent",
                        evicted = before - entries.len();
                        "evicted expired cache entries");
        }
    }

    fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }
}

/// Build a stable cache key for evaluating `flag_key` for `entity_id` with `context`.
///
/// The key does not depend on the iteration order of `context`.
pub fn cache_key(flag_key: &str, entity_id: &str, context: &EntityContext) -> String {
    let sorted_context = context.iter().collect::<BTreeMap<_, _>>();
    let context = serde_json::to_string(&sorted_context).unwrap_or_default();

    let hash = md5::compute(format!("{flag_key}\0{entity_id}\0{context}"));
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, thread::sleep, time::Duration};

    use crate::{AttributeValue, EntityContext};

    use super::{cache_key, EvaluationCache, InMemoryCache};

    #[test]
    fn returns_value_before_ttl_and_miss_after() {
        let cache = InMemoryCache::new();
        cache.set("k".to_owned(), 42, Duration::from_millis(50));

        assert_eq!(cache.get("k"), Some(42));

        sleep(Duration::from_millis(80));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn set_replaces_previous_entry() {
        let cache = InMemoryCache::new();
        cache.set("k".to_owned(), "a", Duration::from_secs(60));
        cache.set("k".to_owned(), "b", Duration::from_secs(60));

        assert_eq!(cache.get("k"), Some("b"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_and_clear() {
        let cache = InMemoryCache::new();
        cache.set("a".to_owned(), 1, Duration::from_secs(60));
        cache.set("b".to_owned(), 2, Duration::from_secs(60));

        cache.delete("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn evict_expired_keeps_live_entries() {
        let cache = InMemoryCache::new();
        cache.set("short".to_owned(), 1, Duration::from_millis(10));
        cache.set("long".to_owned(), 2, Duration::from_secs(60));

        sleep(Duration::from_millis(30));
        assert_eq!(cache.len(), 2);

        cache.evict_expired();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("long"), Some(2));
    }

    #[test]
    fn zero_ttl_is_never_served() {
        let cache = InMemoryCache::new();
        cache.set("k".to_owned(), 1, Duration::ZERO);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn huge_ttl_never_expires() {
        let cache = InMemoryCache::new();
        cache.set("k".to_owned(), 1, Duration::MAX);

        cache.evict_expired();
        assert_eq!(cache.get("k"), Some(1));
    }

    #[test]
    fn cache_key_is_stable() {
        let a: EntityContext = [
            ("tier".to_owned(), AttributeValue::from("premium")),
            ("age".to_owned(), AttributeValue::from(30.0)),
            ("beta".to_owned(), AttributeValue::from(true)),
        ]
        .into_iter()
        .collect();
        let mut entries = a.clone().into_iter().collect::<Vec<_>>();
        entries.reverse();
        let b: EntityContext = entries.into_iter().collect();

        assert_eq!(cache_key("f", "u1", &a), cache_key("f", "u1", &b));
        assert_eq!(cache_key("f", "u1", &a).len(), 32);
    }

    #[test]
    fn cache_key_distinguishes_inputs() {
        let empty = HashMap::new();
        let premium = HashMap::from([("tier".to_owned(), AttributeValue::from("premium"))]);

        assert_ne!(cache_key("f", "u1", &empty), cache_key("f", "u2", &empty));
        assert_ne!(cache_key("f", "u1", &empty), cache_key("g", "u1", &empty));
        assert_ne!(cache_key("f", "u1", &empty), cache_key("f", "u1", &premium));
        assert_ne!(cache_key("ab", "c", &empty), cache_key("a", "bc", &empty));
    }
}
