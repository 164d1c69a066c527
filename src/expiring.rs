//! # ExpiringMap
//!
//! A key→value map where every entry carries its own time-to-live,
//! independent of the others. Expired entries are treated as absent and are
//! swept out lazily on access (or eagerly via [`ExpiringMap::purge_expired`]).
//! Useful for cooldown tracking, e.g. "don't email this address again for an
//! hour".

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct ExpiringMap<K, V> {
    default_ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> ExpiringMap<K, V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert with the map's default TTL. Replaces (and re-times) any
    /// existing entry.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an entry-specific TTL.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().insert(key, entry);
    }

    /// Get a live value. An expired entry counts as absent and is removed.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.get(key).is_some()
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    /// Drop every expired entry now.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, e| e.expires_at > now);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.purge_expired();
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_insert_and_get() {
        let map = ExpiringMap::new(Duration::from_secs(60));
        map.insert("a", 1);
        assert_eq!(map.get("a"), Some(1));
        assert_eq!(map.get("b"), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_entry_expires() {
        let map = ExpiringMap::new(Duration::from_millis(30));
        map.insert("a", 1);
        assert_eq!(map.get("a"), Some(1));
        sleep(Duration::from_millis(60));
        assert_eq!(map.get("a"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_per_entry_ttl_is_independent() {
        let map = ExpiringMap::new(Duration::from_secs(60));
        map.insert_with_ttl("short", 1, Duration::from_millis(30));
        map.insert("long", 2);
        sleep(Duration::from_millis(60));
        assert_eq!(map.get("short"), None);
        assert_eq!(map.get("long"), Some(2));
    }

    #[test]
    fn test_reinsert_resets_ttl() {
        let map = ExpiringMap::new(Duration::from_millis(50));
        map.insert("a", 1);
        sleep(Duration::from_millis(30));
        map.insert("a", 2);
        sleep(Duration::from_millis(30));
        // the second insert re-timed the entry
        assert_eq!(map.get("a"), Some(2));
    }

    #[test]
    fn test_remove() {
        let map = ExpiringMap::new(Duration::from_secs(60));
        map.insert("a", 1);
        assert_eq!(map.remove("a"), Some(1));
        assert_eq!(map.get("a"), None);
    }
}
