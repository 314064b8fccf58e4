//! A bounded map of entries that expire after a per-entry TTL, shared by the
//! rate limiter (one [`crate::ratelimit::bucket::BucketSet`] per
//! source) and the connection limiter (one counter per source).
//!
//! Expiry is lazy: entries are only reaped when touched via [`get_or_insert`]
//! or during [`sweep`], never on a background timer — cleanup is folded
//! into the hot path, the same discipline [`crate::metrics::RollingCounter`]
//! uses for its own stale-slot zeroing.
//!
//! [`get_or_insert`]: TtlMap::get_or_insert

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry<V> {
    value: Arc<V>,
    expires_at: Instant,
}

/// `max_entries == 0` means unbounded.
pub struct TtlMap<K, V> {
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the entry for `key`, or create one via `make` if absent or
    /// expired. Access alone does not extend the TTL — entries expire by
    /// absolute time from their last [`update`]; callers that mutate the
    /// looked-up value call `update` afterward to renew it. Returns `None`
    /// only when the map is at capacity and `key` is not already present —
    /// callers map that to a "too many distinct sources" condition
    /// (surfaced to the caller as a 500).
    ///
    /// [`update`]: TtlMap::update
    pub fn get_or_insert(&self, key: &K, now: Instant, make: impl FnOnce() -> V) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
            inner.remove(key);
        }

        if self.max_entries > 0 && inner.len() >= self.max_entries {
            self.sweep_locked(&mut inner, now);
            if inner.len() >= self.max_entries {
                return None;
            }
        }

        let value = Arc::new(make());
        inner.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                expires_at: now + self.ttl,
            },
        );
        Some(value)
    }

    pub fn get(&self, key: &K, now: Instant) -> Option<Arc<V>> {
        let inner = self.inner.lock();
        inner
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    /// Renew `key`'s TTL from `now` if it is still present and unexpired.
    /// Returns whether an entry was renewed.
    pub fn update(&self, key: &K, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + self.ttl;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &K) {
        self.inner.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry whose TTL has lapsed as of `now`.
    pub fn sweep(&self, now: Instant) {
        let mut inner = self.inner.lock();
        self.sweep_locked(&mut inner, now);
    }

    fn sweep_locked(&self, inner: &mut HashMap<K, Entry<V>>, now: Instant) {
        inner.retain(|_, entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_and_retrieves_within_ttl() {
        let map: TtlMap<String, u32> = TtlMap::new(Duration::from_secs(60), 0);
        let now = Instant::now();
        let v = map.get_or_insert(&"a".to_string(), now, || 42).unwrap();
        assert_eq!(*v, 42);
        assert_eq!(*map.get(&"a".to_string(), now).unwrap(), 42);
    }

    #[test]
    fn expired_entry_is_recreated() {
        let map: TtlMap<String, u32> = TtlMap::new(Duration::from_millis(10), 0);
        let t0 = Instant::now();
        map.get_or_insert(&"a".to_string(), t0, || 1).unwrap();
        let t1 = t0 + Duration::from_millis(50);
        assert!(map.get(&"a".to_string(), t1).is_none());
        let v = map.get_or_insert(&"a".to_string(), t1, || 2).unwrap();
        assert_eq!(*v, 2);
    }

    #[test]
    fn plain_access_does_not_extend_ttl() {
        let map: TtlMap<String, u32> = TtlMap::new(Duration::from_millis(100), 0);
        let t0 = Instant::now();
        map.get_or_insert(&"a".to_string(), t0, || 1).unwrap();
        let t1 = t0 + Duration::from_millis(80);
        map.get_or_insert(&"a".to_string(), t1, || 99).unwrap();
        let t2 = t0 + Duration::from_millis(150);
        // not renewed by the access at t1, so it has already expired by t2
        assert!(map.get(&"a".to_string(), t2).is_none());
    }

    #[test]
    fn update_extends_ttl() {
        let map: TtlMap<String, u32> = TtlMap::new(Duration::from_millis(100), 0);
        let t0 = Instant::now();
        map.get_or_insert(&"a".to_string(), t0, || 1).unwrap();
        let t1 = t0 + Duration::from_millis(80);
        assert!(map.update(&"a".to_string(), t1));
        let t2 = t0 + Duration::from_millis(150);
        assert!(map.get(&"a".to_string(), t2).is_some());
    }

    #[test]
    fn rejects_new_keys_over_capacity() {
        let map: TtlMap<String, u32> = TtlMap::new(Duration::from_secs(60), 1);
        let now = Instant::now();
        map.get_or_insert(&"a".to_string(), now, || 1).unwrap();
        assert!(map.get_or_insert(&"b".to_string(), now, || 2).is_none());
    }

    #[test]
    fn capacity_is_reclaimed_by_expiry_before_rejecting() {
        let map: TtlMap<String, u32> = TtlMap::new(Duration::from_millis(10), 1);
        let t0 = Instant::now();
        map.get_or_insert(&"a".to_string(), t0, || 1).unwrap();
        let t1 = t0 + Duration::from_millis(50);
        let v = map.get_or_insert(&"b".to_string(), t1, || 2).unwrap();
        assert_eq!(*v, 2);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let map: TtlMap<String, u32> = TtlMap::new(Duration::from_millis(10), 0);
        let t0 = Instant::now();
        map.get_or_insert(&"a".to_string(), t0, || 1).unwrap();
        let t1 = t0 + Duration::from_millis(50);
        map.get_or_insert(&"b".to_string(), t1, || 2).unwrap();
        map.sweep(t1);
        assert_eq!(map.len(), 1);
        assert!(map.get(&"b".to_string(), t1).is_some());
    }
}
