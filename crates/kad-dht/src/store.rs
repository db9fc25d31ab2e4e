//! Local value store: key → set-of-values, each with its own TTL,
//! last-refresh and expiry bookkeeping.
//!
//! Modeled as a primary map keyed by `(key, value)` plus two secondary
//! indexes on `last_refresh` and `expire_time`, the way the original's
//! multi-index table is expressed here as one `HashMap` plus two
//! `BTreeMap<u64, HashSet<(Key, Value)>>` maintained alongside it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

type Key = Vec<u8>;
type Value = Vec<u8>;

#[derive(Clone, Debug)]
struct Entry {
    last_refresh: u64,
    expire_time: Option<u64>,
    ttl: u64,
}

/// A value due for a refresh-wave re-STORE.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshValue {
    /// The entry's key.
    pub key: Key,
    /// The entry's value.
    pub value: Value,
    /// The entry's original TTL, to carry into the re-STORE.
    pub ttl: u64,
}

struct Inner {
    entries: HashMap<(Key, Value), Entry>,
    by_last_refresh: BTreeMap<u64, HashSet<(Key, Value)>>,
    by_expire_time: BTreeMap<u64, HashSet<(Key, Value)>>,
}

/// In-memory key/value store with TTL, republish, and refresh semantics.
///
/// A single mutex protects the whole store; every operation here is short
/// and never awaits, so it is safe to call from async contexts without
/// holding the lock across a suspension point.
pub struct DataStore {
    inner: Mutex<Inner>,
}

impl DataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                by_last_refresh: BTreeMap::new(),
                by_expire_time: BTreeMap::new(),
            }),
        }
    }

    /// Store `value` under `key`.
    ///
    /// If the `(key, value)` tuple already exists: `republish = true`
    /// resets both `last_refresh` and `expire_time`; `republish = false`
    /// (a refresh) resets only `last_refresh`, leaving `expire_time`
    /// untouched. If new, inserts with `last_refresh = now` and
    /// `expire_time = now + ttl` (`ttl = 0` means no expiry).
    ///
    /// Returns `true` if this was a new entry, `false` if an existing one
    /// was refreshed or republished.
    pub fn store(&self, key: &[u8], value: &[u8], ttl: u64, republish: bool) -> bool {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = now_secs();
        let map_key = (key.to_vec(), value.to_vec());

        if let Some(existing) = inner.entries.get(&map_key).cloned() {
            remove_from_index(&mut inner.by_last_refresh, existing.last_refresh, &map_key);
            if let Some(old_expiry) = existing.expire_time {
                remove_from_index(&mut inner.by_expire_time, old_expiry, &map_key);
            }

            let new_expire_time = if republish {
                compute_expire_time(now, ttl)
            } else {
                existing.expire_time
            };

            let updated = Entry {
                last_refresh: now,
                expire_time: new_expire_time,
                ttl: if republish { ttl } else { existing.ttl },
            };
            insert_into_index(&mut inner.by_last_refresh, now, map_key.clone());
            if let Some(expiry) = new_expire_time {
                insert_into_index(&mut inner.by_expire_time, expiry, map_key.clone());
            }
            inner.entries.insert(map_key, updated);
            false
        } else {
            let expire_time = compute_expire_time(now, ttl);
            let entry = Entry {
                last_refresh: now,
                expire_time,
                ttl,
            };
            insert_into_index(&mut inner.by_last_refresh, now, map_key.clone());
            if let Some(expiry) = expire_time {
                insert_into_index(&mut inner.by_expire_time, expiry, map_key.clone());
            }
            inner.entries.insert(map_key, entry);
            true
        }
    }

    /// Return every value currently stored under `key` (expired entries
    /// excluded; callers should run `delete_expired` periodically, but a
    /// stale entry that has not yet been swept is still excluded here).
    pub fn load(&self, key: &[u8]) -> Vec<Value> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let now = now_secs();
        inner
            .entries
            .iter()
            .filter(|((k, _), entry)| k == key && !is_expired(entry, now))
            .map(|((_, v), _)| v.clone())
            .collect()
    }

    /// Remove all values stored under `key`.
    pub fn delete(&self, key: &[u8]) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let victims: Vec<(Key, Value)> = inner
            .entries
            .keys()
            .filter(|(k, _)| k == key)
            .cloned()
            .collect();
        for map_key in victims {
            remove_entry(&mut inner, &map_key);
        }
    }

    /// Remove a single `(key, value)` tuple.
    pub fn delete_value(&self, key: &[u8], value: &[u8]) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let map_key = (key.to_vec(), value.to_vec());
        remove_entry(&mut inner, &map_key);
    }

    /// Remove every entry whose `expire_time <= now`. Returns the count removed.
    pub fn delete_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = now_secs();
        let expired_keys: Vec<u64> = inner
            .by_expire_time
            .range(..=now)
            .map(|(t, _)| *t)
            .collect();
        let victims: Vec<(Key, Value)> = expired_keys
            .iter()
            .flat_map(|t| inner.by_expire_time.get(t).cloned().unwrap_or_default())
            .collect();
        let count = victims.len();
        for map_key in victims {
            remove_entry(&mut inner, &map_key);
        }
        count
    }

    /// Return every entry whose `last_refresh + refresh_interval_secs <= now`.
    pub fn values_to_refresh(&self, refresh_interval_secs: u64) -> Vec<RefreshValue> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let now = now_secs();
        let cutoff = now.saturating_sub(refresh_interval_secs);
        inner
            .by_last_refresh
            .range(..=cutoff)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .filter_map(|(key, value)| {
                inner.entries.get(&(key.clone(), value.clone())).map(|e| RefreshValue {
                    key,
                    value,
                    ttl: e.ttl,
                })
            })
            .collect()
    }

    /// The `last_refresh` timestamp of a specific tuple, if present.
    pub fn last_refresh(&self, key: &[u8], value: &[u8]) -> Option<u64> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .entries
            .get(&(key.to_vec(), value.to_vec()))
            .map(|e| e.last_refresh)
    }

    /// The `expire_time` of a specific tuple, if present (`None` means
    /// either absent or never-expiring).
    pub fn expire_time(&self, key: &[u8], value: &[u8]) -> Option<u64> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .entries
            .get(&(key.to_vec(), value.to_vec()))
            .and_then(|e| e.expire_time)
    }

    /// The original `ttl` of a specific tuple, if present.
    pub fn ttl(&self, key: &[u8], value: &[u8]) -> Option<u64> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .entries
            .get(&(key.to_vec(), value.to_vec()))
            .map(|e| e.ttl)
    }

    /// Whether the store holds any (non-expired) value under `key`.
    pub fn has(&self, key: &[u8]) -> bool {
        !self.load(key).is_empty()
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn compute_expire_time(now: u64, ttl: u64) -> Option<u64> {
    if ttl == 0 {
        None
    } else {
        Some(now + ttl)
    }
}

fn is_expired(entry: &Entry, now: u64) -> bool {
    matches!(entry.expire_time, Some(t) if t <= now)
}

fn insert_into_index(index: &mut BTreeMap<u64, HashSet<(Key, Value)>>, at: u64, map_key: (Key, Value)) {
    index.entry(at).or_default().insert(map_key);
}

fn remove_from_index(index: &mut BTreeMap<u64, HashSet<(Key, Value)>>, at: u64, map_key: &(Key, Value)) {
    if let Some(set) = index.get_mut(&at) {
        set.remove(map_key);
        if set.is_empty() {
            index.remove(&at);
        }
    }
}

fn remove_entry(inner: &mut Inner, map_key: &(Key, Value)) {
    if let Some(entry) = inner.entries.remove(map_key) {
        remove_from_index(&mut inner.by_last_refresh, entry.last_refresh, map_key);
        if let Some(expiry) = entry.expire_time {
            remove_from_index(&mut inner.by_expire_time, expiry, map_key);
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_new_entry() {
        let store = DataStore::new();
        let is_new = store.store(b"k", b"v", 3600, true);
        assert!(is_new);
        assert_eq!(store.load(b"k"), vec![b"v".to_vec()]);
    }

    #[test]
    fn test_republish_resets_expire_time() {
        let store = DataStore::new();
        store.store(b"k", b"v", 100, true);
        let e1 = store.expire_time(b"k", b"v").expect("has expiry");
        std::thread::sleep(std::time::Duration::from_millis(1100));
        store.store(b"k", b"v", 200, true);
        let e2 = store.expire_time(b"k", b"v").expect("has expiry");
        assert!(e2 > e1);
    }

    #[test]
    fn test_refresh_does_not_move_expire_time() {
        let store = DataStore::new();
        store.store(b"k", b"v", 86400, true);
        let e1 = store.expire_time(b"k", b"v").expect("has expiry");
        let r1 = store.last_refresh(b"k", b"v").expect("has refresh");
        std::thread::sleep(std::time::Duration::from_millis(1100));
        store.store(b"k", b"v", 86400, false);
        let e2 = store.expire_time(b"k", b"v").expect("has expiry");
        let r2 = store.last_refresh(b"k", b"v").expect("has refresh");
        assert_eq!(e1, e2);
        assert!(r2 > r1);
    }

    #[test]
    fn test_ttl_zero_never_expires() {
        let store = DataStore::new();
        store.store(b"k", b"v", 0, true);
        assert_eq!(store.expire_time(b"k", b"v"), None);
    }

    #[test]
    fn test_delete_expired() {
        let store = DataStore::new();
        store.store(b"k", b"v", 1, true);
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let removed = store.delete_expired();
        assert_eq!(removed, 1);
        assert!(store.load(b"k").is_empty());
    }

    #[test]
    fn test_values_to_refresh() {
        let store = DataStore::new();
        store.store(b"k", b"v", 86400, true);
        let due = store.values_to_refresh(0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, b"k".to_vec());
        assert_eq!(due[0].value, b"v".to_vec());

        let not_due = store.values_to_refresh(3600);
        assert!(not_due.is_empty());
    }

    #[test]
    fn test_delete_value() {
        let store = DataStore::new();
        store.store(b"k", b"v1", 3600, true);
        store.store(b"k", b"v2", 3600, true);
        store.delete_value(b"k", b"v1");
        let remaining = store.load(b"k");
        assert_eq!(remaining, vec![b"v2".to_vec()]);
    }

    #[test]
    fn test_delete_all_for_key() {
        let store = DataStore::new();
        store.store(b"k", b"v1", 3600, true);
        store.store(b"k", b"v2", 3600, true);
        store.delete(b"k");
        assert!(store.load(b"k").is_empty());
    }

    #[test]
    fn test_multiple_values_same_key() {
        let store = DataStore::new();
        store.store(b"k", b"v1", 3600, true);
        store.store(b"k", b"v2", 3600, true);
        let mut values = store.load(b"k");
        values.sort();
        assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec()]);
    }

    #[test]
    fn test_has() {
        let store = DataStore::new();
        assert!(!store.has(b"k"));
        store.store(b"k", b"v", 3600, true);
        assert!(store.has(b"k"));
    }
}
