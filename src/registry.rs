// src/registry.rs - Concurrent string-keyed map with insert-once semantics

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Thread-safe map used for reply correlation, WebSocket sessions and the
/// server's tunnel table. Every operation is atomic with respect to the others.
pub struct SyncMap<V> {
    inner: DashMap<String, V>,
}

impl<V> Default for SyncMap<V> {
    fn default() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }
}

impl<V: Clone> SyncMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` unless `key` is taken. Returns `false`, leaving the
    /// existing value in place, when it is.
    pub fn set_if_absent(&self, key: impl Into<String>, value: V) -> bool {
        match self.inner.entry(key.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    pub fn delete(&self, key: &str) -> Option<V> {
        self.inner.remove(key).map(|(_, value)| value)
    }

    /// Remove `key` only while it still maps to a value matching `pred`.
    pub fn delete_if(&self, key: &str, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        self.inner
            .remove_if(key, |_, value| pred(value))
            .map(|(_, value)| value)
    }

    /// Mutate the value under `key` in place. Returns `false` if absent.
    pub fn update(&self, key: &str, f: impl FnOnce(&mut V)) -> bool {
        match self.inner.get_mut(key) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Remove every entry, handing each one to `f`. Entries inserted while
    /// this runs may survive; callers close the map to new inserts first.
    pub fn range_and_clear(&self, mut f: impl FnMut(String, V)) {
        for key in self.keys() {
            if let Some((key, value)) = self.inner.remove(&key) {
                f(key, value);
            }
        }
    }
}
