use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Associative map whose every operation runs under one internal lock.
///
/// Cloning yields another handle to the same map. The lock itself is never
/// exposed; callers that need several steps to happen atomically go through
/// [`SafeMap::with`] or [`SafeMap::update`].
pub struct SafeMap<K, V> {
    inner: Arc<Mutex<HashMap<K, V>>>,
}

impl<K, V> Clone for SafeMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for SafeMap<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> SafeMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Inserts only when the key is absent. Returns false if it was present.
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut map = self.inner.lock();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, value);
        true
    }

    /// Inserts or overwrites, returning the previous value.
    pub fn ensure_insert(&self, key: K, value: V) -> Option<V> {
        self.inner.lock().insert(key, value)
    }

    pub fn erase(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    /// Applies `f` to the value under `key`. Returns false when the key is absent.
    pub fn update<F>(&self, key: &K, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        match self.inner.lock().get_mut(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        let map = self.inner.lock();
        for (k, v) in map.iter() {
            f(k, v);
        }
    }

    pub fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.inner.lock().retain(f);
    }

    /// Runs `f` with exclusive access to the whole map.
    pub fn with<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<K, V>) -> R,
    {
        f(&mut self.inner.lock())
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> HashMap<K, V> {
        self.inner.lock().clone()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn insert_does_not_overwrite() {
        let map = SafeMap::new();
        assert!(map.insert(1u32, "a"));
        assert!(!map.insert(1u32, "b"));
        assert_eq!(map.find(&1), Some("a"));

        assert_eq!(map.ensure_insert(1, "c"), Some("a"));
        assert_eq!(map.find(&1), Some("c"));
    }

    #[test]
    fn erase_and_clear() {
        let map = SafeMap::new();
        map.ensure_insert("x".to_string(), 1);
        map.ensure_insert("y".to_string(), 2);
        assert_eq!(map.size(), 2);

        assert_eq!(map.erase(&"x".to_string()), Some(1));
        assert_eq!(map.erase(&"x".to_string()), None);
        assert_eq!(map.size(), 1);

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn update_only_touches_present_keys() {
        let map = SafeMap::new();
        map.ensure_insert(7u32, 10u64);
        assert!(map.update(&7, |v| *v += 5));
        assert!(!map.update(&8, |v| *v += 5));
        assert_eq!(map.find(&7), Some(15));
        assert_eq!(map.find(&8), None);
    }

    #[test]
    fn clones_share_state_across_threads() {
        let map: SafeMap<u32, u64> = SafeMap::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = map.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        map.ensure_insert(t * 1000 + i, i as u64);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.size(), 400);
        let mut sum = 0;
        map.iterate(|_, v| sum += *v);
        assert_eq!(sum, 4 * (0..100).sum::<u64>());
    }
}
