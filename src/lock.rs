//! Reference-counted per-key locking, used by the file-pack store to
//! serialize writes to the same logical name while letting writes to
//! distinct names proceed in parallel.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

struct Entry {
    lock: Arc<Mutex<()>>,
    refcount: usize,
}

/// A map from key to `Mutex<()>`, with entries removed once their last
/// holder releases it — the map does not grow unboundedly across the
/// lifetime of a long-lived store.
pub struct KeyedLock<K> {
    entries: Mutex<HashMap<K, Entry>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`, blocking until available.
    /// The per-key entry is dropped from the map once the last concurrent
    /// holder finishes.
    pub fn with_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let per_key = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                lock: Arc::new(Mutex::new(())),
                refcount: 0,
            });
            entry.refcount += 1;
            entry.lock.clone()
        };
        let result = {
            let _guard = per_key.lock().unwrap();
            f()
        };
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entries.remove(key);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn serializes_same_key() {
        let lock: Arc<KeyedLock<String>> = Arc::new(KeyedLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..16 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                lock.with_lock(&"same".to_string(), || {
                    let before = counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(before, 0); // no other holder concurrently
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn map_shrinks_after_release() {
        let lock: KeyedLock<&str> = KeyedLock::new();
        lock.with_lock(&"a", || {});
        assert!(lock.entries.lock().unwrap().is_empty());
    }
}
