use lru_cache::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    item: V,
    expiration: Instant,
}

/// LRU cache whose entries also expire after a fixed TTL.
/// Expired entries are dropped lazily on access; capacity overflow
/// evicts in LRU order. Interior mutex makes it safe to share
/// between concurrent classification calls.
pub struct TtlCache<K: Eq + Hash, V: Clone> {
    ttl: Duration,
    cache: Mutex<LruCache<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(key)?;
        if Instant::now() < entry.expiration {
            Some(entry.item.clone())
        } else {
            cache.remove(key);
            None
        }
    }

    pub fn insert(&self, key: K, item: V) {
        let expiration = Instant::now() + self.ttl;
        self.cache.lock().insert(key, Entry { item, expiration });
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entries_expire() {
        let cache: TtlCache<String, u32> = TtlCache::new(4, Duration::from_millis(20));
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_lru() {
        let cache: TtlCache<u32, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1, 1);
        cache.insert(2, 2);
        // touch 1 so that 2 becomes the eviction candidate
        cache.get(&1);
        cache.insert(3, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&3), Some(3));
    }
}
