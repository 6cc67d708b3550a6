use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

const CAPACITY: usize = 1024;

#[derive(Clone)]
struct Entry {
    body: Arc<Vec<u8>>,
    content_type: &'static str,
    expires: Instant,
}

/// In-process TTL cache for successful responses, keyed by the full query
/// string. LRU keeps it bounded; expiry is checked on read.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<Mutex<LruCache<String, Entry>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(CAPACITY).expect("capacity is nonzero"),
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<(Arc<Vec<u8>>, &'static str)> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires > Instant::now() => {
                Some((entry.body.clone(), entry.content_type))
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, body: Arc<Vec<u8>>, content_type: &'static str, ttl: Duration) {
        let entry = Entry {
            body,
            content_type,
            expires: Instant::now() + ttl,
        };
        self.entries.lock().unwrap().put(key, entry);
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hit_until_expiry() {
        let cache = ResponseCache::new();
        cache.put(
            "k".into(),
            Arc::new(b"body".to_vec()),
            "application/json",
            Duration::from_secs(60),
        );

        let (body, content_type) = cache.get("k").unwrap();
        assert_eq!(b"body".as_slice(), body.as_slice());
        assert_eq!("application/json", content_type);
    }

    #[test]
    fn expired_entries_drop_out() {
        let cache = ResponseCache::new();
        cache.put(
            "k".into(),
            Arc::new(Vec::new()),
            "application/json",
            Duration::from_millis(0),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn miss_on_unknown_key() {
        let cache = ResponseCache::new();
        assert!(cache.get("nope").is_none());
    }
}
