use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process TTL cache for API lookups. Plain instance, constructed and
/// passed where needed; two clients never share entries unless handed the
/// same cache on purpose.
///
/// Expired entries are dropped lazily on access, so a key written with a
/// TTL and never read again occupies memory until the next `get`/`set` on
/// that key.
#[derive(Default)]
pub struct TtlCache {
    entries: DashMap<String, Entry>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        // Re-check under the write lock before removing.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Stores `value` under `key`. `ttl: None` never expires.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        self.entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

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
    use serde_json::json;

    #[test]
    fn set_get_delete() {
        let cache = TtlCache::new();
        cache.set("guild:1", json!({"name": "test"}), None);
        assert_eq!(cache.get("guild:1").unwrap()["name"], "test");
        assert!(cache.delete("guild:1"));
        assert!(!cache.delete("guild:1"));
        assert!(cache.get("guild:1").is_none());
    }

    #[test]
    fn expired_entries_vanish_on_read() {
        let cache = TtlCache::new();
        cache.set("k", json!(1), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn overwrite_replaces_ttl() {
        let cache = TtlCache::new();
        cache.set("k", json!(1), Some(Duration::from_millis(0)));
        cache.set("k", json!(2), None);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k").unwrap(), json!(2));
    }

    #[test]
    fn instances_are_independent() {
        let a = TtlCache::new();
        let b = TtlCache::new();
        a.set("k", json!("a"), None);
        assert!(b.get("k").is_none());
    }
}
