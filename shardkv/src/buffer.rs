use std::time::Duration;

use bytes::Bytes;
use scc::HashMap;
use tokio::time::Instant;

/// A recently written value, stamped with the monotonic time of the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub payload: Bytes,
    pub last_write: Instant,
}

impl Entry {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            last_write: Instant::now(),
        }
    }

    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_write) > ttl
    }
}

/// In-memory tier holding the latest write of each key for a short TTL.
///
/// Entries are only mutated while the key's lock is held; the buffer itself
/// does no locking beyond what `scc::HashMap` needs internally.
#[derive(Default)]
pub struct HotBuffer {
    entries: HashMap<String, Entry>,
}

impl HotBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, payload: Bytes) {
        self.entries.upsert(key.to_string(), Entry::new(payload));
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.read(key, |_, entry| entry.payload.clone())
    }

    pub fn entry(&self, key: &str) -> Option<Entry> {
        self.entries.read(key, |_, entry| entry.clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Removes `key` only if it is still expired at `now`.
    pub fn remove_expired(&self, key: &str, now: Instant, ttl: Duration) -> bool {
        self.entries
            .remove_if(key, |entry| entry.is_expired(now, ttl))
            .is_some()
    }

    /// Keys whose last write is older than `ttl` at `now`.
    pub fn expired_keys(&self, now: Instant, ttl: Duration) -> Vec<String> {
        let mut keys = Vec::new();
        self.entries.scan(|key, entry| {
            if entry.is_expired(now, ttl) {
                keys.push(key.clone());
            }
        });
        keys
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

    #[tokio::test(start_paused = true)]
    async fn expiry_uses_monotonic_age() {
        let buffer = HotBuffer::new();
        let ttl = Duration::from_secs(60);
        buffer.insert("a", Bytes::from_static(b"1"));

        tokio::time::advance(Duration::from_secs(30)).await;
        buffer.insert("b", Bytes::from_static(b"2"));
        assert!(buffer.expired_keys(Instant::now(), ttl).is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(buffer.expired_keys(Instant::now(), ttl), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_expired_spares_refreshed_entries() {
        let buffer = HotBuffer::new();
        let ttl = Duration::from_secs(10);
        buffer.insert("a", Bytes::from_static(b"old"));
        tokio::time::advance(Duration::from_secs(11)).await;
        let now = Instant::now();
        assert_eq!(buffer.expired_keys(now, ttl), vec!["a"]);

        buffer.insert("a", Bytes::from_static(b"new"));
        assert!(!buffer.remove_expired("a", Instant::now(), ttl));
        assert_eq!(buffer.get("a"), Some(Bytes::from_static(b"new")));
    }
}
