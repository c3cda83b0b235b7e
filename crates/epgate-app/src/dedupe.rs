//! msgId dedup cache: EP may redeliver the same inbound message on retry;
//! drop repeats seen within the last 10 minutes.

use std::time::{Duration, Instant};

use dashmap::DashMap;

const TTL: Duration = Duration::from_secs(600);

pub struct DedupeCache {
    seen: DashMap<String, Instant>,
}

impl DedupeCache {
    pub fn new() -> Self {
        Self { seen: DashMap::new() }
    }

    /// Returns `true` if `msg_id` was already seen within the TTL window,
    /// recording it either way.
    pub fn seen_recently(&self, msg_id: &str) -> bool {
        let now = Instant::now();
        if let Some(prev) = self.seen.get(msg_id) {
            if now.duration_since(*prev) < TTL {
                return true;
            }
        }
        self.seen.insert(msg_id.to_string(), now);
        false
    }

    /// Drops entries older than the TTL; call on a background interval.
    pub fn prune(&self) {
        let now = Instant::now();
        self.seen.retain(|_, ts| now.duration_since(*ts) < TTL);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_not_a_repeat() {
        let cache = DedupeCache::new();
        assert!(!cache.seen_recently("msg-1"));
    }

    #[test]
    fn repeat_within_ttl_is_flagged() {
        let cache = DedupeCache::new();
        assert!(!cache.seen_recently("msg-1"));
        assert!(cache.seen_recently("msg-1"));
    }

    #[test]
    fn distinct_ids_do_not_collide() {
        let cache = DedupeCache::new();
        assert!(!cache.seen_recently("a"));
        assert!(!cache.seen_recently("b"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn prune_removes_stale_entries_only() {
        let cache = DedupeCache::new();
        cache.seen.insert("old".to_string(), Instant::now() - Duration::from_secs(601));
        cache.seen.insert("fresh".to_string(), Instant::now());
        cache.prune();
        assert!(!cache.seen.contains_key("old"));
        assert!(cache.seen.contains_key("fresh"));
    }
}
