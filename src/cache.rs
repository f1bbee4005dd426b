//! # Seen Set
//!
//! Bounded record of message fingerprints a topic has already handled. A
//! fingerprint is recorded *before* the message is forwarded, so a copy that
//! loops back through the mesh is recognised and dropped.
//!
//! ## Eviction
//!
//! - **Capacity**: when full, inserting evicts the oldest fingerprint (FIFO)
//! - **Age**: fingerprints older than the TTL are dropped on the next access
//!
//! Lookups never refresh an entry, so the underlying LRU order is exactly
//! insertion order.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::messages::MessageId;

/// Default number of fingerprints remembered per topic.
pub const DEFAULT_SEEN_CAPACITY: usize = 2048;

/// Default lifetime of a fingerprint.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub struct SeenSet {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenSet {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn has_seen(&mut self, id: &MessageId) -> bool {
        self.expire_old();
        self.entries.contains(id)
    }

    /// Record `id`. Returns `false` if it was already present; the original
    /// insertion time is kept in that case.
    pub fn mark_seen(&mut self, id: MessageId) -> bool {
        self.expire_old();
        if self.entries.contains(&id) {
            return false;
        }
        self.entries.push(id, Instant::now());
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Fingerprints currently held, oldest first.
    pub fn snapshot(&self) -> Vec<MessageId> {
        self.entries.iter().rev().map(|(id, _)| *id).collect()
    }

    fn expire_old(&mut self) {
        let now = Instant::now();
        while let Some((_, inserted)) = self.entries.peek_lru() {
            if now.duration_since(*inserted) >= self.ttl {
                self.entries.pop_lru();
            } else {
                break; // insertion-ordered, nothing younger can be expired
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> MessageId {
        *blake3::hash(&n.to_be_bytes()).as_bytes()
    }

    #[test]
    fn mark_is_idempotent() {
        let mut seen = SeenSet::new(8, DEFAULT_SEEN_TTL);
        assert!(seen.mark_seen(id(1)));
        assert!(!seen.mark_seen(id(1)));
        assert_eq!(seen.len(), 1);
        assert!(seen.has_seen(&id(1)));
        assert!(!seen.has_seen(&id(2)));
    }

    #[test]
    fn full_set_evicts_oldest_first() {
        let mut seen = SeenSet::new(3, DEFAULT_SEEN_TTL);
        for n in 0..3 {
            seen.mark_seen(id(n));
        }
        // Looking up the oldest entry must not save it from eviction.
        assert!(seen.has_seen(&id(0)));

        seen.mark_seen(id(3));
        assert!(!seen.has_seen(&id(0)));
        assert!(seen.has_seen(&id(1)));
        assert!(seen.has_seen(&id(3)));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn duplicate_mark_does_not_refresh_position() {
        let mut seen = SeenSet::new(2, DEFAULT_SEEN_TTL);
        seen.mark_seen(id(0));
        seen.mark_seen(id(1));
        seen.mark_seen(id(0));
        seen.mark_seen(id(2));
        assert!(!seen.has_seen(&id(0)));
        assert!(seen.has_seen(&id(1)));
    }

    #[test]
    fn ten_thousand_inserts_keep_latest_hundred() {
        let mut seen = SeenSet::new(100, DEFAULT_SEEN_TTL);
        for n in 0..10_000 {
            seen.mark_seen(id(n));
        }

        assert_eq!(seen.len(), 100);
        let expected: Vec<MessageId> = (9_900..10_000).map(id).collect();
        assert_eq!(seen.snapshot(), expected);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut seen = SeenSet::new(16, Duration::from_millis(20));
        seen.mark_seen(id(1));
        assert!(seen.has_seen(&id(1)));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!seen.has_seen(&id(1)));
        assert!(seen.is_empty());
        assert!(seen.mark_seen(id(1)));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut seen = SeenSet::new(0, DEFAULT_SEEN_TTL);
        assert_eq!(seen.capacity(), 1);
        seen.mark_seen(id(1));
        seen.mark_seen(id(2));
        assert_eq!(seen.snapshot(), vec![id(2)]);
    }
}
