//! Per-Chat Operation State
//!
//! A keyed lease store marks "bot operation in progress" per chat. The
//! lease never blocks concurrent requests for the same chat; it only
//! flags the newcomer so a stale history entry is not written twice.
//! `ScheduleDedup` makes task scheduling idempotent per chat within a
//! short window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Token identifying one acquisition of a chat lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseToken(Uuid);

struct LeaseEntry {
    token: LeaseToken,
    acquired_at: Instant,
}

/// Keyed map from chat id to an in-progress lease with expiry.
///
/// Passed by handle into the request path; no ambient global state.
pub struct ChatLeaseStore {
    entries: Mutex<HashMap<i64, LeaseEntry>>,
    ttl: Duration,
}

impl ChatLeaseStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Acquire the lease for a chat.
    ///
    /// Returns the new token and whether a live lease was already held.
    /// An expired lease counts as not held. The new token always replaces
    /// the old entry: the latest request owns the chat.
    pub fn acquire(&self, chat_id: i64) -> (LeaseToken, bool) {
        let token = LeaseToken(Uuid::new_v4());
        let mut entries = self.entries.lock();

        let already_held = entries
            .get(&chat_id)
            .map(|e| e.acquired_at.elapsed() < self.ttl)
            .unwrap_or(false);

        entries.insert(
            chat_id,
            LeaseEntry {
                token,
                acquired_at: Instant::now(),
            },
        );

        if already_held {
            debug!("Chat {} already had a live lease, superseding", chat_id);
        }
        (token, already_held)
    }

    /// Release the lease if `token` still owns it; a superseded token is a
    /// no-op
    pub fn release(&self, chat_id: i64, token: LeaseToken) {
        let mut entries = self.entries.lock();
        if entries.get(&chat_id).map(|e| e.token) == Some(token) {
            entries.remove(&chat_id);
        }
    }

    /// Whether a live lease exists for a chat
    pub fn is_held(&self, chat_id: i64) -> bool {
        self.entries
            .lock()
            .get(&chat_id)
            .map(|e| e.acquired_at.elapsed() < self.ttl)
            .unwrap_or(false)
    }
}

/// TTL cache deduplicating idempotent scheduling calls per chat
pub struct ScheduleDedup {
    seen: Cache<String, ()>,
}

impl ScheduleDedup {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Returns true the first time a (chat, command) pair is seen within
    /// the window; false for the duplicate
    pub fn first_seen(&self, chat_id: i64, command: &str) -> bool {
        let key = format!("{}:{}", chat_id, command);
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, ());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let store = ChatLeaseStore::new(Duration::from_secs(60));

        let (token, held) = store.acquire(1);
        assert!(!held);
        assert!(store.is_held(1));

        store.release(1, token);
        assert!(!store.is_held(1));
    }

    #[test]
    fn test_reacquire_marks_but_does_not_block() {
        let store = ChatLeaseStore::new(Duration::from_secs(60));

        let (_first, held) = store.acquire(1);
        assert!(!held);

        // A new request for the same chat proceeds anyhow.
        let (second, held) = store.acquire(1);
        assert!(held);

        store.release(1, second);
        assert!(!store.is_held(1));
    }

    #[test]
    fn test_superseded_release_is_noop() {
        let store = ChatLeaseStore::new(Duration::from_secs(60));

        let (first, _) = store.acquire(1);
        let (_second, _) = store.acquire(1);

        // The first request finishing must not clear the second's lease.
        store.release(1, first);
        assert!(store.is_held(1));
    }

    #[test]
    fn test_expired_lease_not_held() {
        let store = ChatLeaseStore::new(Duration::from_millis(10));
        let (_token, _) = store.acquire(1);
        std::thread::sleep(Duration::from_millis(20));

        assert!(!store.is_held(1));
        let (_token, held) = store.acquire(1);
        assert!(!held);
    }

    #[test]
    fn test_chats_are_independent() {
        let store = ChatLeaseStore::new(Duration::from_secs(60));
        store.acquire(1);
        assert!(!store.is_held(2));
    }

    #[test]
    fn test_schedule_dedup() {
        let dedup = ScheduleDedup::new(Duration::from_secs(60));

        assert!(dedup.first_seen(1, "daily summary"));
        assert!(!dedup.first_seen(1, "daily summary"));
        // Different chat or command is not a duplicate.
        assert!(dedup.first_seen(2, "daily summary"));
        assert!(dedup.first_seen(1, "weather"));
    }
}
