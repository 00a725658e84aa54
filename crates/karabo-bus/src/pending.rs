//! Pending Reply Store - correlation of requests and their replies.
//!
//! Maps reply ids to the promise of a waiting `request`.
//!
//! Flow:
//! 1. The requestor calls `register()` and gets a reply id plus a receiver
//! 2. The request goes out with the reply id in its header
//! 3. The dispatcher receives `__reply__` and calls `complete()`
//! 4. The requestor awaits the receiver or times out and calls `remove()`
//!
//! A reply id is completed at most once; later replies for it, and replies
//! for ids never registered, are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use karabo_data::{Hash, Result};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// A request waiting for its reply.
struct PendingReply {
    sender: oneshot::Sender<Result<Hash>>,
    created_at: Instant,
    /// Slot name (for logging)
    slot: String,
    timeout: Duration,
}

/// Counters of the store.
#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_registered: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_timeouts: AtomicU64,
    /// Replies whose requestor had already gone away.
    pub total_cancelled: AtomicU64,
    /// Replies for unknown or already completed ids.
    pub total_dropped: AtomicU64,
}

pub struct PendingReplies {
    pending: DashMap<String, PendingReply>,
    stats: PendingStats,
}

impl Default for PendingReplies {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingReplies {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            stats: PendingStats::default(),
        }
    }

    /// Register a pending request; returns its reply id and the receiver of
    /// the reply.
    pub fn register(&self, slot: &str, timeout: Duration) -> (String, oneshot::Receiver<Result<Hash>>) {
        let reply_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            reply_id.clone(),
            PendingReply {
                sender: tx,
                created_at: Instant::now(),
                slot: slot.to_string(),
                timeout,
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        debug!(reply_id = %reply_id, slot = slot, "Registered pending reply");
        (reply_id, rx)
    }

    /// Complete a pending request. Returns false for unknown ids.
    pub fn complete(&self, reply_id: &str, result: Result<Hash>) -> bool {
        let Some((_, pending)) = self.pending.remove(reply_id) else {
            self.stats.total_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(reply_id = %reply_id, "Reply for unknown or expired reply id");
            return false;
        };
        let elapsed = pending.created_at.elapsed();
        if pending.sender.send(result).is_ok() {
            self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
            debug!(
                reply_id = %reply_id,
                slot = pending.slot,
                response_time_ms = elapsed.as_millis(),
                "Completed pending reply"
            );
            true
        } else {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(reply_id = %reply_id, slot = pending.slot, "Requestor went away before the reply");
            false
        }
    }

    /// Evict a request whose requestor gave up (timeout). Returns whether
    /// it was still pending.
    pub fn remove(&self, reply_id: &str) -> bool {
        let removed = self.pending.remove(reply_id).is_some();
        if removed {
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop requests older than their timeout. Returns how many went.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.pending.retain(|id, request| {
            let elapsed = now.duration_since(request.created_at);
            if elapsed > request.timeout {
                warn!(
                    reply_id = %id,
                    slot = request.slot,
                    elapsed_ms = elapsed.as_millis(),
                    "Removing expired pending reply"
                );
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, reply_id: &str) -> bool {
        self.pending.contains_key(reply_id)
    }

    #[must_use]
    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karabo_data::KaraboError;

    #[tokio::test]
    async fn test_register_and_complete() {
        let store = PendingReplies::new();
        let (id, rx) = store.register("slotFoo", Duration::from_secs(1));
        assert!(store.is_pending(&id));
        assert!(store.complete(&id, Ok(Hash::new().with("a1", 5i32))));
        assert_eq!(rx.await.unwrap().unwrap().get::<i32>("a1").unwrap(), 5);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_delivered_at_most_once() {
        let store = PendingReplies::new();
        let (id, rx) = store.register("slotFoo", Duration::from_secs(1));
        assert!(store.complete(&id, Err(KaraboError::Fatal("boom".into()))));
        assert!(!store.complete(&id, Ok(Hash::new())));
        assert!(rx.await.unwrap().is_err());
        assert!(!store.complete("never-registered", Ok(Hash::new())));
        assert_eq!(store.stats().total_dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_expiry() {
        let store = PendingReplies::new();
        let (_id, _rx) = store.register("slotFoo", Duration::ZERO);
        let (keep, _rx2) = store.register("slotBar", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.remove_expired(), 1);
        assert!(store.is_pending(&keep));
        assert!(store.remove(&keep));
        assert!(!store.remove(&keep));
    }
}
