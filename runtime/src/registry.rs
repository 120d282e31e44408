//! Correlation registry.
//!
//! Maps the correlation key of every outstanding request to the one-shot slot
//! its caller is waiting on. The dispatcher registers an entry per request and
//! the response consumer fulfills it; entries for unrelated requests never
//! contend on a shared lock.
//!
//! An entry lives exactly as long as its [`PendingRequest`]: dropping the
//! pending request (after a reply, a timeout, or a failed publish) removes the
//! entry, so a reply arriving later finds nothing and is discarded.

use dashmap::DashMap;
use shardlink_core::response::ResponseOutcome;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Outstanding requests keyed by correlation key.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    pending: DashMap<String, oneshot::Sender<ResponseOutcome>>,
    counter: AtomicU64,
}

impl CorrelationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request under a fresh correlation key (`req-<n>`).
    ///
    /// Keys come from a strictly increasing counter and are never reused for
    /// the lifetime of the registry.
    #[must_use]
    pub fn register(self: &Arc<Self>) -> PendingRequest {
        let key = format!("req-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(key.clone(), sender);

        PendingRequest {
            key,
            receiver,
            registry: Arc::clone(self),
        }
    }

    /// Deliver `outcome` to the request registered under `key`.
    ///
    /// Returns `false` if no such request is waiting, which happens when the
    /// reply arrives after the request timed out.
    pub fn fulfill(&self, key: &str, outcome: ResponseOutcome) -> bool {
        match self.pending.remove(key) {
            Some((_, sender)) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Whether a request is waiting under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of requests currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A registered request awaiting its reply.
///
/// Removes its registry entry when dropped.
#[derive(Debug)]
pub struct PendingRequest {
    key: String,
    receiver: oneshot::Receiver<ResponseOutcome>,
    registry: Arc<CorrelationRegistry>,
}

impl PendingRequest {
    /// The correlation key to publish the request with.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait up to `timeout` for the reply.
    ///
    /// Returns `None` if nothing arrived in time. Either way the registry
    /// entry is gone once this returns.
    pub async fn wait(mut self, timeout: Duration) -> Option<ResponseOutcome> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.registry.pending.remove(&self.key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_sequential_and_unique() {
        let registry = Arc::new(CorrelationRegistry::new());
        let first = registry.register();
        let second = registry.register();

        assert_eq!(first.key(), "req-1");
        assert_eq!(second.key(), "req-2");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn fulfilled_request_receives_outcome() {
        let registry = Arc::new(CorrelationRegistry::new());
        let pending = registry.register();
        let key = pending.key().to_string();

        assert!(registry.fulfill(&key, ResponseOutcome::NotFound));
        assert_eq!(
            pending.wait(Duration::from_secs(1)).await,
            Some(ResponseOutcome::NotFound)
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn timed_out_request_is_removed() {
        let registry = Arc::new(CorrelationRegistry::new());
        let pending = registry.register();
        let key = pending.key().to_string();

        assert_eq!(pending.wait(Duration::from_millis(10)).await, None);
        assert!(!registry.contains(&key));
        assert!(!registry.fulfill(&key, ResponseOutcome::Success("late".to_string())));
    }

    #[test]
    fn dropping_the_request_removes_the_entry() {
        let registry = Arc::new(CorrelationRegistry::new());
        let pending = registry.register();
        let key = pending.key().to_string();
        drop(pending);
        assert!(!registry.contains(&key));
    }

    #[test]
    fn second_fulfill_is_ignored() {
        let registry = Arc::new(CorrelationRegistry::new());
        let pending = registry.register();
        let key = pending.key().to_string();

        assert!(registry.fulfill(&key, ResponseOutcome::NotFound));
        assert!(!registry.fulfill(&key, ResponseOutcome::NotFound));
    }

    #[tokio::test]
    async fn concurrent_registrations_never_collide() {
        let registry = Arc::new(CorrelationRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                (0..100).map(|_| registry.register()).collect::<Vec<_>>()
            }));
        }

        let mut keys = HashSet::new();
        let mut held = Vec::new();
        for task in tasks {
            for pending in task.await.unwrap() {
                assert!(keys.insert(pending.key().to_string()));
                held.push(pending);
            }
        }
        assert_eq!(registry.len(), 800);
    }
}
