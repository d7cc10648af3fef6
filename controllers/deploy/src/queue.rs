//! Deduplicating, rate-limited work queue of reconcile keys.
//!
//! Guarantees:
//! - a key is queued at most once, however many events arrive for it
//! - a key is handed to at most one worker at a time; adds that arrive while
//!   it is being processed are remembered and it is re-queued on `done`
//! - after `shut_down`, `get` hands out nothing more, even if keys remain
//!
//! Cloning a `WorkQueue` yields another handle to the same queue.

use crate::backoff::ItemExponentialBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug)]
struct State<K> {
    /// Keys ready to be handed out, in order
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while in flight)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    /// Consecutive failures per key
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

#[derive(Debug)]
struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ItemExponentialBackoff,
}

/// Work queue handle.
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create an empty queue using `backoff` for rate-limited re-adds.
    pub fn new(backoff: ItemExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    // No critical section can leave the state half-updated, so a poisoned
    // lock is still safe to use.
    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Re-queued by done()
            trace!(?key, "key is in flight, deferring");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Wake another waiter if more work is queued
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `key` finished. If it was re-added meanwhile, it
    /// goes back on the queue.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-add `key` after its per-key exponential backoff, and count the failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.backoff_for(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        trace!(?key, ?delay, "rate limited requeue");
        self.add_after(key, delay);
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether no key is waiting to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether `shut_down` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(ItemExponentialBackoff::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn queue() -> WorkQueue<String> {
        WorkQueue::default()
    }

    #[tokio::test]
    async fn test_duplicate_adds_coalesce() {
        let queue = queue();
        queue.add("shop/web".to_string());
        queue.add("shop/web".to_string());
        queue.add("shop/api".to_string());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("shop/web"));
        assert_eq!(queue.get().await.as_deref(), Some("shop/api"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_is_redelivered_after_done() {
        let queue = queue();
        queue.add("shop/web".to_string());
        let key = queue.get().await.unwrap();

        // Same key arrives twice while in flight: not handed out concurrently
        queue.add(key.clone());
        queue.add(key.clone());
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key.clone()));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add("shop/web".to_string());

        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("shop/web"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters_and_stops_dequeue() {
        let queue = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        queue.shut_down();
        for waiter in waiters {
            let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert!(got.is_none());
        }

        // Nothing is accepted or handed out after shutdown
        queue.add("shop/web".to_string());
        assert!(queue.is_empty());
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_with_queued_keys_hands_out_nothing() {
        let queue = queue();
        queue.add("shop/web".to_string());
        queue.shut_down();
        assert!(queue.get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeue_and_forget() {
        let queue = WorkQueue::new(ItemExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
        ));
        let key = "shop/web".to_string();

        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 2);
        assert!(queue.is_empty());

        // First delayed add lands after 100ms and coalesces with the second
        let got = timeout(Duration::from_millis(150), queue.get()).await.unwrap();
        assert_eq!(got, Some(key.clone()));
        queue.done(&key);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_go_to_distinct_workers() {
        let queue = queue();
        queue.add("shop/web".to_string());
        queue.add("shop/api".to_string());

        let first = queue.get().await.unwrap();
        let second = queue.get().await.unwrap();
        assert_ne!(first, second);
    }
}
