//! Deduplicating, per-key serialized work queue
//!
//! A key is in at most one of three places at a time: ready (waiting for a
//! worker), processing (held by exactly one worker), or nowhere. Adding a key
//! that is already ready is a no-op; adding a key that is being processed
//! marks it dirty, and [`WorkQueue::done`] puts it back once the worker lets
//! go. Two workers therefore never reconcile the same key concurrently.
//!
//! Delayed adds and rate-limited retries park keys until their deadline;
//! each key's retry history lives in a [`BackoffTicket`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::retry::RetryConfig;

/// Retry bookkeeping for one key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffTicket {
    /// Rate-limited requeues since the key last succeeded
    pub attempts: u32,
    /// Earliest time the key may be processed again
    pub next_eligible: Instant,
}

struct QueueState<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    delayed: HashMap<K, Instant>,
    tickets: HashMap<K, BackoffTicket>,
    shutdown: bool,
}

impl<K: Clone + Eq + Hash> QueueState<K> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            processing: HashSet::new(),
            dirty: HashSet::new(),
            delayed: HashMap::new(),
            tickets: HashMap::new(),
            shutdown: false,
        }
    }

    /// Returns true when the key became ready
    fn push(&mut self, key: K) -> bool {
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) -> bool {
        let due: Vec<K> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut promoted = false;
        for key in due {
            self.delayed.remove(&key);
            promoted |= self.push(key);
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }
}

/// Work queue shared by the event pump, the resync ticker and the workers
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    retry: RetryConfig,
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    /// Create a queue whose rate-limited adds follow `retry`
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            retry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        // Every critical section leaves the sets consistent; poisoning is ignored
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `key` ready now
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        state.delayed.remove(&key);
        if state.push(key) {
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Make `key` ready after `delay`; an earlier pending deadline wins
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut state = self.lock();
        if state.shutdown || state.queued.contains(&key) {
            return;
        }
        let at = Instant::now() + delay;
        state
            .delayed
            .entry(key)
            .and_modify(|existing| *existing = (*existing).min(at))
            .or_insert(at);
        drop(state);
        // Idle workers recompute how long to sleep
        self.notify.notify_one();
    }

    /// Requeue `key` after its next backoff delay and return that delay
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut state = self.lock();
            let now = Instant::now();
            let ticket = state.tickets.entry(key.clone()).or_insert(BackoffTicket {
                attempts: 0,
                next_eligible: now,
            });
            let delay = self.retry.delay_for(ticket.attempts);
            ticket.attempts += 1;
            ticket.next_eligible = now + delay;
            delay
        };
        self.add_after(key, delay);
        delay
    }

    /// Clear the retry history of `key`
    pub fn forget(&self, key: &K) {
        self.lock().tickets.remove(key);
    }

    /// Rate-limited requeues of `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock()
            .tickets
            .get(key)
            .map(|t| t.attempts)
            .unwrap_or(0)
    }

    /// Current backoff ticket of `key`, if it has one
    pub fn ticket(&self, key: &K) -> Option<BackoffTicket> {
        self.lock().tickets.get(key).copied()
    }

    /// Wait for the next ready key and mark it processing.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let deadline = {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.ready.is_empty() || !state.delayed.is_empty();
                    drop(state);
                    if more {
                        // Pass the baton so another idle worker re-checks
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Release `key`; a key re-added while processing becomes ready again
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.push(key.clone()) {
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys; waiting and future `get` calls return `None`
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether [`WorkQueue::shutdown`] was called
    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Keys ready to be handed out
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Whether no key is ready
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(RetryConfig::exponential(
            5,
            Duration::from_millis(500),
            Duration::from_secs(4),
        ))
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
    }

    #[tokio::test]
    async fn key_in_processing_is_not_handed_out_again() {
        let q = queue();
        q.add("a");
        assert_eq!(q.get().await, Some("a"));

        q.add("a");
        assert!(q.is_empty(), "dirty key must wait for done");

        q.done(&"a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test]
    async fn done_without_readd_leaves_queue_empty() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_key_becomes_ready_after_its_deadline() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(5));
        assert!(q.is_empty());

        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_add_supersedes_delay() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(60));
        q.add("a");
        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_delays_grow_until_forgotten() {
        let q = queue();
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(500));
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(1));
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(2));
        assert_eq!(q.num_requeues(&"a"), 3);
        assert_eq!(q.ticket(&"a").unwrap().attempts, 3);

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_waiting_workers() {
        let q = Arc::new(queue());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn concurrent_workers_never_share_a_key() {
        let q = Arc::new(queue());
        for key in ["a", "b", "c"] {
            q.add(key);
        }

        let first = q.get().await.unwrap();
        let second = q.get().await.unwrap();
        let third = q.get().await.unwrap();
        let mut seen = vec![first, second, third];
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);

        // Re-adding held keys only marks them dirty
        q.add(first);
        q.add(second);
        assert!(q.is_empty());
    }
}
