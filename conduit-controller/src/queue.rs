//! Rate-limited work queue
//!
//! Keys are `<namespace>/<name>` strings. The queue guarantees that:
//! - a key waiting in the queue is only queued once
//! - a key is never handed to two workers at the same time
//! - a key added while it is being processed is queued again once `done` is called
//!
//! Failing keys are re-added after an exponential, per-key backoff until `forget`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys that need processing, queued or deferred behind an in-flight run
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

/// Deduplicating work queue shared by the informers and the workers of a controller
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Creates a queue retrying failed keys after `backoff_base * 2^failures`,
    /// capped at `backoff_max`
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                backoff_base,
                backoff_max,
            }),
        }
    }

    /// Marks a key as needing processing
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and empty.
    ///
    /// Every key returned must be passed to `done`.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks a key as processed, queueing it again if it was added meanwhile
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Adds a key after its current backoff delay
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let delay = backoff_delay(self.inner.backoff_base, self.inner.backoff_max, *failures);
            *failures = failures.saturating_add(1);
            delay
        };

        debug!(%key, ?delay, "requeueing with backoff");
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Clears the retry state of a key
    pub fn forget(&self, key: &str) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Number of consecutive failures recorded for a key
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be picked up
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting keys and wakes every waiting worker
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

/// Delay before the retry following `failures` previous failures
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    2u32.checked_pow(failures)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue {
        WorkQueue::new(Duration::from_millis(5), Duration::from_secs(1000))
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(5));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(40));
        assert_eq!(backoff_delay(base, max, 20), max);
        assert_eq!(backoff_delay(base, max, 64), max);
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = queue();
        queue.add("ns/a");
        queue.add("ns/a");
        queue.add("ns/b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_is_deferred() {
        let queue = queue();
        queue.add("ns/a");
        let key = queue.get().await.unwrap();

        queue.add("ns/a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_key() {
        let queue = queue();
        queue.add("ns/a");
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shut_down_wakes_waiting_workers() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("ns/a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_wakes_on_add() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.add("ns/a");
        assert_eq!(waiter.await.unwrap().as_deref(), Some("ns/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeue() {
        let queue = queue();
        queue.add_rate_limited("ns/a");
        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues("ns/a"), 1);

        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        queue.done("ns/a");

        queue.add_rate_limited("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 2);

        queue.forget("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 0);
    }
}
