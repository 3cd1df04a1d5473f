//! Deduplicating work queue of job names
//!
//! A key is held at most once in the queue and is never handed to two
//! workers at the same time: a key added while it is being processed is
//! marked dirty and re-queued when the worker calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, queued or not
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl WorkQueue {
    /// Creates a queue whose rate limiter backs off from `base_delay` to
    /// `max_delay`
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    pub fn add(&self, key: &str) {
        {
            let mut state = self.lock();
            if state.shutting_down || !state.dirty.insert(key.to_string()) {
                return;
            }
            if state.processing.contains(key) {
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.notify.notify_one();
    }

    /// Adds `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Adds `key` after a delay that doubles with every consecutive failure
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let failures = {
            let mut state = self.lock();
            let count = state.failures.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.backoff(failures);
        debug!("Requeue {} after {:?} (failure {})", key, delay, failures);
        self.add_after(key, delay);
    }

    /// Resets the failure count of `key`
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Waits for the next key; `None` once the queue is shut down
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as processed, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stops handing out keys and wakes every waiting worker
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue> {
        Arc::new(WorkQueue::new(
            Duration::from_millis(10),
            Duration::from_millis(80),
        ))
    }

    #[tokio::test]
    async fn test_duplicate_adds_are_collapsed() {
        let queue = queue();
        queue.add("job-a");
        queue.add("job-a");
        queue.add("job-b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.next().await.as_deref(), Some("job-a"));
        assert_eq!(queue.next().await.as_deref(), Some("job-b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_requeued_on_done() {
        let queue = queue();
        queue.add("job-a");
        let key = queue.next().await.unwrap();

        // Not handed to a second worker while in flight
        queue.add("job-a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await.as_deref(), Some("job-a"));
        queue.done("job-a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_next_waits_for_add() {
        let queue = queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add("job-a");
        assert_eq!(waiter.await.unwrap().as_deref(), Some("job-a"));
    }

    #[tokio::test]
    async fn test_add_after_delays_the_key() {
        let queue = queue();
        queue.add_after("job-a", Duration::from_millis(30));
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let queue = queue();
        assert_eq!(queue.backoff(1), Duration::from_millis(10));
        assert_eq!(queue.backoff(2), Duration::from_millis(20));
        assert_eq!(queue.backoff(4), Duration::from_millis(80));
        assert_eq!(queue.backoff(40), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_forget_resets_failures() {
        let queue = queue();
        queue.add_rate_limited("job-a");
        queue.add_rate_limited("job-a");
        assert_eq!(queue.lock().failures.get("job-a"), Some(&2));
        queue.forget("job-a");
        assert!(queue.lock().failures.get("job-a").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("job-a");
        assert!(queue.is_empty());
    }
}
