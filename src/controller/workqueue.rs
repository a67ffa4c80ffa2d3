//! Deduplicating work queue
//!
//! A key is queued at most once and is never handed to two workers at the
//! same time. Adds for a key that is being processed are remembered and the
//! key is queued again once the worker calls [`WorkQueue::done`]. Failed keys
//! are requeued with per-key exponential delay.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct QueueState<K> {
    /// Keys ready for a worker, in arrival order
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while in flight)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        })
    }

    /// Mark a key for processing
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Add a key once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Requeue a failed key with exponential delay; returns the delay used
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let failures = {
            let mut state = self.state.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let delay = self.backoff_delay(failures);
        self.add_after(key, delay);
        delay
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Clear a key's failure history
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key; `None` once the queue shuts down
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
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

    /// Release a key taken with [`get`](Self::get)
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue() -> Arc<WorkQueue<String>> {
        WorkQueue::new(Duration::from_millis(10), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_deduplicates_queued_keys() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[test]
    fn test_get_parks_until_a_key_arrives() {
        let q = queue();
        let mut get = tokio_test::task::spawn(q.get());
        tokio_test::assert_pending!(get.poll());

        q.add("a".to_string());
        assert!(get.is_woken());
        let key = tokio_test::assert_ready!(get.poll());
        assert_eq!(key.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_in_flight_key_is_redispatched_once() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();

        q.add("a".to_string());
        q.add("a".to_string());
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_delay_grows_and_caps() {
        let q = WorkQueue::<String>::new(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(q.add_rate_limited("a".into()), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited("a".into()), Duration::from_millis(20));
        assert_eq!(q.add_rate_limited("a".into()), Duration::from_millis(40));
        assert_eq!(q.add_rate_limited("a".into()), Duration::from_millis(50));
        assert_eq!(q.failures(&"a".to_string()), 4);

        q.forget(&"a".to_string());
        assert_eq!(q.failures(&"a".to_string()), 0);

        let key = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_workers() {
        let q = queue();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(worker.await.unwrap(), None);

        q.add("late".to_string());
        assert!(q.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burst_never_runs_key_concurrently() {
        let q = queue();
        let in_flight: Arc<HashMap<&'static str, AtomicUsize>> = Arc::new(
            ["a", "b", "c"]
                .into_iter()
                .map(|k| (k, AtomicUsize::new(0)))
                .collect(),
        );
        let overlaps = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..6 {
            let q = q.clone();
            let in_flight = in_flight.clone();
            let overlaps = overlaps.clone();
            let processed = processed.clone();
            workers.push(tokio::spawn(async move {
                while let Some(key) = q.get().await {
                    let counter = &in_flight[key.as_str()];
                    if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                    q.done(&key);
                }
            }));
        }

        for round in 0..200 {
            let key = ["a", "b", "c"][round % 3];
            q.add(key.to_string());
            if round % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        q.shutdown();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        // Bursts coalesce instead of queueing every add
        let done = processed.load(Ordering::SeqCst);
        assert!(done >= 3 && done < 200, "processed {}", done);
    }
}
