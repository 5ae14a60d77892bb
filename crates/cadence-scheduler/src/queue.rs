use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use cadence_core::{config::BackoffConfig, ObjectKey};
use tokio::{sync::Notify, time::Instant};

/// Upper bound on a delayed add; longer delays are clamped to it.
const MAX_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Deduplicating work queue of schedule keys.
///
/// A key is never handed to two workers at once: adding a key that is being
/// processed marks it dirty, and it is queued again when the worker calls
/// [`WorkQueue::done`].
///
/// Delayed adds share one timer task; each key keeps only its earliest
/// pending deadline.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    timer: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    /// Keys that need a pass (queued, or waiting for their current pass).
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    /// Earliest pending deadline of each delayed key.
    waiting: HashMap<ObjectKey, Instant>,
    timer_running: bool,
    shutting_down: bool,
}

impl WorkQueue {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            timer: Notify::new(),
            base_delay,
            max_delay,
        })
    }

    pub fn from_config(config: &BackoffConfig) -> Arc<Self> {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_secs(config.max_delay_secs),
        )
    }

    pub fn add(&self, key: ObjectKey) {
        {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down || !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay.min(MAX_WAIT);
        let start_timer = {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            state
                .waiting
                .entry(key)
                .and_modify(|at| *at = (*at).min(deadline))
                .or_insert(deadline);
            !std::mem::replace(&mut state.timer_running, true)
        };
        if start_timer {
            tokio::spawn(Arc::clone(self).run_timer());
        } else {
            self.timer.notify_one();
        }
    }

    /// Move due keys onto the queue until nothing is waiting or the queue
    /// shuts down.
    async fn run_timer(self: Arc<Self>) {
        loop {
            let notified = self.timer.notified();
            let (due, next) = {
                let mut state = self.state.lock().unwrap();
                if state.shutting_down {
                    state.timer_running = false;
                    return;
                }
                let now = Instant::now();
                let due: Vec<ObjectKey> = state
                    .waiting
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &due {
                    state.waiting.remove(key);
                }
                let next = state.waiting.values().min().copied();
                if next.is_none() {
                    state.timer_running = false;
                }
                (due, next)
            };
            for key in due {
                self.add(key);
            }
            let Some(next) = next else {
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = notified => {}
            }
        }
    }

    /// Add `key` after its exponential backoff delay and count the failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) -> Duration {
        let delay = {
            let mut state = self.state.lock().unwrap();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
        delay
    }

    /// Clear the failure count of `key` after a successful pass.
    pub fn forget(&self, key: &ObjectKey) {
        self.state.lock().unwrap().failures.remove(key);
    }

    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.state
            .lock()
            .unwrap()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// `base * 2^failures`, capped at the maximum delay.
    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark the pass for `key` finished, requeueing it if it was added meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let requeued = {
            let mut state = self.state.lock().unwrap();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.notify.notify_waiters();
        self.timer.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys waiting on a delayed add.
    pub fn delayed(&self) -> usize {
        self.state.lock().unwrap().waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(Duration::from_millis(5), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add(key("a"));
        q.add(key("a"));
        q.add(key("b"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(key("a")));
        assert_eq!(q.get().await, Some(key("b")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let q = queue();
        q.add(key("a"));
        let first = q.get().await.unwrap();

        // re-added while processing: held back until done
        q.add(key("a"));
        assert!(q.is_empty());

        q.done(&first);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(key("a")));
        q.done(&key("a"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shut_down_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        q.add(key("late"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn backoff_grows_and_resets() {
        let q = queue();
        assert_eq!(q.add_rate_limited(key("a")), Duration::from_millis(5));
        assert_eq!(q.add_rate_limited(key("a")), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited(key("a")), Duration::from_millis(20));
        assert_eq!(q.failures(&key("a")), 3);

        q.forget(&key("a"));
        assert_eq!(q.failures(&key("a")), 0);
        assert_eq!(q.add_rate_limited(key("a")), Duration::from_millis(5));
    }

    #[test]
    fn backoff_is_capped() {
        let q = queue();
        assert_eq!(q.backoff(40), Duration::from_secs(1));
        assert_eq!(q.backoff(31), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn delayed_add_arrives() {
        let q = queue();
        q.add_after(key("later"), Duration::from_millis(10));
        assert!(q.is_empty());
        let got = tokio::time::timeout(Duration::from_secs(2), q.get()).await.unwrap();
        assert_eq!(got, Some(key("later")));
    }

    #[tokio::test]
    async fn repeated_delays_keep_one_deadline_per_key() {
        let q = queue();
        q.add_after(key("a"), Duration::from_secs(60));
        q.add_after(key("a"), Duration::from_secs(90));
        q.add_after(key("a"), Duration::from_secs(30));
        q.add_after(key("b"), Duration::from_secs(60));
        assert_eq!(q.delayed(), 2);

        // the earliest deadline wins
        q.add_after(key("a"), Duration::from_millis(10));
        assert_eq!(q.delayed(), 2);
        let got = tokio::time::timeout(Duration::from_secs(2), q.get()).await.unwrap();
        assert_eq!(got, Some(key("a")));
        assert_eq!(q.delayed(), 1);
    }

    #[tokio::test]
    async fn shut_down_drops_pending_delays() {
        let q = queue();
        q.add_after(key("a"), Duration::from_secs(60));
        q.add_rate_limited(key("b"));
        q.shut_down();
        assert_eq!(q.delayed(), 0);

        q.add_after(key("late"), Duration::from_millis(1));
        assert_eq!(q.delayed(), 0);
    }
}
