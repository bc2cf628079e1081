//! Rate-limited retrying work queue. Decouples event arrival from
//! reconciliation: producers add keys, a pool of workers takes them one at
//! a time. A key is never handed to two workers at once; a key touched
//! while being processed is re-queued when the worker calls `done`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::Notify;
use tokio::time::sleep;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::with_rate_limit(BASE_DELAY, MAX_DELAY)
    }

    pub fn with_rate_limit(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Adds a key. Keys already waiting or being processed are not
    /// duplicated; a key added while processing is re-queued on `done`.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Blocks until a key is available or the queue shuts down (`None`).
    /// The caller must call `done` with the key when finished.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // wake another worker for the remaining items
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    // cascade so every other blocked getter wakes too
                    self.notify.notify_one();
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks a key no longer being processed, re-queuing it if it was
    /// touched in the meantime.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-adds a key after an exponentially growing per-key delay
    /// (`base * 2^(failures-1)`, capped).
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            let exp = (*failures - 1).min(63);
            self.base_delay
                .saturating_mul(2u32.saturating_pow(exp))
                .min(self.max_delay)
        };

        debug!("requeuing {key} in {delay:?}");
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Clears the failure history of a key after a successful run.
    pub fn forget(&self, key: &str) {
        self.state.lock().unwrap().failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new keys and unblocks every waiting `get`. Keys
    /// already handed to workers finish normally.
    pub fn shut_down(&self) {
        self.state.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
        // notify_waiters misses a getter that has not registered yet; the
        // permit stored by notify_one covers it
        self.notify.notify_one();
    }
}
