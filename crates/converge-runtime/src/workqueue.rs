//! Deduplicating, rate-limited work queue
//!
//! Keys flow through three places:
//!
//! ```text
//!   add ──▶ queued ──get──▶ processing ──done──▶ (gone)
//!             ▲                  │
//!             └──── dirty ◀──add─┘   (re-queued on done)
//!   add_after / add_rate_limited ──▶ delayed ──timer──▶ queued
//! ```
//!
//! A key is never queued twice and never handed to two workers at once.
//! Adds that arrive while the key is being processed collapse into a single
//! dirty marker, which is turned back into one queued item when the worker
//! calls [`WorkQueue::done`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::key::ResourceKey;
use crate::metrics;
use crate::retry::Backoff;

/// Longest delay `add_after` honours; longer ones are clamped.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Handle to a shared work queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<QueueState>,
    /// Wakes workers blocked in `get`.
    ready: Notify,
    /// Wakes the delay timer when the earliest deadline may have changed.
    timer: Arc<Notify>,
    backoff: Backoff,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ResourceKey>,
    queued: HashSet<ResourceKey>,
    processing: HashSet<ResourceKey>,
    dirty: HashSet<ResourceKey>,
    /// Delayed items ordered by deadline; the sequence number breaks ties.
    delayed: BTreeMap<(Instant, u64), ResourceKey>,
    deadlines: HashMap<ResourceKey, (Instant, u64)>,
    attempts: HashMap<ResourceKey, u32>,
    next_seq: u64,
    shutting_down: bool,
}

impl QueueState {
    /// Make `key` eligible for processing. Returns true if a worker should be woken.
    fn enqueue(&mut self, key: ResourceKey) -> bool {
        if self.shutting_down {
            return false;
        }
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
            true
        } else {
            false
        }
    }

    fn schedule(&mut self, key: ResourceKey, deadline: Instant) -> bool {
        if self.shutting_down {
            return false;
        }
        if let Some(&(existing, seq)) = self.deadlines.get(&key) {
            if existing <= deadline {
                return false;
            }
            self.delayed.remove(&(existing, seq));
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.delayed.insert((deadline, seq), key.clone());
        self.deadlines.insert(key, (deadline, seq));
        true
    }

    /// Move every delayed item due at `now` into the ready set.
    fn promote_due(&mut self, now: Instant) -> usize {
        let mut woken = 0;
        while self
            .delayed
            .first_key_value()
            .is_some_and(|(&(deadline, _), _)| deadline <= now)
        {
            if let Some((_, key)) = self.delayed.pop_first() {
                self.deadlines.remove(&key);
                if self.enqueue(key) {
                    woken += 1;
                }
            }
        }
        woken
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.first_key_value().map(|(&(deadline, _), _)| deadline)
    }
}

impl WorkQueue {
    /// Create a queue and start its delay timer.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime, since the delay timer is
    /// spawned as a background task.
    pub fn new(backoff: Backoff) -> Self {
        let timer = Arc::new(Notify::new());
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            timer: timer.clone(),
            backoff,
        });
        tokio::spawn(run_timer(Arc::downgrade(&inner), timer));
        Self { inner }
    }

    /// Queue `key` for immediate processing.
    pub fn add(&self, key: ResourceKey) {
        let (wake, depth) = {
            let mut state = self.inner.state.lock();
            let wake = state.enqueue(key);
            (wake, state.ready.len())
        };
        if wake {
            metrics::set_queue_depth(depth);
            self.inner.ready.notify_one();
        }
    }

    /// Queue `key` once `delay` has elapsed. If the key already waits for an
    /// earlier deadline, the earlier one is kept.
    pub fn add_after(&self, key: ResourceKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let delay = if delay > MAX_DELAY {
            warn!(
                key = %key,
                requested_secs = delay.as_secs(),
                max_secs = MAX_DELAY.as_secs(),
                "Requeue delay too long, clamping"
            );
            MAX_DELAY
        } else {
            delay
        };
        let deadline = Instant::now() + delay;
        let scheduled = self.inner.state.lock().schedule(key, deadline);
        if scheduled {
            self.inner.timer.notify_one();
        }
    }

    /// Queue `key` after its next backoff delay and return that delay.
    pub fn add_rate_limited(&self, key: ResourceKey) -> Duration {
        let attempt = {
            let mut state = self.inner.state.lock();
            let attempts = state.attempts.entry(key.clone()).or_insert(0);
            *attempts = attempts.saturating_add(1);
            *attempts
        };
        let delay = self.inner.backoff.delay(attempt);
        debug!(
            key = %key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry with exponential backoff"
        );
        metrics::record_retry();
        self.add_after(key, delay);
        delay
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The returned key is marked as processing until [`WorkQueue::done`].
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let remaining = state.ready.len();
                    drop(state);

                    metrics::set_queue_depth(remaining);
                    if remaining > 0 {
                        self.inner.ready.notify_one();
                    }
                    trace!(key = %key, "Dequeued key");
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark processing of `key` finished. A key that was added meanwhile is
    /// queued again exactly once.
    pub fn done(&self, key: &ResourceKey) {
        let wake = {
            let mut state = self.inner.state.lock();
            state.processing.remove(key);
            if state.dirty.remove(key) {
                state.enqueue(key.clone())
            } else {
                false
            }
        };
        if wake {
            self.inner.ready.notify_one();
        }
    }

    /// Reset the backoff attempt counter of `key`.
    pub fn forget(&self, key: &ResourceKey) {
        self.inner.state.lock().attempts.remove(key);
    }

    /// Number of rate-limited requeues since the last [`WorkQueue::forget`].
    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.inner
            .state
            .lock()
            .attempts
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of keys ready for a worker.
    pub fn len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys waiting on a delay.
    pub fn delayed_len(&self) -> usize {
        self.inner.state.lock().delayed.len()
    }

    /// Stop handing out work: pending and future `get` calls return `None`,
    /// further adds are ignored, and delayed items are discarded.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.delayed.clear();
            state.deadlines.clear();
        }
        debug!("Work queue shutting down");
        self.inner.ready.notify_waiters();
        self.inner.timer.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Let the timer task observe that the queue is gone.
        self.timer.notify_one();
    }
}

/// Promote delayed items as their deadlines pass.
///
/// Holds only a weak reference between wake-ups so the queue can be dropped.
async fn run_timer(inner: Weak<Inner>, wake: Arc<Notify>) {
    loop {
        let notified = wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            if state.shutting_down {
                return;
            }
            let woken = state.promote_due(Instant::now());
            let next = state.next_deadline();
            let depth = state.ready.len();
            drop(state);

            if woken > 0 {
                metrics::set_queue_depth(depth);
                for _ in 0..woken {
                    inner.ready.notify_one();
                }
            }
            next
        };

        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = &mut notified => {}
                }
            }
            None => notified.await,
        }
    }
}
