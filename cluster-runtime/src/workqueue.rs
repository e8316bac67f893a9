//! A deduplicating, rate limited queue of keys awaiting reconciliation
//!
//! Modelled on the client-go work queue: a key is either *pending* (waiting to be handed
//! out), *processing* (handed out by [`WorkQueue::get`] and not yet returned by
//! [`WorkQueue::done`]), or both, in which case it is handed out again once the current
//! holder is done. This guarantees that at most one worker handles a given key at a time.
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::{channel::mpsc, future::poll_fn, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tokio_util::{
    sync::CancellationToken,
    time::{delay_queue, DelayQueue},
};
use tracing::{debug, trace};

/// Backoff parameters for [`WorkQueue::add_rate_limited`]
///
/// The n-th consecutive failure of a key is retried after `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any retry delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

impl RetryPolicy {
    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(usize::MAX)
    }
}

/// Per-key exponential backoff
struct RateLimiter<K> {
    policy: RetryPolicy,
    failures: HashMap<K, (usize, ExponentialBackoff)>,
}

impl<K: Hash + Eq> RateLimiter<K> {
    fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
        }
    }

    /// Records a failure of `key` and returns how long to wait before retrying it
    fn when(&mut self, key: K) -> (usize, Duration) {
        let policy = self.policy;
        let (count, backoff) = self
            .failures
            .entry(key)
            .or_insert_with(|| (0, policy.builder().build()));
        *count += 1;
        (*count, backoff.next().unwrap_or(policy.max_delay))
    }

    fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &K) -> usize {
        self.failures.get(key).map_or(0, |(count, _)| *count)
    }
}

struct State<K> {
    /// Keys waiting to be handed out, in insertion order
    queue: VecDeque<K>,
    /// Keys that need processing, whether queued or deferred behind an in-flight pass
    dirty: HashSet<K>,
    /// Keys currently handed out to a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    limiter: Mutex<RateLimiter<K>>,
    notify: Notify,
    shutdown: CancellationToken,
    delayed: mpsc::UnboundedSender<(K, Instant)>,
}

/// A cloneable handle to a shared work queue
///
/// Gives no FIFO promise to callers beyond "every added key is eventually handed out once".
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Creates an empty queue
    ///
    /// Spawns the task serving [`WorkQueue::add_after`], so this must be called from within a Tokio runtime.
    pub fn new(policy: RetryPolicy) -> Self {
        let (delayed_tx, delayed_rx) = mpsc::unbounded();
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            limiter: Mutex::new(RateLimiter::new(policy)),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            delayed: delayed_tx,
        });
        tokio::spawn(run_delayed(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            delayed_rx,
        ));
        Self { inner }
    }

    /// Marks `key` as needing processing
    ///
    /// Coalesces with a pending copy of the same key. If the key is being processed it is
    /// handed out again once [`WorkQueue::done`] is called for it.
    pub fn add(&self, key: K) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                trace!(?key, "deferring add of in-flight key");
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    /// Waits for the next key to process
    ///
    /// Returns `None` once the queue is shutting down, even if keys are still pending.
    /// The returned key is *processing* until it is passed to [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // wake the next waiter, notify_one only stores a single permit
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            tokio::select! {
                () = self.inner.notify.notified() => {}
                () = self.inner.shutdown.cancelled() => {}
            }
        }
    }

    /// Marks `key` as no longer being processed
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Adds `key` after `delay`
    ///
    /// Several delayed adds of the same key are merged, the earliest one wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.inner.delayed.unbounded_send((key, Instant::now() + delay)).is_err() {
            trace!("delayed add dropped, queue is shutting down");
        }
    }

    /// Adds `key` after its current backoff delay, and bumps the backoff
    pub fn add_rate_limited(&self, key: K) {
        let (attempt, delay) = self.inner.limiter.lock().when(key.clone());
        debug!(?key, attempt, ?delay, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Resets the backoff of `key`
    ///
    /// Does not remove the key from the queue.
    pub fn forget(&self, key: &K) {
        self.inner.limiter.lock().forget(key);
    }

    /// How many times `key` has been rate limited since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> usize {
        self.inner.limiter.lock().num_requeues(key)
    }

    /// Number of keys waiting to be handed out
    ///
    /// Excludes keys that are processing and keys that are waiting on a delay.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no key is waiting to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out keys
    ///
    /// Every current and future [`WorkQueue::get`] returns `None`, and further adds are ignored.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.shutdown.cancel();
    }

    /// Whether [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

/// Keys waiting for a delayed add, each with the earliest deadline requested for it
struct Waiting<K> {
    timers: DelayQueue<K>,
    deadlines: HashMap<K, (Instant, delay_queue::Key)>,
}

impl<K: Clone + Eq + Hash> Waiting<K> {
    fn new() -> Self {
        Self {
            timers: DelayQueue::new(),
            deadlines: HashMap::new(),
        }
    }

    fn insert(&mut self, key: K, due: Instant) {
        match self.deadlines.get_mut(&key) {
            Some((deadline, _)) if *deadline <= due => {}
            Some((deadline, timer)) => {
                self.timers.reset_at(timer, due);
                *deadline = due;
            }
            None => {
                let timer = self.timers.insert_at(key.clone(), due);
                self.deadlines.insert(key, (due, timer));
            }
        }
    }

    /// Resolves to the next due key, or `None` right away if nothing is waiting
    fn poll_due(&mut self, cx: &mut Context<'_>) -> Poll<Option<K>> {
        self.timers.poll_expired(cx).map(|expired| {
            let key = expired?.into_inner();
            self.deadlines.remove(&key);
            Some(key)
        })
    }
}

/// Feeds delayed adds back into the queue once they are due
async fn run_delayed<K>(
    queue: Weak<Inner<K>>,
    shutdown: CancellationToken,
    mut requests: mpsc::UnboundedReceiver<(K, Instant)>,
) where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    let mut waiting = Waiting::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            request = requests.next() => match request {
                Some((key, due)) => waiting.insert(key, due),
                None => break,
            },
            Some(key) = poll_fn(|cx| waiting.poll_due(cx)) => match queue.upgrade() {
                Some(inner) => WorkQueue { inner }.add(key),
                None => break,
            },
        }
    }
}
