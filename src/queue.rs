use crate::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Delay before the first requeue of a failing key.
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound for the exponential requeue delay.
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// FIFO of reconciliation keys with deduplication, in-progress coalescing and
/// rate-limited requeueing. Cloning yields another handle to the same queue.
///
/// Invariants enforced here:
/// - a key is never handed to two workers at once; adds for a key that is
///   being processed are coalesced and replayed once [`done`](Self::done) is
///   called,
/// - adding a key that is already queued is a no-op and keeps its earliest
///   position.
#[derive(Clone)]
pub struct WorkQueue {
  inner: Arc<Inner>,
}

struct Inner {
  state: Mutex<State>,
  wakeup: Notify,
}

#[derive(Default)]
struct State {
  order: VecDeque<String>,
  queued: HashSet<String>,
  processing: HashSet<String>,
  dirty: HashSet<String>,
  requeues: HashMap<String, u32>,
  shutting_down: bool,
}

impl WorkQueue {
  pub fn new() -> Self {
    WorkQueue {
      inner: Arc::new(Inner {
        state: Mutex::new(State::default()),
        wakeup: Notify::new(),
      }),
    }
  }

  /// Enqueues a key for processing. No-op for keys already queued; keys
  /// currently being processed are marked and re-enqueued on `done`.
  pub fn add(&self, key: &str) {
    let mut state = self.inner.state.lock().unwrap();
    if state.shutting_down {
      return;
    }

    if state.processing.contains(key) {
      state.dirty.insert(key.to_owned());
      return;
    }

    if state.queued.insert(key.to_owned()) {
      state.order.push_back(key.to_owned());
      self.inner.wakeup.notify_one();
    }
  }

  /// Enqueues a key after an exponential per-key delay and bumps its requeue
  /// counter. The counter is reset by [`forget`](Self::forget).
  pub fn add_rate_limited(&self, key: &str) {
    let delay = {
      let mut state = self.inner.state.lock().unwrap();
      if state.shutting_down {
        return;
      }

      let attempt = state.requeues.entry(key.to_owned()).or_insert(0);
      let delay = backoff(*attempt);
      *attempt += 1;
      delay
    };

    let queue = self.clone();
    let key = key.to_owned();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      queue.add(&key);
    });
  }

  /// Blocks until a key is available and marks it as being processed.
  /// Returns `None` once the queue is shut down and drained.
  pub async fn get(&self) -> Option<String> {
    loop {
      let wakeup = self.inner.wakeup.notified();

      {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(key) = state.order.pop_front() {
          state.queued.remove(&key);
          state.processing.insert(key.clone());
          return Some(key);
        }

        if state.shutting_down {
          return None;
        }
      }

      wakeup.await;
    }
  }

  /// Signals that processing of a key finished. Keys re-added while being
  /// processed go back on the queue here.
  pub fn done(&self, key: &str) {
    let mut state = self.inner.state.lock().unwrap();
    state.processing.remove(key);

    if state.dirty.remove(key) && !state.shutting_down && state.queued.insert(key.to_owned()) {
      state.order.push_back(key.to_owned());
      self.inner.wakeup.notify_one();
    }
  }

  /// Resets the requeue counter for a key.
  pub fn forget(&self, key: &str) {
    self.inner.state.lock().unwrap().requeues.remove(key);
  }

  /// Number of rate-limited requeues for a key since it was last forgotten.
  pub fn num_requeues(&self, key: &str) -> u32 {
    self.inner.state.lock().unwrap().requeues.get(key).copied().unwrap_or(0)
  }

  /// Blocks new additions; workers drain what is queued and then observe
  /// `None` from [`get`](Self::get).
  pub fn shutdown(&self) {
    self.inner.state.lock().unwrap().shutting_down = true;
    self.inner.wakeup.notify_waiters();
  }
}

/// `BASE_DELAY · 2^attempt`, bounded by [`MAX_DELAY`].
fn backoff(attempt: u32) -> Duration {
  let millis = (BASE_DELAY.as_millis() as u64).saturating_mul(1u64 << attempt.min(32));
  Duration::from_millis(millis).min(MAX_DELAY)
}
