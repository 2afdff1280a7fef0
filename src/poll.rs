//! Poll scheduler: one shared timer that revalidates registered keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::api::Payload;
use crate::cache::CacheKey;
use crate::query::QueryCoordinator;

/// Default period of the shared timer.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Computes the next interval from the last cached value. `Duration::ZERO` stops polling.
pub type IntervalFn = Arc<dyn Fn(Option<&Payload>) -> Duration + Send + Sync>;

/// How often a key is revalidated.
#[derive(Clone)]
pub enum Cadence {
  Fixed(Duration),
  Adaptive(IntervalFn),
}

impl Cadence {
  pub fn adaptive<F>(f: F) -> Self
  where
    F: Fn(Option<&Payload>) -> Duration + Send + Sync + 'static,
  {
    Cadence::Adaptive(Arc::new(f))
  }

  fn interval(&self, last: Option<&Payload>) -> Duration {
    match self {
      Cadence::Fixed(interval) => *interval,
      Cadence::Adaptive(f) => f(last),
    }
  }
}

impl std::fmt::Debug for Cadence {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Cadence::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
      Cadence::Adaptive(_) => f.write_str("Adaptive"),
    }
  }
}

#[derive(Clone)]
struct PollEntry {
  id: u64,
  cadence: Cadence,
  /// Last time this scheduler (or registration) revalidated the key
  last_triggered: Instant,
}

/// Shared-timer poller. Each tick refreshes every registered key that has a
/// subscriber, is not already fetching and whose interval has elapsed.
///
/// A registration ends exactly once: when the key has no subscribers, when its
/// cadence returns zero, or when it is cancelled explicitly.
#[derive(Clone)]
pub struct PollScheduler {
  queries: QueryCoordinator,
  entries: Arc<Mutex<HashMap<CacheKey, PollEntry>>>,
  next_id: Arc<AtomicU64>,
  visible: Arc<AtomicBool>,
  tick: Duration,
  task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PollScheduler {
  pub fn new(queries: QueryCoordinator, tick: Duration) -> Self {
    Self {
      queries,
      entries: Arc::new(Mutex::new(HashMap::new())),
      next_id: Arc::new(AtomicU64::new(0)),
      visible: Arc::new(AtomicBool::new(true)),
      tick,
      task: Arc::new(Mutex::new(None)),
    }
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, PollEntry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register `key`, replacing any previous registration for it.
  pub fn register(&self, key: &CacheKey, cadence: Cadence) -> PollHandle {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(key = %key, ?cadence, "poll registered");
    self.entries().insert(
      key.clone(),
      PollEntry {
        id,
        cadence,
        last_triggered: Instant::now(),
      },
    );
    PollHandle {
      scheduler: self.clone(),
      key: key.clone(),
      id,
    }
  }

  /// Remove the registration for `key`. Returns false if there was none.
  pub fn deregister(&self, key: &CacheKey) -> bool {
    self.remove(key, None, "deregistered")
  }

  fn remove(&self, key: &CacheKey, id: Option<u64>, reason: &str) -> bool {
    let mut entries = self.entries();
    let matches = entries
      .get(key)
      .is_some_and(|e| id.map_or(true, |id| id == e.id));
    if !matches {
      return false;
    }
    entries.remove(key);
    info!(key = %key, reason, "poll timer cancelled");
    true
  }

  pub fn is_registered(&self, key: &CacheKey) -> bool {
    self.entries().contains_key(key)
  }

  /// Visibility reported by the UI. While hidden, ticks do nothing.
  pub fn set_visible(&self, visible: bool) {
    self.visible.store(visible, Ordering::Relaxed);
  }

  /// Run one pass over the registrations. Returns the keys refreshed.
  pub fn tick(&self) -> Vec<CacheKey> {
    if !self.visible.load(Ordering::Relaxed) {
      trace!("context hidden, skipping poll tick");
      return Vec::new();
    }

    let now = Instant::now();
    let registrations: Vec<(CacheKey, PollEntry)> = self
      .entries()
      .iter()
      .map(|(k, e)| (k.clone(), e.clone()))
      .collect();
    let store = self.queries.store();
    let mut refreshed = Vec::new();

    for (key, poll) in registrations {
      if store.subscriber_count(&key) == 0 {
        self.remove(&key, Some(poll.id), "no subscribers");
        continue;
      }
      if self.queries.is_fetching(&key) {
        continue;
      }

      let entry = store.read(&key);
      let interval = poll.cadence.interval(entry.value.as_ref());
      if interval.is_zero() {
        self.remove(&key, Some(poll.id), "cadence stopped");
        continue;
      }

      let last = entry
        .fetched_at
        .map_or(poll.last_triggered, |at| at.max(poll.last_triggered));
      if now.saturating_duration_since(last) < interval {
        continue;
      }

      if let Some(e) = self.entries().get_mut(&key) {
        if e.id == poll.id {
          e.last_triggered = now;
        }
      }
      trace!(key = %key, interval_ms = interval.as_millis() as u64, "poll refresh");
      self.queries.refresh(&key);
      refreshed.push(key);
    }
    refreshed
  }

  /// Start the shared timer if it is not running.
  pub fn start(&self) {
    let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
    if task.as_ref().is_some_and(|t| !t.is_finished()) {
      return;
    }
    let scheduler = self.clone();
    let period = self.tick;
    *task = Some(tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        scheduler.tick();
      }
    }));
    debug!(tick_ms = period.as_millis() as u64, "poll scheduler started");
  }

  /// Stop the shared timer. Registrations are kept.
  pub fn stop(&self) {
    if let Some(task) = self
      .task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      task.abort();
      debug!("poll scheduler stopped");
    }
  }

  /// Stop the timer and drop every registration.
  pub fn shutdown(&self) {
    self.stop();
    self.entries().clear();
  }
}

/// Cancellation handle for one registration. Dropping it leaves the
/// registration in place; its lifetime is then tied to the key's subscribers.
pub struct PollHandle {
  scheduler: PollScheduler,
  key: CacheKey,
  id: u64,
}

impl PollHandle {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Cancel this registration. A no-op if it already ended or was replaced.
  pub fn cancel(self) -> bool {
    self.scheduler.remove(&self.key, Some(self.id), "cancelled")
  }
}
