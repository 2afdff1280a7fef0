//! Job poller: tracks one long-running server job to a terminal phase.
//!
//! Status lookups go through the query coordinator like any other read
//! (key `job_status?jobId=...`) and are revalidated by the shared poll
//! scheduler. A driver task watches the cached status entry and advances the
//! state machine:
//!
//! ```text
//! not_started --trigger--> queued --> running --> completed --confirm--> not_started
//!                                        \-----> failed
//! ```
//!
//! The result endpoint is called on the first `completed` observation only,
//! and polling stops as soon as a terminal phase is reached.

use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::storage::JobStorage;
use super::types::{JobPhase, JobRecord, JobResult};
use crate::api::types::ApiJobStatusResponse;
use crate::cache::{CacheEntry, CacheKey, FetchStatus, Subscription};
use crate::error::SyncError;
use crate::poll::{Cadence, PollHandle, PollScheduler};
use crate::query::QueryCoordinator;

/// Resource name of job status keys.
pub const JOB_STATUS_RESOURCE: &str = "job_status";

/// Cache key of the status lookup for `job_id`.
pub fn status_key(job_id: &str) -> CacheKey {
  CacheKey::new(JOB_STATUS_RESOURCE).param("jobId", job_id)
}

/// Job endpoints besides the status lookup.
pub trait JobApi: Send + Sync {
  /// Start a job and return its id.
  fn trigger(&self, force: bool) -> BoxFuture<'static, Result<String, SyncError>>;

  fn result(&self, job_id: &str) -> BoxFuture<'static, Result<JobResult, SyncError>>;

  /// Commit a completed job's result.
  fn confirm(&self, job_id: &str) -> BoxFuture<'static, Result<(), SyncError>>;
}

#[derive(Debug, Clone)]
pub struct JobPollerConfig {
  pub poll_interval: Duration,
  /// Status polls allowed before the job is failed with a timeout
  pub max_attempts: u32,
}

impl Default for JobPollerConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(3),
      max_attempts: 200,
    }
  }
}

struct Tracking {
  job_id: String,
  _subscription: Subscription,
  poll: PollHandle,
  driver: JoinHandle<()>,
}

struct Inner {
  queries: QueryCoordinator,
  scheduler: PollScheduler,
  api: Arc<dyn JobApi>,
  storage: Arc<dyn JobStorage>,
  config: JobPollerConfig,
  state: watch::Sender<JobRecord>,
  tracking: Mutex<Option<Tracking>>,
}

/// Tracks at most one job at a time. Cloning is cheap.
#[derive(Clone)]
pub struct JobPoller {
  inner: Arc<Inner>,
}

impl JobPoller {
  pub fn new(
    queries: QueryCoordinator,
    scheduler: PollScheduler,
    api: Arc<dyn JobApi>,
    storage: Arc<dyn JobStorage>,
    config: JobPollerConfig,
  ) -> Self {
    let (state, _) = watch::channel(JobRecord::default());
    Self {
      inner: Arc::new(Inner {
        queries,
        scheduler,
        api,
        storage,
        config,
        state,
        tracking: Mutex::new(None),
      }),
    }
  }

  fn tracking(&self) -> MutexGuard<'_, Option<Tracking>> {
    self
      .inner
      .tracking
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Current snapshot of the tracked job.
  pub fn record(&self) -> JobRecord {
    self.inner.state.borrow().clone()
  }

  pub fn phase(&self) -> JobPhase {
    self.inner.state.borrow().phase
  }

  /// Receiver that sees every change to the job record.
  pub fn watch(&self) -> watch::Receiver<JobRecord> {
    self.inner.state.subscribe()
  }

  // ==========================================================================
  // Operations
  // ==========================================================================

  /// Resume tracking after a restart. An explicitly supplied id wins over the
  /// persisted one and replaces it in storage.
  pub fn init(&self, explicit: Option<&str>) -> Result<JobRecord, SyncError> {
    let stored = self.inner.storage.load()?;
    let job_id = match (explicit, stored) {
      (Some(id), stored) => {
        if stored.as_deref() != Some(id) {
          self.inner.storage.save(id)?;
        }
        id.to_string()
      }
      (None, Some(id)) => id,
      (None, None) => return Ok(self.record()),
    };

    info!(job_id = %job_id, "resuming job");
    self.stop_tracking();
    self.start_tracking(&job_id, true);
    Ok(self.record())
  }

  /// Start a new job. Without `force` this is only allowed when no job is
  /// tracked. On failure the phase is left as it was.
  pub async fn trigger(&self, force: bool) -> Result<String, SyncError> {
    let current = self.record();
    if current.phase != JobPhase::NotStarted && !force {
      return Err(SyncError::InvalidState(format!(
        "job {} is {}",
        current.job_id.as_deref().unwrap_or("-"),
        current.phase
      )));
    }

    let job_id = match self.inner.api.trigger(force).await {
      Ok(job_id) => job_id,
      Err(e) => {
        warn!(error = %e, "job trigger failed");
        self.inner.state.send_modify(|r| r.error = Some(e.clone()));
        return Err(e);
      }
    };

    self.stop_tracking();
    let persisted = match self.inner.storage.save(&job_id) {
      Ok(()) => true,
      Err(e) => {
        warn!(job_id = %job_id, error = %e, "could not persist job id");
        false
      }
    };
    info!(job_id = %job_id, force, "job triggered");
    self.start_tracking(&job_id, persisted);
    Ok(job_id)
  }

  /// Commit the result of a completed job, then forget it.
  pub async fn confirm(&self) -> Result<(), SyncError> {
    let record = self.record();
    let job_id = match record.job_id {
      Some(job_id) if record.phase == JobPhase::Completed => job_id,
      _ => {
        return Err(SyncError::InvalidState(format!(
          "cannot confirm a job that is {}",
          record.phase
        )))
      }
    };

    self.inner.api.confirm(&job_id).await?;
    info!(job_id = %job_id, "job confirmed");
    self.clear()
  }

  /// Forget the tracked job, optionally starting a new one.
  pub async fn retry(&self, retrigger: bool) -> Result<Option<String>, SyncError> {
    self.clear()?;
    if retrigger {
      self.trigger(true).await.map(Some)
    } else {
      Ok(None)
    }
  }

  /// Stop tracking, reset to `not_started` and drop the persisted id.
  pub fn clear(&self) -> Result<(), SyncError> {
    let job_id = self.record().job_id;
    self.stop_tracking();
    if let Some(job_id) = &job_id {
      self.inner.queries.store().clear(&status_key(job_id));
      info!(job_id = %job_id, "job cleared");
    }
    self.inner.state.send_replace(JobRecord::default());
    self.inner.storage.clear()
  }

  /// Stop polling without touching the record or storage.
  pub fn shutdown(&self) {
    self.stop_tracking();
  }

  // ==========================================================================
  // Tracking
  // ==========================================================================

  fn start_tracking(&self, job_id: &str, persisted: bool) {
    let key = status_key(job_id);
    self
      .inner
      .state
      .send_replace(JobRecord::tracking(job_id, persisted));

    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = self.inner.queries.store().subscribe(&key, move |_, entry| {
      let _ = tx.send(entry.clone());
    });

    // Held while the result is being collected so no status poll overlaps it
    let hold = Arc::new(AtomicBool::new(false));
    let phase = self.inner.state.subscribe();
    let interval = self.inner.config.poll_interval;
    let held = Arc::clone(&hold);
    let poll = self.inner.scheduler.register(
      &key,
      Cadence::adaptive(move |_| {
        if !phase.borrow().phase.is_active() {
          Duration::ZERO
        } else if held.load(Ordering::Acquire) {
          Duration::MAX
        } else {
          interval
        }
      }),
    );

    let driver = tokio::spawn(drive(
      Arc::downgrade(&self.inner),
      job_id.to_string(),
      hold,
      rx,
    ));

    *self.tracking() = Some(Tracking {
      job_id: job_id.to_string(),
      _subscription: subscription,
      poll,
      driver,
    });
    debug!(job_id, "tracking job");
    self.inner.queries.refresh(&key);
  }

  fn stop_tracking(&self) {
    let tracking = self.tracking().take();
    if let Some(tracking) = tracking {
      tracking.driver.abort();
      tracking.poll.cancel();
      debug!(job_id = %tracking.job_id, "stopped tracking job");
    }
  }

  /// Drop the subscription and poll registration of `job_id`, leaving the
  /// driver to finish on its own.
  fn release(&self, job_id: &str) {
    let tracking = {
      let mut guard = self.tracking();
      if guard.as_ref().is_some_and(|t| t.job_id == job_id) {
        guard.take()
      } else {
        None
      }
    };
    if let Some(tracking) = tracking {
      tracking.poll.cancel();
    }
  }

  /// Apply `f` to the record if it still tracks `job_id`.
  fn update<R>(&self, job_id: &str, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
    let mut out = None;
    self.inner.state.send_if_modified(|record| {
      if !record.is_tracking(job_id) {
        return false;
      }
      out = Some(f(record));
      true
    });
    out
  }

  fn transition(&self, job_id: &str, phase: JobPhase) {
    let from = self.update(job_id, |r| std::mem::replace(&mut r.phase, phase));
    if let Some(from) = from.filter(|from| *from != phase) {
      info!(job_id, from = %from, to = %phase, "job phase changed");
    }
  }

  /// The server no longer knows `job_id`: reset without surfacing a failure.
  fn forget(&self, job_id: &str) {
    warn!(job_id, "job unknown to server, clearing");
    self.release(job_id);
    self.inner.queries.store().clear(&status_key(job_id));
    if let Err(e) = self.inner.storage.clear() {
      warn!(job_id, error = %e, "could not clear persisted job id");
    }
    self.inner.state.send_replace(JobRecord {
      error: Some(SyncError::JobNotFound(job_id.to_string())),
      ..JobRecord::default()
    });
  }

  /// Handle one completed status poll. Returns false once tracking is over.
  async fn observe(&self, job_id: &str, entry: CacheEntry, hold: &AtomicBool) -> bool {
    let Some(attempts) = self.update(job_id, |r| {
      r.attempts += 1;
      r.last_polled_at = Some(Utc::now());
      r.attempts
    }) else {
      return false;
    };

    let reported = match (entry.status, entry.value) {
      (FetchStatus::Error, _) => {
        let error = entry
          .error
          .unwrap_or_else(|| SyncError::Network("status poll failed".into()));
        if error.status() == Some(404) {
          self.forget(job_id);
          return false;
        }
        warn!(job_id, attempts, error = %error, "status poll failed");
        self.update(job_id, |r| r.error = Some(error));
        None
      }
      (_, Some(payload)) => match payload.parse_document::<ApiJobStatusResponse>() {
        Ok(status) => Some(JobPhase::from_server(&status.status)),
        Err(e) => {
          warn!(job_id, error = %e, "unreadable job status");
          self.update(job_id, |r| r.error = Some(e));
          None
        }
      },
      (_, None) => None,
    };

    if let Some(phase) = reported {
      let phase = if phase == JobPhase::Completed {
        hold.store(true, Ordering::Release);
        let phase = self.collect_result(job_id).await;
        hold.store(false, Ordering::Release);
        phase
      } else {
        phase
      };
      self.transition(job_id, phase);
    }

    let record = self.record();
    if !record.is_tracking(job_id) || record.phase.is_terminal() {
      return false;
    }
    if attempts >= self.inner.config.max_attempts {
      warn!(job_id, attempts, "job did not finish within the poll ceiling");
      self.update(job_id, |r| {
        r.phase = JobPhase::Failed;
        r.error = Some(SyncError::JobTimeout { attempts });
      });
      return false;
    }
    true
  }

  /// Fetch the result once. A result that is not ready yet keeps the job running.
  async fn collect_result(&self, job_id: &str) -> JobPhase {
    if self.record().result_fetched {
      return JobPhase::Completed;
    }

    match self.inner.api.result(job_id).await {
      Ok(JobResult::Ready(payload)) => {
        self.update(job_id, |r| {
          if !r.result_fetched {
            r.result_fetched = true;
            r.result = Some(payload);
            r.error = None;
          }
        });
        info!(job_id, "job result fetched");
        JobPhase::Completed
      }
      Ok(JobResult::Pending) => {
        debug!(job_id, "job reported completed but result is not ready");
        JobPhase::Running
      }
      Err(e) => {
        warn!(job_id, error = %e, "job result fetch failed");
        self.update(job_id, |r| r.error = Some(e));
        JobPhase::Running
      }
    }
  }
}

/// Feed finished status polls of `job_id` into the state machine.
async fn drive(
  inner: Weak<Inner>,
  job_id: String,
  hold: Arc<AtomicBool>,
  mut rx: mpsc::UnboundedReceiver<CacheEntry>,
) {
  // A poll has finished when the entry leaves the loading state
  let mut was_loading = false;
  while let Some(entry) = rx.recv().await {
    let loading = entry.status.is_loading();
    let finished = was_loading && !loading;
    was_loading = loading;
    if !finished {
      continue;
    }

    let Some(inner) = inner.upgrade() else {
      return;
    };
    let poller = JobPoller { inner };
    if !poller.observe(&job_id, entry, &hold).await {
      poller.release(&job_id);
      debug!(job_id = %job_id, phase = %poller.phase(), "job polling finished");
      return;
    }
  }
}
