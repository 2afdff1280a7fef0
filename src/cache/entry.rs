//! Cache entries and the partial updates applied to them.

use std::time::Duration;
use tokio::time::Instant;

use crate::api::Payload;
use crate::error::SyncError;

/// Default time before a fetched value is considered stale.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);

/// Fetch status of an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchStatus {
  /// Never fetched
  #[default]
  Idle,
  /// A fetch is in flight
  Loading,
  /// Last fetch (or write) succeeded
  Success,
  /// Last fetch failed
  Error,
}

impl FetchStatus {
  pub fn is_loading(&self) -> bool {
    matches!(self, FetchStatus::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, FetchStatus::Success)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, FetchStatus::Error)
  }
}

/// Current state of one cached key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub value: Option<Payload>,
  pub status: FetchStatus,
  pub fetched_at: Option<Instant>,
  pub stale_after: Duration,
  /// Stamp of the last value-bearing write. Never decreases.
  pub generation: u64,
  pub error: Option<SyncError>,
  /// Set by invalidation; cleared when a fetched value lands.
  pub invalidated: bool,
}

impl Default for CacheEntry {
  fn default() -> Self {
    Self {
      value: None,
      status: FetchStatus::Idle,
      fetched_at: None,
      stale_after: DEFAULT_STALE_TIME,
      generation: 0,
      error: None,
      invalidated: false,
    }
  }
}

impl CacheEntry {
  /// Check if the entry needs a refetch, measured against `stale_time`.
  pub fn is_stale_at(&self, now: Instant, stale_time: Duration) -> bool {
    if self.invalidated || self.status.is_error() {
      return true;
    }
    match self.fetched_at {
      Some(at) => now.saturating_duration_since(at) > stale_time,
      None => true,
    }
  }

  /// Check staleness against the entry's own configured stale time.
  pub fn is_stale(&self) -> bool {
    self.is_stale_at(Instant::now(), self.stale_after)
  }

  /// Data if any value is present, stale or not.
  pub fn data(&self) -> Option<&Payload> {
    self.value.as_ref()
  }

  /// Only a terminal error with no prior value should be shown as an error.
  pub fn shows_error(&self) -> bool {
    self.value.is_none() && self.status.is_error()
  }
}

/// A partial update merged into an entry by `CacheStore::write`.
///
/// Only a patch that carries a value bumps the entry's generation.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
  pub(crate) value: Option<Option<Payload>>,
  pub(crate) status: Option<FetchStatus>,
  pub(crate) fetched_at: Option<Option<Instant>>,
  pub(crate) stale_after: Option<Duration>,
  pub(crate) error: Option<Option<SyncError>>,
  pub(crate) invalidated: Option<bool>,
}

impl EntryPatch {
  pub fn new() -> Self {
    Self::default()
  }

  /// Value confirmed by the server. Marks the entry fresh.
  pub fn fetched(payload: Payload, at: Instant) -> Self {
    Self {
      value: Some(Some(payload)),
      status: Some(FetchStatus::Success),
      fetched_at: Some(Some(at)),
      error: Some(None),
      invalidated: Some(false),
      ..Self::default()
    }
  }

  /// Local write that has not been confirmed. Leaves freshness alone.
  pub fn optimistic(payload: Payload) -> Self {
    Self {
      value: Some(Some(payload)),
      status: Some(FetchStatus::Success),
      error: Some(None),
      ..Self::default()
    }
  }

  /// Put back a previously captured state, including an absent value.
  pub fn restore(entry: &CacheEntry) -> Self {
    Self {
      value: Some(entry.value.clone()),
      status: Some(entry.status),
      fetched_at: Some(entry.fetched_at),
      stale_after: Some(entry.stale_after),
      error: Some(entry.error.clone()),
      invalidated: Some(entry.invalidated),
    }
  }

  /// Failed fetch. The last known value is kept.
  pub fn failed(error: SyncError) -> Self {
    Self {
      status: Some(FetchStatus::Error),
      error: Some(Some(error)),
      ..Self::default()
    }
  }

  pub fn status(mut self, status: FetchStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn stale_after(mut self, stale_after: Duration) -> Self {
    self.stale_after = Some(stale_after);
    self
  }

  pub fn invalidated(mut self, invalidated: bool) -> Self {
    self.invalidated = Some(invalidated);
    self
  }

  pub fn carries_value(&self) -> bool {
    self.value.is_some()
  }

  /// Merge into `entry`, stamping `generation` if this is a value-bearing write.
  pub(crate) fn apply(self, entry: &mut CacheEntry, generation: u64) {
    if let Some(value) = self.value {
      entry.value = value;
      entry.generation = generation;
    }
    if let Some(status) = self.status {
      entry.status = status;
    }
    if let Some(fetched_at) = self.fetched_at {
      entry.fetched_at = fetched_at;
    }
    if let Some(stale_after) = self.stale_after {
      entry.stale_after = stale_after;
    }
    if let Some(error) = self.error {
      entry.error = error;
    }
    if let Some(invalidated) = self.invalidated {
      entry.invalidated = invalidated;
    }
  }
}
