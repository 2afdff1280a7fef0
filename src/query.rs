//! Query coordinator: cache-first reads with deduplicated background fetches.
//!
//! Inspired by TanStack Query. Every trigger (a UI read, the poll scheduler,
//! push invalidation, a mutation's invalidate set) funnels into the same fetch
//! path, which guarantees:
//! - at most one in-flight fetch per key; later callers join it
//! - a response is applied only if no newer value was written while it was in
//!   flight (generation guard)
//! - network and server errors are retried with bounded exponential backoff;
//!   validation and auth errors are not
//!
//! # Example
//!
//! ```ignore
//! let queries = QueryCoordinator::new(store.clone(), Arc::new(api), QueryConfig::default());
//! let key = CacheKey::new("campaigns").param("clientId", 7);
//!
//! // Returns whatever is cached and starts a refresh if it is stale
//! let snapshot = queries.get(&key, &QueryOptions::default());
//!
//! // Or wait for a fresh value
//! let campaigns = queries.fetch(&key, &QueryOptions::default()).await?;
//! ```

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::Payload;
use crate::cache::{
  CacheEntry, CacheKey, CacheStore, EntryPatch, FetchStatus, DEFAULT_STALE_TIME,
};
use crate::error::SyncError;

/// External fetch collaborator: resolves a key to a validated payload.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, key: &CacheKey) -> BoxFuture<'static, Result<Payload, SyncError>>;
}

impl<F, Fut> Fetcher for F
where
  F: Fn(&CacheKey) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Payload, SyncError>> + Send + 'static,
{
  fn fetch(&self, key: &CacheKey) -> BoxFuture<'static, Result<Payload, SyncError>> {
    self(key).boxed()
  }
}

/// Per-read options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
  pub stale_time: Duration,
  pub enabled: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: DEFAULT_STALE_TIME,
      enabled: true,
    }
  }
}

impl QueryOptions {
  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }
}

/// Bounded exponential backoff for transient fetch errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Total attempts including the first one
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(8),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (0-based): base, 2x base, 4x base, ...
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
  pub retry: RetryPolicy,
  /// Each network attempt resolves as a NetworkError after this long
  pub fetch_timeout: Duration,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      retry: RetryPolicy::default(),
      fetch_timeout: Duration::from_secs(15),
    }
  }
}

/// Snapshot of a key as seen by a consumer.
#[derive(Debug, Clone)]
pub struct QueryResult {
  pub key: CacheKey,
  pub data: Option<Payload>,
  pub status: FetchStatus,
  pub error: Option<SyncError>,
  pub is_stale: bool,
  pub is_fetching: bool,
}

impl QueryResult {
  fn from_entry(key: &CacheKey, entry: CacheEntry, stale_time: Duration, is_fetching: bool) -> Self {
    let is_stale = entry.is_stale_at(Instant::now(), stale_time);
    Self {
      key: key.clone(),
      data: entry.value,
      status: entry.status,
      error: entry.error,
      is_stale,
      is_fetching,
    }
  }

  pub fn data(&self) -> Option<&Payload> {
    self.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.status.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.status.is_success()
  }

  /// Only an error with nothing cached to show instead.
  pub fn is_error(&self) -> bool {
    self.data.is_none() && self.status.is_error()
  }

  pub fn error(&self) -> Option<&SyncError> {
    self.error.as_ref()
  }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Payload, SyncError>>>;

struct InFlight {
  seq: u64,
  future: SharedFetch,
}

/// Resolves reads against the cache store and owns the single fetch path.
///
/// Cloning is cheap; clones share the store, fetcher and in-flight table.
#[derive(Clone)]
pub struct QueryCoordinator {
  store: CacheStore,
  fetcher: Arc<dyn Fetcher>,
  in_flight: Arc<Mutex<HashMap<CacheKey, InFlight>>>,
  next_seq: Arc<AtomicU64>,
  config: Arc<QueryConfig>,
}

impl QueryCoordinator {
  pub fn new(store: CacheStore, fetcher: Arc<dyn Fetcher>, config: QueryConfig) -> Self {
    Self {
      store,
      fetcher,
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_seq: Arc::new(AtomicU64::new(0)),
      config: Arc::new(config),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  fn in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, InFlight>> {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Check if a fetch is currently running for `key`.
  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self.in_flight().contains_key(key)
  }

  /// Return the cached state for `key` and start a background refresh if it is
  /// missing, stale or errored. A no-op read when `enabled` is false.
  pub fn get(&self, key: &CacheKey, options: &QueryOptions) -> QueryResult {
    let entry = self.store.read(key);
    if options.enabled && entry.is_stale_at(Instant::now(), options.stale_time) {
      self.start_fetch(key, options.stale_time);
    }
    let is_fetching = self.is_fetching(key);
    QueryResult::from_entry(key, self.store.read(key), options.stale_time, is_fetching)
  }

  /// Resolve the value for `key`, waiting for a fetch if the cache cannot
  /// serve it. Concurrent callers share one network call.
  pub async fn fetch(&self, key: &CacheKey, options: &QueryOptions) -> Result<Payload, SyncError> {
    let entry = self.store.read(key);
    if !options.enabled {
      return entry
        .value
        .ok_or_else(|| SyncError::InvalidState(format!("query {} is disabled", key)));
    }
    if !entry.is_stale_at(Instant::now(), options.stale_time) {
      if let Some(value) = entry.value {
        return Ok(value);
      }
    }
    self.start_fetch(key, options.stale_time).await
  }

  /// Start a fetch regardless of freshness, unless one is already running.
  pub fn refresh(&self, key: &CacheKey) {
    let stale_time = self.store.read(key).stale_after;
    self.start_fetch(key, stale_time);
  }

  /// Like `refresh`, but wait for the outcome.
  pub async fn refetch(&self, key: &CacheKey) -> Result<Payload, SyncError> {
    let stale_time = self.store.read(key).stale_after;
    self.start_fetch(key, stale_time).await
  }

  /// Refresh `key` once the fetch running now has settled, or right away if
  /// none is. Outside a runtime the key is left for the next read to refetch.
  pub(crate) fn refresh_after_in_flight(&self, key: &CacheKey) {
    if tokio::runtime::Handle::try_current().is_err() {
      return;
    }
    let running = self.in_flight().get(key).map(|f| f.future.clone());
    let Some(running) = running else {
      self.refresh(key);
      return;
    };
    let queries = self.clone();
    let key = key.clone();
    tokio::spawn(async move {
      let _ = running.await;
      queries.refresh(&key);
    });
  }

  /// Mark `key` stale and refetch it if anyone is subscribed. Returns true if
  /// a refetch was triggered.
  pub fn invalidate(&self, key: &CacheKey) -> bool {
    if !self.store.mark_stale(key) {
      return false;
    }
    if self.store.subscriber_count(key) == 0 {
      debug!(key = %key, "invalidated without subscribers, deferring refetch");
      return false;
    }
    self.refresh(key);
    true
  }

  /// Invalidate every subscribed key of a resource type. Keys nobody is
  /// watching are left untouched. Returns the keys that were refreshed.
  pub fn invalidate_resource(&self, resource: &str) -> Vec<CacheKey> {
    let keys = self.store.active_keys(resource);
    for key in &keys {
      self.store.mark_stale(key);
      self.refresh(key);
    }
    keys
  }

  /// Join the in-flight fetch for `key` or start a new one.
  fn start_fetch(&self, key: &CacheKey, stale_time: Duration) -> SharedFetch {
    let (future, seq) = {
      let mut in_flight = self.in_flight();
      if let Some(existing) = in_flight.get(key) {
        debug!(key = %key, seq = existing.seq, "joining in-flight fetch");
        return existing.future.clone();
      }

      let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
      let issued_generation = self.store.read(key).generation;
      let future = self
        .fetch_task(key.clone(), seq, issued_generation, stale_time)
        .boxed()
        .shared();
      in_flight.insert(
        key.clone(),
        InFlight {
          seq,
          future: future.clone(),
        },
      );
      (future, seq)
    };

    debug!(key = %key, seq, "starting fetch");
    self.store.write(
      key,
      EntryPatch::new()
        .status(FetchStatus::Loading)
        .stale_after(stale_time),
    );
    tokio::spawn(future.clone());
    future
  }

  fn fetch_task(
    &self,
    key: CacheKey,
    seq: u64,
    issued_generation: u64,
    stale_time: Duration,
  ) -> impl Future<Output = Result<Payload, SyncError>> + Send + 'static {
    let store = self.store.clone();
    let fetcher = Arc::clone(&self.fetcher);
    let in_flight = Arc::clone(&self.in_flight);
    let config = Arc::clone(&self.config);

    async move {
      let outcome = fetch_with_retry(fetcher.as_ref(), &key, &config).await;

      {
        let mut in_flight = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.get(&key).is_some_and(|f| f.seq == seq) {
          in_flight.remove(&key);
        }
      }

      let not_superseded = |e: &CacheEntry| e.generation <= issued_generation;
      match outcome {
        Ok(payload) => {
          let patch = EntryPatch::fetched(payload.clone(), Instant::now()).stale_after(stale_time);
          if store.write_when(&key, not_superseded, patch).is_some() {
            debug!(key = %key, seq, "fetch applied");
            return Ok(payload);
          }
          debug!(key = %key, seq, issued_generation, "discarding response older than cached value");
          store.write_when(
            &key,
            |e| e.status.is_loading(),
            EntryPatch::new().status(FetchStatus::Success),
          );
          Ok(store.read(&key).value.unwrap_or(payload))
        }
        Err(error) => {
          warn!(key = %key, seq, error = %error, "fetch failed");
          let patch = EntryPatch::failed(error.clone()).stale_after(stale_time);
          if store.write_when(&key, not_superseded, patch).is_none() {
            store.write_when(
              &key,
              |e| e.status.is_loading(),
              EntryPatch::new().status(FetchStatus::Success),
            );
          }
          Err(error)
        }
      }
    }
  }
}

async fn fetch_with_retry(
  fetcher: &dyn Fetcher,
  key: &CacheKey,
  config: &QueryConfig,
) -> Result<Payload, SyncError> {
  let mut attempt = 0;
  loop {
    let result = match tokio::time::timeout(config.fetch_timeout, fetcher.fetch(key)).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::Network(format!(
        "fetch timed out after {}ms",
        config.fetch_timeout.as_millis()
      ))),
    };

    match result {
      Ok(payload) => return Ok(payload),
      Err(e) if e.is_retryable() && attempt + 1 < config.retry.max_attempts => {
        let delay = config.retry.delay(attempt);
        warn!(
          key = %key,
          attempt = attempt + 1,
          backoff_ms = delay.as_millis() as u64,
          error = %e,
          "transient fetch error, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{record, ScriptedFetcher};

  fn coordinator(fetcher: Arc<ScriptedFetcher>) -> QueryCoordinator {
    QueryCoordinator::new(CacheStore::new(), fetcher, QueryConfig::default())
  }

  fn campaigns() -> CacheKey {
    CacheKey::new("campaigns").param("clientId", 7)
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_success() {
    let fetcher = ScriptedFetcher::new();
    fetcher.always(&campaigns(), Ok(record("c1", "name", "Spring")));
    let queries = coordinator(fetcher.clone());

    let snapshot = queries.get(&campaigns(), &QueryOptions::default());
    assert!(snapshot.is_loading());
    assert!(snapshot.data().is_none());

    let value = queries.fetch(&campaigns(), &QueryOptions::default()).await.unwrap();
    assert_eq!(value, record("c1", "name", "Spring"));

    let snapshot = queries.get(&campaigns(), &QueryOptions::default());
    assert!(snapshot.is_success());
    assert!(!snapshot.is_stale);
    assert_eq!(fetcher.calls_for(&campaigns()), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reads_within_stale_time_share_one_call() {
    let fetcher = ScriptedFetcher::new();
    fetcher.always(&campaigns(), Ok(record("c1", "name", "Spring")));
    let queries = coordinator(fetcher.clone());
    let options = QueryOptions::default().stale_time(Duration::from_secs(10));

    queries.fetch(&campaigns(), &options).await.unwrap();
    tokio::time::advance(Duration::from_secs(9)).await;
    queries.fetch(&campaigns(), &options).await.unwrap();
    queries.get(&campaigns(), &options);
    assert_eq!(fetcher.calls_for(&campaigns()), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    queries.fetch(&campaigns(), &options).await.unwrap();
    assert_eq!(fetcher.calls_for(&campaigns()), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_fetches_are_deduplicated() {
    let fetcher = ScriptedFetcher::new();
    fetcher.set_delay(Duration::from_millis(200));
    fetcher.respond(&campaigns(), Ok(record("c1", "name", "first")));
    fetcher.respond(&campaigns(), Ok(record("c1", "name", "second")));
    let queries = coordinator(fetcher.clone());

    let options = QueryOptions::default();
    let key = campaigns();
    let results = futures::future::join_all((0..5).map(|_| queries.fetch(&key, &options))).await;

    assert_eq!(fetcher.calls_for(&campaigns()), 1);
    for result in results {
      assert_eq!(result.unwrap(), record("c1", "name", "first"));
    }
    assert!(!queries.is_fetching(&campaigns()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_query_is_noop() {
    let fetcher = ScriptedFetcher::new();
    fetcher.always(&campaigns(), Ok(record("c1", "name", "Spring")));
    let queries = coordinator(fetcher.clone());
    let options = QueryOptions::default().enabled(false);

    let snapshot = queries.get(&campaigns(), &options);
    assert_eq!(snapshot.status, FetchStatus::Idle);
    assert!(queries.fetch(&campaigns(), &options).await.is_err());
    assert_eq!(fetcher.total_calls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_late_response_does_not_overwrite_newer_value() {
    let fetcher = ScriptedFetcher::new();
    fetcher.set_delay(Duration::from_millis(500));
    fetcher.respond(&campaigns(), Ok(record("c1", "name", "from R1")));
    let queries = coordinator(fetcher.clone());

    // R1 is issued, then a newer value (R2's response) lands first.
    let key = campaigns();
    let r1 = queries.refetch(&key);
    let store = queries.store().clone();
    let key = key.clone();
    let r2 = async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      store.write(&key, EntryPatch::fetched(record("c1", "name", "from R2"), Instant::now()));
    };
    let (r1, ()) = tokio::join!(r1, r2);

    assert_eq!(r1.unwrap(), record("c1", "name", "from R2"));
    let entry = queries.store().read(&campaigns());
    assert_eq!(entry.value, Some(record("c1", "name", "from R2")));
    assert_eq!(entry.status, FetchStatus::Success);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_errors_are_retried() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond(&campaigns(), Err(SyncError::Network("reset".into())));
    fetcher.respond(
      &campaigns(),
      Err(SyncError::Server {
        status: 502,
        body: serde_json::Value::Null,
      }),
    );
    fetcher.respond(&campaigns(), Ok(record("c1", "name", "Spring")));
    let queries = coordinator(fetcher.clone());

    let value = queries.fetch(&campaigns(), &QueryOptions::default()).await;
    assert_eq!(value.unwrap(), record("c1", "name", "Spring"));
    assert_eq!(fetcher.calls_for(&campaigns()), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_validation_and_auth_errors_are_not_retried() {
    let fetcher = ScriptedFetcher::new();
    let leads = CacheKey::new("leads");
    fetcher.always(
      &campaigns(),
      Err(SyncError::Validation {
        status: 422,
        body: serde_json::Value::Null,
      }),
    );
    fetcher.always(
      &leads,
      Err(SyncError::Auth {
        status: 401,
        message: "expired".into(),
      }),
    );
    let queries = coordinator(fetcher.clone());

    assert!(queries.fetch(&campaigns(), &QueryOptions::default()).await.is_err());
    assert!(queries.fetch(&leads, &QueryOptions::default()).await.is_err());
    assert_eq!(fetcher.calls_for(&campaigns()), 1);
    assert_eq!(fetcher.calls_for(&leads), 1);

    let snapshot = queries.get(&leads, &QueryOptions::default().enabled(false));
    assert!(snapshot.is_error());
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_resolves_as_network_error() {
    let fetcher = ScriptedFetcher::new();
    fetcher.set_delay(Duration::from_secs(60));
    fetcher.always(&campaigns(), Ok(record("c1", "name", "Spring")));
    let config = QueryConfig {
      retry: RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default()
      },
      fetch_timeout: Duration::from_secs(5),
    };
    let queries = QueryCoordinator::new(CacheStore::new(), fetcher, config);

    let err = queries.fetch(&campaigns(), &QueryOptions::default()).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_refresh_keeps_stale_value() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond(&campaigns(), Ok(record("c1", "name", "Spring")));
    fetcher.always(
      &campaigns(),
      Err(SyncError::Validation {
        status: 400,
        body: serde_json::Value::Null,
      }),
    );
    let queries = coordinator(fetcher);

    queries.fetch(&campaigns(), &QueryOptions::default()).await.unwrap();
    assert!(queries.refetch(&campaigns()).await.is_err());

    let snapshot = queries.get(&campaigns(), &QueryOptions::default().enabled(false));
    assert_eq!(snapshot.data(), Some(&record("c1", "name", "Spring")));
    assert!(!snapshot.is_error());
    assert!(snapshot.error().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_resource_only_touches_subscribed_keys() {
    let fetcher = ScriptedFetcher::new();
    let watched = CacheKey::new("leads").param("page", 1);
    let unwatched = CacheKey::new("leads").param("page", 2);
    fetcher.always(&watched, Ok(record("l1", "score", 10)));
    fetcher.always(&unwatched, Ok(record("l2", "score", 20)));
    let queries = coordinator(fetcher.clone());

    queries.fetch(&watched, &QueryOptions::default()).await.unwrap();
    queries.fetch(&unwatched, &QueryOptions::default()).await.unwrap();
    let _sub = queries.store().subscribe(&watched, |_, _| {});

    let refreshed = queries.invalidate_resource("leads");
    assert_eq!(refreshed, vec![watched.clone()]);
    assert!(queries.invalidate_resource("campaigns").is_empty());

    queries.refetch(&watched).await.unwrap();
    assert_eq!(fetcher.calls_for(&watched), 2);
    assert_eq!(fetcher.calls_for(&unwatched), 1);
    assert!(!queries.store().read(&unwatched).invalidated);
  }

  #[test]
  fn test_backoff_is_bounded() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay(0), Duration::from_millis(500));
    assert_eq!(policy.delay(1), Duration::from_secs(1));
    assert_eq!(policy.delay(2), Duration::from_secs(2));
    assert_eq!(policy.delay(40), Duration::from_secs(8));
  }
}
