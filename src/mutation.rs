//! Optimistic mutations with generation-stamped rollback.
//!
//! Every mutation follows the same protocol:
//! 1. snapshot the target keys (the whole entry, including its generation)
//! 2. write the optimistic values produced by the updater
//! 3. run the server call
//! 4. on success, write any server-confirmed values and invalidate derived keys;
//!    on failure, restore each key whose generation is still the one this
//!    mutation stamped, and surface the error
//!
//! A rollback never clobbers a later write. If a later mutation is still
//! pending on the key, the snapshot is handed to it, so that if it fails too
//! the key returns to the state before the first of the two.
//!
//! Dropping a mutation's future before the server call settles rolls it back.
//!
//! Mutations are never retried automatically.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::Payload;
use crate::cache::{CacheEntry, CacheKey, EntryPatch, FetchStatus};
use crate::error::SyncError;
use crate::query::QueryCoordinator;

/// Lifecycle of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
  Pending,
  Committed,
  RolledBack,
}

/// State of one key captured before the optimistic write.
#[derive(Debug, Clone)]
struct Snapshot {
  entry: CacheEntry,
}

impl Snapshot {
  fn generation(&self) -> u64 {
    self.entry.generation
  }

  /// A fetch that was loading at snapshot time. Its response was discarded by
  /// the optimistic write, so restoring `Loading` verbatim would strand it.
  fn was_loading(&self) -> bool {
    self.entry.status.is_loading()
  }

  fn restore_patch(&self, fetch_running: bool) -> EntryPatch {
    let patch = EntryPatch::restore(&self.entry);
    if !self.was_loading() {
      return patch;
    }
    let status = match (fetch_running, &self.entry.value) {
      (true, _) => FetchStatus::Loading,
      (false, Some(_)) => FetchStatus::Success,
      (false, None) => FetchStatus::Idle,
    };
    patch.status(status).invalidated(true)
  }
}

/// Rolls a mutation back if its future is dropped while the server call is
/// still pending. A no-op once the mutation has committed or rolled back.
struct CancelGuard<'a> {
  mutations: &'a MutationCoordinator,
  id: u64,
}

impl Drop for CancelGuard<'_> {
  fn drop(&mut self) {
    if self.mutations.ledger().pending.contains_key(&self.id) {
      let error = SyncError::InvalidState("mutation cancelled before the server responded".into());
      self.mutations.rollback(self.id, &error);
    }
  }
}

/// Ledger entry for a pending mutation.
#[derive(Debug)]
pub struct MutationRecord {
  pub id: u64,
  pub target_keys: Vec<CacheKey>,
  snapshot: HashMap<CacheKey, Snapshot>,
  /// Generation this mutation wrote to each key it changed.
  stamps: HashMap<CacheKey, u64>,
  pub applied_generation: u64,
  pub outcome: MutationOutcome,
}

/// Which keys a mutation writes and which derived keys it invalidates on success.
#[derive(Debug, Clone, Default)]
pub struct MutationRequest {
  targets: Vec<CacheKey>,
  invalidate: Vec<CacheKey>,
}

impl MutationRequest {
  pub fn new(targets: impl IntoIterator<Item = CacheKey>) -> Self {
    let mut deduped: Vec<CacheKey> = Vec::new();
    for key in targets {
      if !deduped.contains(&key) {
        deduped.push(key);
      }
    }
    Self {
      targets: deduped,
      invalidate: Vec::new(),
    }
  }

  pub fn invalidate(mut self, keys: impl IntoIterator<Item = CacheKey>) -> Self {
    self.invalidate.extend(keys);
    self
  }
}

/// Server call result plus any values the server confirmed for target keys.
/// Keys without a confirmed value keep their optimistic value.
#[derive(Debug, Clone)]
pub struct Confirmed<R> {
  pub result: R,
  pub values: Vec<(CacheKey, Payload)>,
}

impl<R> Confirmed<R> {
  pub fn new(result: R) -> Self {
    Self {
      result,
      values: Vec::new(),
    }
  }

  pub fn with_value(mut self, key: CacheKey, value: Payload) -> Self {
    self.values.push((key, value));
    self
  }
}

#[derive(Default)]
struct Ledger {
  next_id: u64,
  /// Pending records in start order.
  pending: BTreeMap<u64, MutationRecord>,
}

/// Applies optimistic writes through the query coordinator's store.
#[derive(Clone)]
pub struct MutationCoordinator {
  queries: QueryCoordinator,
  ledger: Arc<Mutex<Ledger>>,
}

impl MutationCoordinator {
  pub fn new(queries: QueryCoordinator) -> Self {
    Self {
      queries,
      ledger: Arc::new(Mutex::new(Ledger::default())),
    }
  }

  fn ledger(&self) -> MutexGuard<'_, Ledger> {
    self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn pending_count(&self) -> usize {
    self.ledger().pending.len()
  }

  /// Check if any pending mutation targets `key`.
  pub fn is_pending(&self, key: &CacheKey) -> bool {
    self
      .ledger()
      .pending
      .values()
      .any(|r| r.target_keys.contains(key))
  }

  /// Run a mutation.
  ///
  /// `updater` receives each target key and its current value and returns the
  /// optimistic value, or `None` to leave that key untouched. `server_call`
  /// performs the write.
  pub async fn mutate<U, F, Fut, R>(
    &self,
    request: MutationRequest,
    updater: U,
    server_call: F,
  ) -> Result<R, SyncError>
  where
    U: FnMut(&CacheKey, Option<&Payload>) -> Option<Payload>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Confirmed<R>, SyncError>>,
  {
    let id = self.apply_optimistic(&request.targets, updater);
    let _guard = CancelGuard { mutations: self, id };

    match server_call().await {
      Ok(confirmed) => {
        self.commit(id, confirmed.values, &request.invalidate);
        Ok(confirmed.result)
      }
      Err(error) => {
        self.rollback(id, &error);
        Err(error)
      }
    }
  }

  fn apply_optimistic<U>(&self, targets: &[CacheKey], mut updater: U) -> u64
  where
    U: FnMut(&CacheKey, Option<&Payload>) -> Option<Payload>,
  {
    let store = self.queries.store();
    let mut snapshot = HashMap::new();
    let mut stamps = HashMap::new();

    for key in targets {
      // Snapshot and write must see the same generation.
      loop {
        let entry = store.read(key);
        let Some(optimistic) = updater(key, entry.value.as_ref()) else {
          snapshot.insert(key.clone(), Snapshot { entry });
          break;
        };
        let expected = entry.generation;
        let captured = Snapshot { entry };
        if let Some(generation) = store.write_when(
          key,
          |e| e.generation == expected,
          EntryPatch::optimistic(optimistic),
        ) {
          snapshot.insert(key.clone(), captured);
          stamps.insert(key.clone(), generation);
          break;
        }
      }
    }

    let applied_generation = stamps.values().copied().max().unwrap_or_default();
    let mut ledger = self.ledger();
    ledger.next_id += 1;
    let id = ledger.next_id;
    debug!(mutation = id, keys = targets.len(), applied_generation, "optimistic write applied");
    ledger.pending.insert(
      id,
      MutationRecord {
        id,
        target_keys: targets.to_vec(),
        snapshot,
        stamps,
        applied_generation,
        outcome: MutationOutcome::Pending,
      },
    );
    id
  }

  fn take(&self, id: u64, outcome: MutationOutcome) -> Option<MutationRecord> {
    let mut record = self.ledger().pending.remove(&id)?;
    record.outcome = outcome;
    Some(record)
  }

  fn commit(&self, id: u64, confirmed: Vec<(CacheKey, Payload)>, invalidate: &[CacheKey]) {
    let Some(record) = self.take(id, MutationOutcome::Committed) else {
      return;
    };
    let store = self.queries.store();

    for (key, value) in confirmed {
      let Some(&stamp) = record.stamps.get(&key) else {
        // Only write over the state this mutation saw; anything newer wins.
        let seen = record.snapshot.get(&key).map(Snapshot::generation);
        let patch = EntryPatch::fetched(value, Instant::now());
        let written = seen.and_then(|seen| store.write_when(&key, |e| e.generation == seen, patch));
        if written.is_none() {
          debug!(mutation = id, key = %key, "confirmed value not written, revalidating");
          self.queries.invalidate(&key);
        }
        continue;
      };
      let patch = EntryPatch::fetched(value.clone(), Instant::now());
      if store.write_when(&key, |e| e.generation == stamp, patch).is_none() {
        // A later write owns the key; it should fall back to our confirmed value.
        let mut entry = store.read(&key);
        EntryPatch::fetched(value, Instant::now()).apply(&mut entry, stamp);
        let confirmed_state = Snapshot { entry };
        self.hand_off(id, &key, confirmed_state);
      }
    }

    info!(mutation = id, applied_generation = record.applied_generation, "mutation committed");
    for key in invalidate {
      self.queries.invalidate(key);
    }
  }

  fn rollback(&self, id: u64, error: &SyncError) {
    let Some(record) = self.take(id, MutationOutcome::RolledBack) else {
      return;
    };
    let store = self.queries.store();

    for (key, stamp) in &record.stamps {
      let Some(snapshot) = record.snapshot.get(key) else {
        continue;
      };
      let stamp = *stamp;
      let fetch_running = self.queries.is_fetching(key);
      if store
        .write_when(key, |e| e.generation == stamp, snapshot.restore_patch(fetch_running))
        .is_some()
      {
        debug!(mutation = id, key = %key, "rolled back");
        if snapshot.was_loading() {
          self.queries.refresh_after_in_flight(key);
        }
      } else if !self.hand_off(id, key, snapshot.clone()) {
        debug!(mutation = id, key = %key, "rollback superseded by a later write");
      }
    }

    warn!(mutation = id, error = %error, "mutation rolled back");
  }

  /// Give `state` to the earliest pending mutation started after `id` that
  /// wrote `key`. Returns false if there is none.
  fn hand_off(&self, id: u64, key: &CacheKey, state: Snapshot) -> bool {
    let mut ledger = self.ledger();
    let later = ledger
      .pending
      .range_mut(id + 1..)
      .map(|(_, record)| record)
      .find(|record| record.stamps.contains_key(key));
    match later {
      Some(record) => {
        debug!(from = id, to = record.id, key = %key, "handing rollback target to later mutation");
        record.snapshot.insert(key.clone(), state);
        true
      }
      None => false,
    }
  }
}
