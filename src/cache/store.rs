//! In-memory cache store: entries, generation clock and subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::trace;

use super::entry::{CacheEntry, EntryPatch};
use super::key::CacheKey;

/// Callback invoked after every write to a subscribed key.
pub type Listener = Arc<dyn Fn(&CacheKey, &CacheEntry) + Send + Sync>;

#[derive(Default)]
struct Inner {
  entries: HashMap<CacheKey, CacheEntry>,
  listeners: HashMap<CacheKey, Vec<(u64, Listener)>>,
  /// Store-wide generation clock. Every value-bearing write takes the next tick,
  /// so generations are monotonic per key and comparable across keys.
  clock: u64,
  next_listener_id: u64,
}

impl Inner {
  fn listeners_for(&self, key: &CacheKey) -> Vec<Listener> {
    self
      .listeners
      .get(key)
      .map(|ls| ls.iter().map(|(_, l)| Arc::clone(l)).collect())
      .unwrap_or_default()
  }
}

/// Keyed table of cache entries. Pure data holder; never touches the network.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone, Default)]
pub struct CacheStore {
  inner: Arc<Mutex<Inner>>,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Current entry for `key`, or an idle default if nothing is cached.
  pub fn read(&self, key: &CacheKey) -> CacheEntry {
    self.lock().entries.get(key).cloned().unwrap_or_default()
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.lock().entries.contains_key(key)
  }

  /// Merge `patch` into the entry, creating it if needed. Returns the entry's
  /// generation after the write.
  pub fn write(&self, key: &CacheKey, patch: EntryPatch) -> u64 {
    self
      .write_when(key, |_| true, patch)
      .unwrap_or_default()
  }

  /// Merge `patch` only if `condition` holds for the current entry. The check
  /// and the write happen under one lock. Returns `None` if the write was skipped.
  pub fn write_when<F>(&self, key: &CacheKey, condition: F, patch: EntryPatch) -> Option<u64>
  where
    F: FnOnce(&CacheEntry) -> bool,
  {
    let (entry, listeners) = {
      let mut inner = self.lock();
      let current = inner.entries.get(key).cloned().unwrap_or_default();
      if !condition(&current) {
        return None;
      }

      let generation = if patch.carries_value() {
        inner.clock += 1;
        inner.clock
      } else {
        current.generation
      };

      let entry = inner.entries.entry(key.clone()).or_default();
      patch.apply(entry, generation);
      let entry = entry.clone();
      (entry, inner.listeners_for(key))
    };

    trace!(key = %key, generation = entry.generation, status = ?entry.status, "cache write");
    for listener in listeners {
      listener(key, &entry);
    }
    Some(entry.generation)
  }

  /// Mark an entry stale without evicting its value. Returns false if the key
  /// has no entry.
  pub fn mark_stale(&self, key: &CacheKey) -> bool {
    let (entry, listeners) = {
      let mut inner = self.lock();
      let Some(entry) = inner.entries.get_mut(key) else {
        return false;
      };
      entry.invalidated = true;
      let entry = entry.clone();
      (entry, inner.listeners_for(key))
    };
    for listener in listeners {
      listener(key, &entry);
    }
    true
  }

  /// Register a listener. Listeners for a key run in registration order.
  pub fn subscribe<F>(&self, key: &CacheKey, listener: F) -> Subscription
  where
    F: Fn(&CacheKey, &CacheEntry) + Send + Sync + 'static,
  {
    let mut inner = self.lock();
    inner.next_listener_id += 1;
    let id = inner.next_listener_id;
    inner
      .listeners
      .entry(key.clone())
      .or_default()
      .push((id, Arc::new(listener)));

    Subscription {
      store: Arc::downgrade(&self.inner),
      key: key.clone(),
      id,
    }
  }

  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    self.lock().listeners.get(key).map(Vec::len).unwrap_or(0)
  }

  /// Keys of the given resource type that have at least one subscriber.
  pub fn active_keys(&self, resource: &str) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self
      .lock()
      .listeners
      .iter()
      .filter(|(key, ls)| key.is_resource(resource) && !ls.is_empty())
      .map(|(key, _)| key.clone())
      .collect();
    keys.sort();
    keys
  }

  /// All keys that currently hold an entry.
  pub fn keys(&self) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self.lock().entries.keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Evict one entry. Subscribers stay registered and see an idle entry.
  pub fn clear(&self, key: &CacheKey) {
    let listeners = {
      let mut inner = self.lock();
      if inner.entries.remove(key).is_none() {
        return;
      }
      inner.listeners_for(key)
    };
    let empty = CacheEntry::default();
    for listener in listeners {
      listener(key, &empty);
    }
  }

  /// Evict every entry.
  pub fn clear_all(&self) {
    let keys = self.keys();
    for key in keys {
      self.clear(&key);
    }
  }

  /// Evict every entry and drop every listener. The generation clock is kept
  /// so stamps stay monotonic for anything still holding one.
  pub fn dispose(&self) {
    let mut inner = self.lock();
    inner.entries.clear();
    inner.listeners.clear();
  }
}

/// Handle for a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  store: Weak<Mutex<Inner>>,
  key: CacheKey,
  id: u64,
}

impl Subscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let Some(inner) = self.store.upgrade() else {
      return;
    };
    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(listeners) = inner.listeners.get_mut(&self.key) {
      listeners.retain(|(id, _)| *id != self.id);
      if listeners.is_empty() {
        inner.listeners.remove(&self.key);
      }
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish()
  }
}
