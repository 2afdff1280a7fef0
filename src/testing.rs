//! Test doubles shared by the coordinator tests.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::{Payload, Record};
use crate::cache::CacheKey;
use crate::error::SyncError;
use crate::query::Fetcher;

pub(crate) fn record(id: &str, field: &str, value: impl Into<serde_json::Value>) -> Payload {
  Payload::Record(Record::new(id).with(field, value))
}

/// Fetcher with scripted per-key responses that counts every call.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
  queued: Mutex<HashMap<CacheKey, VecDeque<Result<Payload, SyncError>>>>,
  fallback: Mutex<HashMap<CacheKey, Result<Payload, SyncError>>>,
  delay: Mutex<Duration>,
  calls: Mutex<Vec<CacheKey>>,
}

impl ScriptedFetcher {
  pub fn new() -> std::sync::Arc<Self> {
    std::sync::Arc::new(Self::default())
  }

  /// Queue a one-shot response for `key`.
  pub fn respond(&self, key: &CacheKey, result: Result<Payload, SyncError>) {
    self
      .queued
      .lock()
      .unwrap()
      .entry(key.clone())
      .or_default()
      .push_back(result);
  }

  /// Response returned once the queue for `key` is empty.
  pub fn always(&self, key: &CacheKey, result: Result<Payload, SyncError>) {
    self.fallback.lock().unwrap().insert(key.clone(), result);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = delay;
  }

  pub fn calls_for(&self, key: &CacheKey) -> usize {
    self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl Fetcher for ScriptedFetcher {
  fn fetch(&self, key: &CacheKey) -> BoxFuture<'static, Result<Payload, SyncError>> {
    self.calls.lock().unwrap().push(key.clone());
    let queued = self
      .queued
      .lock()
      .unwrap()
      .get_mut(key)
      .and_then(VecDeque::pop_front);
    let result = queued
      .or_else(|| self.fallback.lock().unwrap().get(key).cloned())
      .unwrap_or_else(|| {
        Err(SyncError::Validation {
          status: 404,
          body: serde_json::Value::Null,
        })
      });
    let delay = *self.delay.lock().unwrap();

    async move {
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      result
    }
    .boxed()
  }
}
