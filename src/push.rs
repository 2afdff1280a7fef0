//! Push-driven invalidation.
//!
//! Change notifications carry only `{eventType, table}`, so the only correct
//! reaction is "revalidate": every subscribed key whose resource type equals
//! the table is marked stale (keeping its value on screen) and refetched.
//! Keys nobody is watching are left alone.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheKey;
use crate::error::SyncError;
use crate::query::QueryCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
  #[serde(alias = "INSERT")]
  Insert,
  #[serde(alias = "UPDATE")]
  Update,
  #[serde(alias = "DELETE")]
  Delete,
}

/// One server-pushed change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
  #[serde(rename = "eventType")]
  pub event_type: ChangeKind,
  pub table: String,
}

impl ChangeEvent {
  pub fn new(table: impl Into<String>, event_type: ChangeKind) -> Self {
    Self {
      event_type,
      table: table.into(),
    }
  }
}

/// External push channel: one stream of notifications per table.
pub trait PushTransport: Send + Sync {
  fn listen(&self, table: &str) -> Result<BoxStream<'static, ChangeEvent>, SyncError>;
}

/// In-process transport backed by a broadcast channel. Whatever bridges the
/// real realtime connection publishes into it.
#[derive(Clone)]
pub struct BroadcastTransport {
  tx: broadcast::Sender<ChangeEvent>,
}

impl BroadcastTransport {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Publish an event. Returns the number of listening channels.
  pub fn publish(&self, event: ChangeEvent) -> usize {
    self.tx.send(event).unwrap_or(0)
  }
}

impl Default for BroadcastTransport {
  fn default() -> Self {
    Self::new(256)
  }
}

impl PushTransport for BroadcastTransport {
  fn listen(&self, table: &str) -> Result<BoxStream<'static, ChangeEvent>, SyncError> {
    let rx = self.tx.subscribe();
    let table = table.to_string();
    let stream = futures::stream::unfold(rx, move |mut rx| {
      let table = table.clone();
      async move {
        loop {
          match rx.recv().await {
            Ok(event) if event.table == table => return Some((event, rx)),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
              // Whatever we missed, the table needs revalidating.
              warn!(table = %table, skipped, "push channel lagged");
              return Some((ChangeEvent::new(table, ChangeKind::Update), rx));
            }
            Err(broadcast::error::RecvError::Closed) => return None,
          }
        }
      }
    });
    Ok(stream.boxed())
  }
}

struct Channel {
  id: u64,
  refs: usize,
  task: JoinHandle<()>,
}

/// Ref-counted table subscriptions that funnel notifications into
/// `QueryCoordinator::invalidate_resource`.
#[derive(Clone)]
pub struct PushInvalidator {
  queries: QueryCoordinator,
  transport: Arc<dyn PushTransport>,
  channels: Arc<Mutex<HashMap<String, Channel>>>,
  next_channel_id: Arc<AtomicU64>,
}

impl PushInvalidator {
  pub fn new(queries: QueryCoordinator, transport: Arc<dyn PushTransport>) -> Self {
    Self {
      queries,
      transport,
      channels: Arc::new(Mutex::new(HashMap::new())),
      next_channel_id: Arc::new(AtomicU64::new(0)),
    }
  }

  fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
    self.channels.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Subscribe to a table. A second subscription reuses the open channel.
  pub fn subscribe_table(&self, table: &str) -> Result<TableHandle, SyncError> {
    let mut channels = self.channels();
    let channel_id = if let Some(channel) = channels.get_mut(table) {
      channel.refs += 1;
      debug!(table, refs = channel.refs, "reusing push channel");
      channel.id
    } else {
      let mut stream = self.transport.listen(table)?;
      let invalidator = self.clone();
      let task = tokio::spawn(async move {
        while let Some(event) = stream.next().await {
          invalidator.handle_event(&event);
        }
      });
      let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
      channels.insert(table.to_string(), Channel { id, refs: 1, task });
      info!(table, channel = id, "push channel opened");
      id
    };

    Ok(TableHandle {
      invalidator: self.clone(),
      table: table.to_string(),
      channel_id,
    })
  }

  /// Drop one reference to channel `id`. A no-op if that channel was already
  /// torn down, even when a newer channel serves the same table.
  fn release(&self, table: &str, id: u64) {
    let mut channels = self.channels();
    let Some(channel) = channels.get_mut(table).filter(|c| c.id == id) else {
      return;
    };
    channel.refs -= 1;
    if channel.refs == 0 {
      if let Some(channel) = channels.remove(table) {
        channel.task.abort();
      }
      info!(table, "push channel closed");
    }
  }

  /// Number of live handles for `table`.
  pub fn ref_count(&self, table: &str) -> usize {
    self.channels().get(table).map_or(0, |c| c.refs)
  }

  /// React to one notification. Returns the keys that were refetched.
  pub fn handle_event(&self, event: &ChangeEvent) -> Vec<CacheKey> {
    let refreshed = self.queries.invalidate_resource(&event.table);
    debug!(
      table = %event.table,
      kind = ?event.event_type,
      refreshed = refreshed.len(),
      "push notification"
    );
    refreshed
  }

  /// Tear down every channel regardless of outstanding handles.
  pub fn shutdown(&self) {
    for (table, channel) in self.channels().drain() {
      channel.task.abort();
      debug!(table = %table, "push channel torn down");
    }
  }
}

/// A table subscription. Dropping it releases one reference.
#[must_use = "dropping a TableHandle releases the subscription"]
pub struct TableHandle {
  invalidator: PushInvalidator,
  table: String,
  channel_id: u64,
}

impl TableHandle {
  pub fn table(&self) -> &str {
    &self.table
  }

  pub fn unsubscribe(self) {}
}

impl Drop for TableHandle {
  fn drop(&mut self) {
    self.invalidator.release(&self.table, self.channel_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStore;
  use crate::query::{QueryConfig, QueryOptions};
  use crate::testing::{record, ScriptedFetcher};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  struct CountingTransport {
    inner: BroadcastTransport,
    listens: AtomicUsize,
  }

  impl PushTransport for CountingTransport {
    fn listen(&self, table: &str) -> Result<BoxStream<'static, ChangeEvent>, SyncError> {
      self.listens.fetch_add(1, Ordering::SeqCst);
      self.inner.listen(table)
    }
  }

  fn setup() -> (Arc<ScriptedFetcher>, Arc<CountingTransport>, PushInvalidator) {
    let fetcher = ScriptedFetcher::new();
    let queries = QueryCoordinator::new(CacheStore::new(), fetcher.clone(), QueryConfig::default());
    let transport = Arc::new(CountingTransport {
      inner: BroadcastTransport::default(),
      listens: AtomicUsize::new(0),
    });
    let invalidator = PushInvalidator::new(queries, transport.clone());
    (fetcher, transport, invalidator)
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_notification_for_unwatched_table_fetches_nothing() {
    let (fetcher, transport, invalidator) = setup();
    let leads = CacheKey::new("leads").param("page", 1);
    let campaigns = CacheKey::new("campaigns").param("page", 1);
    fetcher.always(&leads, Ok(record("l1", "score", 10)));
    fetcher.always(&campaigns, Ok(record("c1", "name", "Spring")));

    invalidator.queries.fetch(&leads, &QueryOptions::default()).await.unwrap();
    invalidator.queries.fetch(&campaigns, &QueryOptions::default()).await.unwrap();
    let _sub = invalidator.queries.store().subscribe(&leads, |_, _| {});
    let _handle = invalidator.subscribe_table("campaigns").unwrap();

    transport
      .inner
      .publish(ChangeEvent::new("campaigns", ChangeKind::Update));
    settle().await;

    assert_eq!(fetcher.calls_for(&leads), 1);
    assert_eq!(fetcher.calls_for(&campaigns), 1);
    assert!(!invalidator.queries.store().read(&campaigns).invalidated);
  }

  #[tokio::test(start_paused = true)]
  async fn test_notification_refetches_watched_keys_and_keeps_value() {
    let (fetcher, transport, invalidator) = setup();
    let leads = CacheKey::new("leads").param("page", 1);
    fetcher.respond(&leads, Ok(record("l1", "score", 10)));
    fetcher.respond(&leads, Ok(record("l1", "score", 99)));
    invalidator.queries.fetch(&leads, &QueryOptions::default()).await.unwrap();

    let _sub = invalidator.queries.store().subscribe(&leads, |_, _| {});
    let _handle = invalidator.subscribe_table("leads").unwrap();
    fetcher.set_delay(Duration::from_millis(100));

    transport
      .inner
      .publish(ChangeEvent::new("leads", ChangeKind::Insert));
    settle().await;

    // Refresh in flight: last known value still served
    let entry = invalidator.queries.store().read(&leads);
    assert_eq!(entry.value, Some(record("l1", "score", 10)));
    assert!(invalidator.queries.is_fetching(&leads));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
      invalidator.queries.store().read(&leads).value,
      Some(record("l1", "score", 99))
    );
    assert_eq!(fetcher.calls_for(&leads), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_table_subscriptions_are_ref_counted() {
    let (_, transport, invalidator) = setup();

    let first = invalidator.subscribe_table("leads").unwrap();
    let second = invalidator.subscribe_table("leads").unwrap();
    assert_eq!(transport.listens.load(Ordering::SeqCst), 1);
    assert_eq!(invalidator.ref_count("leads"), 2);

    drop(first);
    assert_eq!(invalidator.ref_count("leads"), 1);
    second.unsubscribe();
    assert_eq!(invalidator.ref_count("leads"), 0);
    settle().await;
    assert_eq!(
      transport
        .inner
        .publish(ChangeEvent::new("leads", ChangeKind::Delete)),
      0
    );

    let _again = invalidator.subscribe_table("leads").unwrap();
    assert_eq!(transport.listens.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_handle_from_before_shutdown_leaves_new_channel_alone() {
    let (_, transport, invalidator) = setup();

    let stale = invalidator.subscribe_table("leads").unwrap();
    invalidator.shutdown();
    assert_eq!(invalidator.ref_count("leads"), 0);

    let fresh = invalidator.subscribe_table("leads").unwrap();
    assert_eq!(transport.listens.load(Ordering::SeqCst), 2);
    drop(stale);
    assert_eq!(invalidator.ref_count("leads"), 1);

    settle().await;
    assert_eq!(
      transport
        .inner
        .publish(ChangeEvent::new("leads", ChangeKind::Update)),
      1
    );
    fresh.unsubscribe();
    assert_eq!(invalidator.ref_count("leads"), 0);
  }

  #[test]
  fn test_event_wire_format() {
    let event: ChangeEvent =
      serde_json::from_str(r#"{"eventType": "UPDATE", "table": "campaigns"}"#).unwrap();
    assert_eq!(event, ChangeEvent::new("campaigns", ChangeKind::Update));
  }
}
