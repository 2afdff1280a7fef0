//! One client context: the store and every coordinator that shares it.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::ApiClient;
use crate::cache::CacheStore;
use crate::config::Config;
use crate::job::{JobApi, JobPoller, JobPollerConfig, JobStorage, SqliteJobStorage};
use crate::mutation::MutationCoordinator;
use crate::poll::{PollScheduler, DEFAULT_TICK};
use crate::push::{PushInvalidator, PushTransport};
use crate::query::{Fetcher, QueryConfig, QueryCoordinator};

#[derive(Debug, Clone)]
pub struct ContextSettings {
  pub query: QueryConfig,
  pub poll_tick: Duration,
  pub jobs: JobPollerConfig,
}

impl Default for ContextSettings {
  fn default() -> Self {
    Self {
      query: QueryConfig::default(),
      poll_tick: DEFAULT_TICK,
      jobs: JobPollerConfig::default(),
    }
  }
}

impl ContextSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      query: config.query.query_config(),
      poll_tick: config.polling.tick(),
      jobs: config.jobs.poller_config(),
    }
  }
}

/// Explicitly constructed synchronization context. Independent contexts share
/// nothing, so each one can be torn down on its own.
pub struct SyncContext {
  store: CacheStore,
  queries: QueryCoordinator,
  mutations: MutationCoordinator,
  scheduler: PollScheduler,
  push: PushInvalidator,
  jobs: JobPoller,
}

impl SyncContext {
  pub fn new(
    fetcher: Arc<dyn Fetcher>,
    job_api: Arc<dyn JobApi>,
    job_storage: Arc<dyn JobStorage>,
    transport: Arc<dyn PushTransport>,
    settings: ContextSettings,
  ) -> Self {
    let store = CacheStore::new();
    let queries = QueryCoordinator::new(store.clone(), fetcher, settings.query);
    let mutations = MutationCoordinator::new(queries.clone());
    let scheduler = PollScheduler::new(queries.clone(), settings.poll_tick);
    let push = PushInvalidator::new(queries.clone(), transport);
    let jobs = JobPoller::new(
      queries.clone(),
      scheduler.clone(),
      job_api,
      job_storage,
      settings.jobs,
    );

    Self {
      store,
      queries,
      mutations,
      scheduler,
      push,
      jobs,
    }
  }

  /// Context talking to the configured API, with the job id persisted in
  /// SQLite under the data directory.
  pub fn from_config(config: &Config, transport: Arc<dyn PushTransport>) -> Result<Self> {
    let api = Arc::new(ApiClient::from_config(config)?);
    let storage = Arc::new(SqliteJobStorage::open()?);
    Ok(Self::new(
      api.clone(),
      api,
      storage,
      transport,
      ContextSettings::from_config(config),
    ))
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn queries(&self) -> &QueryCoordinator {
    &self.queries
  }

  pub fn mutations(&self) -> &MutationCoordinator {
    &self.mutations
  }

  pub fn scheduler(&self) -> &PollScheduler {
    &self.scheduler
  }

  pub fn push(&self) -> &PushInvalidator {
    &self.push
  }

  pub fn jobs(&self) -> &JobPoller {
    &self.jobs
  }

  /// Start the shared poll timer.
  pub fn start(&self) {
    self.scheduler.start();
  }

  /// Forward the UI's visibility signal to the poll scheduler.
  pub fn set_visible(&self, visible: bool) {
    self.scheduler.set_visible(visible);
  }

  /// Stop polling, tear down push channels and evict every entry.
  pub fn shutdown(&self) {
    self.jobs.shutdown();
    self.scheduler.shutdown();
    self.push.shutdown();
    self.store.dispose();
    info!("sync context shut down");
  }
}

impl Drop for SyncContext {
  fn drop(&mut self) {
    self.scheduler.stop();
    self.push.shutdown();
  }
}
