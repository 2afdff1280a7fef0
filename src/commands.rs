//! Command handlers for the `resync` binary.

use color_eyre::{eyre::eyre, Result};
use resync::cache::{CacheEntry, CacheKey};
use resync::config::Config;
use resync::job::{JobPhase, JobRecord};
use resync::poll::Cadence;
use resync::push::{BroadcastTransport, ChangeEvent};
use resync::SyncContext;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

fn cache_key(resource: &str, params: Vec<(String, String)>) -> CacheKey {
  params
    .into_iter()
    .fold(CacheKey::new(resource), |key, (name, value)| key.param(name, value))
}

fn print_entry(key: &CacheKey, entry: &CacheEntry) {
  let value = entry
    .value
    .as_ref()
    .and_then(|v| serde_json::to_string(v).ok())
    .unwrap_or_else(|| "null".to_string());
  match &entry.error {
    Some(error) => println!("{} [{:?}] {} (error: {})", key, entry.status, value, error),
    None => println!("{} [{:?}] {}", key, entry.status, value),
  }
}

fn print_record(record: &JobRecord) {
  let Some(job_id) = &record.job_id else {
    println!("no job tracked");
    if let Some(error) = &record.error {
      println!("last error: {}", error);
    }
    return;
  };

  println!("job:       {}", job_id);
  println!("phase:     {}", record.phase);
  println!("polls:     {}", record.attempts);
  if let Some(at) = record.last_polled_at {
    println!("polled at: {}", at.to_rfc3339());
  }
  println!("persisted: {}", record.persisted);
  if let Some(result) = &record.result {
    println!(
      "result:    {}",
      serde_json::to_string_pretty(result).unwrap_or_default()
    );
  }
  if let Some(error) = &record.error {
    println!("error:     {}", error);
  }
}

/// Fetch once and print the validated payload.
pub async fn get(
  ctx: &SyncContext,
  config: &Config,
  resource: &str,
  params: Vec<(String, String)>,
) -> Result<()> {
  let key = cache_key(resource, params);
  let payload = ctx.queries().fetch(&key, &config.query.options()).await?;
  println!("{}", serde_json::to_string_pretty(&payload)?);
  Ok(())
}

/// Subscribe, poll and optionally react to change notifications until Ctrl-C.
pub async fn watch(
  ctx: &SyncContext,
  config: &Config,
  transport: &BroadcastTransport,
  resource: &str,
  params: Vec<(String, String)>,
  every: u64,
  table: Option<String>,
) -> Result<()> {
  let key = cache_key(resource, params);
  let _subscription = ctx.store().subscribe(&key, |key, entry| {
    if !entry.status.is_loading() {
      print_entry(key, entry);
    }
  });
  let poll = ctx
    .scheduler()
    .register(&key, Cadence::Fixed(Duration::from_secs(every.max(1))));

  let _table = match &table {
    Some(table) => Some(ctx.push().subscribe_table(table)?),
    None => None,
  };
  let bridge = table.map(|_| tokio::spawn(forward_stdin(transport.clone())));

  ctx.queries().get(&key, &config.query.options());
  info!(key = %key, every, "watching");

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  if let Some(bridge) = bridge {
    bridge.abort();
  }
  poll.cancel();
  Ok(())
}

/// Publish change notifications read as JSON lines from stdin.
async fn forward_stdin(transport: BroadcastTransport) {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) if line.trim().is_empty() => continue,
      Ok(Some(line)) => match serde_json::from_str::<ChangeEvent>(&line) {
        Ok(event) => {
          transport.publish(event);
        }
        Err(e) => warn!(error = %e, "ignoring malformed change notification"),
      },
      Ok(None) => return,
      Err(e) => {
        warn!(error = %e, "stdin closed");
        return;
      }
    }
  }
}

/// Wait until the job has been polled at least once or needs no polling.
async fn settle(ctx: &SyncContext) -> Result<JobRecord> {
  let mut rx = ctx.jobs().watch();
  let record = rx
    .wait_for(|r| r.job_id.is_none() || r.attempts > 0 || r.phase.is_terminal())
    .await
    .map_err(|e| eyre!("Job poller stopped: {}", e))?
    .clone();
  Ok(record)
}

/// Trigger a job and print each phase until it is terminal or Ctrl-C.
pub async fn job_trigger(ctx: &SyncContext, force: bool) -> Result<()> {
  ctx.jobs().init(None)?;
  let job_id = ctx.jobs().trigger(force).await?;
  println!("triggered job {}", job_id);

  let mut rx = ctx.jobs().watch();
  let mut last = JobPhase::NotStarted;
  loop {
    let record = rx.borrow_and_update().clone();
    if record.phase != last {
      println!("{}", record.phase);
      last = record.phase;
    }
    if record.job_id.is_none() || record.phase.is_terminal() {
      print_record(&record);
      return Ok(());
    }

    tokio::select! {
      changed = rx.changed() => changed.map_err(|e| eyre!("Job poller stopped: {}", e))?,
      _ = tokio::signal::ctrl_c() => {
        println!("still {}; run `resync job status` to resume", record.phase);
        return Ok(());
      }
    }
  }
}

pub async fn job_status(ctx: &SyncContext) -> Result<()> {
  let record = ctx.jobs().init(None)?;
  if record.job_id.is_none() {
    print_record(&record);
    return Ok(());
  }
  print_record(&settle(ctx).await?);
  Ok(())
}

pub async fn job_confirm(ctx: &SyncContext) -> Result<()> {
  ctx.jobs().init(None)?;
  let record = settle(ctx).await?;
  if record.phase != JobPhase::Completed {
    return Err(eyre!(
      "job {} is {}, only completed jobs can be confirmed",
      record.job_id.as_deref().unwrap_or("-"),
      record.phase
    ));
  }
  ctx.jobs().confirm().await?;
  println!("confirmed");
  Ok(())
}

pub fn job_clear(ctx: &SyncContext) -> Result<()> {
  ctx.jobs().clear()?;
  println!("cleared");
  Ok(())
}
