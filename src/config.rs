use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::job::JobPollerConfig;
use crate::query::{QueryConfig, QueryOptions, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub query: QuerySettings,
  #[serde(default)]
  pub polling: PollingSettings,
  #[serde(default)]
  pub jobs: JobsSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Path templates per resource, e.g. `campaigns: /clients/{clientId}/campaigns`.
  /// Resources without an entry use `/{resource}`.
  #[serde(default)]
  pub routes: BTreeMap<String, String>,
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
  pub stale_time_secs: u64,
  pub fetch_timeout_secs: u64,
  /// Total attempts for transient errors, including the first
  pub retry_attempts: u32,
  pub backoff_base_ms: u64,
  pub backoff_max_ms: u64,
}

impl Default for QuerySettings {
  fn default() -> Self {
    Self {
      stale_time_secs: 30,
      fetch_timeout_secs: 15,
      retry_attempts: 3,
      backoff_base_ms: 500,
      backoff_max_ms: 8_000,
    }
  }
}

impl QuerySettings {
  pub fn query_config(&self) -> QueryConfig {
    QueryConfig {
      retry: RetryPolicy {
        max_attempts: self.retry_attempts.max(1),
        base_delay: Duration::from_millis(self.backoff_base_ms),
        max_delay: Duration::from_millis(self.backoff_max_ms),
      },
      fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
    }
  }

  pub fn options(&self) -> QueryOptions {
    QueryOptions::default().stale_time(Duration::from_secs(self.stale_time_secs))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
  /// Period of the shared poll timer
  pub tick_ms: u64,
}

impl Default for PollingSettings {
  fn default() -> Self {
    Self { tick_ms: 1_000 }
  }
}

impl PollingSettings {
  pub fn tick(&self) -> Duration {
    Duration::from_millis(self.tick_ms.max(10))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsSettings {
  pub trigger_path: String,
  /// Must contain `{jobId}`
  pub status_path: String,
  /// Must contain `{jobId}`
  pub result_path: String,
  pub confirm_path: String,
  pub poll_interval_secs: u64,
  pub max_attempts: u32,
}

impl Default for JobsSettings {
  fn default() -> Self {
    Self {
      trigger_path: "/jobs/trigger".to_string(),
      status_path: "/jobs/status/{jobId}".to_string(),
      result_path: "/jobs/result/{jobId}".to_string(),
      confirm_path: "/jobs/confirm".to_string(),
      poll_interval_secs: 3,
      max_attempts: 200,
    }
  }
}

impl JobsSettings {
  pub fn poller_config(&self) -> JobPollerConfig {
    JobPollerConfig {
      poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
      max_attempts: self.max_attempts.max(1),
    }
  }
}

fn default_request_timeout_secs() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./resync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/resync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/resync/config.yaml\n\
                 See resync.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("resync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("resync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse a YAML document.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if !config.jobs.status_path.contains("{jobId}") {
      return Err(eyre!("jobs.status_path must contain {{jobId}}"));
    }
    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks RESYNC_API_TOKEN first, then API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("RESYNC_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .map_err(|_| eyre!("API token not found. Set RESYNC_API_TOKEN or API_TOKEN environment variable."))
  }
}
