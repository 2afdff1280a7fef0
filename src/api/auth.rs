//! Credential collaborator.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

use crate::config::Config;
use crate::error::SyncError;

/// Supplies bearer tokens and hears about rejected ones.
///
/// Auth errors are never retried locally; refreshing the credential or
/// sending the user back to login is the provider's business.
pub trait CredentialProvider: Send + Sync {
  fn token(&self) -> Option<String>;

  fn on_auth_failure(&self, error: &SyncError) {
    warn!(error = %error, "credential rejected");
  }
}

/// A fixed token, typically from the environment.
#[derive(Debug, Default)]
pub struct StaticToken {
  token: Option<String>,
  failures: AtomicUsize,
}

impl StaticToken {
  pub fn new(token: impl Into<String>) -> Self {
    Self {
      token: Some(token.into()),
      failures: AtomicUsize::new(0),
    }
  }

  /// No credential; requests go out without an Authorization header.
  pub fn anonymous() -> Self {
    Self::default()
  }

  /// Token from `RESYNC_API_TOKEN` or `API_TOKEN`, anonymous if neither is set.
  pub fn from_env() -> Self {
    Config::get_api_token()
      .map(Self::new)
      .unwrap_or_else(|_| Self::anonymous())
  }

  /// Number of auth failures reported so far.
  pub fn failures(&self) -> usize {
    self.failures.load(Ordering::Relaxed)
  }
}

impl CredentialProvider for StaticToken {
  fn token(&self) -> Option<String> {
    self.token.clone()
  }

  fn on_auth_failure(&self, error: &SyncError) {
    let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
    warn!(error = %error, failures, "API token rejected, set a fresh RESYNC_API_TOKEN");
  }
}
