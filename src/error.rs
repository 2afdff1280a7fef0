//! Error taxonomy shared by every coordinator.

use thiserror::Error;

/// Errors surfaced by fetches, mutations and job tracking.
///
/// `SyncError` is `Clone` because one fetch outcome is handed to every
/// deduplicated waiter and is also stored on the cache entry.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
  /// Transport failure or timeout. Transient.
  #[error("network error: {0}")]
  Network(String),

  /// Expired or invalid credential.
  #[error("authentication failed ({status}): {message}")]
  Auth { status: u16, message: String },

  /// Non-auth 4xx. Never retried.
  #[error("request rejected ({status}): {body}")]
  Validation {
    status: u16,
    body: serde_json::Value,
  },

  /// 5xx from the server. Retried with backoff by queries.
  #[error("server error ({status}): {body}")]
  Server {
    status: u16,
    body: serde_json::Value,
  },

  /// The server no longer knows the tracked job.
  #[error("job not found: {0}")]
  JobNotFound(String),

  /// The job never reached a terminal phase within the attempt ceiling.
  #[error("job did not finish after {attempts} status polls")]
  JobTimeout { attempts: u32 },

  /// The response body did not have a recognised shape.
  #[error("invalid payload: {0}")]
  Decode(String),

  /// An operation was called from a phase that does not allow it.
  #[error("invalid state: {0}")]
  InvalidState(String),

  /// Durable client storage failed.
  #[error("storage error: {0}")]
  Storage(String),
}

impl SyncError {
  /// Build an error from a non-2xx status and its (possibly empty) body.
  pub fn from_status(status: u16, body: serde_json::Value) -> Self {
    match status {
      401 | 403 => SyncError::Auth {
        status,
        message: body
          .get("message")
          .or_else(|| body.get("error"))
          .and_then(|v| v.as_str())
          .map(String::from)
          .unwrap_or_else(|| body.to_string()),
      },
      500..=599 => SyncError::Server { status, body },
      _ => SyncError::Validation { status, body },
    }
  }

  /// Network and server errors may succeed on a later attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(self, SyncError::Network(_) | SyncError::Server { .. })
  }

  pub fn is_auth(&self) -> bool {
    matches!(self, SyncError::Auth { .. })
  }

  /// HTTP status carried by the error, if any.
  pub fn status(&self) -> Option<u16> {
    match self {
      SyncError::Auth { status, .. }
      | SyncError::Validation { status, .. }
      | SyncError::Server { status, .. } => Some(*status),
      _ => None,
    }
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      SyncError::Decode(e.to_string())
    } else {
      SyncError::Network(e.to_string())
    }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Decode(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_status_classification() {
    assert!(SyncError::from_status(401, json!({})).is_auth());
    assert!(SyncError::from_status(403, json!({"message": "nope"})).is_auth());
    assert!(matches!(
      SyncError::from_status(422, json!({"field": "share"})),
      SyncError::Validation { status: 422, .. }
    ));
    assert!(SyncError::from_status(503, json!(null)).is_retryable());
    assert!(!SyncError::from_status(400, json!(null)).is_retryable());
  }

  #[test]
  fn test_auth_message_from_body() {
    let err = SyncError::from_status(401, json!({"message": "token expired"}));
    assert_eq!(
      err,
      SyncError::Auth {
        status: 401,
        message: "token expired".to_string()
      }
    );
  }
}
