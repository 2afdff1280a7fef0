//! Job lifecycle types.

use chrono::{DateTime, Utc};
use std::fmt;
use tracing::warn;

use crate::api::Payload;
use crate::error::SyncError;

/// Lifecycle phase of a tracked server-side job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum JobPhase {
  #[default]
  NotStarted,
  Queued,
  Running,
  Completed,
  Failed,
}

impl JobPhase {
  /// Map a server-reported status string to a phase.
  pub fn from_server(status: &str) -> Self {
    match status.to_ascii_lowercase().as_str() {
      "pending" | "queued" => JobPhase::Queued,
      "running" | "processing" | "in_progress" => JobPhase::Running,
      "completed" | "complete" | "succeeded" | "done" => JobPhase::Completed,
      "failed" | "error" | "cancelled" => JobPhase::Failed,
      other => {
        warn!(status = other, "unknown job status, treating as running");
        JobPhase::Running
      }
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, JobPhase::Completed | JobPhase::Failed)
  }

  /// Queued or running: status polling is active.
  pub fn is_active(&self) -> bool {
    matches!(self, JobPhase::Queued | JobPhase::Running)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      JobPhase::NotStarted => "not_started",
      JobPhase::Queued => "queued",
      JobPhase::Running => "running",
      JobPhase::Completed => "completed",
      JobPhase::Failed => "failed",
    }
  }
}

impl fmt::Display for JobPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Snapshot of the tracked job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRecord {
  pub job_id: Option<String>,
  pub phase: JobPhase,
  /// Flips to true at most once per job id
  pub result_fetched: bool,
  pub last_polled_at: Option<DateTime<Utc>>,
  /// The job id is held in durable storage
  pub persisted: bool,
  /// Status polls observed so far
  pub attempts: u32,
  pub result: Option<Payload>,
  pub error: Option<SyncError>,
}

impl JobRecord {
  pub(crate) fn tracking(job_id: &str, persisted: bool) -> Self {
    Self {
      job_id: Some(job_id.to_string()),
      phase: JobPhase::Queued,
      persisted,
      ..Self::default()
    }
  }

  pub fn is_tracking(&self, job_id: &str) -> bool {
    self.job_id.as_deref() == Some(job_id)
  }
}

/// Response of the job result endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
  /// 202: the server has not produced the result yet
  Pending,
  Ready(Payload),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_mapping() {
    assert_eq!(JobPhase::from_server("pending"), JobPhase::Queued);
    assert_eq!(JobPhase::from_server("RUNNING"), JobPhase::Running);
    assert_eq!(JobPhase::from_server("completed"), JobPhase::Completed);
    assert_eq!(JobPhase::from_server("failed"), JobPhase::Failed);
    assert_eq!(JobPhase::from_server("warming_up"), JobPhase::Running);
  }

  #[test]
  fn test_terminal_phases() {
    assert!(JobPhase::Completed.is_terminal());
    assert!(JobPhase::Failed.is_terminal());
    assert!(!JobPhase::Running.is_terminal());
    assert!(!JobPhase::NotStarted.is_active());
    assert_eq!(JobPhase::NotStarted.to_string(), "not_started");
  }
}
