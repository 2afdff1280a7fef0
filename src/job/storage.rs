//! Durable storage for the outstanding job id.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::SyncError;

/// Fixed key the outstanding job id is stored under.
pub const PENDING_JOB_KEY: &str = "pending_job_id";

/// At most one outstanding job id, surviving restarts.
pub trait JobStorage: Send + Sync {
  fn load(&self) -> Result<Option<String>, SyncError>;

  fn save(&self, job_id: &str) -> Result<(), SyncError>;

  fn clear(&self) -> Result<(), SyncError>;
}

/// Storage that forgets everything when dropped.
#[derive(Debug, Default)]
pub struct MemoryJobStorage {
  job_id: Mutex<Option<String>>,
}

impl MemoryJobStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_job(job_id: &str) -> Self {
    Self {
      job_id: Mutex::new(Some(job_id.to_string())),
    }
  }
}

impl JobStorage for MemoryJobStorage {
  fn load(&self) -> Result<Option<String>, SyncError> {
    Ok(self.job_id.lock().unwrap_or_else(PoisonError::into_inner).clone())
  }

  fn save(&self, job_id: &str) -> Result<(), SyncError> {
    *self.job_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(job_id.to_string());
    Ok(())
  }

  fn clear(&self) -> Result<(), SyncError> {
    *self.job_id.lock().unwrap_or_else(PoisonError::into_inner) = None;
    Ok(())
  }
}

/// SQLite-backed key/value storage.
pub struct SqliteJobStorage {
  conn: Mutex<Connection>,
}

impl SqliteJobStorage {
  /// Open the database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open job database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("resync").join("state.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STATE_SCHEMA)
      .map_err(|e| eyre!("Failed to run state migrations: {}", e))?;

    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM client_state WHERE key = ?1",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  fn put(&self, key: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT INTO client_state (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM client_state WHERE key = ?1", params![key])
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;

    Ok(())
  }
}

impl JobStorage for SqliteJobStorage {
  fn load(&self) -> Result<Option<String>, SyncError> {
    self
      .get(PENDING_JOB_KEY)
      .map_err(|e| SyncError::Storage(e.to_string()))
  }

  fn save(&self, job_id: &str) -> Result<(), SyncError> {
    self
      .put(PENDING_JOB_KEY, job_id)
      .map_err(|e| SyncError::Storage(e.to_string()))
  }

  fn clear(&self) -> Result<(), SyncError> {
    self
      .delete(PENDING_JOB_KEY)
      .map_err(|e| SyncError::Storage(e.to_string()))
  }
}

const STATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS client_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
