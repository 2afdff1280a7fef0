//! Long-running server job tracking.

mod poller;
mod storage;
mod types;

pub use poller::{status_key, JobApi, JobPoller, JobPollerConfig, JOB_STATUS_RESOURCE};
pub use storage::{JobStorage, MemoryJobStorage, SqliteJobStorage, PENDING_JOB_KEY};
pub use types::{JobPhase, JobRecord, JobResult};
