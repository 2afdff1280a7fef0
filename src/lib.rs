//! Client-side synchronization between UI consumers and a remote resource API.
//!
//! - `cache`: keyed store of server-owned values with subscriptions
//! - `query`: cache-first reads over a single deduplicated fetch path
//! - `mutation`: optimistic writes with generation-guarded rollback
//! - `poll`: shared-timer revalidation of registered keys
//! - `push`: change notifications turned into targeted invalidation
//! - `job`: tracking of long-running server jobs to completion

pub mod api;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod mutation;
pub mod poll;
pub mod push;
pub mod query;

#[cfg(test)]
mod testing;

pub use context::{ContextSettings, SyncContext};
pub use error::SyncError;
