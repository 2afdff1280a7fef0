//! Keyed cache of server-owned resources.
//!
//! This module is a pure data holder:
//! - `CacheKey` identifies a value by resource type and ordered parameters
//! - `CacheEntry` carries the value, fetch status, freshness and generation
//! - `CacheStore` merges partial writes and notifies subscribers synchronously
//!
//! It never issues network calls; see `query` for the fetch path.

mod entry;
mod key;
mod store;

pub use entry::{CacheEntry, EntryPatch, FetchStatus, DEFAULT_STALE_TIME};
pub use key::CacheKey;
pub use store::{CacheStore, Listener, Subscription};
