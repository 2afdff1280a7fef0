//! HTTP boundary: route resolution, credentials and payload validation.

pub mod auth;
pub mod client;
pub mod types;

pub use auth::{CredentialProvider, StaticToken};
pub use client::ApiClient;
pub use types::{Payload, Record};
