//! Accessor for the authoritative content API.
//!
//! The remote side is stateless from the engine's point of view: every call is
//! a single request/response, and nothing here knows about the local cache.

pub mod api_types;
mod client;
mod error;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::store::Record;

pub use client::HttpRemote;
pub use error::RemoteError;

/// A record as the remote source reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
  pub id: String,
  pub region: String,
  pub payload: Value,
  pub version: u64,
  /// Server-side timestamp of this version
  pub updated_at: DateTime<Utc>,
  /// Tombstone: the record was removed remotely
  pub deleted: bool,
}

/// Request/response access to the remote source.
#[async_trait]
pub trait RemoteSource: Send + Sync {
  /// Records of `region` with a version greater than `since_version`.
  /// Has no side effects.
  async fn fetch_region(
    &self,
    region: &str,
    since_version: u64,
  ) -> Result<Vec<RemoteRecord>, RemoteError>;

  /// Send a local change. Safe to resend unchanged: the record's push token
  /// lets the remote deduplicate.
  async fn push_record(&self, record: &Record) -> Result<RemoteRecord, RemoteError>;
}
