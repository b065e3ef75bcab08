//! Record types held by the local store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A committed unit of cached content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: String,
  /// Grid cell the record belongs to
  pub region: String,
  pub payload: Value,
  /// Assigned by the remote; 0 until the remote has seen the record
  pub version: u64,
  /// Assigned locally on every committed write
  pub local_revision: u64,
  /// Wall-clock origin of the content at `local_revision`
  pub modified_at: DateTime<Utc>,
  pub last_synced_at: Option<DateTime<Utc>>,
  /// A local change exists that the remote has not confirmed
  pub dirty: bool,
  /// Idempotency token sent with pushes, present while dirty
  pub push_token: Option<String>,
}

impl Record {
  /// True when the record was never reconciled or not within `max_age`.
  pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
    match self.last_synced_at {
      Some(synced) => now - synced > max_age,
      None => true,
    }
  }
}

/// The caller-supplied part of a write. The store assigns `local_revision`
/// and `push_token` when it commits.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
  pub id: String,
  pub region: String,
  pub payload: Value,
  pub version: u64,
  pub modified_at: DateTime<Utc>,
  pub last_synced_at: Option<DateTime<Utc>>,
  pub dirty: bool,
}

impl RecordDraft {
  /// Start a draft from the committed state of a record.
  pub fn from_record(record: &Record) -> Self {
    Self {
      id: record.id.clone(),
      region: record.region.clone(),
      payload: record.payload.clone(),
      version: record.version,
      modified_at: record.modified_at,
      last_synced_at: record.last_synced_at,
      dirty: record.dirty,
    }
  }

  /// A brand new local record that the remote has never seen.
  pub fn new_local(id: &str, region: &str, payload: Value, now: DateTime<Utc>) -> Self {
    Self {
      id: id.to_string(),
      region: region.to_string(),
      payload,
      version: 0,
      modified_at: now,
      last_synced_at: None,
      dirty: true,
    }
  }

  pub(crate) fn into_record(self, local_revision: u64) -> Record {
    let push_token = self.dirty.then(|| push_token(&self.id, local_revision));
    Record {
      id: self.id,
      region: self.region,
      payload: self.payload,
      version: self.version,
      local_revision,
      modified_at: self.modified_at,
      last_synced_at: self.last_synced_at,
      dirty: self.dirty,
      push_token,
    }
  }
}

/// Deterministic idempotency token for a record revision. Resending the same
/// revision produces the same token, so the remote can deduplicate retries.
pub fn push_token(id: &str, local_revision: u64) -> String {
  let mut hasher = Sha256::new();
  hasher.update(id.as_bytes());
  hasher.update(b":");
  hasher.update(local_revision.to_be_bytes());
  hex::encode(hasher.finalize())
}

/// Per-region high-water mark of remote versions already merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMarker {
  pub region: String,
  pub max_version: u64,
  pub last_synced_at: DateTime<Utc>,
}
