//! Serde types matching the content API's JSON bodies.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on engine needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RemoteRecord;
use crate::store::Record;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRecord {
  pub id: String,
  pub region: String,
  #[serde(default)]
  pub payload: Value,
  pub version: u64,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub deleted: bool,
}

impl From<ApiRecord> for RemoteRecord {
  fn from(api: ApiRecord) -> Self {
    RemoteRecord {
      id: api.id,
      region: api.region,
      payload: api.payload,
      version: api.version,
      updated_at: api.updated_at,
      deleted: api.deleted,
    }
  }
}

/// Region fetch response
#[derive(Debug, Deserialize)]
pub struct ApiRecordsResponse {
  #[serde(default)]
  pub records: Vec<ApiRecord>,
}

/// Body of a record push
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPushRequest<'a> {
  pub id: &'a str,
  pub region: &'a str,
  pub payload: &'a Value,
  /// Remote version the local change was based on
  pub base_version: u64,
  pub modified_at: DateTime<Utc>,
}

impl<'a> From<&'a Record> for ApiPushRequest<'a> {
  fn from(record: &'a Record) -> Self {
    Self {
      id: &record.id,
      region: &record.region,
      payload: &record.payload,
      base_version: record.version,
      modified_at: record.modified_at,
    }
  }
}
