//! Entry point for UI collaborators.
//!
//! Every call answers from the local store and returns without waiting for
//! the network; anything that needs the remote is handed to the coordinator.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::bus::{Filter, Subscription};
use crate::store::{Applied, LocalStore, Mutation, Record, RecordDraft, StoreError};
use crate::sync::{Admission, SyncCoordinator};

#[derive(Error, Debug)]
pub enum FacadeError {
  #[error("Record not found: {0}")]
  NotFound(String),

  #[error("Record already exists: {0}")]
  AlreadyExists(String),

  #[error(transparent)]
  Store(#[from] StoreError),
}

pub struct CacheFacade {
  store: Arc<LocalStore>,
  coordinator: Arc<SyncCoordinator>,
  refresh_on_read: bool,
  region_staleness: chrono::Duration,
}

impl CacheFacade {
  pub fn new(
    store: Arc<LocalStore>,
    coordinator: Arc<SyncCoordinator>,
    refresh_on_read: bool,
    region_staleness: chrono::Duration,
  ) -> Self {
    Self {
      store,
      coordinator,
      refresh_on_read,
      region_staleness,
    }
  }

  /// A clean record that has not been reconciled within the staleness
  /// window has its region refreshed in the background.
  pub fn read(&self, id: &str) -> Result<Option<Record>, FacadeError> {
    let record = self.store.get(id)?;
    if let Some(record) = &record {
      let stale = !record.dirty && record.is_stale(Utc::now(), self.region_staleness);
      if self.refresh_on_read && stale {
        self.refresh_region(&record.region);
      }
    }
    Ok(record)
  }

  /// Cached records of a region. A stale region is refreshed in the
  /// background when refresh-on-read is enabled.
  pub fn read_region(&self, region: &str) -> Result<Vec<Record>, FacadeError> {
    let records = self.store.query(region)?;
    if self.refresh_on_read && self.region_is_stale(region, Utc::now())? {
      self.refresh_region(region);
    }
    Ok(records)
  }

  fn region_is_stale(&self, region: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
    Ok(match self.store.region_marker(region)? {
      Some(marker) => now - marker.last_synced_at > self.region_staleness,
      None => true,
    })
  }

  /// Ask for a fetch of `region` regardless of its age.
  pub fn refresh_region(&self, region: &str) -> Admission {
    debug!(region, "Refreshing region");
    self.coordinator.enqueue_pull(region, Utc::now())
  }

  /// Replace the payload of an existing record. The change is visible to
  /// reads immediately and pushed in the background.
  pub fn write(&self, id: &str, payload: Value) -> Result<Record, FacadeError> {
    let now = Utc::now();
    let applied = self.store.apply(id, |current| {
      let Some(current) = current else {
        return Ok(Mutation::Keep);
      };
      let mut draft = RecordDraft::from_record(current);
      draft.payload = payload;
      draft.modified_at = now;
      draft.dirty = true;
      Ok(Mutation::Put(draft))
    })?;

    match applied {
      Applied::Committed(record) => {
        self.coordinator.enqueue_push(&record.id, now);
        Ok(record)
      }
      _ => Err(FacadeError::NotFound(id.to_string())),
    }
  }

  /// Add a record the remote has not seen yet.
  pub fn create(&self, id: &str, region: &str, payload: Value) -> Result<Record, FacadeError> {
    let now = Utc::now();
    let applied = self.store.apply(id, |current| {
      if current.is_some() {
        return Ok(Mutation::Keep);
      }
      Ok(Mutation::Put(RecordDraft::new_local(id, region, payload, now)))
    })?;

    match applied {
      Applied::Committed(record) => {
        self.coordinator.enqueue_push(&record.id, now);
        Ok(record)
      }
      _ => Err(FacadeError::AlreadyExists(id.to_string())),
    }
  }

  /// Change notifications matching `filter`, starting now.
  pub fn subscribe(&self, filter: Filter) -> Subscription {
    self.store.bus().subscribe(filter)
  }
}
