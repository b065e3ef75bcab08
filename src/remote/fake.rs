//! Scriptable in-memory remote source for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{RemoteError, RemoteRecord, RemoteSource};
use crate::store::Record;

pub fn remote_record(
  id: &str,
  region: &str,
  version: u64,
  payload: Value,
  updated_at: DateTime<Utc>,
) -> RemoteRecord {
  RemoteRecord {
    id: id.to_string(),
    region: region.to_string(),
    payload,
    version,
    updated_at,
    deleted: false,
  }
}

/// How the fake answers the next push.
#[derive(Debug, Clone)]
pub enum PushReply {
  Accept,
  Fail(RemoteError),
  Conflict(RemoteRecord),
}

#[derive(Default)]
struct FakeState {
  records: Vec<RemoteRecord>,
  fetch_failures: VecDeque<RemoteError>,
  push_replies: VecDeque<PushReply>,
  fetches: Vec<(String, u64)>,
  pushes: Vec<Record>,
  acks: Vec<RemoteRecord>,
}

#[derive(Default)]
pub struct FakeRemote {
  state: Mutex<FakeState>,
  push_delay: Option<Duration>,
  replay: bool,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Slow down every push, to widen race windows.
  pub fn with_push_delay(mut self, delay: Duration) -> Self {
    self.push_delay = Some(delay);
    self
  }

  /// Deliver every record of a region on each fetch, ignoring the marker,
  /// like an at-least-once feed.
  pub fn with_replay(mut self) -> Self {
    self.replay = true;
    self
  }

  /// Insert or replace a server-side record.
  pub fn put(&self, record: RemoteRecord) {
    let mut state = self.state.lock().unwrap();
    state.records.retain(|r| r.id != record.id);
    state.records.push(record);
  }

  pub fn fail_next_fetch(&self, err: RemoteError) {
    self.state.lock().unwrap().fetch_failures.push_back(err);
  }

  pub fn reply_to_push(&self, reply: PushReply) {
    self.state.lock().unwrap().push_replies.push_back(reply);
  }

  pub fn fetches(&self) -> Vec<(String, u64)> {
    self.state.lock().unwrap().fetches.clone()
  }

  pub fn pushes(&self) -> Vec<Record> {
    self.state.lock().unwrap().pushes.clone()
  }

  /// Records returned by accepted pushes, in order.
  pub fn acks(&self) -> Vec<RemoteRecord> {
    self.state.lock().unwrap().acks.clone()
  }

  pub fn max_concurrent_pushes(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl RemoteSource for FakeRemote {
  async fn fetch_region(
    &self,
    region: &str,
    since_version: u64,
  ) -> Result<Vec<RemoteRecord>, RemoteError> {
    let since_version = if self.replay { 0 } else { since_version };
    let mut state = self.state.lock().unwrap();
    state.fetches.push((region.to_string(), since_version));
    if let Some(err) = state.fetch_failures.pop_front() {
      return Err(err);
    }

    let mut records: Vec<RemoteRecord> = state
      .records
      .iter()
      .filter(|r| r.region == region && r.version > since_version)
      .cloned()
      .collect();
    records.sort_by_key(|r| r.version);
    Ok(records)
  }

  async fn push_record(&self, record: &Record) -> Result<RemoteRecord, RemoteError> {
    let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

    if let Some(delay) = self.push_delay {
      tokio::time::sleep(delay).await;
    }

    let result = {
      let mut state = self.state.lock().unwrap();
      state.pushes.push(record.clone());
      match state.push_replies.pop_front().unwrap_or(PushReply::Accept) {
        PushReply::Accept => {
          let next_version = state
            .records
            .iter()
            .map(|r| r.version)
            .max()
            .unwrap_or(0)
            .max(record.version)
            + 1;
          let ack = RemoteRecord {
            id: record.id.clone(),
            region: record.region.clone(),
            payload: record.payload.clone(),
            version: next_version,
            updated_at: Utc::now(),
            deleted: false,
          };
          state.records.retain(|r| r.id != record.id);
          state.records.push(ack.clone());
          state.acks.push(ack.clone());
          Ok(ack)
        }
        PushReply::Fail(err) => Err(err),
        PushReply::Conflict(remote) => Err(RemoteError::Conflict(Box::new(remote))),
      }
    };

    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    result
  }
}
