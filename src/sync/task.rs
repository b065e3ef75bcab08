//! Units of work drained by the coordinator.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
  FullRegionFetch,
  SingleRecordPush,
}

/// Identity of a task. At most one task per key is ever in flight.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKey {
  Region(String),
  Record(String),
}

impl TaskKey {
  pub fn kind(&self) -> TaskKind {
    match self {
      TaskKey::Region(_) => TaskKind::FullRegionFetch,
      TaskKey::Record(_) => TaskKind::SingleRecordPush,
    }
  }
}

impl fmt::Display for TaskKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskKey::Region(region) => write!(f, "pull:{region}"),
      TaskKey::Record(id) => write!(f, "push:{id}"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
  pub key: TaskKey,
  /// Failed attempts so far
  pub attempt: u32,
  pub next_eligible_at: DateTime<Utc>,
}

impl SyncTask {
  pub fn new(key: TaskKey, now: DateTime<Utc>) -> Self {
    Self {
      key,
      attempt: 0,
      next_eligible_at: now,
    }
  }

  pub fn kind(&self) -> TaskKind {
    self.key.kind()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Pending,
  /// Pending again after a failure, waiting out its backoff
  Retrying,
  InFlight,
}

/// How a dispatched task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
  Completed,
  Retrying { attempt: u32, delay: Duration },
  PermanentlyFailed { attempts: u32 },
  AuthRequired,
}
