//! Deadline-ordered task queue with per-key coalescing.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use super::task::{SyncTask, TaskKey, TaskState};

/// What happened to an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  /// A new pending task was created
  Queued,
  /// A task for the key was already pending and keeps its schedule
  Coalesced,
  /// The key is in flight; it runs again once the current attempt finishes
  Deferred,
}

struct Entry {
  task: SyncTask,
  seq: u64,
}

#[derive(Default)]
struct InFlight {
  /// Another run was requested meanwhile
  followup: bool,
  /// Keys to admit once this one finishes
  waiters: Vec<TaskKey>,
}

/// Pending tasks ordered by `next_eligible_at`, plus the set of keys in flight.
///
/// The heap is lazily invalidated: rescheduling or cancelling a key leaves
/// its old heap entry behind, and entries whose sequence number no longer
/// matches the pending map are discarded when they surface.
#[derive(Default)]
pub struct TaskQueue {
  pending: HashMap<TaskKey, Entry>,
  heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, TaskKey)>>,
  in_flight: HashMap<TaskKey, InFlight>,
  next_seq: u64,
}

impl TaskQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn admit(&mut self, key: TaskKey, now: DateTime<Utc>) -> Admission {
    if let Some(running) = self.in_flight.get_mut(&key) {
      running.followup = true;
      return Admission::Deferred;
    }
    if self.pending.contains_key(&key) {
      return Admission::Coalesced;
    }
    self.schedule(SyncTask::new(key, now));
    Admission::Queued
  }

  /// Like [`admit`](Self::admit), but a pending task is made eligible now
  /// with its attempt counter reset.
  pub fn force(&mut self, key: TaskKey, now: DateTime<Utc>) -> Admission {
    if let Some(running) = self.in_flight.get_mut(&key) {
      running.followup = true;
      return Admission::Deferred;
    }
    let existed = self.pending.contains_key(&key);
    self.schedule(SyncTask::new(key, now));
    if existed {
      Admission::Coalesced
    } else {
      Admission::Queued
    }
  }

  fn schedule(&mut self, task: SyncTask) {
    let seq = self.next_seq;
    self.next_seq += 1;
    self
      .heap
      .push(Reverse((task.next_eligible_at, seq, task.key.clone())));
    self.pending.insert(task.key.clone(), Entry { task, seq });
  }

  /// Drop heap entries that no longer describe a pending task.
  fn discard_stale(&mut self) {
    loop {
      let stale = match self.heap.peek() {
        Some(Reverse((_, seq, key))) => self.pending.get(key).map_or(true, |e| e.seq != *seq),
        None => false,
      };
      if !stale {
        break;
      }
      self.heap.pop();
    }
  }

  /// Take the earliest task that is eligible at `now` and mark it in flight.
  pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<SyncTask> {
    self.discard_stale();
    let Reverse((eligible_at, _, _)) = self.heap.peek()?;
    if *eligible_at > now {
      return None;
    }

    let Reverse((_, _, key)) = self.heap.pop()?;
    let entry = self.pending.remove(&key)?;
    self.in_flight.insert(key, InFlight::default());
    Some(entry.task)
  }

  /// If `blocker` is in flight, admit `key` once it finishes and return
  /// true. Returns false when `blocker` is not running.
  pub fn wait_for(&mut self, blocker: &TaskKey, key: TaskKey) -> bool {
    match self.in_flight.get_mut(blocker) {
      Some(running) => {
        if !running.waiters.contains(&key) {
          running.waiters.push(key);
        }
        true
      }
      None => false,
    }
  }

  /// Release an in-flight key. `retry` reschedules it; otherwise a run
  /// requested while it was in flight is admitted now. Keys waiting on it
  /// are admitted either way.
  pub fn finish(&mut self, key: &TaskKey, retry: Option<SyncTask>, now: DateTime<Utc>) {
    let running = self.in_flight.remove(key).unwrap_or_default();
    match retry {
      Some(task) => self.schedule(task),
      None if running.followup => self.schedule(SyncTask::new(key.clone(), now)),
      None => {}
    }
    for waiter in running.waiters {
      self.admit(waiter, now);
    }
  }

  /// Drop a pending task, and any follow-up requested for an in-flight one.
  /// Returns true if a pending task was removed.
  pub fn cancel(&mut self, key: &TaskKey) -> bool {
    if let Some(running) = self.in_flight.get_mut(key) {
      running.followup = false;
    }
    self.pending.remove(key).is_some()
  }

  /// When the earliest pending task becomes eligible.
  pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
    self.discard_stale();
    self.heap.peek().map(|Reverse((at, _, _))| *at)
  }

  pub fn state(&self, key: &TaskKey) -> Option<TaskState> {
    if self.in_flight.contains_key(key) {
      return Some(TaskState::InFlight);
    }
    self.pending.get(key).map(|entry| {
      if entry.task.attempt > 0 {
        TaskState::Retrying
      } else {
        TaskState::Pending
      }
    })
  }

  /// Keys of all pending region fetches.
  pub fn pending_regions(&self) -> Vec<String> {
    self
      .pending
      .keys()
      .filter_map(|key| match key {
        TaskKey::Region(region) => Some(region.clone()),
        TaskKey::Record(_) => None,
      })
      .collect()
  }

  pub fn is_idle(&self) -> bool {
    self.pending.is_empty() && self.in_flight.is_empty()
  }
}
