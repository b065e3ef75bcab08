//! Orchestration of fetch, merge and push cycles.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::conflict::{ConflictResolver, LastWriterWins};
use super::error::SyncError;
use super::merge::{apply_push_ack, merge_push_conflict, merge_remote, Merge};
use super::queue::{Admission, TaskQueue};
use super::task::{SyncTask, TaskKey, TaskOutcome, TaskState};
use crate::bus::{BusEvent, ChangeBus, Scope};
use crate::config::SyncSettings;
use crate::remote::{RemoteError, RemoteSource};
use crate::store::{LocalStore, Record, StoreError};

/// How long an idle worker sleeps when nothing is scheduled.
const IDLE_POLL: Duration = Duration::from_secs(60);

fn lock(queue: &Mutex<TaskQueue>) -> MutexGuard<'_, TaskQueue> {
  // The queue holds no invariants a panicking holder could break halfway
  queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work scheduled by a [`SyncCoordinator::resync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Resync {
  pub pushes: usize,
  pub pulls: usize,
}

/// Owns the task queue and runs tasks against the store and the remote.
///
/// Tasks are drained by [`spawn_workers`](Self::spawn_workers), or one at a
/// time with [`run_next`](Self::run_next). The queue guarantees that no two
/// tasks with the same key run concurrently, however many workers there are.
pub struct SyncCoordinator {
  store: Arc<LocalStore>,
  remote: Arc<dyn RemoteSource>,
  bus: ChangeBus,
  resolver: Arc<dyn ConflictResolver>,
  backoff: Backoff,
  settings: SyncSettings,
  queue: Arc<Mutex<TaskQueue>>,
  wakeup: Notify,
  settled: Notify,
}

impl SyncCoordinator {
  pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteSource>, settings: SyncSettings) -> Self {
    Self {
      bus: store.bus().clone(),
      store,
      remote,
      resolver: Arc::new(LastWriterWins),
      backoff: Backoff::new(settings.backoff_base(), settings.backoff_cap()),
      settings,
      queue: Arc::new(Mutex::new(TaskQueue::new())),
      wakeup: Notify::new(),
      settled: Notify::new(),
    }
  }

  pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
    self.resolver = resolver;
    self
  }

  pub fn with_backoff(mut self, backoff: Backoff) -> Self {
    self.backoff = backoff;
    self
  }

  fn lock_queue(&self) -> MutexGuard<'_, TaskQueue> {
    lock(&self.queue)
  }

  fn admit(&self, key: TaskKey, now: DateTime<Utc>) -> Admission {
    let admission = self.lock_queue().admit(key.clone(), now);
    debug!(task = %key, ?admission, "Task admitted");
    if admission == Admission::Queued {
      self.wakeup.notify_one();
    }
    admission
  }

  /// Schedule a fetch of `region`.
  pub fn enqueue_pull(&self, region: &str, now: DateTime<Utc>) -> Admission {
    self.admit(TaskKey::Region(region.to_string()), now)
  }

  /// Schedule a push of record `id`.
  pub fn enqueue_push(&self, id: &str, now: DateTime<Utc>) -> Admission {
    self.admit(TaskKey::Record(id.to_string()), now)
  }

  /// Drop a pending fetch of `region`. In-flight fetches run to completion.
  pub fn cancel_pull(&self, region: &str) -> bool {
    self.lock_queue().cancel(&TaskKey::Region(region.to_string()))
  }

  pub fn pending_regions(&self) -> Vec<String> {
    self.lock_queue().pending_regions()
  }

  pub fn task_state(&self, key: &TaskKey) -> Option<TaskState> {
    self.lock_queue().state(key)
  }

  pub fn is_idle(&self) -> bool {
    self.lock_queue().is_idle()
  }

  /// When `region` last completed a fetch.
  pub fn region_last_synced(&self, region: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    Ok(self.store.region_marker(region)?.map(|m| m.last_synced_at))
  }

  /// Rebuild the queue from persisted state: a push for every dirty record
  /// and a fetch for every stale region, all eligible now with a fresh
  /// attempt counter. Used at startup, after reconnecting, and after the
  /// caller re-authenticated.
  pub fn resync(&self, now: DateTime<Utc>) -> Result<Resync, StoreError> {
    let dirty = self.store.dirty_records()?;
    let stale = self
      .store
      .stale_regions(now - self.settings.region_staleness())?;

    let summary = Resync {
      pushes: dirty.len(),
      pulls: stale.len(),
    };
    {
      let mut queue = self.lock_queue();
      for record in dirty {
        queue.force(TaskKey::Record(record.id), now);
      }
      for region in stale {
        queue.force(TaskKey::Region(region), now);
      }
    }

    info!(pushes = summary.pushes, pulls = summary.pulls, "Resync scheduled");
    self.wakeup.notify_one();
    Ok(summary)
  }

  /// Run the earliest task eligible at `now`, if any.
  pub async fn run_next(&self, now: DateTime<Utc>) -> Option<(TaskKey, TaskOutcome)> {
    let task = self.lock_queue().pop_ready(now)?;
    debug!(task = %task.key, kind = ?task.kind(), attempt = task.attempt, "Running task");

    let result = match &task.key {
      TaskKey::Region(region) => self.pull(region, now).await,
      TaskKey::Record(id) => self.push(id, now).await,
    };

    let key = task.key.clone();
    let outcome = self.conclude(task, result, now).await;
    Some((key, outcome))
  }

  async fn conclude(
    &self,
    task: SyncTask,
    result: Result<(), SyncError>,
    now: DateTime<Utc>,
  ) -> TaskOutcome {
    let (retry, outcome) = match result {
      Ok(()) => {
        debug!(task = %task.key, "Task completed");
        (None, TaskOutcome::Completed)
      }
      Err(err) if err.is_auth() => {
        warn!(task = %task.key, error = %err, "Remote rejected credentials");
        let scope = self.scope_of(&task.key).await;
        self.bus.publish(BusEvent::AuthRequired {
          scope,
          error: err.to_string(),
        });
        (None, TaskOutcome::AuthRequired)
      }
      Err(err) => {
        let attempt = task.attempt + 1;
        if !err.is_retryable() || attempt >= self.settings.max_attempts {
          warn!(task = %task.key, attempts = attempt, error = %err, "Task failed permanently");
          let scope = self.scope_of(&task.key).await;
          self.bus.publish(BusEvent::SyncFailed {
            scope,
            attempts: attempt,
            error: err.to_string(),
          });
          (None, TaskOutcome::PermanentlyFailed { attempts: attempt })
        } else {
          let delay = self.backoff.delay(attempt);
          let next_eligible_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|step| now.checked_add_signed(step))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
          debug!(task = %task.key, attempt, ?delay, error = %err, "Task will be retried");
          let retry = SyncTask {
            key: task.key.clone(),
            attempt,
            next_eligible_at,
          };
          (Some(retry), TaskOutcome::Retrying { attempt, delay })
        }
      }
    };

    self.lock_queue().finish(&task.key, retry, now);
    self.wakeup.notify_one();
    self.settled.notify_waiters();
    outcome
  }

  async fn scope_of(&self, key: &TaskKey) -> Scope {
    match key {
      TaskKey::Region(region) => Scope::Region(region.clone()),
      TaskKey::Record(id) => {
        let lookup = id.clone();
        let region = self
          .blocking(move |store| store.get(&lookup))
          .await
          .ok()
          .flatten()
          .map(|record| record.region)
          .unwrap_or_default();
        Scope::Record {
          id: id.clone(),
          region,
        }
      }
    }
  }

  /// Run a store operation on the blocking pool, bounded by the storage
  /// timeout.
  ///
  /// An operation that overruns fails the attempt, but only once it has
  /// returned: the caller's task key stays in flight until then, so a retry
  /// never overlaps a stalled merge.
  async fn blocking<T, F>(&self, op: F) -> Result<T, SyncError>
  where
    F: FnOnce(&LocalStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
  {
    let store = Arc::clone(&self.store);
    let timeout = self.settings.storage_timeout();
    let mut handle = tokio::task::spawn_blocking(move || op(&store));
    match tokio::time::timeout(timeout, &mut handle).await {
      Ok(Ok(result)) => result.map_err(SyncError::from),
      Ok(Err(join)) => Err(SyncError::Worker(join.to_string())),
      Err(_) => {
        warn!(?timeout, "Storage operation stalled");
        if let Err(join) = handle.await {
          warn!(error = %join, "Stalled storage operation ended abnormally");
        }
        Err(SyncError::StorageTimeout(timeout))
      }
    }
  }

  async fn remote_call<T>(
    &self,
    call: impl Future<Output = Result<T, RemoteError>>,
  ) -> Result<T, RemoteError> {
    let timeout = self.settings.request_timeout();
    match tokio::time::timeout(timeout, call).await {
      Ok(result) => result,
      Err(_) => Err(RemoteError::Network(format!(
        "Request timed out after {timeout:?}"
      ))),
    }
  }

  /// Fetch everything newer than the region marker and merge it. The marker
  /// only advances once the whole batch merged.
  ///
  /// Records with a push in flight are left to that push. The marker stays
  /// below the oldest of them and the region is fetched again once the push
  /// finishes.
  async fn pull(&self, region: &str, now: DateTime<Utc>) -> Result<(), SyncError> {
    let lookup = region.to_string();
    let since = self
      .blocking(move |store| Ok(store.region_marker(&lookup)?.map_or(0, |m| m.max_version)))
      .await?;

    let batch = self.remote_call(self.remote.fetch_region(region, since)).await?;
    debug!(region, since, records = batch.len(), "Fetched region");

    let resolver = Arc::clone(&self.resolver);
    let queue = Arc::clone(&self.queue);
    let region_key = TaskKey::Region(region.to_string());
    let region_owned = region.to_string();
    let pushes = self
      .blocking(move |store| {
        let mut max_version = since;
        let mut held_back: Option<u64> = None;
        let mut pushes = Vec::new();
        for remote in &batch {
          // Holding the queue keeps a push of this record from starting mid-merge
          let mut tasks = lock(&queue);
          if tasks.wait_for(&TaskKey::Record(remote.id.clone()), region_key.clone()) {
            debug!(id = %remote.id, "Push in flight, merging on the next fetch");
            held_back = Some(held_back.map_or(remote.version, |v| v.min(remote.version)));
            continue;
          }

          max_version = max_version.max(remote.version);
          let mut merged = None;
          store.apply(&remote.id, |local| {
            let merge = merge_remote(local, remote, resolver.as_ref(), now);
            let mutation = merge.mutation.clone();
            merged = Some(merge);
            Ok(mutation)
          })?;
          drop(tasks);

          if let Some(merge) = merged {
            if let Some(conflict) = merge.conflict {
              store.bus().publish(BusEvent::Conflict(conflict));
            }
            if merge.push_needed {
              pushes.push(remote.id.clone());
            }
          }
        }
        let marker = match held_back {
          Some(version) => max_version.min(version.saturating_sub(1)),
          None => max_version,
        };
        store.advance_region(&region_owned, marker, now)?;
        Ok(pushes)
      })
      .await?;

    for id in pushes {
      self.enqueue_push(&id, now);
    }
    Ok(())
  }

  async fn push(&self, id: &str, now: DateTime<Utc>) -> Result<(), SyncError> {
    let lookup = id.to_string();
    let Some(record) = self.blocking(move |store| store.get(&lookup)).await? else {
      debug!(id, "Record gone before push");
      return Ok(());
    };
    if !record.dirty {
      return Ok(());
    }

    match self.remote_call(self.remote.push_record(&record)).await {
      Ok(ack) => {
        debug!(id, version = ack.version, "Push acknowledged");
        self
          .settle(id, now, move |current| apply_push_ack(current, &record, &ack, now))
          .await
      }
      Err(RemoteError::Conflict(remote)) => {
        info!(id, remote_version = remote.version, "Push rejected as conflicting");
        let resolver = Arc::clone(&self.resolver);
        self
          .settle(id, now, move |current| {
            merge_push_conflict(current, &remote, resolver.as_ref(), now)
          })
          .await
      }
      Err(err) => Err(err.into()),
    }
  }

  /// Commit a merge decision for one record, then publish and schedule
  /// whatever it asks for.
  async fn settle<F>(&self, id: &str, now: DateTime<Utc>, decide: F) -> Result<(), SyncError>
  where
    F: FnOnce(Option<&Record>) -> Merge + Send + 'static,
  {
    let target = id.to_string();
    let merge = self
      .blocking(move |store| {
        let mut merged = None;
        store.apply(&target, |current| {
          let merge = decide(current);
          let mutation = merge.mutation.clone();
          merged = Some(merge);
          Ok(mutation)
        })?;
        if let Some(conflict) = merged.as_ref().and_then(|m| m.conflict.clone()) {
          store.bus().publish(BusEvent::Conflict(conflict));
        }
        Ok(merged)
      })
      .await?;

    if merge.is_some_and(|m| m.push_needed) {
      self.enqueue_push(id, now);
    }
    Ok(())
  }

  /// Start `workers` tasks draining the queue until `shutdown` turns true.
  pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    (0..self.settings.workers.max(1))
      .map(|worker| {
        let coordinator = Arc::clone(self);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { coordinator.worker_loop(worker, shutdown).await })
      })
      .collect()
  }

  async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
    debug!(worker, "Sync worker started");
    'outer: loop {
      if *shutdown.borrow() {
        break;
      }

      while let Some((key, outcome)) = self.run_next(Utc::now()).await {
        debug!(worker, task = %key, ?outcome, "Task finished");
        if *shutdown.borrow() {
          break 'outer;
        }
      }

      let sleep_for = self
        .lock_queue()
        .next_deadline()
        .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
        .unwrap_or(IDLE_POLL);

      tokio::select! {
        _ = self.wakeup.notified() => {}
        _ = tokio::time::sleep(sleep_for) => {}
        changed = shutdown.changed() => {
          if changed.is_err() {
            break;
          }
        }
      }
    }
    debug!(worker, "Sync worker stopped");
  }

  /// Wait until nothing is pending or in flight. Returns false on timeout.
  pub async fn wait_idle(&self, timeout: Duration) -> bool {
    let settle = async {
      loop {
        if self.is_idle() {
          return;
        }
        tokio::select! {
          _ = self.settled.notified() => {}
          _ = tokio::time::sleep(Duration::from_millis(25)) => {}
        }
      }
    };
    tokio::time::timeout(timeout, settle).await.is_ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::{ChangeKind, ConflictWinner, Filter, Subscription};
  use crate::remote::fake::{remote_record, FakeRemote, PushReply};
  use crate::store::{Mutation, RecordDraft};
  use chrono::Duration as ChronoDuration;
  use proptest::prelude::*;
  use serde_json::{json, Value};
  use std::time::Instant;

  struct Harness {
    coordinator: Arc<SyncCoordinator>,
    store: Arc<LocalStore>,
    remote: Arc<FakeRemote>,
    events: Subscription,
  }

  fn harness(remote: FakeRemote) -> Harness {
    harness_with(remote, SyncSettings::default())
  }

  fn harness_with(remote: FakeRemote, settings: SyncSettings) -> Harness {
    let bus = ChangeBus::new();
    let events = bus.subscribe(Filter::All);
    let store = Arc::new(LocalStore::open_in_memory(bus).unwrap());
    let remote = Arc::new(remote);
    let coordinator = SyncCoordinator::new(
      Arc::clone(&store),
      Arc::clone(&remote) as Arc<dyn RemoteSource>,
      settings,
    )
    .with_backoff(Backoff::without_jitter(
      Duration::from_millis(100),
      Duration::from_secs(10),
    ));
    Harness {
      coordinator: Arc::new(coordinator),
      store,
      remote,
      events,
    }
  }

  fn local_write(store: &LocalStore, id: &str, region: &str, payload: Value, at: DateTime<Utc>) -> Record {
    let applied = store
      .apply(id, |current| {
        let mut draft = match current {
          Some(record) => RecordDraft::from_record(record),
          None => RecordDraft::new_local(id, region, Value::Null, at),
        };
        draft.payload = payload;
        draft.modified_at = at;
        draft.dirty = true;
        Ok(Mutation::Put(draft))
      })
      .unwrap();
    applied.committed().cloned().unwrap()
  }

  fn drain(events: &mut Subscription) -> Vec<BusEvent> {
    std::iter::from_fn(|| events.try_next()).collect()
  }

  #[tokio::test]
  async fn test_pull_inserts_and_advances_marker() {
    let h = harness(FakeRemote::new());
    let now = Utc::now();
    h.remote.put(remote_record("a", "r", 1, json!("a1"), now));
    h.remote.put(remote_record("b", "r", 2, json!("b2"), now));

    h.coordinator.enqueue_pull("r", now);
    let (key, outcome) = h.coordinator.run_next(now).await.unwrap();
    assert_eq!(key, TaskKey::Region("r".to_string()));
    assert_eq!(outcome, TaskOutcome::Completed);

    let records = h.store.query("r").unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| !r.dirty && r.last_synced_at == Some(now)));
    assert_eq!(h.store.region_marker("r").unwrap().unwrap().max_version, 2);
    assert_eq!(h.coordinator.region_last_synced("r").unwrap(), Some(now));

    h.coordinator.enqueue_pull("r", now);
    h.coordinator.run_next(now).await.unwrap();
    assert_eq!(h.remote.fetches(), vec![("r".to_string(), 0), ("r".to_string(), 2)]);
    assert!(h.coordinator.is_idle());
  }

  #[tokio::test]
  async fn test_conflicting_pull_keeps_newer_local_write() {
    let mut h = harness(FakeRemote::new());
    let t0 = Utc::now();
    h.remote.put(remote_record("a", "r", 1, json!("p1"), t0));
    h.remote.put(remote_record("b", "r", 1, json!("q1"), t0));
    h.coordinator.enqueue_pull("r", t0);
    h.coordinator.run_next(t0).await.unwrap();

    let written_at = t0 + ChronoDuration::seconds(10);
    local_write(&h.store, "a", "r", json!("p2"), written_at);

    // The remote's change to A happened before the local edit
    h.remote.put(remote_record("a", "r", 2, json!("p1-remote"), t0 + ChronoDuration::seconds(5)));
    h.remote.put(remote_record("b", "r", 2, json!("q2"), t0 + ChronoDuration::seconds(5)));
    drain(&mut h.events);

    let now = t0 + ChronoDuration::seconds(20);
    h.coordinator.enqueue_pull("r", now);
    assert_eq!(h.coordinator.run_next(now).await.unwrap().1, TaskOutcome::Completed);

    let a = h.store.get("a").unwrap().unwrap();
    assert_eq!(a.payload, json!("p2"));
    assert!(a.dirty);
    assert_eq!(a.version, 2);
    let b = h.store.get("b").unwrap().unwrap();
    assert_eq!(b.payload, json!("q2"));
    assert!(!b.dirty);

    let conflicts: Vec<_> = drain(&mut h.events)
      .into_iter()
      .filter_map(|event| match event {
        BusEvent::Conflict(conflict) => Some(conflict),
        _ => None,
      })
      .collect();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id, "a");
    assert_eq!(conflicts[0].winner, ConflictWinner::Local);

    // The surviving local change is queued for upload
    assert_eq!(
      h.coordinator.task_state(&TaskKey::Record("a".to_string())),
      Some(TaskState::Pending)
    );
  }

  #[tokio::test]
  async fn test_dirty_payload_survives_redelivery() {
    let h = harness(FakeRemote::new().with_replay());
    let now = Utc::now();
    h.remote.put(remote_record("a", "r", 3, json!("server"), now));
    h.coordinator.enqueue_pull("r", now);
    h.coordinator.run_next(now).await.unwrap();

    for n in 0..3 {
      let payload = json!({ "edit": n });
      local_write(&h.store, "a", "r", payload.clone(), now);
      h.coordinator.enqueue_pull("r", now);
      h.coordinator.run_next(now).await.unwrap();

      let a = h.store.get("a").unwrap().unwrap();
      assert_eq!(a.payload, payload);
      assert_eq!(a.version, 3);
      assert!(a.dirty);
    }
    assert_eq!(h.remote.fetches().len(), 4);
  }

  #[derive(Debug, Clone)]
  enum Step {
    /// Local edit stamped `at` seconds after the start
    Write { at: i64 },
    /// The remote serves this version, changed `updated` seconds after the start
    Pull { version: u64, updated: i64 },
  }

  fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
      (0i64..40).prop_map(|at| Step::Write { at }),
      (1u64..6, 0i64..40).prop_map(|(version, updated)| Step::Pull { version, updated }),
    ]
  }

  proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_dirty_payload_survives_pulls_in_any_order(steps in prop::collection::vec(step(), 1..12)) {
      let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
      runtime.block_on(async {
        let h = harness(FakeRemote::new().with_replay());
        let t0 = Utc::now();

        for (n, step) in steps.into_iter().enumerate() {
          let now = t0 + ChronoDuration::seconds(100 + n as i64);
          match step {
            Step::Write { at } => {
              let payload = json!({ "local": n });
              local_write(&h.store, "a", "r", payload.clone(), t0 + ChronoDuration::seconds(at));
              assert_eq!(h.store.get("a").unwrap().unwrap().payload, payload);
            }
            Step::Pull { version, updated } => {
              let remote =
                remote_record("a", "r", version, json!({ "remote": n }), t0 + ChronoDuration::seconds(updated));
              h.remote.put(remote.clone());
              let before = h.store.get("a").unwrap();

              h.coordinator.enqueue_pull("r", now);
              assert_eq!(h.coordinator.run_next(now).await.unwrap().1, TaskOutcome::Completed);
              // Uploads of a surviving edit are not under test here
              h.coordinator.lock_queue().cancel(&TaskKey::Record("a".to_string()));

              let after = h.store.get("a").unwrap().unwrap();
              match before {
                Some(local) if local.dirty => {
                  let remote_wins =
                    remote.version > local.version && remote.updated_at >= local.modified_at;
                  if remote_wins {
                    assert_eq!(after.payload, remote.payload);
                    assert!(!after.dirty);
                  } else {
                    assert_eq!(after.payload, local.payload);
                    assert!(after.dirty);
                    assert_eq!(after.version, local.version.max(remote.version));
                  }
                }
                Some(local) if remote.version <= local.version => assert_eq!(after, local),
                _ => {
                  assert_eq!(after.payload, remote.payload);
                  assert!(!after.dirty);
                }
              }
            }
          }
        }
      });
    }
  }

  #[tokio::test]
  async fn test_push_retries_with_growing_delays_then_succeeds() {
    let h = harness(FakeRemote::new());
    for _ in 0..3 {
      h.remote
        .reply_to_push(PushReply::Fail(RemoteError::Network("unreachable".to_string())));
    }
    let mut now = Utc::now();
    local_write(&h.store, "a", "r", json!("draft"), now);
    h.coordinator.enqueue_push("a", now);

    let mut delays = Vec::new();
    for expected_attempt in 1..=3 {
      let (_, outcome) = h.coordinator.run_next(now).await.unwrap();
      match outcome {
        TaskOutcome::Retrying { attempt, delay } => {
          assert_eq!(attempt, expected_attempt);
          delays.push(delay);
          // Not eligible before the delay elapsed
          assert!(h.coordinator.run_next(now).await.is_none());
          now = now + ChronoDuration::from_std(delay).unwrap();
        }
        other => panic!("expected retry, got {other:?}"),
      }
    }
    assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));

    assert_eq!(h.coordinator.run_next(now).await.unwrap().1, TaskOutcome::Completed);
    let a = h.store.get("a").unwrap().unwrap();
    assert!(!a.dirty);
    assert_eq!(a.version, h.remote.acks()[0].version);
    assert_eq!(h.remote.pushes().len(), 4);
    // Every resend of the unchanged record carried the same token
    let tokens: Vec<_> = h.remote.pushes().into_iter().map(|r| r.push_token).collect();
    assert!(tokens.windows(2).all(|pair| pair[0] == pair[1]));
  }

  #[tokio::test]
  async fn test_exhausted_retries_publish_failure_and_resync_resets() {
    let mut h = harness(FakeRemote::new());
    for _ in 0..5 {
      h.remote.reply_to_push(PushReply::Fail(RemoteError::Server {
        status: 503,
        message: "busy".to_string(),
      }));
    }
    let mut now = Utc::now();
    local_write(&h.store, "a", "r", json!("draft"), now);
    h.coordinator.enqueue_push("a", now);
    drain(&mut h.events);

    let mut last = None;
    while let Some((_, outcome)) = h.coordinator.run_next(now).await {
      if let TaskOutcome::Retrying { delay, .. } = &outcome {
        now = now + ChronoDuration::from_std(*delay).unwrap();
      }
      last = Some(outcome);
    }
    assert_eq!(last, Some(TaskOutcome::PermanentlyFailed { attempts: 5 }));
    assert!(h.coordinator.is_idle());
    assert!(h.store.get("a").unwrap().unwrap().dirty);

    let events = drain(&mut h.events);
    assert!(events.iter().any(|event| matches!(
      event,
      BusEvent::SyncFailed { scope: Scope::Record { id, region }, attempts: 5, .. }
        if id == "a" && region == "r"
    )));

    let resync = h.coordinator.resync(now).unwrap();
    assert_eq!(resync.pushes, 1);
    assert_eq!(h.coordinator.run_next(now).await.unwrap().1, TaskOutcome::Completed);
    assert!(!h.store.get("a").unwrap().unwrap().dirty);
  }

  #[tokio::test]
  async fn test_rejected_request_fails_without_retry() {
    let mut h = harness(FakeRemote::new());
    h.remote.reply_to_push(PushReply::Fail(RemoteError::Server {
      status: 400,
      message: "payload too large".to_string(),
    }));
    let now = Utc::now();
    local_write(&h.store, "a", "r", json!("draft"), now);
    h.coordinator.enqueue_push("a", now);
    drain(&mut h.events);

    assert_eq!(
      h.coordinator.run_next(now).await.unwrap().1,
      TaskOutcome::PermanentlyFailed { attempts: 1 }
    );
    assert!(h.coordinator.is_idle());
    assert!(h.store.get("a").unwrap().unwrap().dirty);
    assert!(matches!(
      drain(&mut h.events).as_slice(),
      [BusEvent::SyncFailed { attempts: 1, .. }]
    ));
  }

  #[tokio::test]
  async fn test_request_timeout_is_retried_like_network_error() {
    let settings = SyncSettings {
      request_timeout_secs: 1,
      ..SyncSettings::default()
    };
    let h = harness_with(FakeRemote::new().with_push_delay(Duration::from_millis(1500)), settings);
    let now = Utc::now();
    local_write(&h.store, "a", "r", json!("draft"), now);
    h.coordinator.enqueue_push("a", now);

    let (_, outcome) = h.coordinator.run_next(now).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Retrying { attempt: 1, .. }));
    assert_eq!(
      h.coordinator.task_state(&TaskKey::Record("a".to_string())),
      Some(TaskState::Retrying)
    );
    let a = h.store.get("a").unwrap().unwrap();
    assert!(a.dirty);
    assert_eq!(a.payload, json!("draft"));
    assert!(h.remote.acks().is_empty());
  }

  #[tokio::test]
  async fn test_stalled_storage_holds_until_it_returns() {
    let settings = SyncSettings {
      storage_timeout_secs: 1,
      ..SyncSettings::default()
    };
    let h = harness_with(FakeRemote::new(), settings);

    let started = Instant::now();
    let result = h
      .coordinator
      .blocking(|_| {
        std::thread::sleep(Duration::from_millis(1500));
        Ok(())
      })
      .await;
    assert!(matches!(result, Err(SyncError::StorageTimeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(1500));
  }

  #[tokio::test]
  async fn test_auth_failure_is_not_retried() {
    let mut h = harness(FakeRemote::new());
    h.remote.fail_next_fetch(RemoteError::Auth {
      status: 401,
      message: "expired".to_string(),
    });
    let now = Utc::now();
    h.coordinator.enqueue_pull("r", now);

    assert_eq!(h.coordinator.run_next(now).await.unwrap().1, TaskOutcome::AuthRequired);
    assert!(h.coordinator.is_idle());
    assert!(h.store.region_marker("r").unwrap().is_none());
    assert!(matches!(
      drain(&mut h.events).as_slice(),
      [BusEvent::AuthRequired { scope: Scope::Region(region), .. }] if region == "r"
    ));
  }

  #[tokio::test]
  async fn test_failed_pull_leaves_marker() {
    let h = harness(FakeRemote::new());
    let now = Utc::now();
    h.remote.put(remote_record("a", "r", 1, json!(1), now));
    h.coordinator.enqueue_pull("r", now);
    h.coordinator.run_next(now).await.unwrap();

    h.remote.fail_next_fetch(RemoteError::Network("reset".to_string()));
    h.coordinator.enqueue_pull("r", now);
    let (_, outcome) = h.coordinator.run_next(now).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Retrying { attempt: 1, .. }));
    assert_eq!(
      h.coordinator.task_state(&TaskKey::Region("r".to_string())),
      Some(TaskState::Retrying)
    );
    assert_eq!(h.store.region_marker("r").unwrap().unwrap().max_version, 1);
  }

  #[tokio::test]
  async fn test_push_conflict_takes_newer_remote() {
    let mut h = harness(FakeRemote::new());
    let now = Utc::now();
    local_write(&h.store, "a", "r", json!("mine"), now - ChronoDuration::minutes(5));
    h.remote.reply_to_push(PushReply::Conflict(remote_record("a", "r", 7, json!("theirs"), now)));
    h.coordinator.enqueue_push("a", now);
    drain(&mut h.events);

    assert_eq!(h.coordinator.run_next(now).await.unwrap().1, TaskOutcome::Completed);
    let a = h.store.get("a").unwrap().unwrap();
    assert_eq!(a.payload, json!("theirs"));
    assert_eq!(a.version, 7);
    assert!(!a.dirty);
    assert!(drain(&mut h.events).iter().any(|event| matches!(
      event,
      BusEvent::Conflict(conflict) if conflict.winner == ConflictWinner::Remote
    )));
  }

  #[tokio::test]
  async fn test_write_during_push_is_pushed_again() {
    let h = harness(FakeRemote::new().with_push_delay(Duration::from_millis(200)));
    let now = Utc::now();
    local_write(&h.store, "a", "r", json!("first"), now);
    h.coordinator.enqueue_push("a", now);

    let coordinator = Arc::clone(&h.coordinator);
    let running = tokio::spawn(async move { coordinator.run_next(now).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = local_write(&h.store, "a", "r", json!("second"), now);
    assert_eq!(h.coordinator.enqueue_push("a", now), Admission::Deferred);
    assert_eq!(running.await.unwrap().unwrap().1, TaskOutcome::Completed);

    let a = h.store.get("a").unwrap().unwrap();
    assert_eq!(a.payload, json!("second"));
    assert!(a.dirty);
    assert_eq!(a.version, h.remote.acks()[0].version);
    assert!(a.local_revision > second.local_revision);

    assert_eq!(h.coordinator.run_next(now).await.unwrap().1, TaskOutcome::Completed);
    let a = h.store.get("a").unwrap().unwrap();
    assert!(!a.dirty);
    assert_eq!(h.remote.pushes()[1].payload, json!("second"));
  }

  #[tokio::test]
  async fn test_pull_leaves_record_with_push_in_flight_alone() {
    let mut h = harness(FakeRemote::new().with_push_delay(Duration::from_millis(200)));
    let t0 = Utc::now();
    local_write(&h.store, "a", "r", json!("mine"), t0);
    h.coordinator.enqueue_push("a", t0);

    let coordinator = Arc::clone(&h.coordinator);
    let pushing = tokio::spawn(async move { coordinator.run_next(t0).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Someone else changed A on the server after the local edit
    h.remote.put(remote_record("a", "r", 2, json!("theirs"), t0 + ChronoDuration::seconds(5)));
    h.coordinator.enqueue_pull("r", t0);
    assert_eq!(h.coordinator.run_next(t0).await.unwrap().1, TaskOutcome::Completed);

    let a = h.store.get("a").unwrap().unwrap();
    assert_eq!(a.payload, json!("mine"));
    assert!(a.dirty);
    // Nothing was merged, so the marker stays below the skipped version
    assert_eq!(h.store.region_marker("r").unwrap().unwrap().max_version, 0);
    assert_eq!(h.coordinator.task_state(&TaskKey::Region("r".to_string())), None);

    assert_eq!(pushing.await.unwrap().unwrap().1, TaskOutcome::Completed);
    let ack = h.remote.acks()[0].clone();
    assert_eq!(ack.version, 3);
    let a = h.store.get("a").unwrap().unwrap();
    assert_eq!((a.version, a.dirty), (3, false));
    assert_eq!(a.payload, json!("mine"));

    // The region is fetched again and finds the server agreeing
    assert_eq!(
      h.coordinator.task_state(&TaskKey::Region("r".to_string())),
      Some(TaskState::Pending)
    );
    assert_eq!(h.coordinator.run_next(t0).await.unwrap().1, TaskOutcome::Completed);
    let a = h.store.get("a").unwrap().unwrap();
    assert_eq!((a.version, a.dirty), (3, false));
    assert_eq!(h.remote.fetches(), vec![("r".to_string(), 0), ("r".to_string(), 0)]);
    assert_eq!(h.store.region_marker("r").unwrap().unwrap().max_version, 3);
    assert!(!drain(&mut h.events)
      .iter()
      .any(|event| matches!(event, BusEvent::Conflict(_))));
    assert!(h.coordinator.is_idle());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_one_push_in_flight_per_record() {
    let h = harness(FakeRemote::new().with_push_delay(Duration::from_millis(20)));
    let now = Utc::now();
    local_write(&h.store, "a", "r", json!(0), now);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = h.coordinator.spawn_workers(shutdown_rx);

    let mut writers = Vec::new();
    for n in 1..=10 {
      let store = Arc::clone(&h.store);
      let coordinator = Arc::clone(&h.coordinator);
      writers.push(tokio::spawn(async move {
        local_write(&store, "a", "r", json!(n), Utc::now());
        coordinator.enqueue_push("a", Utc::now());
      }));
    }
    for writer in writers {
      writer.await.unwrap();
    }

    assert!(h.coordinator.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(h.remote.max_concurrent_pushes(), 1);
    let a = h.store.get("a").unwrap().unwrap();
    assert!(!a.dirty);
    assert_eq!(h.remote.pushes().last().unwrap().payload, a.payload);

    shutdown_tx.send(true).unwrap();
    for worker in workers {
      worker.await.unwrap();
    }
  }

  #[tokio::test]
  async fn test_change_events_follow_commits() {
    let mut h = harness(FakeRemote::new());
    let now = Utc::now();
    h.remote.put(remote_record("a", "r", 1, json!(1), now));
    h.coordinator.enqueue_pull("r", now);
    h.coordinator.run_next(now).await.unwrap();

    let events = drain(&mut h.events);
    assert!(matches!(
      events.as_slice(),
      [BusEvent::Change(change)] if change.kind == ChangeKind::Inserted && change.new_version == 1
    ));
  }
}
