//! In-process publish/subscribe channel for committed cache changes.
//!
//! The bus keeps only the sending half of each subscriber's channel. The
//! receiving half lives in the [`Subscription`] handed to the consumer, so the
//! bus never keeps a consumer alive, and a subscription only holds a weak
//! reference back to the bus, so consumers never keep the engine alive either.
//! Dropping a subscription removes it from the subscriber set immediately.

use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-subscriber buffer. A subscriber that falls further behind than this
/// starts losing events rather than growing memory without bound.
const SUBSCRIBER_BUFFER: usize = 1024;

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Inserted,
  Updated,
  Deleted,
}

/// Published once per committed store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
  pub id: String,
  pub region: String,
  pub kind: ChangeKind,
  pub new_version: u64,
}

/// Which side of a conflict kept its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
  Local,
  Remote,
}

/// Informational report of a resolved conflict. The losing side's content is
/// gone by the time this is published.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEvent {
  pub id: String,
  pub region: String,
  pub winner: ConflictWinner,
  pub local_revision: u64,
  pub local_modified_at: DateTime<Utc>,
  pub remote_version: u64,
  pub remote_updated_at: DateTime<Utc>,
}

/// What a sync failure was about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
  Region(String),
  Record { id: String, region: String },
}

impl Scope {
  fn region(&self) -> &str {
    match self {
      Scope::Region(region) => region,
      Scope::Record { region, .. } => region,
    }
  }

  fn id(&self) -> Option<&str> {
    match self {
      Scope::Region(_) => None,
      Scope::Record { id, .. } => Some(id),
    }
  }
}

/// Everything that travels over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
  Change(ChangeEvent),
  Conflict(ConflictEvent),
  /// A task exhausted its retries. The record (if any) stays dirty.
  SyncFailed {
    scope: Scope,
    attempts: u32,
    error: String,
  },
  /// The remote rejected our credentials; nothing is retried until the
  /// caller re-authenticates and triggers a resync.
  AuthRequired { scope: Scope, error: String },
}

impl BusEvent {
  fn region(&self) -> &str {
    match self {
      BusEvent::Change(event) => &event.region,
      BusEvent::Conflict(event) => &event.region,
      BusEvent::SyncFailed { scope, .. } | BusEvent::AuthRequired { scope, .. } => scope.region(),
    }
  }

  fn id(&self) -> Option<&str> {
    match self {
      BusEvent::Change(event) => Some(&event.id),
      BusEvent::Conflict(event) => Some(&event.id),
      BusEvent::SyncFailed { scope, .. } | BusEvent::AuthRequired { scope, .. } => scope.id(),
    }
  }
}

/// Selects the events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
  All,
  Record(String),
  Region(String),
}

impl Filter {
  pub fn matches(&self, event: &BusEvent) -> bool {
    match self {
      Filter::All => true,
      Filter::Record(id) => event.id() == Some(id.as_str()),
      Filter::Region(region) => event.region() == region,
    }
  }
}

struct Subscriber {
  filter: Filter,
  tx: mpsc::Sender<BusEvent>,
}

#[derive(Default)]
struct BusInner {
  next_id: AtomicU64,
  subscribers: Mutex<HashMap<u64, Subscriber>>,
}

/// Cloneable handle to the bus; all clones share one subscriber set.
#[derive(Clone, Default)]
pub struct ChangeBus {
  inner: Arc<BusInner>,
}

impl ChangeBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new subscriber. Delivery starts with the next published event.
  pub fn subscribe(&self, filter: Filter) -> Subscription {
    register(&self.inner, filter)
  }

  /// Deliver an event to every matching subscriber. Returns how many
  /// subscribers received it.
  pub fn publish(&self, event: BusEvent) -> usize {
    let mut subscribers = match self.inner.subscribers.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    let mut delivered = 0;
    subscribers.retain(|id, subscriber| {
      if !subscriber.filter.matches(&event) {
        return !subscriber.tx.is_closed();
      }
      match subscriber.tx.try_send(event.clone()) {
        Ok(()) => {
          delivered += 1;
          true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
          warn!(subscriber = id, "Subscriber is lagging, dropping event");
          true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
          debug!(subscriber = id, "Pruning closed subscriber");
          false
        }
      }
    });

    delivered
  }

  pub fn subscriber_count(&self) -> usize {
    self
      .inner
      .subscribers
      .lock()
      .map(|subscribers| subscribers.len())
      .unwrap_or(0)
  }
}

fn register(inner: &Arc<BusInner>, filter: Filter) -> Subscription {
  let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
  let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

  let mut subscribers = match inner.subscribers.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  };
  subscribers.insert(
    id,
    Subscriber {
      filter: filter.clone(),
      tx,
    },
  );

  Subscription {
    id,
    filter,
    bus: Arc::downgrade(inner),
    rx,
  }
}

/// A live subscription. Implements [`Stream`]; the stream ends when the bus
/// itself is dropped.
pub struct Subscription {
  id: u64,
  filter: Filter,
  bus: Weak<BusInner>,
  rx: mpsc::Receiver<BusEvent>,
}

impl Subscription {
  pub fn scope_filter(&self) -> &Filter {
    &self.filter
  }

  /// Start a fresh sequence with the same filter. Returns `None` once the
  /// bus is gone.
  pub fn resubscribe(&self) -> Option<Subscription> {
    self
      .bus
      .upgrade()
      .map(|inner| register(&inner, self.filter.clone()))
  }

  /// Wait for the next event.
  pub async fn recv(&mut self) -> Option<BusEvent> {
    self.rx.recv().await
  }

  /// Take the next buffered event without waiting.
  pub fn try_next(&mut self) -> Option<BusEvent> {
    self.rx.try_recv().ok()
  }
}

impl Stream for Subscription {
  type Item = BusEvent;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.get_mut().rx.poll_recv(cx)
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.bus.upgrade() {
      if let Ok(mut subscribers) = inner.subscribers.lock() {
        subscribers.remove(&self.id);
      }
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("id", &self.id)
      .field("filter", &self.filter)
      .finish_non_exhaustive()
  }
}
