//! Pure merge rules between local and remote record state.
//!
//! Everything here decides a [`Mutation`] for [`LocalStore::apply`] and
//! never touches the store itself, so the rules run inside the store's write
//! transaction and can be tested without one.
//!
//! [`LocalStore::apply`]: crate::store::LocalStore::apply

use chrono::{DateTime, Utc};

use super::conflict::{ConflictResolver, Resolution};
use crate::bus::{ConflictEvent, ConflictWinner};
use crate::remote::RemoteRecord;
use crate::store::{Mutation, Record, RecordDraft};

/// Decision for one remote record.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
  pub mutation: Mutation,
  /// Set when a dirty local record met a newer remote version
  pub conflict: Option<ConflictEvent>,
  /// The surviving local content still has to reach the remote
  pub push_needed: bool,
}

impl Merge {
  fn keep() -> Self {
    Self::plain(Mutation::Keep)
  }

  fn plain(mutation: Mutation) -> Self {
    Self {
      mutation,
      conflict: None,
      push_needed: false,
    }
  }
}

/// Draft holding the remote content as the clean, reconciled state.
fn remote_draft(remote: &RemoteRecord, min_version: u64, now: DateTime<Utc>) -> RecordDraft {
  RecordDraft {
    id: remote.id.clone(),
    region: remote.region.clone(),
    payload: remote.payload.clone(),
    version: remote.version.max(min_version),
    modified_at: remote.updated_at,
    last_synced_at: Some(now),
    dirty: false,
  }
}

/// Merge a record delivered by a region fetch.
pub fn merge_remote(
  local: Option<&Record>,
  remote: &RemoteRecord,
  resolver: &dyn ConflictResolver,
  now: DateTime<Utc>,
) -> Merge {
  let Some(local) = local else {
    if remote.deleted {
      return Merge::keep();
    }
    return Merge::plain(Mutation::Put(remote_draft(remote, 0, now)));
  };

  // Redelivery of something already merged, or older than what we hold
  if remote.version <= local.version {
    return Merge::keep();
  }

  if local.dirty {
    return resolve_conflict(local, remote, resolver, now);
  }

  if remote.deleted {
    Merge::plain(Mutation::Delete)
  } else {
    Merge::plain(Mutation::Put(remote_draft(remote, local.version, now)))
  }
}

/// Merge the authoritative record returned with a rejected push.
pub fn merge_push_conflict(
  local: Option<&Record>,
  remote: &RemoteRecord,
  resolver: &dyn ConflictResolver,
  now: DateTime<Utc>,
) -> Merge {
  match local {
    Some(local) if local.dirty => resolve_conflict(local, remote, resolver, now),
    other => merge_remote(other, remote, resolver, now),
  }
}

/// Settle a dirty local record against a remote version it was not based on.
pub fn resolve_conflict(
  local: &Record,
  remote: &RemoteRecord,
  resolver: &dyn ConflictResolver,
  now: DateTime<Utc>,
) -> Merge {
  let resolution = resolver.resolve(local, remote);
  let winner = match resolution {
    Resolution::KeepLocal => ConflictWinner::Local,
    Resolution::TakeRemote => ConflictWinner::Remote,
  };
  let conflict = Some(ConflictEvent {
    id: local.id.clone(),
    region: local.region.clone(),
    winner,
    local_revision: local.local_revision,
    local_modified_at: local.modified_at,
    remote_version: remote.version,
    remote_updated_at: remote.updated_at,
  });

  match resolution {
    Resolution::KeepLocal => {
      // The local change is now based on the remote version it beat
      let mut draft = RecordDraft::from_record(local);
      draft.version = local.version.max(remote.version);
      draft.dirty = true;
      Merge {
        mutation: Mutation::Put(draft),
        conflict,
        push_needed: true,
      }
    }
    Resolution::TakeRemote => {
      let mutation = if remote.deleted {
        Mutation::Delete
      } else {
        Mutation::Put(remote_draft(remote, local.version, now))
      };
      Merge {
        mutation,
        conflict,
        push_needed: false,
      }
    }
  }
}

/// Settle a successful push against the record as it is now.
///
/// `pushed` is the state that was sent. If the record was written again
/// while the push was in flight, the newer content stays dirty on top of the
/// acknowledged version and needs its own push. A record that became clean
/// meanwhile takes the acknowledgement when it is newer than what it holds.
pub fn apply_push_ack(
  current: Option<&Record>,
  pushed: &Record,
  ack: &RemoteRecord,
  now: DateTime<Utc>,
) -> Merge {
  let Some(current) = current else {
    return Merge::keep();
  };

  if current.local_revision == pushed.local_revision {
    if ack.deleted {
      return Merge::plain(Mutation::Delete);
    }
    return Merge::plain(Mutation::Put(remote_draft(ack, current.version, now)));
  }

  if !current.dirty {
    if ack.version <= current.version {
      return Merge::keep();
    }
    if ack.deleted {
      return Merge::plain(Mutation::Delete);
    }
    return Merge::plain(Mutation::Put(remote_draft(ack, current.version, now)));
  }

  let mut draft = RecordDraft::from_record(current);
  draft.version = current.version.max(ack.version);
  Merge {
    mutation: Mutation::Put(draft),
    conflict: None,
    push_needed: true,
  }
}
