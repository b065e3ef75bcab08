//! Conflict resolution between a dirty local record and a newer remote one.

use crate::remote::RemoteRecord;
use crate::store::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
  KeepLocal,
  TakeRemote,
}

/// Decides which side of a conflict survives. Only called when the local
/// record is dirty and the remote holds a version the local change was not
/// based on.
pub trait ConflictResolver: Send + Sync {
  fn resolve(&self, local: &Record, remote: &RemoteRecord) -> Resolution;
}

/// The strictly later timestamp wins; a tie goes to the remote.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
  fn resolve(&self, local: &Record, remote: &RemoteRecord) -> Resolution {
    if local.modified_at > remote.updated_at {
      Resolution::KeepLocal
    } else {
      Resolution::TakeRemote
    }
  }
}
