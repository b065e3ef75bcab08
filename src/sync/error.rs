use thiserror::Error;

use crate::remote::RemoteError;
use crate::store::StoreError;

/// Why a single task attempt failed. Never leaves the coordinator: transient
/// failures are retried, and only the final outcome is published.
#[derive(Error, Debug)]
pub enum SyncError {
  #[error(transparent)]
  Remote(#[from] RemoteError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("Storage operation timed out after {0:?}")]
  StorageTimeout(std::time::Duration),

  #[error("Storage worker failed: {0}")]
  Worker(String),
}

impl SyncError {
  pub fn is_auth(&self) -> bool {
    matches!(self, SyncError::Remote(RemoteError::Auth { .. }))
  }

  /// Local storage trouble is always worth another attempt; remote errors
  /// only when transient.
  pub fn is_retryable(&self) -> bool {
    match self {
      SyncError::Remote(err) => err.is_retryable(),
      SyncError::Store(_) | SyncError::StorageTimeout(_) | SyncError::Worker(_) => true,
    }
  }
}
