//! Reconciliation between the local store and the remote source.

mod backoff;
mod conflict;
mod coordinator;
mod error;
pub mod merge;
mod queue;
mod task;

pub use backoff::Backoff;
pub use conflict::{ConflictResolver, LastWriterWins, Resolution};
pub use coordinator::{Resync, SyncCoordinator};
pub use error::SyncError;
pub use queue::Admission;
pub use task::{SyncTask, TaskKey, TaskKind, TaskOutcome, TaskState};
