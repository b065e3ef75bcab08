//! Durable local cache of records.
//!
//! This module knows nothing about the network. It provides:
//! - Versioned records with a locally assigned revision per write
//! - Atomic single-record read-modify-write (`LocalStore::apply`)
//! - Region-scoped queries and a per-region high-water version marker
//! - A change event on the bus for every committed write

mod error;
mod record;
mod schema;
mod storage;

pub use error::StoreError;
pub use record::{push_token, Record, RecordDraft, RegionMarker};
pub use storage::{Applied, LocalStore, Mutation};
