use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("Stale write for {id}: incoming version {incoming} is older than stored version {stored}")]
  StaleWrite { id: String, stored: u64, incoming: u64 },

  #[error("Record not found: {0}")]
  NotFound(String),

  #[error("Database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("Failed to encode or decode payload: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Invalid timestamp in store: {0}")]
  Timestamp(String),

  #[error("Failed to prepare storage location: {0}")]
  Io(#[from] std::io::Error),

  #[error("Store lock poisoned")]
  LockPoisoned,
}
