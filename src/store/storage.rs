//! SQLite-backed record store.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::error::StoreError;
use super::record::{Record, RecordDraft, RegionMarker};
use super::schema::SCHEMA;
use crate::bus::{BusEvent, ChangeBus, ChangeEvent, ChangeKind};

const RECORD_COLUMNS: &str = "id, region, payload, version, local_revision, modified_at, \
   last_synced_at, dirty, push_token, deleted";

/// What an [`LocalStore::apply`] callback wants done with the record.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  /// Leave the record as it is
  Keep,
  /// Commit this content
  Put(RecordDraft),
  /// Remove the record
  Delete,
}

/// Result of an [`LocalStore::apply`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
  /// Nothing was written; carries the current record, if any
  Unchanged(Option<Record>),
  Committed(Record),
  /// The record was removed; carries its last committed state
  Deleted(Record),
}

impl Applied {
  pub fn committed(&self) -> Option<&Record> {
    match self {
      Applied::Committed(record) => Some(record),
      _ => None,
    }
  }
}

/// Durable record storage.
///
/// Every write goes through one connection mutex and one SQLite transaction,
/// so writes are atomic and serialized per id. A change event is published
/// once the transaction has committed, while the mutex is still held, which
/// keeps event order identical to commit order.
pub struct LocalStore {
  conn: Mutex<Connection>,
  bus: ChangeBus,
}

impl LocalStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path, bus: ChangeBus, busy_timeout: Duration) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    debug!(path = %path.display(), journal_mode = %mode, "Opened record store");

    Self::with_connection(conn, bus)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory(bus: ChangeBus) -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?, bus)
  }

  fn with_connection(conn: Connection, bus: ChangeBus) -> Result<Self, StoreError> {
    conn.execute_batch(SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
      bus,
    })
  }

  /// The bus this store publishes to.
  pub fn bus(&self) -> &ChangeBus {
    &self.bus
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }

  pub fn get(&self, id: &str) -> Result<Option<Record>, StoreError> {
    let conn = self.lock()?;
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1 AND deleted = 0");
    let raw = conn.query_row(&sql, params![id], RawRow::read).optional()?;
    raw.map(|raw| raw.into_record().map(|(record, _)| record)).transpose()
  }

  /// All live records of a region, ordered by id.
  pub fn query(&self, region: &str) -> Result<Vec<Record>, StoreError> {
    self.select_many(
      &format!("SELECT {RECORD_COLUMNS} FROM records WHERE region = ?1 AND deleted = 0 ORDER BY id"),
      params![region],
    )
  }

  /// Records with an unconfirmed local change.
  pub fn dirty_records(&self) -> Result<Vec<Record>, StoreError> {
    self.select_many(
      &format!("SELECT {RECORD_COLUMNS} FROM records WHERE dirty = 1 AND deleted = 0 ORDER BY id"),
      [],
    )
  }

  fn select_many(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Record>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
      .query_map(args, RawRow::read)?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|raw| raw.into_record().map(|(record, _)| record))
      .collect()
  }

  /// Regions holding records that were not reconciled since `cutoff`, plus
  /// previously synced regions whose marker is older than `cutoff`.
  pub fn stale_regions(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT DISTINCT r.region FROM records r
       LEFT JOIN region_sync s ON s.region = r.region
       WHERE r.deleted = 0 AND (s.last_synced_at IS NULL OR s.last_synced_at < ?1)
       UNION
       SELECT region FROM region_sync WHERE last_synced_at < ?1
       ORDER BY 1",
    )?;
    let regions = stmt
      .query_map(params![format_time(cutoff)], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(regions)
  }

  pub fn region_marker(&self, region: &str) -> Result<Option<RegionMarker>, StoreError> {
    let conn = self.lock()?;
    select_marker(&conn, region)
  }

  /// Record a completed fetch. The marker never moves backwards.
  pub fn advance_region(
    &self,
    region: &str,
    max_version: u64,
    synced_at: DateTime<Utc>,
  ) -> Result<RegionMarker, StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO region_sync (region, max_version, last_synced_at) VALUES (?1, ?2, ?3)
       ON CONFLICT(region) DO UPDATE SET
         max_version = MAX(max_version, excluded.max_version),
         last_synced_at = excluded.last_synced_at",
      params![region, max_version as i64, format_time(synced_at)],
    )?;
    select_marker(&conn, region)?.ok_or_else(|| StoreError::NotFound(region.to_string()))
  }

  /// Commit a record. Fails with [`StoreError::StaleWrite`] if the draft's
  /// version is older than the stored one.
  pub fn upsert(&self, draft: RecordDraft) -> Result<Record, StoreError> {
    let id = draft.id.clone();
    match self.apply(&id, move |_| Ok(Mutation::Put(draft)))? {
      Applied::Committed(record) => Ok(record),
      _ => Err(StoreError::NotFound(id)),
    }
  }

  /// Flag an existing record as locally modified.
  pub fn mark_dirty(&self, id: &str, now: DateTime<Utc>) -> Result<Record, StoreError> {
    let applied = self.apply(id, |current| {
      let current = current.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
      let mut draft = RecordDraft::from_record(current);
      draft.dirty = true;
      draft.modified_at = now;
      Ok(Mutation::Put(draft))
    })?;

    match applied {
      Applied::Committed(record) => Ok(record),
      _ => Err(StoreError::NotFound(id.to_string())),
    }
  }

  /// Remove a record. Returns its last state if it existed.
  pub fn delete(&self, id: &str) -> Result<Option<Record>, StoreError> {
    match self.apply(id, |_| Ok(Mutation::Delete))? {
      Applied::Deleted(record) => Ok(Some(record)),
      _ => Ok(None),
    }
  }

  /// Atomic read-modify-write of a single record.
  ///
  /// `decide` sees the current live record (or `None`) and returns the
  /// mutation to commit. It runs inside the write transaction, so no other
  /// write to the store can interleave with it.
  pub fn apply<F>(&self, id: &str, decide: F) -> Result<Applied, StoreError>
  where
    F: FnOnce(Option<&Record>) -> Result<Mutation, StoreError>,
  {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing = select_row(&tx, id)?;
    let last_revision = existing.as_ref().map_or(0, |(record, _)| record.local_revision);
    let live = existing.and_then(|(record, deleted)| (!deleted).then_some(record));

    let (event, applied) = match decide(live.as_ref())? {
      Mutation::Keep => return Ok(Applied::Unchanged(live)),
      Mutation::Put(mut draft) => {
        if let Some(current) = &live {
          if draft.version < current.version {
            warn!(
              id,
              stored = current.version,
              incoming = draft.version,
              "Rejecting stale write"
            );
            return Err(StoreError::StaleWrite {
              id: id.to_string(),
              stored: current.version,
              incoming: draft.version,
            });
          }
        }

        draft.id = id.to_string();
        let kind = if live.is_some() {
          ChangeKind::Updated
        } else {
          ChangeKind::Inserted
        };
        let record = draft.into_record(last_revision + 1);
        write_record(&tx, &record)?;

        let event = ChangeEvent {
          id: record.id.clone(),
          region: record.region.clone(),
          kind,
          new_version: record.version,
        };
        (event, Applied::Committed(record))
      }
      Mutation::Delete => {
        let Some(current) = live else {
          return Ok(Applied::Unchanged(None));
        };

        tx.execute(
          "UPDATE records SET deleted = 1, dirty = 0, push_token = NULL, local_revision = ?2
           WHERE id = ?1",
          params![id, (last_revision + 1) as i64],
        )?;

        let event = ChangeEvent {
          id: current.id.clone(),
          region: current.region.clone(),
          kind: ChangeKind::Deleted,
          new_version: current.version,
        };
        (event, Applied::Deleted(current))
      }
    };

    tx.commit()?;
    self.bus.publish(BusEvent::Change(event));

    Ok(applied)
  }
}

fn select_row(tx: &Transaction<'_>, id: &str) -> Result<Option<(Record, bool)>, StoreError> {
  let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
  let raw = tx.query_row(&sql, params![id], RawRow::read).optional()?;
  raw.map(RawRow::into_record).transpose()
}

fn select_marker(conn: &Connection, region: &str) -> Result<Option<RegionMarker>, StoreError> {
  let row: Option<(i64, String)> = conn
    .query_row(
      "SELECT max_version, last_synced_at FROM region_sync WHERE region = ?1",
      params![region],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?;

  row
    .map(|(max_version, synced)| {
      Ok(RegionMarker {
        region: region.to_string(),
        max_version: max_version as u64,
        last_synced_at: parse_time(&synced)?,
      })
    })
    .transpose()
}

fn write_record(tx: &Transaction<'_>, record: &Record) -> Result<(), StoreError> {
  let payload = serde_json::to_string(&record.payload)?;
  tx.execute(
    "INSERT OR REPLACE INTO records
       (id, region, payload, version, local_revision, modified_at, last_synced_at, dirty, push_token, deleted)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
    params![
      record.id,
      record.region,
      payload,
      record.version as i64,
      record.local_revision as i64,
      format_time(record.modified_at),
      record.last_synced_at.map(format_time),
      record.dirty,
      record.push_token,
    ],
  )?;
  Ok(())
}

/// Column values as SQLite hands them back.
struct RawRow {
  id: String,
  region: String,
  payload: String,
  version: i64,
  local_revision: i64,
  modified_at: String,
  last_synced_at: Option<String>,
  dirty: bool,
  push_token: Option<String>,
  deleted: bool,
}

impl RawRow {
  fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      region: row.get(1)?,
      payload: row.get(2)?,
      version: row.get(3)?,
      local_revision: row.get(4)?,
      modified_at: row.get(5)?,
      last_synced_at: row.get(6)?,
      dirty: row.get(7)?,
      push_token: row.get(8)?,
      deleted: row.get(9)?,
    })
  }

  fn into_record(self) -> Result<(Record, bool), StoreError> {
    let record = Record {
      payload: serde_json::from_str(&self.payload)?,
      version: self.version as u64,
      local_revision: self.local_revision as u64,
      modified_at: parse_time(&self.modified_at)?,
      last_synced_at: self.last_synced_at.as_deref().map(parse_time).transpose()?,
      dirty: self.dirty,
      push_token: self.push_token,
      id: self.id,
      region: self.region,
    };
    Ok((record, self.deleted))
  }
}

/// Fixed-width RFC 3339, so stored timestamps compare correctly as text.
fn format_time(time: DateTime<Utc>) -> String {
  time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|time| time.with_timezone(&Utc))
    .map_err(|_| StoreError::Timestamp(s.to_string()))
}
