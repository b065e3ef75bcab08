//! Turns location samples into region fetches.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::grid::{Cell, CellGrid};
use crate::config::LocationSettings;
use crate::sync::SyncCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
  /// Non-finite, out of range, or the (0, 0) placeholder fix
  InvalidCoordinates,
  PoorAccuracy,
  /// Older than a sample already accepted
  OutOfOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocationDecision {
  Ignored(IgnoreReason),
  /// Same cell and it is still fresh, or every cell around it is
  Unchanged(Cell),
  /// `regions` lists the fetches requested, centre cell first when stale
  Triggered { cell: Cell, regions: Vec<String> },
}

#[derive(Default)]
struct TriggerState {
  last_cell: Option<Cell>,
  last_sample_ms: Option<i64>,
  /// When each region was last requested by this trigger
  triggered_at: HashMap<String, DateTime<Utc>>,
}

pub struct LocationTrigger {
  coordinator: Arc<SyncCoordinator>,
  grid: CellGrid,
  settings: LocationSettings,
  state: Mutex<TriggerState>,
}

fn valid_coordinates(lat: f64, lon: f64) -> bool {
  lat.is_finite()
    && lon.is_finite()
    && lat.abs() <= 90.0
    && lon.abs() <= 180.0
    && !(lat == 0.0 && lon == 0.0)
}

impl LocationTrigger {
  pub fn new(coordinator: Arc<SyncCoordinator>, settings: LocationSettings) -> Self {
    Self {
      coordinator,
      grid: CellGrid::new(settings.cell_size_deg),
      settings,
      state: Mutex::new(TriggerState::default()),
    }
  }

  pub fn grid(&self) -> &CellGrid {
    &self.grid
  }

  pub fn on_location_update(
    &self,
    lat: f64,
    lon: f64,
    accuracy_m: f64,
    timestamp_ms: i64,
  ) -> LocationDecision {
    self.on_location_update_at(lat, lon, accuracy_m, timestamp_ms, Utc::now())
  }

  /// [`on_location_update`](Self::on_location_update) with an explicit clock.
  pub fn on_location_update_at(
    &self,
    lat: f64,
    lon: f64,
    accuracy_m: f64,
    timestamp_ms: i64,
    now: DateTime<Utc>,
  ) -> LocationDecision {
    if !valid_coordinates(lat, lon) {
      debug!(lat, lon, "Ignoring invalid location");
      return LocationDecision::Ignored(IgnoreReason::InvalidCoordinates);
    }
    if !(accuracy_m.is_finite() && accuracy_m >= 0.0 && accuracy_m <= self.settings.max_accuracy_m) {
      debug!(accuracy_m, "Ignoring inaccurate location");
      return LocationDecision::Ignored(IgnoreReason::PoorAccuracy);
    }

    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.last_sample_ms.is_some_and(|last| timestamp_ms < last) {
      debug!(timestamp_ms, "Ignoring out-of-order location");
      return LocationDecision::Ignored(IgnoreReason::OutOfOrder);
    }
    state.last_sample_ms = Some(timestamp_ms);

    let cell = self.grid.cell_of(lat, lon);
    let moved = state.last_cell != Some(cell);
    if !moved && self.is_fresh(&state, &cell.region_id(), now) {
      return LocationDecision::Unchanged(cell);
    }

    let around: Vec<String> = self
      .grid
      .neighbourhood(cell)
      .iter()
      .map(Cell::region_id)
      .collect();

    if moved {
      self.cancel_superseded(&mut state, &around);
      state.last_cell = Some(cell);
    }

    let staleness = self.settings.staleness();
    state.triggered_at.retain(|_, at| now - *at <= staleness);
    let regions: Vec<String> = around
      .into_iter()
      .filter(|region| !self.is_fresh(&state, region, now))
      .collect();
    if regions.is_empty() {
      debug!(cell = %cell, "Neighbourhood already fresh");
      return LocationDecision::Unchanged(cell);
    }

    for region in &regions {
      self.coordinator.enqueue_pull(region, now);
      state.triggered_at.insert(region.clone(), now);
    }

    info!(cell = %cell, moved, regions = regions.len(), "Location triggered region fetch");
    LocationDecision::Triggered { cell, regions }
  }

  /// A cell is fresh when it was synced or requested within the staleness
  /// window.
  fn is_fresh(&self, state: &TriggerState, region: &str, now: DateTime<Utc>) -> bool {
    let synced = match self.coordinator.region_last_synced(region) {
      Ok(synced) => synced,
      Err(e) => {
        warn!(region, error = %e, "Could not read region marker");
        None
      }
    };
    let requested = state.triggered_at.get(region).copied();
    match synced.max(requested) {
      Some(at) => now - at <= self.settings.staleness(),
      None => false,
    }
  }

  /// Drop pending fetches this trigger requested for cells that are no
  /// longer around the device. A cancelled fetch no longer counts as fresh.
  fn cancel_superseded(&self, state: &mut TriggerState, keep: &[String]) {
    let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
    for region in self.coordinator.pending_regions() {
      if keep.contains(region.as_str()) || !state.triggered_at.contains_key(&region) {
        continue;
      }
      if self.coordinator.cancel_pull(&region) {
        state.triggered_at.remove(&region);
        debug!(region, "Cancelled superseded region fetch");
      }
    }
  }
}
