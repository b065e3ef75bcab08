//! Fixed-size geographic grid mapping coordinates to region ids.

use std::fmt;

/// A grid cell, counted from the south pole and the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell {
  pub lat: i64,
  pub lon: i64,
}

impl Cell {
  /// Region id used by the store and the remote, e.g. "13885:18229".
  pub fn region_id(&self) -> String {
    self.to_string()
  }
}

impl fmt::Display for Cell {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.lat, self.lon)
  }
}

#[derive(Debug, Clone, Copy)]
pub struct CellGrid {
  size: f64,
  lat_cells: i64,
  lon_cells: i64,
}

/// Number of cells spanning `span` degrees. Spans that are a whole multiple
/// of the cell size up to float error are not given an extra sliver cell.
fn cells_across(span: f64, size: f64) -> i64 {
  let n = span / size;
  let rounded = n.round();
  let cells = if (n - rounded).abs() < 1e-6 { rounded } else { n.ceil() };
  (cells as i64).max(1)
}

impl CellGrid {
  pub fn new(size_deg: f64) -> Self {
    Self {
      size: size_deg,
      lat_cells: cells_across(180.0, size_deg),
      lon_cells: cells_across(360.0, size_deg),
    }
  }

  /// The cell containing a coordinate. Latitude is clamped to the poles and
  /// longitude wraps around.
  pub fn cell_of(&self, lat: f64, lon: f64) -> Cell {
    let lat_cell = ((lat + 90.0) / self.size).floor() as i64;
    let lon_offset = (lon + 180.0).rem_euclid(360.0);
    let lon_cell = (lon_offset / self.size).floor() as i64;
    Cell {
      lat: lat_cell.clamp(0, self.lat_cells - 1),
      lon: lon_cell.rem_euclid(self.lon_cells),
    }
  }

  /// The cell and its up to eight neighbours, the cell itself first. There
  /// is nothing beyond the poles; across the antimeridian the grid wraps.
  pub fn neighbourhood(&self, cell: Cell) -> Vec<Cell> {
    let mut cells = vec![cell];
    for dlat in -1..=1 {
      for dlon in -1..=1 {
        let lat = cell.lat + dlat;
        if lat < 0 || lat >= self.lat_cells {
          continue;
        }
        let neighbour = Cell {
          lat,
          lon: (cell.lon + dlon).rem_euclid(self.lon_cells),
        };
        if !cells.contains(&neighbour) {
          cells.push(neighbour);
        }
      }
    }
    cells
  }
}
