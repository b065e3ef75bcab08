//! Location-driven prefetching of nearby regions.

mod grid;
mod trigger;

pub use grid::{Cell, CellGrid};
pub use trigger::{IgnoreReason, LocationDecision, LocationTrigger};
