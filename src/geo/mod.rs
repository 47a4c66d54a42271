//! Geographic primitives -- positions and the statistics grid.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Equatorial circumference, meters.
const EARTH_CIRCUMFERENCE_METERS: f64 = 40_075_017.0;
pub const METERS_PER_DEGREE: f64 = EARTH_CIRCUMFERENCE_METERS / 360.0;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("grid resolution must be a positive number of meters, got {0}")]
    InvalidResolution(f64),
}

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.4}, {:.4})", self.latitude, self.longitude)
    }
}

/// Maps continuous coordinates to discrete statistics cells at a fixed
/// resolution. Pure arithmetic, so cell ids are stable across store
/// open/close. The resolution is fixed when the feature store is built and
/// the analyzer derives it from the store's metadata.
#[derive(Debug, Clone, Copy)]
pub struct Grid {
    resolution_meters: f64,
    degree_span: f64,
    cells_per_row: i64,
    rows: i64,
}

impl Grid {
    pub fn new(resolution_meters: f64) -> Result<Self, GeoError> {
        // `> 0.0` is false for NaN as well
        if !(resolution_meters > 0.0) {
            return Err(GeoError::InvalidResolution(resolution_meters));
        }
        let degree_span = resolution_meters / METERS_PER_DEGREE;
        let cells_per_row = (360.0 / degree_span).ceil() as i64;
        let rows = (180.0 / degree_span).ceil() as i64;
        Ok(Self {
            resolution_meters,
            degree_span,
            cells_per_row,
            rows,
        })
    }

    pub fn resolution(&self) -> f64 {
        self.resolution_meters
    }

    /// Map a position to its cell id. Two positions map to the same cell iff
    /// they fall in the same resolution-sized bucket. Latitude 90 and
    /// longitude 180 close the last bucket rather than opening a new one, so
    /// the boundary cannot alias into the next row.
    pub fn cell_of(&self, position: Position) -> i64 {
        let row = (((position.latitude + 90.0) / self.degree_span).floor() as i64)
            .clamp(0, self.rows - 1);
        let col = (((position.longitude + 180.0) / self.degree_span).floor() as i64)
            .clamp(0, self.cells_per_row - 1);
        row * self.cells_per_row + col
    }

    /// Approximate center of a cell, for reverse lookup and event text.
    pub fn center_of(&self, cell: i64) -> Position {
        let row = cell.div_euclid(self.cells_per_row);
        let col = cell.rem_euclid(self.cells_per_row);
        Position {
            latitude: (row as f64 + 0.5) * self.degree_span - 90.0,
            longitude: (col as f64 + 0.5) * self.degree_span - 180.0,
        }
    }
}
