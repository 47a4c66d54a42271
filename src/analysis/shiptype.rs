//! Unusual vessel type/size detection.
//!
//! A (shipType, shipSize) combination that historically makes up less than
//! the configured share of a cell's traffic raises an `UnusualVesselType`
//! event: the vessel is somewhere ships like it rarely go.

use std::sync::Arc;

use tracing::warn;

use crate::analysis::{Detector, Verdict};
use crate::config::DetectionConfig;
use crate::geo::Grid;
use crate::stats::repository::FeatureDataRepository;
use crate::stats::FEATURE_SHIP_TYPE_AND_SIZE;
use crate::tracker::{Track, PROP_SHIP_SIZE_BUCKET, PROP_SHIP_TYPE};

pub const EVENT_TYPE: &str = "UnusualVesselType";

pub struct ShipTypeAndSizeDetector {
    stats: Arc<FeatureDataRepository>,
    grid: Grid,
    rare_quantile: f64,
    min_samples: u64,
}

impl ShipTypeAndSizeDetector {
    pub fn new(stats: Arc<FeatureDataRepository>, grid: Grid, config: &DetectionConfig) -> Self {
        Self {
            stats,
            grid,
            rare_quantile: config.rare_quantile,
            min_samples: config.min_samples,
        }
    }
}

impl Detector for ShipTypeAndSizeDetector {
    fn name(&self) -> &str {
        "ship-type-and-size"
    }

    fn event_type(&self) -> &str {
        EVENT_TYPE
    }

    fn evaluate(&self, track: &Track) -> Verdict {
        let (Some(ship_type), Some(ship_size)) = (
            track.property_u32(PROP_SHIP_TYPE),
            track.property_u32(PROP_SHIP_SIZE_BUCKET),
        ) else {
            return Verdict::Indeterminate;
        };

        let cell = self.grid.cell_of(track.position);
        let data = match self.stats.feature_data(cell, FEATURE_SHIP_TYPE_AND_SIZE) {
            Ok(Some(data)) => data,
            Ok(None) => return Verdict::Indeterminate,
            Err(e) => {
                warn!(cell, "feature lookup failed: {e:#}");
                return Verdict::Indeterminate;
            }
        };

        let total = data.total_count();
        if total < self.min_samples {
            return Verdict::Indeterminate;
        }

        let count = data.stat(&[ship_type, ship_size]).map_or(0, |s| s.count);
        let share = count as f64 / total as f64;

        if share < self.rare_quantile {
            let center = self.grid.center_of(cell);
            Verdict::Abnormal {
                title: format!("Unusual vessel type near {center}"),
                description: format!(
                    "Vessel {} (type {}, size bucket {}) seen near {}; \
                     {:.2}% of {} historical observations match",
                    track.mmsi,
                    ship_type,
                    ship_size,
                    center,
                    share * 100.0,
                    total
                ),
            }
        } else {
            Verdict::Normal
        }
    }
}
