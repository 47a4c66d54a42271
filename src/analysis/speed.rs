//! Abnormal speed-over-ground detection.
//!
//! Compares a track's current speed against the historical speed
//! distribution for its grid cell and ship type. Faster-than-normal beyond
//! the configured z-score threshold raises an `AbnormalSpeed` event.

use std::sync::Arc;

use tracing::warn;

use crate::analysis::{Detector, Verdict};
use crate::config::DetectionConfig;
use crate::geo::Grid;
use crate::stats::repository::FeatureDataRepository;
use crate::stats::FEATURE_SPEED_OVER_GROUND;
use crate::tracker::{Track, PROP_SHIP_TYPE};

pub const EVENT_TYPE: &str = "AbnormalSpeed";

pub struct SpeedOverGroundDetector {
    stats: Arc<FeatureDataRepository>,
    grid: Grid,
    z_threshold: f64,
    min_samples: u64,
}

impl SpeedOverGroundDetector {
    pub fn new(stats: Arc<FeatureDataRepository>, grid: Grid, config: &DetectionConfig) -> Self {
        Self {
            stats,
            grid,
            z_threshold: config.speed_z_threshold,
            min_samples: config.min_samples,
        }
    }
}

impl Detector for SpeedOverGroundDetector {
    fn name(&self) -> &str {
        "speed-over-ground"
    }

    fn event_type(&self) -> &str {
        EVENT_TYPE
    }

    fn evaluate(&self, track: &Track) -> Verdict {
        let Some(ship_type) = track.property_u32(PROP_SHIP_TYPE) else {
            return Verdict::Indeterminate;
        };

        let cell = self.grid.cell_of(track.position);
        let data = match self.stats.feature_data(cell, FEATURE_SPEED_OVER_GROUND) {
            Ok(Some(data)) => data,
            Ok(None) => return Verdict::Indeterminate,
            Err(e) => {
                warn!(cell, "feature lookup failed: {e:#}");
                return Verdict::Indeterminate;
            }
        };

        let Some(stat) = data.stat(&[ship_type]) else {
            return Verdict::Indeterminate;
        };
        if stat.count < self.min_samples {
            return Verdict::Indeterminate;
        }

        let sog = track.speed_over_ground as f64;
        let std_dev = stat.std_dev();
        let z = if std_dev > 1e-4 {
            (sog - stat.mean()) / std_dev
        } else if (sog - stat.mean()).abs() > f64::EPSILON {
            // constant baseline: any deviation is infinite
            f64::INFINITY
        } else {
            0.0
        };

        if z > self.z_threshold {
            let center = self.grid.center_of(cell);
            Verdict::Abnormal {
                title: format!("Abnormal speed of vessel {}", track.mmsi),
                description: format!(
                    "Vessel {} observed at {:.1} kn near {} where ships of type {} average {:.1} kn (z = {:.1})",
                    track.mmsi,
                    sog,
                    center,
                    ship_type,
                    stat.mean(),
                    z
                ),
            }
        } else {
            Verdict::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Position;
    use crate::reader::PositionReport;
    use crate::stats::FeatureData;
    use crate::tracker::TrackingService;
    use chrono::{TimeZone, Utc};

    const MMSI: u32 = 123456789;

    fn track_at(sog: f32, with_identity: bool) -> Track {
        let svc = TrackingService::new(&crate::config::TrackerConfig::default());
        if with_identity {
            svc.apply_identity(&crate::reader::IdentityReport {
                mmsi: MMSI,
                ship_type: 7,
                ship_length_meters: Some(100.0),
                name: None,
                timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            });
        }
        svc.update(&PositionReport {
            mmsi: MMSI,
            latitude: 55.1,
            longitude: 10.2,
            course_over_ground: 90.0,
            speed_over_ground: sog,
            timestamp: Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
        });
        svc.track(MMSI).unwrap()
    }

    fn detector_with_baseline(
        dir: &tempfile::TempDir,
        mean: f64,
        spread: f64,
    ) -> SpeedOverGroundDetector {
        let grid = Grid::new(200.0).unwrap();
        let path = dir.path().join("stats.db");
        let repo = FeatureDataRepository::open_for_write(&path, grid.resolution()).unwrap();

        let cell = grid.cell_of(Position::new(55.1, 10.2));
        let mut data = FeatureData::new(FEATURE_SPEED_OVER_GROUND, &["shipType"]);
        for i in 0..20 {
            let value = if i % 2 == 0 { mean - spread } else { mean + spread };
            data.fold(&[7], value);
        }
        repo.put_feature_data(cell, FEATURE_SPEED_OVER_GROUND, &data).unwrap();

        SpeedOverGroundDetector::new(Arc::new(repo), grid, &DetectionConfig::default())
    }

    #[test]
    fn test_fast_vessel_is_abnormal() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector_with_baseline(&dir, 8.0, 0.1);
        let verdict = detector.evaluate(&track_at(25.0, true));
        assert!(matches!(verdict, Verdict::Abnormal { .. }));
    }

    #[test]
    fn test_baseline_speed_is_normal() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector_with_baseline(&dir, 8.0, 0.1);
        assert_eq!(detector.evaluate(&track_at(8.0, true)), Verdict::Normal);
    }

    #[test]
    fn test_missing_identity_is_indeterminate() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector_with_baseline(&dir, 8.0, 0.1);
        assert_eq!(
            detector.evaluate(&track_at(25.0, false)),
            Verdict::Indeterminate
        );
    }

    #[test]
    fn test_unpopulated_cell_is_indeterminate() {
        let dir = tempfile::tempdir().unwrap();
        let grid = Grid::new(200.0).unwrap();
        let repo = FeatureDataRepository::open_for_write(&dir.path().join("empty.db"), 200.0).unwrap();
        let detector =
            SpeedOverGroundDetector::new(Arc::new(repo), grid, &DetectionConfig::default());
        assert_eq!(
            detector.evaluate(&track_at(25.0, true)),
            Verdict::Indeterminate
        );
    }
}
