//! Composition root between the report reader and the rest of the pipeline.
//!
//! In analysis mode the [`PacketHandler`] forwards reports to the tracking
//! service (which fans out to the subscribed analyses). In
//! statistics-building mode the [`StatBuilder`] folds observations into
//! per-cell feature accumulators instead; no analyses run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::geo::{Grid, Position};
use crate::reader::Report;
use crate::stats::repository::FeatureDataRepository;
use crate::stats::{
    ship_size_bucket, FeatureData, FEATURE_SHIP_TYPE_AND_SIZE, FEATURE_SPEED_OVER_GROUND,
};
use crate::tracker::TrackingService;

/// Feeds decoded reports into the tracking service.
pub struct PacketHandler {
    tracking: Arc<TrackingService>,
    progress_interval: u64,
    received: AtomicU64,
    malformed: AtomicU64,
}

impl PacketHandler {
    pub fn new(tracking: Arc<TrackingService>, progress_interval: u64) -> Self {
        Self {
            tracking,
            progress_interval: progress_interval.max(1),
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn handle(&self, report: &Report) {
        let received = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        if received % self.progress_interval == 0 {
            info!(
                received,
                tracks = self.tracking.len(),
                malformed = self.malformed.load(Ordering::Relaxed),
                "ingest progress"
            );
        }

        match report {
            Report::Position(position) => {
                if !Position::new(position.latitude, position.longitude).is_valid()
                    || !position.speed_over_ground.is_finite()
                {
                    debug!(mmsi = position.mmsi, "dropping malformed position report");
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.tracking.update(position);
            }
            Report::Identity(identity) => self.tracking.apply_identity(identity),
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Folds historical observations into the feature store. Single writer by
/// design; accumulates per-cell payloads in memory and flushes once at the
/// end, merging with whatever the store already holds.
pub struct StatBuilder {
    repo: FeatureDataRepository,
    grid: Grid,
    identities: HashMap<u32, (u32, u32)>,
    type_size: HashMap<i64, FeatureData>,
    speed: HashMap<i64, FeatureData>,
    folded: u64,
    without_identity: u64,
}

impl StatBuilder {
    pub fn new(repo: FeatureDataRepository, grid: Grid) -> Self {
        Self {
            repo,
            grid,
            identities: HashMap::new(),
            type_size: HashMap::new(),
            speed: HashMap::new(),
            folded: 0,
            without_identity: 0,
        }
    }

    pub fn handle(&mut self, report: &Report) {
        match report {
            Report::Identity(identity) => {
                self.identities.insert(
                    identity.mmsi,
                    (
                        identity.ship_type,
                        ship_size_bucket(identity.ship_length_meters),
                    ),
                );
            }
            Report::Position(position) => {
                if !Position::new(position.latitude, position.longitude).is_valid() {
                    return;
                }
                // Observations are only countable once the vessel's type and
                // size are known.
                let Some(&(ship_type, ship_size)) = self.identities.get(&position.mmsi) else {
                    self.without_identity += 1;
                    return;
                };

                let cell = self
                    .grid
                    .cell_of(Position::new(position.latitude, position.longitude));
                self.type_size
                    .entry(cell)
                    .or_insert_with(|| {
                        FeatureData::new(FEATURE_SHIP_TYPE_AND_SIZE, &["shipType", "shipSize"])
                    })
                    .fold(&[ship_type, ship_size], 1.0);
                self.speed
                    .entry(cell)
                    .or_insert_with(|| FeatureData::new(FEATURE_SPEED_OVER_GROUND, &["shipType"]))
                    .fold(&[ship_type], position.speed_over_ground as f64);
                self.folded += 1;
            }
        }
    }

    /// Write all accumulated cells to the store. Returns the number of
    /// (cell, feature) records written.
    pub fn flush(self) -> Result<u64> {
        info!(
            observations = self.folded,
            skipped_without_identity = self.without_identity,
            cells = self.type_size.len(),
            "flushing statistics to feature store"
        );

        let mut written = 0u64;
        for (feature_name, accumulated) in [
            (FEATURE_SHIP_TYPE_AND_SIZE, self.type_size),
            (FEATURE_SPEED_OVER_GROUND, self.speed),
        ] {
            for (cell, mut data) in accumulated {
                if let Some(existing) = self.repo.feature_data(cell, feature_name)? {
                    data.merge(&existing);
                }
                self.repo.put_feature_data(cell, feature_name, &data)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::reader::{IdentityReport, PositionReport};
    use chrono::{TimeZone, Utc};

    fn position(mmsi: u32, lat: f64, lon: f64, sog: f32) -> Report {
        Report::Position(PositionReport {
            mmsi,
            latitude: lat,
            longitude: lon,
            course_over_ground: 90.0,
            speed_over_ground: sog,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        })
    }

    fn identity(mmsi: u32, ship_type: u32, length: f32) -> Report {
        Report::Identity(IdentityReport {
            mmsi,
            ship_type,
            ship_length_meters: Some(length),
            name: None,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        })
    }

    #[test]
    fn test_handler_drops_malformed_positions() {
        let tracking = Arc::new(TrackingService::new(&TrackerConfig::default()));
        let handler = PacketHandler::new(tracking.clone(), 1000);

        handler.handle(&position(1, 95.0, 10.0, 5.0)); // latitude out of range
        handler.handle(&position(2, 55.0, 10.0, f32::NAN));
        handler.handle(&position(3, 55.0, 10.0, 5.0));

        assert_eq!(handler.received(), 3);
        assert_eq!(handler.malformed(), 2);
        assert_eq!(tracking.len(), 1);
    }

    #[test]
    fn test_stat_builder_folds_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let grid = Grid::new(200.0).unwrap();
        let repo =
            FeatureDataRepository::open_for_write(&dir.path().join("stats.db"), 200.0).unwrap();

        let mut builder = StatBuilder::new(repo, grid);
        builder.handle(&identity(1, 7, 110.0));
        builder.handle(&position(1, 55.0, 10.0, 8.0));
        builder.handle(&position(1, 55.0, 10.0, 8.5));
        builder.handle(&position(2, 55.0, 10.0, 20.0)); // no identity yet, skipped
        let written = builder.flush().unwrap();
        assert_eq!(written, 2); // one cell, two features

        let repo = FeatureDataRepository::open_for_read(&dir.path().join("stats.db")).unwrap();
        let cell = grid.cell_of(Position::new(55.0, 10.0));
        let speed = repo
            .feature_data(cell, FEATURE_SPEED_OVER_GROUND)
            .unwrap()
            .unwrap();
        assert_eq!(speed.stat(&[7]).unwrap().count, 2);
        assert!((speed.stat(&[7]).unwrap().mean() - 8.25).abs() < 1e-6);

        // flushing again merges instead of overwriting
        let repo =
            FeatureDataRepository::open_for_write(&dir.path().join("stats.db"), 200.0).unwrap();
        let mut builder = StatBuilder::new(repo, grid);
        builder.handle(&identity(1, 7, 110.0));
        builder.handle(&position(1, 55.0, 10.0, 9.0));
        builder.flush().unwrap();

        let repo = FeatureDataRepository::open_for_read(&dir.path().join("stats.db")).unwrap();
        let speed = repo
            .feature_data(cell, FEATURE_SPEED_OVER_GROUND)
            .unwrap()
            .unwrap();
        assert_eq!(speed.stat(&[7]).unwrap().count, 3);
    }
}
