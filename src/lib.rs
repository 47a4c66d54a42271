//! aisguard -- abnormal vessel behaviour detection from AIS position reports.
//!
//! The crate runs in two modes: offline, it folds historical position
//! reports into a grid-indexed statistical baseline (the feature store);
//! online, it maintains live per-vessel tracks, compares them against that
//! baseline, and raises persistent abnormal-behaviour events as vessels
//! deviate from and return to normal.

pub mod analysis;
pub mod config;
pub mod events;
pub mod geo;
pub mod pipeline;
pub mod reader;
pub mod stats;
pub mod storage;
pub mod tracker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::analysis::shiptype::ShipTypeAndSizeDetector;
use crate::analysis::speed::SpeedOverGroundDetector;
use crate::analysis::{AnalysisRunner, Detector, EventEmitter};
use crate::config::AppConfig;
use crate::events::repository::EventRepository;
use crate::events::EventState;
use crate::geo::Grid;
use crate::pipeline::{PacketHandler, StatBuilder};
use crate::stats::repository::FeatureDataRepository;
use crate::tracker::{run_sweep_loop, TrackingService};

/// Run the analyzer: stream decoded reports, detect abnormal behaviour
/// against the feature store, and persist events.
pub async fn run_analyzer(
    input: &Path,
    stats_path: &Path,
    events_path: &Path,
    config: &AppConfig,
) -> Result<()> {
    let stats = Arc::new(
        FeatureDataRepository::open_for_read(stats_path)
            .context("cannot open feature store; run `aisguard build-stats` first")?,
    );

    // The grid is always derived from the store's metadata, never from the
    // analysis-time config.
    let meta = stats.meta_data()?;
    let grid = Grid::new(meta.grid_resolution)?;
    info!(resolution = grid.resolution(), "Grid derived from feature store metadata");

    let findings = stats::validate::validate_format(&stats)?;
    stats::validate::apply_policy(&findings, config.validation_policy)?;

    let events = Arc::new(EventRepository::open(events_path)?);
    let tracking = Arc::new(TrackingService::new(&config.tracker));

    let detectors: Vec<Arc<dyn Detector>> = vec![
        Arc::new(SpeedOverGroundDetector::new(
            stats.clone(),
            grid,
            &config.detection,
        )),
        Arc::new(ShipTypeAndSizeDetector::new(
            stats.clone(),
            grid,
            &config.detection,
        )),
    ];
    let runner = Arc::new(AnalysisRunner::new(EventEmitter::new(events.clone()), detectors));
    runner.start(&tracking);

    let sweep = tokio::spawn(run_sweep_loop(
        tracking.clone(),
        Duration::from_secs(config.tracker.sweep_interval_secs),
    ));

    // Ingest on a blocking thread: subscribers run synchronously and talk
    // to SQLite.
    let handler = PacketHandler::new(tracking.clone(), config.progress_interval);
    let input: PathBuf = input.to_path_buf();
    let handler = tokio::task::spawn_blocking(move || -> Result<PacketHandler> {
        let mut reports = reader::read_reports(&input)?;
        for report in reports.by_ref() {
            handler.handle(&report);
        }
        info!(skipped_lines = reports.skipped(), "report stream drained");
        Ok(handler)
    })
    .await??;

    sweep.abort();
    info!(
        reports = handler.received(),
        malformed = handler.malformed(),
        live_tracks = tracking.len(),
        ongoing_events = events.count_by_state(EventState::Ongoing)?,
        past_events = events.count_by_state(EventState::Past)?,
        "Analysis complete"
    );
    Ok(())
}

/// Build (or extend) the statistical baseline from historical reports.
pub async fn run_stat_builder(input: &Path, stats_path: &Path, config: &AppConfig) -> Result<()> {
    let grid = Grid::new(config.grid_resolution_meters)?;
    let repo = FeatureDataRepository::open_for_write(stats_path, grid.resolution())?;

    let input: PathBuf = input.to_path_buf();
    let written = tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut builder = StatBuilder::new(repo, grid);
        for report in reader::read_reports(&input)? {
            builder.handle(&report);
        }
        builder.flush()
    })
    .await??;

    info!(records = written, "Statistics build complete");
    Ok(())
}

/// Validate a feature store against the analyses' expectations. Returns the
/// findings; the caller decides how to present them.
pub fn run_validation(stats_path: &Path) -> Result<Vec<String>> {
    let repo = FeatureDataRepository::open_for_read(stats_path)?;
    stats::validate::validate_format(&repo)
}
