//! Live per-vessel track state and the service that owns it.
//!
//! The [`TrackingService`] is the single owner of all [`Track`]s. Updates
//! mutate the track under the collection lock, then subscribers are notified
//! with a snapshot after the lock is released, so a subscriber may call back
//! into the service without deadlocking. Subscribers run synchronously in
//! registration order; a slow subscriber throttles ingestion.
//!
//! `update` and `sweep` hold a shared notification lock for their whole run,
//! so deliveries never interleave even though the sweep runs on its own task.
//! Subscribers that read find-then-write state (the event emitter) rely on
//! this. Subscribers must not feed reports back into the service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::geo::{Position, METERS_PER_DEGREE};
use crate::reader::{IdentityReport, PositionReport};

/// Property bag keys set by identity reports.
pub const PROP_SHIP_TYPE: &str = "shipType";
pub const PROP_SHIP_SIZE_BUCKET: &str = "shipSizeBucket";
pub const PROP_SHIP_NAME: &str = "shipName";

const KNOTS_TO_METERS_PER_SEC: f64 = 0.514_444;

/// Mutable kinematic state for one vessel, keyed by MMSI.
#[derive(Debug, Clone)]
pub struct Track {
    pub mmsi: u32,
    pub position: Position,
    pub course_over_ground: f32,
    pub speed_over_ground: f32,
    /// True when the position was synthesized by dead reckoning rather
    /// than observed.
    pub position_is_interpolated: bool,
    /// Last update of any kind, including interpolation ticks.
    pub last_update: DateTime<Utc>,
    /// Last update that moved the position (real or interpolated).
    pub last_position_update: DateTime<Utc>,
    /// Last real (non-synthesized) report; drives staleness and eviction.
    pub last_report: DateTime<Utc>,
    properties: HashMap<String, Value>,
}

impl Track {
    fn new(report: &PositionReport) -> Self {
        Self {
            mmsi: report.mmsi,
            position: Position::new(report.latitude, report.longitude),
            course_over_ground: report.course_over_ground,
            speed_over_ground: report.speed_over_ground,
            position_is_interpolated: false,
            last_update: report.timestamp,
            last_position_update: report.timestamp,
            last_report: report.timestamp,
            properties: HashMap::new(),
        }
    }

    pub fn set_property(&mut self, name: &str, value: Value) {
        self.properties.insert(name.to_string(), value);
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn property_u32(&self, name: &str) -> Option<u32> {
        self.property(name)?.as_u64().map(|v| v as u32)
    }
}

/// Receives track snapshots after each update. Registration is keyed on
/// [`TrackSubscriber::name`], so a subscriber cannot be registered twice.
pub trait TrackSubscriber: Send + Sync {
    fn name(&self) -> &str;
    fn on_track_update(&self, track: &Track);
}

pub struct TrackingService {
    tracks: Mutex<HashMap<u32, Track>>,
    subscribers: Mutex<Vec<Arc<dyn TrackSubscriber>>>,
    /// Identity data seen before the vessel's first position report,
    /// applied when the track is created. Keyed with the report timestamp
    /// so the sweep can expire entries for vessels that never report a
    /// position.
    pending_identity: Mutex<HashMap<u32, (DateTime<Utc>, Vec<(String, Value)>)>>,
    /// Held across mutation and notification by `update` and `sweep`.
    notify_lock: Mutex<()>,
    stale_after: Duration,
    expire_after: Duration,
}

impl TrackingService {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            tracks: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            pending_identity: Mutex::new(HashMap::new()),
            notify_lock: Mutex::new(()),
            stale_after: Duration::seconds(config.stale_after_secs as i64),
            expire_after: Duration::seconds(config.expire_after_secs as i64),
        }
    }

    /// Register a subscriber. Re-registering the same name is ignored.
    pub fn register_subscriber(&self, subscriber: Arc<dyn TrackSubscriber>) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if subscribers.iter().any(|s| s.name() == subscriber.name()) {
            warn!(name = subscriber.name(), "subscriber already registered, ignoring");
            return;
        }
        info!(name = subscriber.name(), "subscriber registered");
        subscribers.push(subscriber);
    }

    /// Apply a position report: create or mutate the track, then notify
    /// subscribers. Reports older than the track's last position update are
    /// dropped so track timestamps stay monotonic.
    pub fn update(&self, report: &PositionReport) {
        let _delivery = self.notify_lock.lock().unwrap();
        let snapshot = {
            let mut tracks = self.tracks.lock().unwrap();
            match tracks.get_mut(&report.mmsi) {
                Some(track) => {
                    if report.timestamp < track.last_position_update {
                        warn!(
                            mmsi = report.mmsi,
                            "dropping out-of-order report ({} < {})",
                            report.timestamp,
                            track.last_position_update
                        );
                        return;
                    }
                    track.position = Position::new(report.latitude, report.longitude);
                    track.course_over_ground = report.course_over_ground;
                    track.speed_over_ground = report.speed_over_ground;
                    track.position_is_interpolated = false;
                    track.last_update = report.timestamp;
                    track.last_position_update = report.timestamp;
                    track.last_report = report.timestamp;
                    track.clone()
                }
                None => {
                    let mut track = Track::new(report);
                    if let Some((_, props)) =
                        self.pending_identity.lock().unwrap().remove(&report.mmsi)
                    {
                        for (name, value) in props {
                            track.set_property(&name, value);
                        }
                    }
                    debug!(mmsi = report.mmsi, "track created");
                    tracks.insert(report.mmsi, track.clone());
                    track
                }
            }
        };
        self.notify(&snapshot);
    }

    /// Apply an identity report to the track's property bag. Identity seen
    /// before the first position report is held back and applied on track
    /// creation.
    pub fn apply_identity(&self, report: &IdentityReport) {
        let props = vec![
            (PROP_SHIP_TYPE.to_string(), Value::from(report.ship_type)),
            (
                PROP_SHIP_SIZE_BUCKET.to_string(),
                Value::from(crate::stats::ship_size_bucket(report.ship_length_meters)),
            ),
            (
                PROP_SHIP_NAME.to_string(),
                report.name.clone().map(Value::from).unwrap_or(Value::Null),
            ),
        ];

        let mut tracks = self.tracks.lock().unwrap();
        match tracks.get_mut(&report.mmsi) {
            Some(track) => {
                for (name, value) in props {
                    track.set_property(&name, value);
                }
                track.last_update = track.last_update.max(report.timestamp);
            }
            None => {
                self.pending_identity
                    .lock()
                    .unwrap()
                    .insert(report.mmsi, (report.timestamp, props));
            }
        }
    }

    /// Timeout sweep: synthesize one dead-reckoned sample for each stale
    /// track and evict tracks past the expire window. Eviction never closes
    /// events; only an analysis observing a return to normal does that.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let _delivery = self.notify_lock.lock().unwrap();
        self.pending_identity
            .lock()
            .unwrap()
            .retain(|_, (seen, _)| now - *seen < self.expire_after);
        let mut to_notify = Vec::new();
        {
            let mut tracks = self.tracks.lock().unwrap();
            tracks.retain(|mmsi, track| {
                let silent_for = now - track.last_report;
                if silent_for >= self.expire_after {
                    info!(mmsi, "track evicted after {}s of silence", silent_for.num_seconds());
                    return false;
                }
                if silent_for >= self.stale_after && track.last_position_update < now {
                    let elapsed = now - track.last_position_update;
                    track.position = dead_reckon(track, elapsed);
                    track.position_is_interpolated = true;
                    track.last_update = now;
                    track.last_position_update = now;
                    debug!(mmsi, "interpolated sample synthesized");
                    to_notify.push(track.clone());
                }
                true
            });
        }
        for track in &to_notify {
            self.notify(track);
        }
    }

    /// Snapshot of one track, if it is live.
    pub fn track(&self, mmsi: u32) -> Option<Track> {
        self.tracks.lock().unwrap().get(&mmsi).cloned()
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, track: &Track) {
        // Clone the registry so a subscriber can register others mid-callback.
        let subscribers: Vec<_> = self.subscribers.lock().unwrap().clone();
        for subscriber in subscribers {
            subscriber.on_track_update(track);
        }
    }
}

/// Advance a track's position along its course at its last known speed.
fn dead_reckon(track: &Track, elapsed: Duration) -> Position {
    let distance = track.speed_over_ground as f64
        * KNOTS_TO_METERS_PER_SEC
        * elapsed.num_milliseconds() as f64
        / 1000.0;
    let bearing = (track.course_over_ground as f64).to_radians();
    let dlat = distance * bearing.cos() / METERS_PER_DEGREE;
    let lat_scale = track.position.latitude.to_radians().cos().max(1e-6);
    let dlon = distance * bearing.sin() / (METERS_PER_DEGREE * lat_scale);
    Position::new(
        track.position.latitude + dlat,
        track.position.longitude + dlon,
    )
}

/// Periodic sweep task; runs until the analyzer shuts down.
pub async fn run_sweep_loop(service: Arc<TrackingService>, interval: StdDuration) {
    info!("Track timeout sweep started");
    let mut interval = tokio::time::interval(interval);
    loop {
        interval.tick().await;
        service.sweep(Utc::now());
    }
}
