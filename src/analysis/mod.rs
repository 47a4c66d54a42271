//! Detection framework.
//!
//! Concrete detectors implement [`Detector`] and return a [`Verdict`] per
//! track update. The [`AnalysisRunner`] subscribes to the tracking service,
//! runs every detector on each notification, and turns verdicts into event
//! lifecycle operations through the shared [`EventEmitter`]. A failure while
//! building or persisting one event is logged and never halts the pipeline.

pub mod shiptype;
pub mod speed;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::events::repository::EventRepository;
use crate::events::{Event, TrackingPoint};
use crate::tracker::{Track, TrackSubscriber, TrackingService};

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The track deviates from the baseline; raise or maintain an event.
    Abnormal { title: String, description: String },
    /// The track is within the baseline; lower any ongoing event.
    Normal,
    /// No baseline or missing vessel data; take no event action.
    Indeterminate,
}

pub trait Detector: Send + Sync {
    fn name(&self) -> &str;
    /// Concrete event type this detector raises, e.g. `"AbnormalSpeed"`.
    fn event_type(&self) -> &str;
    fn evaluate(&self, track: &Track) -> Verdict;
}

/// Raise/maintain/lower operations shared by all detectors. This is the sole
/// path that creates events, which is what enforces the at-most-one-ongoing
/// invariant per (vessel, event type).
pub struct EventEmitter {
    events: Arc<EventRepository>,
}

impl EventEmitter {
    pub fn new(events: Arc<EventRepository>) -> Self {
        Self { events }
    }

    fn tracking_point(track: &Track) -> TrackingPoint {
        TrackingPoint {
            timestamp: track.last_position_update,
            latitude: track.position.latitude,
            longitude: track.position.longitude,
            course_over_ground: track.course_over_ground,
            speed_over_ground: track.speed_over_ground,
            interpolated: track.position_is_interpolated,
        }
    }

    /// If an ONGOING event of this type exists for the vessel, append the
    /// track's newest point to its behaviour; otherwise raise a new event.
    pub fn raise_or_maintain(
        &self,
        event_type: &str,
        title: &str,
        description: &str,
        track: &Track,
    ) -> Result<()> {
        let point = Self::tracking_point(track);
        let mut event = match self
            .events
            .find_ongoing_event_by_vessel(track.mmsi, event_type)?
        {
            Some(event) => event,
            None => {
                let event = Event::new(event_type, track.last_position_update, title, description);
                info!(
                    mmsi = track.mmsi,
                    event_type,
                    id = %event.id,
                    "abnormal behaviour event raised"
                );
                event
            }
        };
        event.behaviour_mut(track.mmsi).add_point(point);
        self.events.save(&event)?;
        Ok(())
    }

    /// Lower the ONGOING event of this type for the vessel, if one exists.
    /// The end time is the track's latest any-update timestamp.
    pub fn lower_if_exists(&self, event_type: &str, track: &Track) -> Result<()> {
        if let Some(mut event) = self
            .events
            .find_ongoing_event_by_vessel(track.mmsi, event_type)?
        {
            event.close(track.last_update);
            self.events.save(&event)?;
            info!(
                mmsi = track.mmsi,
                event_type,
                id = %event.id,
                "abnormal behaviour event lowered"
            );
        }
        Ok(())
    }
}

/// Runs the configured detectors on every track notification.
pub struct AnalysisRunner {
    detectors: Vec<Arc<dyn Detector>>,
    emitter: EventEmitter,
}

impl AnalysisRunner {
    pub fn new(emitter: EventEmitter, detectors: Vec<Arc<dyn Detector>>) -> Self {
        Self { detectors, emitter }
    }

    /// Register with the tracking service. Before this call the runner
    /// receives no notifications.
    pub fn start(self: &Arc<Self>, tracking: &TrackingService) {
        for detector in &self.detectors {
            info!(detector = detector.name(), "analysis active");
        }
        tracking.register_subscriber(self.clone());
    }
}

impl TrackSubscriber for AnalysisRunner {
    fn name(&self) -> &str {
        "analysis-runner"
    }

    fn on_track_update(&self, track: &Track) {
        for detector in &self.detectors {
            let outcome = match detector.evaluate(track) {
                Verdict::Abnormal { title, description } => self.emitter.raise_or_maintain(
                    detector.event_type(),
                    &title,
                    &description,
                    track,
                ),
                Verdict::Normal => self.emitter.lower_if_exists(detector.event_type(), track),
                Verdict::Indeterminate => Ok(()),
            };
            if let Err(e) = outcome {
                error!(
                    detector = detector.name(),
                    mmsi = track.mmsi,
                    "event update failed: {e:#}"
                );
            }
        }
    }
}
