//! Abnormal behaviour events and their observed trajectories.
//!
//! An [`Event`] records one detected abnormality. It starts ONGOING, is
//! maintained while the anomaly persists (its behaviour grows), transitions
//! to PAST when the vessel returns to normal, and is never deleted.

pub mod repository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventState {
    Ongoing,
    Past,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Ongoing => "ONGOING",
            EventState::Past => "PAST",
        }
    }
}

/// One observed sample within a behaviour, ordered by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingPoint {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub course_over_ground: f32,
    pub speed_over_ground: f32,
    pub interpolated: bool,
}

/// The trajectory of one vessel within one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Behaviour {
    pub mmsi: u32,
    points: Vec<TrackingPoint>,
}

impl Behaviour {
    pub fn new(mmsi: u32) -> Self {
        Self {
            mmsi,
            points: Vec::new(),
        }
    }

    /// Insert a point keeping timestamp order. A point whose timestamp
    /// equals an existing one is dropped so ordering stays strict.
    pub fn add_point(&mut self, point: TrackingPoint) {
        match self
            .points
            .binary_search_by_key(&point.timestamp, |p| p.timestamp)
        {
            Ok(_) => {}
            Err(idx) => self.points.insert(idx, point),
        }
    }

    pub fn points(&self) -> &[TrackingPoint] {
        &self.points
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub state: EventState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub title: String,
    pub description: String,
    behaviours: Vec<Behaviour>,
}

impl Event {
    /// A freshly raised, ONGOING event with no behaviours yet.
    pub fn new(event_type: &str, start_time: DateTime<Utc>, title: &str, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            state: EventState::Ongoing,
            start_time,
            end_time: None,
            title: title.to_string(),
            description: description.to_string(),
            behaviours: Vec::new(),
        }
    }

    pub fn behaviour(&self, mmsi: u32) -> Option<&Behaviour> {
        self.behaviours.iter().find(|b| b.mmsi == mmsi)
    }

    /// The behaviour for `mmsi`, created if absent.
    pub fn behaviour_mut(&mut self, mmsi: u32) -> &mut Behaviour {
        if let Some(idx) = self.behaviours.iter().position(|b| b.mmsi == mmsi) {
            &mut self.behaviours[idx]
        } else {
            self.behaviours.push(Behaviour::new(mmsi));
            self.behaviours.last_mut().unwrap()
        }
    }

    pub fn behaviours(&self) -> &[Behaviour] {
        &self.behaviours
    }

    /// Transition ONGOING -> PAST, stamping the end time. PAST is terminal.
    pub fn close(&mut self, end_time: DateTime<Utc>) {
        if self.state == EventState::Ongoing {
            self.state = EventState::Past;
            self.end_time = Some(end_time);
        }
    }
}
