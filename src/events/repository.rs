//! SQLite-backed event repository.
//!
//! `save` is an idempotent upsert by event id: the event row is replaced,
//! behaviours and tracking points are inserted with conflict-ignore, all in
//! one transaction. A `find_ongoing_event_by_vessel` after `save` always
//! sees the new state because both go straight to the pool.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

use crate::events::{Event, EventState, TrackingPoint};
use crate::storage::{self, Pool};

pub struct EventRepository {
    pool: Pool,
}

impl EventRepository {
    /// Open (or create) the event store.
    pub fn open(path: &Path) -> Result<Self> {
        let pool = storage::open_pool(path)?;
        let conn = pool.get()?;
        migrate(&conn)?;
        info!(path = %path.display(), "Opened event store");
        Ok(Self { pool })
    }

    /// The ONGOING event of `event_type` involving `mmsi`, if any. The
    /// at-most-one-ongoing invariant makes this unambiguous.
    pub fn find_ongoing_event_by_vessel(
        &self,
        mmsi: u32,
        event_type: &str,
    ) -> Result<Option<Event>> {
        let conn = self.pool.get()?;
        let event = conn
            .query_row(
                "SELECT e.id, e.event_type, e.state, e.start_time, e.end_time, e.title, e.description
                 FROM events e
                 JOIN behaviours b ON b.event_id = e.id
                 WHERE b.mmsi = ?1 AND e.event_type = ?2 AND e.state = 'ONGOING'
                 LIMIT 1",
                params![mmsi, event_type],
                row_to_event,
            )
            .optional()?;

        match event {
            Some(mut event) => {
                load_behaviours(&conn, &mut event)?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    /// Upsert `event` by identity. Safe to call repeatedly.
    pub fn save(&self, event: &Event) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO events (id, event_type, state, start_time, end_time, title, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO UPDATE SET
                 state = excluded.state,
                 end_time = excluded.end_time,
                 title = excluded.title,
                 description = excluded.description",
            params![
                event.id.to_string(),
                event.event_type,
                event.state.as_str(),
                event.start_time.to_rfc3339(),
                event.end_time.map(|t| t.to_rfc3339()),
                event.title,
                event.description,
            ],
        )?;

        for behaviour in event.behaviours() {
            tx.execute(
                "INSERT INTO behaviours (event_id, mmsi) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![event.id.to_string(), behaviour.mmsi],
            )?;
            for point in behaviour.points() {
                tx.execute(
                    "INSERT INTO tracking_points
                         (event_id, mmsi, timestamp, latitude, longitude,
                          course_over_ground, speed_over_ground, interpolated)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT DO NOTHING",
                    params![
                        event.id.to_string(),
                        behaviour.mmsi,
                        point.timestamp.to_rfc3339(),
                        point.latitude,
                        point.longitude,
                        point.course_over_ground,
                        point.speed_over_ground,
                        point.interpolated,
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Most recently started events, for the operator listing.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_type, state, start_time, end_time, title, description
             FROM events ORDER BY start_time DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], row_to_event)?;

        let mut events = Vec::new();
        for event in rows {
            let mut event = event?;
            load_behaviours(&conn, &mut event)?;
            events.push(event);
        }
        Ok(events)
    }

    pub fn count_by_state(&self, state: EventState) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let id_str: String = row.get(0)?;
    let state_str: String = row.get(2)?;
    let start_str: String = row.get(3)?;
    let end_str: Option<String> = row.get(4)?;

    let mut event = Event::new(
        &row.get::<_, String>(1)?,
        parse_timestamp(&start_str).map_err(|e| bad_column(3, e))?,
        &row.get::<_, String>(5)?,
        &row.get::<_, String>(6)?,
    );
    event.id = Uuid::parse_str(&id_str).map_err(|e| bad_column(0, e))?;
    event.state = match state_str.as_str() {
        "ONGOING" => EventState::Ongoing,
        "PAST" => EventState::Past,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown event state {other:?}").into(),
            ))
        }
    };
    event.end_time = match end_str {
        Some(raw) => Some(parse_timestamp(&raw).map_err(|e| bad_column(4, e))?),
        None => None,
    };
    Ok(event)
}

fn bad_column(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn load_behaviours(conn: &Connection, event: &mut Event) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT mmsi, timestamp, latitude, longitude,
                course_over_ground, speed_over_ground, interpolated
         FROM tracking_points WHERE event_id = ?1 ORDER BY mmsi, timestamp",
    )?;
    let rows = stmt.query_map(params![event.id.to_string()], |row| {
        let mmsi: u32 = row.get(0)?;
        let stamp: String = row.get(1)?;
        Ok((
            mmsi,
            TrackingPoint {
                timestamp: parse_timestamp(&stamp).map_err(|e| bad_column(1, e))?,
                latitude: row.get(2)?,
                longitude: row.get(3)?,
                course_over_ground: row.get(4)?,
                speed_over_ground: row.get(5)?,
                interpolated: row.get(6)?,
            },
        ))
    })?;

    for row in rows {
        let (mmsi, point) = row?;
        event.behaviour_mut(mmsi).add_point(point);
    }
    Ok(())
}

fn parse_timestamp(raw: &str) -> chrono::ParseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            state TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            title TEXT NOT NULL,
            description TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS behaviours (
            event_id TEXT NOT NULL REFERENCES events(id),
            mmsi INTEGER NOT NULL,
            PRIMARY KEY (event_id, mmsi)
        );

        CREATE TABLE IF NOT EXISTS tracking_points (
            event_id TEXT NOT NULL REFERENCES events(id),
            mmsi INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            course_over_ground REAL NOT NULL,
            speed_over_ground REAL NOT NULL,
            interpolated INTEGER NOT NULL,
            UNIQUE (event_id, mmsi, timestamp)
        );

        CREATE INDEX IF NOT EXISTS idx_events_type_state ON events(event_type, state);
        CREATE INDEX IF NOT EXISTS idx_behaviours_mmsi ON behaviours(mmsi);",
    )
    .context("event store migration failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scratch_repo() -> (tempfile::TempDir, EventRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = EventRepository::open(&dir.path().join("events.db")).unwrap();
        (dir, repo)
    }

    fn sample_event(mmsi: u32) -> Event {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let mut event = Event::new("AbnormalSpeed", start, "Abnormal speed", "details");
        event.behaviour_mut(mmsi).add_point(TrackingPoint {
            timestamp: start,
            latitude: 55.1,
            longitude: 10.2,
            course_over_ground: 90.0,
            speed_over_ground: 25.0,
            interpolated: false,
        });
        event
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }

    #[test]
    fn test_save_and_find_ongoing() {
        let (_dir, repo) = scratch_repo();
        let event = sample_event(123456789);
        repo.save(&event).unwrap();

        let found = repo
            .find_ongoing_event_by_vessel(123456789, "AbnormalSpeed")
            .unwrap()
            .expect("event should be ongoing");
        assert_eq!(found.id, event.id);
        assert_eq!(found.state, EventState::Ongoing);
        assert_eq!(found.behaviour(123456789).unwrap().points().len(), 1);

        // other vessel or type finds nothing
        assert!(repo
            .find_ongoing_event_by_vessel(999999999, "AbnormalSpeed")
            .unwrap()
            .is_none());
        assert!(repo
            .find_ongoing_event_by_vessel(123456789, "UnusualVesselType")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_save_is_idempotent_upsert() {
        let (_dir, repo) = scratch_repo();
        let mut event = sample_event(123456789);
        repo.save(&event).unwrap();
        repo.save(&event).unwrap();

        event.behaviour_mut(123456789).add_point(TrackingPoint {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap(),
            latitude: 55.11,
            longitude: 10.21,
            course_over_ground: 91.0,
            speed_over_ground: 26.0,
            interpolated: false,
        });
        repo.save(&event).unwrap();

        let found = repo
            .find_ongoing_event_by_vessel(123456789, "AbnormalSpeed")
            .unwrap()
            .unwrap();
        assert_eq!(found.behaviour(123456789).unwrap().points().len(), 2);
        assert_eq!(repo.count_by_state(EventState::Ongoing).unwrap(), 1);
    }

    #[test]
    fn test_corrupt_rows_surface_as_errors() {
        let (dir, repo) = scratch_repo();
        repo.save(&sample_event(123456789)).unwrap();

        let conn = Connection::open(dir.path().join("events.db")).unwrap();
        conn.pragma_update(None, "foreign_keys", false).unwrap();
        conn.execute("UPDATE events SET start_time = 'not a timestamp'", [])
            .unwrap();
        assert!(repo.recent_events(10).is_err());

        conn.execute(
            "UPDATE events SET start_time = '2024-03-01T10:00:00Z', id = 'not-a-uuid'",
            [],
        )
        .unwrap();
        conn.execute("UPDATE behaviours SET event_id = 'not-a-uuid'", []).unwrap();
        conn.execute("UPDATE tracking_points SET event_id = 'not-a-uuid'", []).unwrap();
        assert!(repo.recent_events(10).is_err());
    }

    #[test]
    fn test_closed_event_no_longer_found_as_ongoing() {
        let (_dir, repo) = scratch_repo();
        let mut event = sample_event(123456789);
        repo.save(&event).unwrap();

        let end = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();
        event.close(end);
        repo.save(&event).unwrap();

        assert!(repo
            .find_ongoing_event_by_vessel(123456789, "AbnormalSpeed")
            .unwrap()
            .is_none());
        assert_eq!(repo.count_by_state(EventState::Past).unwrap(), 1);

        let listed = repo.recent_events(10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].end_time, Some(end));
    }
}
