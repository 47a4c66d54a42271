//! SQLite-backed feature data repository.
//!
//! One row per (cell, feature name) with the payload as JSON, plus a single
//! metadata row fixing the grid resolution and format version. Opened either
//! read-only (analysis) or read-write (statistics building); the write path
//! has a single writer by design.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::stats::{DatasetMetaData, FeatureData, StatsError, FORMAT_VERSION};
use crate::storage::{self, Pool};

pub struct FeatureDataRepository {
    pool: Pool,
    writable: bool,
}

impl FeatureDataRepository {
    /// Open an existing feature store read-only. Fails if the file is
    /// missing or carries no metadata record.
    pub fn open_for_read(path: &Path) -> Result<Self> {
        let pool = storage::open_pool_read_only(path)
            .map_err(|_| StatsError::StoreUnreadable(path.to_path_buf()))?;
        let repo = Self {
            pool,
            writable: false,
        };
        let meta = repo.meta_data()?;
        info!(
            path = %path.display(),
            resolution = meta.grid_resolution,
            version = meta.format_version,
            "Opened feature store for read"
        );
        Ok(repo)
    }

    /// Open (or create) a feature store for writing. An existing store must
    /// have been built at the same grid resolution; changing resolution
    /// requires a full rebuild.
    pub fn open_for_write(path: &Path, grid_resolution: f64) -> Result<Self> {
        let pool = storage::open_pool(path)?;
        {
            let conn = pool.get()?;
            migrate(&conn)?;

            let existing: Option<f64> = conn
                .query_row("SELECT grid_resolution FROM metadata WHERE id = 1", [], |row| {
                    row.get(0)
                })
                .optional()?;
            match existing {
                Some(existing) if (existing - grid_resolution).abs() > f64::EPSILON => {
                    return Err(StatsError::ResolutionMismatch {
                        existing,
                        requested: grid_resolution,
                    }
                    .into());
                }
                Some(_) => {}
                None => {
                    conn.execute(
                        "INSERT INTO metadata (id, format_version, grid_resolution, created_at)
                         VALUES (1, ?1, ?2, ?3)",
                        params![FORMAT_VERSION, grid_resolution, Utc::now().to_rfc3339()],
                    )?;
                }
            }
        }
        info!(path = %path.display(), resolution = grid_resolution, "Opened feature store for write");
        Ok(Self {
            pool,
            writable: true,
        })
    }

    pub fn meta_data(&self) -> Result<DatasetMetaData> {
        let conn = self.pool.get()?;
        let meta = conn
            .query_row(
                "SELECT format_version, grid_resolution, created_at FROM metadata WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to read feature store metadata")?
            .ok_or(StatsError::MissingMetadata)?;

        Ok(DatasetMetaData {
            format_version: meta.0,
            grid_resolution: meta.1,
            created_at: parse_timestamp(&meta.2),
        })
    }

    /// Distinct feature names present across all cells.
    pub fn feature_names(&self) -> Result<BTreeSet<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT DISTINCT feature_name FROM feature_data")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut names = BTreeSet::new();
        for name in rows {
            names.insert(name?);
        }
        Ok(names)
    }

    pub fn feature_data(&self, cell: i64, feature_name: &str) -> Result<Option<FeatureData>> {
        let conn = self.pool.get()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT data_json FROM feature_data WHERE cell_id = ?1 AND feature_name = ?2",
                params![cell, feature_name],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json).with_context(|| {
                format!("corrupt feature data for cell {cell}, feature {feature_name}")
            })?)),
            None => Ok(None),
        }
    }

    /// Fetch the feature data of one arbitrary populated cell. Used by
    /// format validation to sample a payload; errors if the feature is
    /// entirely absent.
    pub fn feature_data_for_random_cell(&self, feature_name: &str) -> Result<FeatureData> {
        let conn = self.pool.get()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT data_json FROM feature_data WHERE feature_name = ?1
                 ORDER BY RANDOM() LIMIT 1",
                params![feature_name],
                |row| row.get(0),
            )
            .optional()?;

        let json = json.ok_or_else(|| StatsError::FeatureAbsent(feature_name.to_string()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("corrupt feature data sampled for feature {feature_name}"))
    }

    /// Upsert the payload for (cell, feature name). Last write wins.
    pub fn put_feature_data(
        &self,
        cell: i64,
        feature_name: &str,
        data: &FeatureData,
    ) -> Result<()> {
        if !self.writable {
            return Err(StatsError::ReadOnly.into());
        }
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO feature_data (cell_id, feature_name, data_json) VALUES (?1, ?2, ?3)
             ON CONFLICT (cell_id, feature_name) DO UPDATE SET data_json = excluded.data_json",
            params![cell, feature_name, serde_json::to_string(data)?],
        )?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            format_version INTEGER NOT NULL,
            grid_resolution REAL NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS feature_data (
            cell_id INTEGER NOT NULL,
            feature_name TEXT NOT NULL,
            data_json TEXT NOT NULL,
            PRIMARY KEY (cell_id, feature_name)
        );

        CREATE INDEX IF NOT EXISTS idx_feature_data_name ON feature_data(feature_name);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{FEATURE_SHIP_TYPE_AND_SIZE, FEATURE_SPEED_OVER_GROUND};

    fn scratch() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db");
        (dir, path)
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, path) = scratch();
        let repo = FeatureDataRepository::open_for_write(&path, 200.0).unwrap();

        let mut data = FeatureData::new(FEATURE_SPEED_OVER_GROUND, &["shipType"]);
        data.fold(&[7], 8.2);
        data.fold(&[7], 7.9);
        repo.put_feature_data(42, FEATURE_SPEED_OVER_GROUND, &data).unwrap();

        let loaded = repo
            .feature_data(42, FEATURE_SPEED_OVER_GROUND)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, data);
        assert!(repo.feature_data(43, FEATURE_SPEED_OVER_GROUND).unwrap().is_none());
    }

    #[test]
    fn test_open_for_read_requires_existing_store() {
        let (_dir, path) = scratch();
        assert!(FeatureDataRepository::open_for_read(&path).is_err());
    }

    #[test]
    fn test_metadata_and_feature_names() {
        let (_dir, path) = scratch();
        {
            let repo = FeatureDataRepository::open_for_write(&path, 250.0).unwrap();
            let mut data = FeatureData::new(FEATURE_SHIP_TYPE_AND_SIZE, &["shipType", "shipSize"]);
            data.fold(&[7, 3], 1.0);
            repo.put_feature_data(1, FEATURE_SHIP_TYPE_AND_SIZE, &data).unwrap();
        }

        let repo = FeatureDataRepository::open_for_read(&path).unwrap();
        let meta = repo.meta_data().unwrap();
        assert_eq!(meta.grid_resolution, 250.0);
        assert_eq!(meta.format_version, FORMAT_VERSION);

        let names = repo.feature_names().unwrap();
        assert!(names.contains(FEATURE_SHIP_TYPE_AND_SIZE));
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_resolution_change_requires_rebuild() {
        let (_dir, path) = scratch();
        drop(FeatureDataRepository::open_for_write(&path, 200.0).unwrap());
        assert!(FeatureDataRepository::open_for_write(&path, 500.0).is_err());
        assert!(FeatureDataRepository::open_for_write(&path, 200.0).is_ok());
    }

    #[test]
    fn test_read_only_rejects_put() {
        let (_dir, path) = scratch();
        drop(FeatureDataRepository::open_for_write(&path, 200.0).unwrap());

        let repo = FeatureDataRepository::open_for_read(&path).unwrap();
        let data = FeatureData::new(FEATURE_SPEED_OVER_GROUND, &["shipType"]);
        assert!(repo.put_feature_data(1, FEATURE_SPEED_OVER_GROUND, &data).is_err());
    }

    #[test]
    fn test_random_cell_errors_when_feature_absent() {
        let (_dir, path) = scratch();
        let repo = FeatureDataRepository::open_for_write(&path, 200.0).unwrap();
        assert!(repo
            .feature_data_for_random_cell(FEATURE_SPEED_OVER_GROUND)
            .is_err());
    }
}
