//! Pooled SQLite plumbing shared by the feature store and the event store.
//!
//! Each store owns its own database file and schema; this module only
//! provides the connection pools. Dropping a pool closes its connections,
//! so store handles are released on all exit paths.

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

/// Connection pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) a SQLite database for read-write access.
pub fn open_pool(path: &Path) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    R2D2Pool::new(manager).with_context(|| format!("failed to open database {}", path.display()))
}

/// Open an existing SQLite database read-only. Fails if the file is missing.
pub fn open_pool_read_only(path: &Path) -> Result<Pool> {
    if !path.exists() {
        anyhow::bail!("database {} does not exist", path.display());
    }

    let manager = SqliteConnectionManager::file(path)
        .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
        .with_init(|c| {
            c.execute_batch(
                "PRAGMA query_only = ON;
                     PRAGMA busy_timeout = 5000;",
            )
        });

    R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {} read-only", path.display()))
}
