//! SQLite access layer.
//!
//! One [`Store`] serves both sides of the pipeline: the read-only road
//! network (roads, nodes, segments with nested feedback/traffic) and the
//! durable `build_records` table. Connection failures surface as
//! [`GraphError::DataAccess`]; a query that succeeds with zero rows never
//! does.

pub mod builds;
pub mod network;

use std::path::Path;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use courier_common::{GraphError, Result};
use parking_lot::Mutex;
use rusqlite::Connection;

/// Current UTC time in the fixed-width RFC 3339 form used for every
/// timestamp column. Fixed width keeps lexicographic order equal to
/// chronological order, which the history queries rely on.
pub(crate) fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn db_err(e: rusqlite::Error) -> GraphError {
    GraphError::DataAccess(e.to_string())
}

#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            GraphError::DataAccess(format!(
                "cannot open store at {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::configure(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(5_000)).map_err(db_err)?;
        // journal_mode returns a row, so it cannot go through execute().
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        Ok(Store { conn: Mutex::new(conn) })
    }

    /// Create the tables this crate owns (`build_records`) and, for dev
    /// and test environments, the road-network tables the platform's
    /// migrations normally provide.
    pub fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS roads (
                    id        INTEGER PRIMARY KEY,
                    name      TEXT,
                    road_type TEXT NOT NULL,
                    one_way   INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS road_nodes (
                    id  INTEGER PRIMARY KEY,
                    lat REAL NOT NULL,
                    lon REAL NOT NULL
                );

                CREATE TABLE IF NOT EXISTS road_segments (
                    id          INTEGER PRIMARY KEY,
                    road_id     INTEGER NOT NULL REFERENCES roads(id),
                    geometry    TEXT NOT NULL,
                    one_way     INTEGER NOT NULL DEFAULT 0,
                    speed_limit INTEGER
                );

                CREATE TABLE IF NOT EXISTS segment_feedback (
                    id         INTEGER PRIMARY KEY AUTOINCREMENT,
                    segment_id INTEGER NOT NULL REFERENCES road_segments(id),
                    adjustment REAL,
                    severity   TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_feedback_segment
                    ON segment_feedback(segment_id, created_at DESC);

                CREATE TABLE IF NOT EXISTS traffic_conditions (
                    id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    segment_id  INTEGER NOT NULL REFERENCES road_segments(id),
                    level       TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    expires_at  TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_traffic_segment
                    ON traffic_conditions(segment_id, expires_at DESC);

                CREATE TABLE IF NOT EXISTS build_records (
                    id            TEXT PRIMARY KEY,
                    instance_name TEXT NOT NULL,
                    status        TEXT NOT NULL,
                    segment_count INTEGER NOT NULL,
                    avg_weight    REAL,
                    source_path   TEXT,
                    output_path   TEXT,
                    error_message TEXT,
                    created_at    TEXT NOT NULL,
                    started_at    TEXT,
                    completed_at  TEXT,
                    deployed_at   TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_builds_instance
                    ON build_records(instance_name, created_at DESC);
                "#,
            )?;
            Ok(())
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(db_err)
    }
}
