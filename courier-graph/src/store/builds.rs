//! Durable build-record rows.
//!
//! Rows are append-then-mutate: inserted once by the registry, updated in
//! place on transitions, never deleted. All ordering uses the fixed-width
//! RFC 3339 `created_at` column with the rowid as tie-break so history is
//! stable even for records created in the same microsecond.

use rusqlite::{params, OptionalExtension, Row};

use courier_common::Result;

use super::Store;
use crate::model::{BuildRecord, BuildStatus};

fn map_record(row: &Row<'_>) -> rusqlite::Result<BuildRecord> {
    let status_str: String = row.get(2)?;
    let status = BuildStatus::from_str(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown build status '{status_str}'").into(),
        )
    })?;
    Ok(BuildRecord {
        id: row.get(0)?,
        instance_name: row.get(1)?,
        status,
        segment_count: row.get::<_, i64>(3)? as u64,
        avg_weight: row.get(4)?,
        source_path: row.get(5)?,
        output_path: row.get(6)?,
        error_message: row.get(7)?,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        deployed_at: row.get(11)?,
    })
}

const RECORD_COLUMNS: &str = "id, instance_name, status, segment_count, avg_weight, \
     source_path, output_path, error_message, created_at, started_at, completed_at, deployed_at";

impl Store {
    pub fn insert_build(&self, record: &BuildRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO build_records (id, instance_name, status, segment_count, avg_weight, \
                 source_path, output_path, error_message, created_at, started_at, completed_at, deployed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id,
                    record.instance_name,
                    record.status.as_str(),
                    record.segment_count as i64,
                    record.avg_weight,
                    record.source_path,
                    record.output_path,
                    record.error_message,
                    record.created_at,
                    record.started_at,
                    record.completed_at,
                    record.deployed_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Write back every registry-mutable column of an existing record.
    pub fn update_build(&self, record: &BuildRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE build_records SET status = ?2, avg_weight = ?3, output_path = ?4, \
                 error_message = ?5, started_at = ?6, completed_at = ?7, deployed_at = ?8 \
                 WHERE id = ?1",
                params![
                    record.id,
                    record.status.as_str(),
                    record.avg_weight,
                    record.output_path,
                    record.error_message,
                    record.started_at,
                    record.completed_at,
                    record.deployed_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_build(&self, id: &str) -> Result<Option<BuildRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM build_records WHERE id = ?1"),
                params![id],
                map_record,
            )
            .optional()
        })
    }

    /// The instance's current non-terminal record, if any. The registry's
    /// serialization invariant means there is at most one.
    pub fn current_for_instance(&self, instance: &str) -> Result<Option<BuildRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM build_records \
                     WHERE instance_name = ?1 AND status IN ('PENDING', 'BUILDING', 'TESTING') \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![instance],
                map_record,
            )
            .optional()
        })
    }

    pub fn latest_for_status(
        &self,
        instance: &str,
        status: BuildStatus,
    ) -> Result<Option<BuildRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM build_records \
                     WHERE instance_name = ?1 AND status = ?2 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![instance, status.as_str()],
                map_record,
            )
            .optional()
        })
    }

    pub fn build_history(&self, instance: &str, limit: usize) -> Result<Vec<BuildRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM build_records WHERE instance_name = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![instance, limit as i64], map_record)?;
            rows.collect()
        })
    }

    /// Most-recent record per instance name, for the status-all query.
    pub fn latest_per_instance(&self) -> Result<Vec<BuildRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM build_records WHERE rowid IN \
                 (SELECT MAX(rowid) FROM build_records GROUP BY instance_name) \
                 ORDER BY instance_name"
            ))?;
            let rows = stmt.query_map([], map_record)?;
            rows.collect()
        })
    }
}
