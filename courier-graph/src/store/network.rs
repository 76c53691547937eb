//! Road-network read side: roads, nodes, and batched segment retrieval
//! with nested feedback and traffic rows.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};

use courier_common::Result;

use super::{now_utc, Store};
use crate::model::{FeedbackSample, Road, RoadNode, RoadSegment, TrafficCondition, TrafficLevel};

/// Most-recent feedback rows eagerly loaded per segment.
pub const FEEDBACK_WINDOW: usize = 10;

impl Store {
    /// Roads are orders of magnitude fewer than segments; one unbounded
    /// fetch is fine.
    pub fn load_roads(&self) -> Result<HashMap<i64, Road>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, road_type, one_way FROM roads ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(Road {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    road_type: row.get(2)?,
                    one_way: row.get::<_, i64>(3)? != 0,
                })
            })?;
            let mut roads = HashMap::new();
            for road in rows {
                let road = road?;
                roads.insert(road.id, road);
            }
            Ok(roads)
        })
    }

    pub fn load_nodes(&self) -> Result<Vec<RoadNode>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, lat, lon FROM road_nodes ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(RoadNode {
                    id: row.get(0)?,
                    lat: row.get(1)?,
                    lon: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn count_segments(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM road_segments", [], |row| {
                row.get::<_, i64>(0).map(|n| n as u64)
            })
        })
    }

    /// One keyset-paged segment batch: segments with `id > after_id`, in
    /// id order, each carrying its [`FEEDBACK_WINDOW`] most-recent
    /// feedback rows and its single most-recent unexpired traffic
    /// condition.
    pub fn load_segment_batch(&self, after_id: i64, limit: usize) -> Result<Vec<RoadSegment>> {
        let now = now_utc();
        self.with_conn(|conn| {
            let mut seg_stmt = conn.prepare(
                "SELECT id, road_id, geometry, one_way, speed_limit
                 FROM road_segments WHERE id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let mut feedback_stmt = conn.prepare(
                "SELECT adjustment, severity FROM segment_feedback
                 WHERE segment_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let mut traffic_stmt = conn.prepare(
                "SELECT level FROM traffic_conditions
                 WHERE segment_id = ?1 AND expires_at > ?2
                 ORDER BY recorded_at DESC, id DESC LIMIT 1",
            )?;

            let mut segments = seg_stmt
                .query_map(params![after_id, limit as i64], |row| {
                    Ok(RoadSegment {
                        id: row.get(0)?,
                        road_id: row.get(1)?,
                        geometry: row.get(2)?,
                        one_way: row.get::<_, i64>(3)? != 0,
                        speed_limit: row.get::<_, Option<i64>>(4)?.map(|v| v as u32),
                        feedback: Vec::new(),
                        traffic: None,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for segment in &mut segments {
                segment.feedback = feedback_stmt
                    .query_map(params![segment.id, FEEDBACK_WINDOW as i64], |row| {
                        Ok(FeedbackSample {
                            adjustment: row.get(0)?,
                            severity: row.get(1)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                segment.traffic = traffic_stmt
                    .query_row(params![segment.id, now], |row| {
                        let label: String = row.get(0)?;
                        Ok(TrafficCondition {
                            level: TrafficLevel::from_label(&label),
                        })
                    })
                    .optional()?;
            }

            Ok(segments)
        })
    }
}
