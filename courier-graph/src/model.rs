//! Domain types shared across the build pipeline.
//!
//! Segment rows are explicit structs with optional sub-structures so the
//! missing-vs-present distinctions the weight resolver depends on are
//! enforced by the type system, not by runtime checks on loosely typed
//! rows.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A parent road row. Segments inherit its name, class and one-way flag.
#[derive(Debug, Clone)]
pub struct Road {
    pub id: i64,
    pub name: Option<String>,
    pub road_type: String,
    pub one_way: bool,
}

/// A surveyed junction node with a platform-assigned identifier.
///
/// Exported graphs reuse these identifiers where segment geometry passes
/// through a known node, so downstream tooling can correlate ways back to
/// the source network.
#[derive(Debug, Clone)]
pub struct RoadNode {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
}

/// One courier feedback row for a segment.
///
/// Either an explicit numeric adjustment in [-1, 1] (negative values mean
/// the segment is better than expected) or a categorical severity label,
/// or both; rows with neither still count as a neutral sample.
#[derive(Debug, Clone, Default)]
pub struct FeedbackSample {
    pub adjustment: Option<f64>,
    pub severity: Option<String>,
}

/// Live congestion level reported for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficLevel {
    FreeFlow,
    Normal,
    Slow,
    Congested,
    Blocked,
}

impl TrafficLevel {
    /// Total mapping from the store's label column. Unrecognized labels
    /// read as free-flow, matching the best-case default used when no
    /// condition exists at all.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_uppercase().as_str() {
            "FREE_FLOW" => TrafficLevel::FreeFlow,
            "NORMAL" => TrafficLevel::Normal,
            "SLOW" => TrafficLevel::Slow,
            "CONGESTED" => TrafficLevel::Congested,
            "BLOCKED" => TrafficLevel::Blocked,
            _ => TrafficLevel::FreeFlow,
        }
    }
}

/// The single most-recent unexpired traffic condition for a segment.
#[derive(Debug, Clone)]
pub struct TrafficCondition {
    pub level: TrafficLevel,
}

/// A directed piece of road geometry, the unit of weight computation and
/// export. Loaded with its feedback and traffic sub-rows already attached.
#[derive(Debug, Clone)]
pub struct RoadSegment {
    pub id: i64,
    pub road_id: i64,
    /// JSON array of `[lat, lon]` pairs. Parsed defensively at export
    /// time; malformed geometry skips the segment, it never aborts a run.
    pub geometry: String,
    pub one_way: bool,
    pub speed_limit: Option<u32>,
    pub feedback: Vec<FeedbackSample>,
    pub traffic: Option<TrafficCondition>,
}

/// Build lifecycle states.
///
/// `Pending`, `Building` and `Testing` are non-terminal; everything else
/// is terminal. Transitions only move forward:
/// Pending → Building → (Testing →) Ready → Deployed, with Failed
/// reachable from any non-terminal state and Deprecated only from
/// Deployed. `Testing` is a reserved gate for external validation; the
/// pipeline itself never enters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    Pending,
    Building,
    Testing,
    Ready,
    Deployed,
    Failed,
    Deprecated,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "PENDING",
            BuildStatus::Building => "BUILDING",
            BuildStatus::Testing => "TESTING",
            BuildStatus::Ready => "READY",
            BuildStatus::Deployed => "DEPLOYED",
            BuildStatus::Failed => "FAILED",
            BuildStatus::Deprecated => "DEPRECATED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BuildStatus::Pending),
            "BUILDING" => Some(BuildStatus::Building),
            "TESTING" => Some(BuildStatus::Testing),
            "READY" => Some(BuildStatus::Ready),
            "DEPLOYED" => Some(BuildStatus::Deployed),
            "FAILED" => Some(BuildStatus::Failed),
            "DEPRECATED" => Some(BuildStatus::Deprecated),
            _ => None,
        }
    }

    /// Pending, Building and Testing occupy an instance's build slot.
    pub fn is_terminal(&self) -> bool {
        match self {
            BuildStatus::Pending | BuildStatus::Building | BuildStatus::Testing => false,
            BuildStatus::Ready
            | BuildStatus::Deployed
            | BuildStatus::Failed
            | BuildStatus::Deprecated => true,
        }
    }

    /// Whether the state machine permits `self → to`.
    pub fn can_transition_to(&self, to: BuildStatus) -> bool {
        match (self, to) {
            (BuildStatus::Pending, BuildStatus::Building) => true,
            (BuildStatus::Building, BuildStatus::Testing) => true,
            (BuildStatus::Building, BuildStatus::Ready) => true,
            (BuildStatus::Testing, BuildStatus::Ready) => true,
            (BuildStatus::Ready, BuildStatus::Deployed) => true,
            (BuildStatus::Deployed, BuildStatus::Deprecated) => true,
            (BuildStatus::Pending, BuildStatus::Failed)
            | (BuildStatus::Building, BuildStatus::Failed)
            | (BuildStatus::Testing, BuildStatus::Failed) => true,
            _ => false,
        }
    }
}

/// One durable build attempt. Created once, mutated only through the
/// registry's transition operations, never deleted — history is retained
/// for audit and rollback.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BuildRecord {
    pub id: String,
    pub instance_name: String,
    pub status: BuildStatus,
    pub segment_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<String>,
}
