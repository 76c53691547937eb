//! Per-segment weight derivation from feedback and traffic signals.
//!
//! The two factors are deliberately asymmetric: a segment without
//! feedback has **no** rating factor (absence is information the profile
//! layer acts on), while a segment without an active traffic condition
//! always gets the free-flow factor. Collapsing the two would make
//! "nobody rated this" indistinguishable from "traffic is fine".

use std::collections::HashMap;

use crate::model::{FeedbackSample, RoadSegment, TrafficLevel};

/// Free-flow traffic factor, the upper end of the [0, 5] scale and the
/// default when no active condition exists.
pub const FREE_FLOW_FACTOR: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedWeight {
    /// Mean of the per-sample values, in [0, 1]. `None` when the segment
    /// has no feedback — never defaulted to a neutral number.
    pub rating_factor: Option<f64>,
    /// Ordinal congestion factor in [0, 5]. Always present.
    pub traffic_factor: f64,
}

/// One feedback sample mapped into [0, 1]. An explicit numeric
/// adjustment wins; otherwise the categorical severity label decides,
/// with unknown labels reading as neutral.
fn sample_value(sample: &FeedbackSample) -> f64 {
    if let Some(adjustment) = sample.adjustment {
        return (0.5 - adjustment * 0.5).clamp(0.0, 1.0);
    }
    match sample.severity.as_deref().map(str::to_ascii_uppercase).as_deref() {
        Some("MINOR") => 0.8,
        Some("MODERATE") => 0.6,
        Some("MAJOR") => 0.4,
        Some("CRITICAL") => 0.2,
        _ => 0.5,
    }
}

fn traffic_factor(level: TrafficLevel) -> f64 {
    match level {
        TrafficLevel::FreeFlow => 5.0,
        TrafficLevel::Normal => 4.0,
        TrafficLevel::Slow => 2.5,
        TrafficLevel::Congested => 1.0,
        TrafficLevel::Blocked => 0.0,
    }
}

pub fn resolve(segment: &RoadSegment) -> DerivedWeight {
    let rating_factor = if segment.feedback.is_empty() {
        None
    } else {
        let sum: f64 = segment.feedback.iter().map(sample_value).sum();
        Some(sum / segment.feedback.len() as f64)
    };

    let traffic = segment
        .traffic
        .as_ref()
        .map(|condition| traffic_factor(condition.level))
        .unwrap_or(FREE_FLOW_FACTOR);

    DerivedWeight { rating_factor, traffic_factor: traffic }
}

/// Resolve every segment, keyed by segment id.
pub fn resolve_all(segments: &[RoadSegment]) -> HashMap<i64, DerivedWeight> {
    segments.iter().map(|s| (s.id, resolve(s))).collect()
}
