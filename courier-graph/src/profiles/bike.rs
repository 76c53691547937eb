//! Two-wheeled courier vehicles (cargo bikes, mopeds).

use super::ProfileTemplate;

pub(crate) const TEMPLATE: ProfileTemplate = ProfileTemplate {
    speeds: &[
        ("primary", 18),
        ("secondary", 18),
        ("tertiary", 17),
        ("unclassified", 16),
        ("residential", 16),
        ("service", 14),
        ("living_street", 10),
        ("track", 10),
    ],
    // No motorized-expressway access for two-wheelers.
    barred: &["motorway", "trunk"],
    default_speed_kmh: 15,
    max_speed_kmh: 45,
    u_turn_penalty_s: 6,
    sharp_turn_penalty_s: 3,
};
