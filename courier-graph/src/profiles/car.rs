//! Four-wheeled delivery vehicles (cars, small vans).

use super::ProfileTemplate;

pub(crate) const TEMPLATE: ProfileTemplate = ProfileTemplate {
    speeds: &[
        ("motorway", 90),
        ("trunk", 75),
        ("primary", 60),
        ("secondary", 50),
        ("tertiary", 40),
        ("unclassified", 25),
        ("residential", 25),
        ("service", 15),
        ("living_street", 10),
        ("track", 12),
    ],
    barred: &[],
    default_speed_kmh: 25,
    max_speed_kmh: 130,
    // U-turns across delivery traffic are expensive; sharp turns less so.
    u_turn_penalty_s: 25,
    sharp_turn_penalty_s: 8,
};
