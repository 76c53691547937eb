//! Per-variant routing-profile generation.
//!
//! A variant is one vehicle class plus two independent modifiers (rating,
//! traffic). Each variant gets a self-contained Lua profile script,
//! generated as a pure function of the per-class template and the flags —
//! no data access, testable by plain text comparison. The set of variants
//! is configuration, not a constant.

pub mod bike;
pub mod car;

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    /// Two-wheeled courier vehicles (cargo bikes, mopeds).
    Bike,
    /// Four-wheeled delivery vehicles (cars, small vans).
    Car,
}

impl VehicleClass {
    pub fn name(&self) -> &'static str {
        match self {
            VehicleClass::Bike => "bike",
            VehicleClass::Car => "car",
        }
    }

    pub(crate) fn template(&self) -> &'static ProfileTemplate {
        match self {
            VehicleClass::Bike => &bike::TEMPLATE,
            VehicleClass::Car => &car::TEMPLATE,
        }
    }
}

/// Per-vehicle-class constants the generator renders into Lua.
pub struct ProfileTemplate {
    /// Nominal speed per road class, km/h.
    pub speeds: &'static [(&'static str, u32)],
    /// Road classes this vehicle may not use at all.
    pub barred: &'static [&'static str],
    /// Fallback for classes missing from `speeds`.
    pub default_speed_kmh: u32,
    /// Hard ceiling regardless of posted limits.
    pub max_speed_kmh: u32,
    pub u_turn_penalty_s: u32,
    pub sharp_turn_penalty_s: u32,
}

/// One (vehicle class × modifier flags) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub vehicle: VehicleClass,
    #[serde(default)]
    pub rating_enabled: bool,
    #[serde(default)]
    pub traffic_enabled: bool,
}

impl Variant {
    /// Stable instance name: vehicle class plus enabled-modifier
    /// suffixes, e.g. `car`, `car-rating`, `bike-rating-traffic`.
    pub fn name(&self) -> String {
        let mut name = self.vehicle.name().to_string();
        if self.rating_enabled {
            name.push_str("-rating");
        }
        if self.traffic_enabled {
            name.push_str("-traffic");
        }
        name
    }
}

/// Generate the variant's profile script.
pub fn generate_profile(variant: &Variant) -> String {
    let template = variant.vehicle.template();
    let mut lua = String::new();

    let _ = writeln!(lua, "-- Routing profile: {}", variant.name());
    let _ = writeln!(
        lua,
        "-- Vehicle class: {}; rating modifier: {}; traffic modifier: {}",
        variant.vehicle.name(),
        if variant.rating_enabled { "on" } else { "off" },
        if variant.traffic_enabled { "on" } else { "off" },
    );
    lua.push_str("-- Generated by courier-graph; do not edit by hand.\n\n");
    lua.push_str("api_version = 4\n\n");

    lua.push_str("function setup()\n");
    lua.push_str("  return {\n");
    lua.push_str("    properties = {\n");
    lua.push_str("      weight_name = 'routability',\n");
    let _ = writeln!(
        lua,
        "      max_speed_for_map_matching = {} / 3.6,",
        template.max_speed_kmh
    );
    let _ = writeln!(lua, "      u_turn_penalty = {},", template.u_turn_penalty_s);
    lua.push_str("      use_turn_restrictions = true,\n");
    lua.push_str("      continue_straight_at_waypoint = false,\n");
    lua.push_str("    },\n");
    let _ = writeln!(lua, "    default_speed = {},", template.default_speed_kmh);
    lua.push_str("    speeds = {\n");
    for (class, speed) in template.speeds {
        let _ = writeln!(lua, "      {class} = {speed},");
    }
    lua.push_str("    },\n");
    lua.push_str("    barred = {\n");
    for class in template.barred {
        let _ = writeln!(lua, "      {class} = true,");
    }
    lua.push_str("    },\n");
    lua.push_str("  }\n");
    lua.push_str("end\n\n");

    lua.push_str("function process_way(profile, way, result)\n");
    lua.push_str("  local highway = way:get_value_by_key('highway')\n");
    lua.push_str("  if not highway or profile.barred[highway] then\n");
    lua.push_str("    return\n");
    lua.push_str("  end\n\n");
    lua.push_str("  local speed = profile.speeds[highway] or profile.default_speed\n\n");
    lua.push_str("  -- Posted limits only ever lower the nominal speed.\n");
    lua.push_str("  local maxspeed = tonumber(way:get_value_by_key('maxspeed') or '')\n");
    lua.push_str("  if maxspeed and maxspeed < speed then\n");
    lua.push_str("    speed = maxspeed\n");
    lua.push_str("  end\n\n");

    if variant.traffic_enabled {
        lua.push_str("  -- Live congestion scales effective speed: 5.0 is free flow.\n");
        lua.push_str("  local traffic = tonumber(way:get_value_by_key('traffic_value') or '')\n");
        lua.push_str("  if traffic then\n");
        lua.push_str("    speed = speed * (traffic / 5.0)\n");
        lua.push_str("  end\n");
        lua.push_str("  if speed <= 0 then\n");
        lua.push_str("    return\n");
        lua.push_str("  end\n\n");
    }

    lua.push_str("  result.forward_speed = speed\n");
    lua.push_str("  result.backward_speed = speed\n");
    lua.push_str("  result.forward_rate = speed / 3.6\n");
    lua.push_str("  result.backward_rate = speed / 3.6\n\n");

    if variant.rating_enabled {
        lua.push_str("  -- Poorly rated segments cost more: weight multiplier (2.0 - rating).\n");
        lua.push_str("  local rating = tonumber(way:get_value_by_key('user_rating') or '')\n");
        lua.push_str("  if rating then\n");
        lua.push_str("    local cost = 2.0 - rating\n");
        lua.push_str("    result.forward_rate = result.forward_rate / cost\n");
        lua.push_str("    result.backward_rate = result.backward_rate / cost\n");
        lua.push_str("  end\n\n");
    }

    lua.push_str("  if way:get_value_by_key('oneway') == 'yes' then\n");
    lua.push_str("    result.backward_mode = mode.inaccessible\n");
    lua.push_str("  end\n\n");
    lua.push_str("  local name = way:get_value_by_key('name')\n");
    lua.push_str("  if name then\n");
    lua.push_str("    result.name = name\n");
    lua.push_str("  end\n");
    lua.push_str("end\n\n");

    lua.push_str("function process_turn(profile, turn)\n");
    lua.push_str("  if turn.is_u_turn then\n");
    let _ = writeln!(lua, "    turn.duration = turn.duration + {}", template.u_turn_penalty_s);
    let _ = writeln!(lua, "    turn.weight = turn.weight + {}", template.u_turn_penalty_s);
    lua.push_str("  elseif math.abs(turn.angle) > 120 then\n");
    let _ = writeln!(lua, "    turn.duration = turn.duration + {}", template.sharp_turn_penalty_s);
    let _ = writeln!(lua, "    turn.weight = turn.weight + {}", template.sharp_turn_penalty_s);
    lua.push_str("  end\n");
    lua.push_str("end\n\n");

    lua.push_str("return {\n");
    lua.push_str("  setup = setup,\n");
    lua.push_str("  process_way = process_way,\n");
    lua.push_str("  process_turn = process_turn,\n");
    lua.push_str("}\n");

    lua
}
