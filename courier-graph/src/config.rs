//! Build configuration, loaded from a JSON sidecar file.
//!
//! Every field has a default so a partial file (or none at all, for dev
//! setups) still yields a runnable configuration.

use std::path::{Path, PathBuf};

use courier_common::{GraphError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ingest::DEFAULT_SEGMENT_BATCH;
use crate::profiles::{Variant, VehicleClass};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub extract_bin: String,
    pub partition_bin: String,
    pub customize_bin: String,
    /// Per-stage deadline in seconds; 0 disables the deadline. A hung
    /// external tool otherwise occupies the instance's build slot
    /// forever.
    pub stage_deadline_secs: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            extract_bin: "osrm-extract".to_string(),
            partition_bin: "osrm-partition".to_string(),
            customize_bin: "osrm-customize".to_string(),
            stage_deadline_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime CLI. Points at a wrapper in environments where
    /// the daemon needs sudo or a remote context.
    pub docker_bin: String,
    pub image: String,
    /// Containers are named `<prefix>-<variant>`.
    pub name_prefix: String,
    /// Variant i listens on `port_base + i` on the host.
    pub port_base: u16,
    /// Freshly started engines get this long before a failing probe
    /// counts as unhealthy rather than still starting.
    pub startup_grace_secs: u64,
    /// Representative health-probe route, `[lat, lon]` pairs.
    pub probe_from: [f64; 2],
    pub probe_to: [f64; 2],
    pub probe_timeout_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            docker_bin: "docker".to_string(),
            image: "osrm/osrm-backend:v5.27.1".to_string(),
            name_prefix: "courier-engine".to_string(),
            port_base: 5000,
            startup_grace_secs: 30,
            probe_from: [52.520_00, 13.404_95],
            probe_to: [52.500_62, 13.398_08],
            probe_timeout_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub store_path: PathBuf,
    pub work_dir: PathBuf,
    pub segment_batch_size: usize,
    pub variants: Vec<Variant>,
    pub compiler: CompilerConfig,
    pub containers: ContainerConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let mut variants = Vec::new();
        for vehicle in [VehicleClass::Car, VehicleClass::Bike] {
            for (rating, traffic) in [(false, false), (true, true)] {
                variants.push(Variant {
                    vehicle,
                    rating_enabled: rating,
                    traffic_enabled: traffic,
                });
            }
        }
        BuildConfig {
            store_path: PathBuf::from("courier.db"),
            work_dir: PathBuf::from("build"),
            segment_batch_size: DEFAULT_SEGMENT_BATCH,
            variants,
            compiler: CompilerConfig::default(),
            containers: ContainerConfig::default(),
        }
    }
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GraphError::Validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            GraphError::Validation(format!("cannot parse config {}: {e}", path.display()))
        })
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn variant_named(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name() == name)
    }

    /// Host port for a variant's routing engine.
    pub fn port_for(&self, name: &str) -> Option<u16> {
        self.variants
            .iter()
            .position(|v| v.name() == name)
            .map(|i| self.containers.port_base + i as u16)
    }
}
