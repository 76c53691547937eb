//! Lifecycle control of the long-running routing-engine containers.
//!
//! One container per variant, managed through the container runtime's
//! CLI. A container that was never created is reported as `not-found`,
//! which is a status, not a fault — the orchestrator must be able to
//! describe a fleet that is only partially rolled out.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_common::{GraphError, Result};
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::config::BuildConfig;
use crate::registry::BuildRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerState {
    Running,
    Stopped,
    Error,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EngineHealth {
    Healthy,
    Unhealthy,
    Starting,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VariantStatus {
    pub variant: String,
    pub container: String,
    pub state: ContainerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<EngineHealth>,
}

struct DockerOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl DockerOutput {
    fn success(&self) -> bool {
        self.code == Some(0)
    }
}

fn parse_container_state(raw: &str) -> ContainerState {
    match raw {
        "running" => ContainerState::Running,
        "exited" | "created" | "paused" => ContainerState::Stopped,
        _ => ContainerState::Error,
    }
}

/// Probe result plus engine uptime decide the health verdict: a failing
/// probe inside the startup grace window reads as still starting.
fn classify_health(probe_ok: bool, uptime: Option<Duration>, grace: Duration) -> EngineHealth {
    if probe_ok {
        return EngineHealth::Healthy;
    }
    match uptime {
        Some(up) if up < grace => EngineHealth::Starting,
        _ => EngineHealth::Unhealthy,
    }
}

pub struct ContainerOrchestrator {
    registry: Arc<BuildRegistry>,
    config: Arc<BuildConfig>,
    http: reqwest::Client,
}

impl ContainerOrchestrator {
    pub fn new(registry: Arc<BuildRegistry>, config: Arc<BuildConfig>) -> Self {
        ContainerOrchestrator {
            registry,
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn container_name(&self, variant: &str) -> String {
        format!("{}-{variant}", self.config.containers.name_prefix)
    }

    async fn docker(&self, args: &[&str]) -> Result<DockerOutput> {
        let bin = &self.config.containers.docker_bin;
        let output = Command::new(bin)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| GraphError::Container(format!("cannot run {bin}: {e}")))?;
        Ok(DockerOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn docker_expect(&self, args: &[&str]) -> Result<DockerOutput> {
        let out = self.docker(args).await?;
        if !out.success() {
            return Err(GraphError::Container(format!(
                "docker {} failed (exit {:?}): {}",
                args.first().unwrap_or(&""),
                out.code,
                out.stderr.trim()
            )));
        }
        Ok(out)
    }

    /// Container state plus start time, or `None` for an unmanaged name.
    async fn inspect(&self, container: &str) -> Result<Option<(ContainerState, Option<DateTime<Utc>>)>> {
        let out = self
            .docker(&["inspect", "-f", "{{.State.Status}}|{{.State.StartedAt}}", container])
            .await?;
        if !out.success() {
            // "No such object" is a normal answer, not a runtime fault.
            if out.stderr.to_ascii_lowercase().contains("no such") {
                return Ok(None);
            }
            return Err(GraphError::Container(format!(
                "docker inspect {container} failed: {}",
                out.stderr.trim()
            )));
        }
        let line = out.stdout.trim();
        let (state_raw, started_raw) = line.split_once('|').unwrap_or((line, ""));
        let started = DateTime::parse_from_rfc3339(started_raw)
            .ok()
            .map(|t| t.with_timezone(&Utc));
        Ok(Some((parse_container_state(state_raw), started)))
    }

    /// Status and health for one variant. Runtime-level failures degrade
    /// to `error` instead of propagating, so one broken container never
    /// hides the rest of the fleet.
    pub async fn status(&self, variant: &str) -> VariantStatus {
        let container = self.container_name(variant);
        match self.inspect(&container).await {
            Ok(None) => VariantStatus {
                variant: variant.to_string(),
                container,
                state: ContainerState::NotFound,
                health: None,
            },
            Ok(Some((state, started))) => {
                let health = if state == ContainerState::Running {
                    let probe_ok = self.probe(variant).await;
                    let uptime = started.and_then(|t| (Utc::now() - t).to_std().ok());
                    let grace = Duration::from_secs(self.config.containers.startup_grace_secs);
                    Some(classify_health(probe_ok, uptime, grace))
                } else {
                    None
                };
                VariantStatus { variant: variant.to_string(), container, state, health }
            }
            Err(e) => {
                warn!(variant, error = %e, "container status query failed");
                VariantStatus {
                    variant: variant.to_string(),
                    container,
                    state: ContainerState::Error,
                    health: None,
                }
            }
        }
    }

    /// Status for every configured variant, probed concurrently so one
    /// slow health check cannot stall the rest of the poll.
    pub async fn status_all(self: &Arc<Self>) -> Vec<VariantStatus> {
        let mut tasks = tokio::task::JoinSet::new();
        for (index, variant) in self.config.variants.iter().enumerate() {
            let this = self.clone();
            let name = variant.name();
            tasks.spawn(async move { (index, this.status(&name).await) });
        }
        let mut results: Vec<(usize, VariantStatus)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(entry) = joined {
                results.push(entry);
            }
        }
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, status)| status).collect()
    }

    pub async fn start(&self, variant: &str) -> Result<()> {
        let container = self.container_name(variant);
        self.docker_expect(&["start", &container]).await?;
        info!(variant, "engine started");
        Ok(())
    }

    pub async fn stop(&self, variant: &str) -> Result<()> {
        let container = self.container_name(variant);
        self.docker_expect(&["stop", &container]).await?;
        info!(variant, "engine stopped");
        Ok(())
    }

    /// Graceful restart, falling back to stop-then-start.
    pub async fn restart(&self, variant: &str) -> Result<()> {
        let container = self.container_name(variant);
        if let Err(e) = self.docker_expect(&["restart", &container]).await {
            warn!(variant, error = %e, "graceful restart failed, falling back to stop/start");
            let _ = self.docker(&["stop", &container]).await;
            self.docker_expect(&["start", &container]).await?;
        }
        info!(variant, "engine restarted");
        Ok(())
    }

    /// Tear the container down and recreate it from the variant's latest
    /// Ready build, which is thereby promoted to Deployed.
    pub async fn rebuild(&self, variant: &str) -> Result<()> {
        let ready = self.registry.latest_ready(variant)?.ok_or_else(|| {
            GraphError::Validation(format!("no READY build to deploy for variant '{variant}'"))
        })?;
        let output_path = ready.output_path.clone().ok_or_else(|| {
            GraphError::State(format!("build {} has no compiled output recorded", ready.id))
        })?;
        let data_dir = std::path::Path::new(&output_path)
            .parent()
            .ok_or_else(|| {
                GraphError::State(format!("compiled output '{output_path}' has no parent directory"))
            })?
            .to_path_buf();
        let port = self.config.port_for(variant).ok_or_else(|| {
            GraphError::Validation(format!("variant '{variant}' is not in the configured matrix"))
        })?;

        let container = self.container_name(variant);
        let _ = self.docker(&["stop", &container]).await;
        let _ = self.docker(&["rm", &container]).await;

        let publish = format!("{port}:5000");
        let volume = format!("{}:/data:ro", data_dir.display());
        self.docker_expect(&[
            "run",
            "-d",
            "--restart",
            "unless-stopped",
            "--name",
            &container,
            "-p",
            &publish,
            "-v",
            &volume,
            &self.config.containers.image,
            "osrm-routed",
            "--algorithm",
            "mld",
            "/data/graph.osrm",
        ])
        .await?;

        self.registry.mark_deployed(&ready.id)?;
        info!(variant, build_id = %ready.id, "engine rebuilt from latest ready output");
        Ok(())
    }

    /// One representative routing query with a short timeout. Any
    /// non-success answer — error status, connection refused, timeout —
    /// is unhealthy.
    pub async fn health_check(&self, variant: &str) -> EngineHealth {
        if self.probe(variant).await {
            EngineHealth::Healthy
        } else {
            EngineHealth::Unhealthy
        }
    }

    async fn probe(&self, variant: &str) -> bool {
        let Some(port) = self.config.port_for(variant) else {
            return false;
        };
        let [from_lat, from_lon] = self.config.containers.probe_from;
        let [to_lat, to_lon] = self.config.containers.probe_to;
        let url = format!(
            "http://127.0.0.1:{port}/route/v1/driving/{from_lon},{from_lat};{to_lon},{to_lat}?overview=false"
        );
        let timeout = Duration::from_secs(self.config.containers.probe_timeout_secs.max(1));
        match self.http.get(&url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BuildStatus;
    use crate::store::Store;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_fake_docker(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-docker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    fn orchestrator_with(dir: &Path, docker_body: &str) -> (Arc<ContainerOrchestrator>, Arc<BuildRegistry>) {
        let store = Store::open_in_memory().unwrap();
        store.init_schema().unwrap();
        let registry = Arc::new(BuildRegistry::new(Arc::new(store)));
        let mut config = BuildConfig::default();
        config.containers.docker_bin = write_fake_docker(dir, docker_body);
        config.containers.startup_grace_secs = 30;
        config.containers.probe_timeout_secs = 1;
        (
            Arc::new(ContainerOrchestrator::new(registry.clone(), Arc::new(config))),
            registry,
        )
    }

    #[test]
    fn container_states_map_from_runtime_strings() {
        assert_eq!(parse_container_state("running"), ContainerState::Running);
        assert_eq!(parse_container_state("exited"), ContainerState::Stopped);
        assert_eq!(parse_container_state("created"), ContainerState::Stopped);
        assert_eq!(parse_container_state("dead"), ContainerState::Error);
    }

    #[test]
    fn failing_probe_within_grace_reads_as_starting() {
        let grace = Duration::from_secs(30);
        assert_eq!(
            classify_health(true, Some(Duration::from_secs(1)), grace),
            EngineHealth::Healthy
        );
        assert_eq!(
            classify_health(false, Some(Duration::from_secs(5)), grace),
            EngineHealth::Starting
        );
        assert_eq!(
            classify_health(false, Some(Duration::from_secs(120)), grace),
            EngineHealth::Unhealthy
        );
        // Unknown uptime never masks a failing probe.
        assert_eq!(classify_health(false, None, grace), EngineHealth::Unhealthy);
    }

    #[tokio::test]
    async fn unmanaged_containers_are_not_found_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = orchestrator_with(
            dir.path(),
            "echo 'Error: No such object: whatever' >&2; exit 1",
        );
        let status = orchestrator.status("car").await;
        assert_eq!(status.state, ContainerState::NotFound);
        assert_eq!(status.health, None);
    }

    #[tokio::test]
    async fn runtime_failures_degrade_to_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) =
            orchestrator_with(dir.path(), "echo 'daemon not reachable' >&2; exit 1");
        let status = orchestrator.status("car").await;
        assert_eq!(status.state, ContainerState::Error);
    }

    #[tokio::test]
    async fn status_all_covers_the_whole_matrix_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = orchestrator_with(
            dir.path(),
            "echo 'Error: No such object' >&2; exit 1",
        );
        let statuses = orchestrator.status_all().await;
        assert_eq!(statuses.len(), 4);
        assert_eq!(statuses[0].variant, "car");
        assert!(statuses.iter().all(|s| s.state == ContainerState::NotFound));
    }

    #[tokio::test]
    async fn running_container_with_dead_engine_is_unhealthy_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        // Old StartedAt, no engine listening on the probe port.
        let (orchestrator, _) = orchestrator_with(
            dir.path(),
            "echo 'running|2020-01-01T00:00:00.000000000Z'; exit 0",
        );
        let status = orchestrator.status("car").await;
        assert_eq!(status.state, ContainerState::Running);
        assert_eq!(status.health, Some(EngineHealth::Unhealthy));
    }

    #[tokio::test]
    async fn restart_falls_back_to_stop_then_start() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let body = format!(
            "echo \"$1\" >> {log}\ncase \"$1\" in restart) exit 1;; esac\nexit 0",
            log = log.display()
        );
        let (orchestrator, _) = orchestrator_with(dir.path(), &body);
        orchestrator.restart("car").await.unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls, vec!["restart", "stop", "start"]);
    }

    #[tokio::test]
    async fn rebuild_without_a_ready_build_is_a_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = orchestrator_with(dir.path(), "exit 0");
        let err = orchestrator.rebuild("car").await.unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[tokio::test]
    async fn rebuild_recreates_the_container_and_promotes_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let body = format!("echo \"$@\" >> {log}\nexit 0", log = log.display());
        let (orchestrator, registry) = orchestrator_with(dir.path(), &body);

        let build = registry.start_build("car", 10, None).unwrap();
        registry.mark_building(&build.id).unwrap();
        registry
            .mark_ready(&build.id, Path::new("/srv/builds/car/graph.osrm"), Some(4.5))
            .unwrap();

        orchestrator.rebuild("car").await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 3); // stop, rm, run
        assert!(lines[2].starts_with("run -d"));
        assert!(lines[2].contains("--name courier-engine-car"));
        assert!(lines[2].contains("-p 5000:5000"));
        assert!(lines[2].contains("/srv/builds/car:/data:ro"));
        assert!(lines[2].contains("/data/graph.osrm"));

        let deployed = registry.latest_deployed("car").unwrap().unwrap();
        assert_eq!(deployed.id, build.id);
        assert_eq!(deployed.status, BuildStatus::Deployed);
    }
}
