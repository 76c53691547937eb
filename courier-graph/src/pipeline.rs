//! Generation runs: shared-graph export plus the three-stage external
//! compile per variant.
//!
//! The compiler is opaque. Each stage is a blocking subprocess with a
//! large output-capture allowance and fail-fast exit-code semantics; the
//! three stages for one variant are strictly sequential because each
//! consumes the previous stage's artifacts. A variant failure aborts that
//! variant's remaining stages only — other variants still run, but the
//! parent run is only Ready once every variant succeeded. There are no
//! automatic retries at any level; a fresh attempt is always a new build
//! record.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use courier_common::{GraphError, Result};
use serde::Serialize;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::BuildConfig;
use crate::export;
use crate::ingest;
use crate::model::{BuildRecord, BuildStatus};
use crate::profiles::{generate_profile, Variant};
use crate::registry::BuildRegistry;
use crate::weights;

/// Instance name of the parent record tracking a full generation run.
pub const GENERATION_INSTANCE: &str = "generation-run";

/// Instance name tracking shared-graph-only export runs.
pub const EXPORT_INSTANCE: &str = "graph-export";

const GRAPH_FILE: &str = "graph.osm";
const PROFILE_FILE: &str = "profile.lua";
const COMPILED_FILE: &str = "graph.osrm";

/// The three compiler stages, in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerStage {
    Extract,
    Partition,
    Customize,
}

impl CompilerStage {
    pub const ALL: [CompilerStage; 3] =
        [CompilerStage::Extract, CompilerStage::Partition, CompilerStage::Customize];

    pub fn name(&self) -> &'static str {
        match self {
            CompilerStage::Extract => "extract",
            CompilerStage::Partition => "partition",
            CompilerStage::Customize => "customize",
        }
    }

    fn command(&self, config: &BuildConfig) -> (String, Vec<String>) {
        match self {
            CompilerStage::Extract => (
                config.compiler.extract_bin.clone(),
                vec!["-p".to_string(), PROFILE_FILE.to_string(), GRAPH_FILE.to_string()],
            ),
            CompilerStage::Partition => {
                (config.compiler.partition_bin.clone(), vec![COMPILED_FILE.to_string()])
            }
            CompilerStage::Customize => {
                (config.compiler.customize_bin.clone(), vec![COMPILED_FILE.to_string()])
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExportSummary {
    pub record: BuildRecord,
    pub graph_path: String,
    pub nodes: u64,
    pub ways: u64,
    pub skipped_segments: u64,
}

#[derive(Debug, Serialize)]
pub struct GenerationReport {
    pub parent: BuildRecord,
    pub variants: Vec<BuildRecord>,
}

struct ExportedGraph {
    path: PathBuf,
    stats: export::ExportStats,
    segment_count: u64,
    avg_weight: f64,
}

pub struct PipelineRunner {
    registry: Arc<BuildRegistry>,
    config: Arc<BuildConfig>,
}

impl PipelineRunner {
    pub fn new(registry: Arc<BuildRegistry>, config: Arc<BuildConfig>) -> Self {
        PipelineRunner { registry, config }
    }

    pub fn config(&self) -> &Arc<BuildConfig> {
        &self.config
    }

    /// Export the shared graph without compiling any variant.
    pub async fn export_graph(&self) -> Result<ExportSummary> {
        self.registry
            .execute_sequentially(EXPORT_INSTANCE, || self.export_graph_locked())
            .await
    }

    async fn export_graph_locked(&self) -> Result<ExportSummary> {
        let segment_count = self.registry.store().count_segments()?;
        let record = self.registry.start_build(EXPORT_INSTANCE, segment_count, None)?;
        let out_dir = self.config.work_dir.join("export");

        let exported = match self.build_shared_graph(&record.id, &out_dir).await {
            Ok(exported) => exported,
            Err(e) => {
                let _ = self.registry.mark_failed(&record.id, &e.to_string());
                return Err(e);
            }
        };
        let record = self
            .registry
            .mark_ready(&record.id, &exported.path, Some(exported.avg_weight))?;
        Ok(ExportSummary {
            record,
            graph_path: exported.path.display().to_string(),
            nodes: exported.stats.nodes,
            ways: exported.stats.ways,
            skipped_segments: exported.stats.skipped_segments,
        })
    }

    /// Run a full multi-variant generation.
    ///
    /// Run-level failures (store unreachable, empty network) surface as
    /// errors after failing the parent record. Variant failures do not:
    /// the report carries every child's terminal record and a Failed
    /// parent.
    pub async fn run_generation(&self) -> Result<GenerationReport> {
        self.registry
            .execute_sequentially(GENERATION_INSTANCE, || self.run_generation_locked())
            .await
    }

    async fn run_generation_locked(&self) -> Result<GenerationReport> {
        let segment_count = self.registry.store().count_segments()?;
        let parent = self.registry.start_build(GENERATION_INSTANCE, segment_count, None)?;
        let run_dir = self.config.work_dir.join("runs").join(&parent.id);

        let exported = match self.build_shared_graph(&parent.id, &run_dir).await {
            Ok(exported) => exported,
            Err(e) => {
                let _ = self.registry.mark_failed(&parent.id, &e.to_string());
                return Err(e);
            }
        };

        let mut children = Vec::with_capacity(self.config.variants.len());
        let mut failures = 0usize;
        for variant in &self.config.variants {
            // Registry/store failures here are run-fatal; the parent must
            // not be left occupying its build slot.
            let child = match self.run_variant(variant, &exported, &run_dir).await {
                Ok(child) => child,
                Err(e) => {
                    let _ = self.registry.mark_failed(&parent.id, &e.to_string());
                    return Err(e);
                }
            };
            if child.status != BuildStatus::Ready {
                failures += 1;
            }
            children.push(child);
        }

        let parent = if failures == 0 {
            self.registry
                .mark_ready(&parent.id, &run_dir, Some(exported.avg_weight))?
        } else {
            self.registry.mark_failed(
                &parent.id,
                &format!("{failures} of {} variants failed to compile", children.len()),
            )?
        };

        info!(
            run = %parent.id,
            variants = children.len(),
            failures,
            "generation run finished"
        );
        Ok(GenerationReport { parent, variants: children })
    }

    /// Load the network, derive weights, and write the shared graph and
    /// its manifest under `out_dir`. Runs on the blocking pool: the
    /// loader and exporter are synchronous by design.
    async fn build_shared_graph(&self, build_id: &str, out_dir: &Path) -> Result<ExportedGraph> {
        self.registry.mark_building(build_id)?;

        let store = self.registry.store().clone();
        let batch_size = self.config.segment_batch_size;
        let out_dir = out_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&out_dir).map_err(|e| {
                GraphError::Validation(format!("cannot create {}: {e}", out_dir.display()))
            })?;
            let network = ingest::load_network(&store, batch_size)?;
            let derived = weights::resolve_all(&network.segments);
            let avg_weight = derived.values().map(|w| w.traffic_factor).sum::<f64>()
                / derived.len().max(1) as f64;

            let graph_path = out_dir.join(GRAPH_FILE);
            let rendered = export::write_graph(&graph_path, &network, &derived)?;
            Ok(ExportedGraph {
                path: graph_path,
                stats: rendered.stats,
                segment_count: network.segments.len() as u64,
                avg_weight,
            })
        })
        .await
        .map_err(|e| GraphError::Validation(format!("export task aborted: {e}")))?
    }

    /// Compile one variant in its isolated workspace. Always returns the
    /// child's terminal record; stage failures are recorded on it, not
    /// propagated. Only registry/store failures escape as errors.
    async fn run_variant(
        &self,
        variant: &Variant,
        exported: &ExportedGraph,
        run_dir: &Path,
    ) -> Result<BuildRecord> {
        let name = variant.name();
        let child =
            self.registry
                .start_build(&name, exported.segment_count, Some(&exported.path))?;
        self.registry.mark_building(&child.id)?;

        let workspace = run_dir.join(&name);
        if let Err(e) = self.stage_workspace(variant, exported, &workspace).await {
            warn!(variant = %name, error = %e, "workspace staging failed");
            return self.registry.mark_failed(&child.id, &e.to_string());
        }

        for stage in CompilerStage::ALL {
            if let Err(e) = self.run_stage(stage, &workspace).await {
                error!(variant = %name, stage = stage.name(), "compiler stage failed");
                // Remaining stages for this variant are skipped; other
                // variants still run.
                return self.registry.mark_failed(&child.id, &e.to_string());
            }
        }

        self.registry
            .mark_ready(&child.id, &workspace.join(COMPILED_FILE), Some(exported.avg_weight))
    }

    async fn stage_workspace(
        &self,
        variant: &Variant,
        exported: &ExportedGraph,
        workspace: &Path,
    ) -> Result<()> {
        tokio::fs::create_dir_all(workspace).await.map_err(|e| {
            GraphError::Validation(format!("cannot create {}: {e}", workspace.display()))
        })?;
        tokio::fs::copy(&exported.path, workspace.join(GRAPH_FILE))
            .await
            .map_err(|e| {
                GraphError::Validation(format!(
                    "cannot copy shared graph into {}: {e}",
                    workspace.display()
                ))
            })?;
        tokio::fs::write(workspace.join(PROFILE_FILE), generate_profile(variant))
            .await
            .map_err(|e| {
                GraphError::Validation(format!("cannot write profile: {e}"))
            })
    }

    async fn run_stage(&self, stage: CompilerStage, workspace: &Path) -> Result<()> {
        let (bin, args) = stage.command(&self.config);
        info!(stage = stage.name(), bin = %bin, workspace = %workspace.display(), "running compiler stage");

        let child = Command::new(&bin)
            .args(&args)
            .current_dir(workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GraphError::external_tool(stage.name(), None, &format!("cannot spawn {bin}: {e}"))
            })?;

        let deadline = self.config.compiler.stage_deadline_secs;
        let waited = if deadline > 0 {
            match tokio::time::timeout(Duration::from_secs(deadline), child.wait_with_output())
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    // kill_on_drop reaps the hung tool.
                    return Err(GraphError::external_tool(
                        stage.name(),
                        None,
                        &format!("deadline of {deadline}s exceeded"),
                    ));
                }
            }
        } else {
            child.wait_with_output().await
        };
        let output =
            waited.map_err(|e| GraphError::external_tool(stage.name(), None, &e.to_string()))?;

        if !output.status.success() {
            let mut captured = String::from_utf8_lossy(&output.stderr).into_owned();
            if captured.trim().is_empty() {
                captured = String::from_utf8_lossy(&output.stdout).into_owned();
            }
            return Err(GraphError::external_tool(
                stage.name(),
                output.status.code(),
                &captured,
            ));
        }
        Ok(())
    }
}
