//! CLI commands for courier-graph

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::{run_server, AppState};
use crate::config::BuildConfig;
use crate::model::BuildRecord;
use crate::orchestrator::ContainerOrchestrator;
use crate::pipeline::PipelineRunner;
use crate::registry::BuildRegistry;
use crate::store::Store;

#[derive(Parser)]
#[command(name = "courier-graph")]
#[command(about = "Routing-graph build pipeline for the courier platform", long_about = None)]
pub struct Cli {
    /// JSON configuration file (defaults apply if missing)
    #[arg(short, long, global = true, default_value = "courier-graph.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export the shared routing graph without compiling any variant
    Export,

    /// Run a full multi-variant generation
    Generate,

    /// Show build status for one instance, or the latest record per instance
    Status {
        /// Instance name (a variant or a run)
        instance: Option<String>,
    },

    /// Show build history for an instance
    History {
        instance: String,

        /// Maximum records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Manage a variant's routing-engine container
    Container {
        /// start | stop | restart | rebuild | health | status
        action: String,
        variant: String,
    },

    /// Serve the HTTP control surface
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8090")]
        port: u16,
    },
}

fn print_record(record: &BuildRecord) {
    println!(
        "{:<24} {:<10} {:>9} segs  {}",
        record.instance_name,
        record.status.as_str(),
        record.segment_count,
        record.created_at
    );
    if let Some(output) = &record.output_path {
        println!("    output: {output}");
    }
    if let Some(message) = &record.error_message {
        println!("    error: {message}");
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(BuildConfig::load_or_default(&cli.config)?);
    let store = Arc::new(Store::open(&config.store_path)?);
    store.init_schema()?;
    let registry = Arc::new(BuildRegistry::new(store));
    let runner = Arc::new(PipelineRunner::new(registry.clone(), config.clone()));
    let orchestrator = Arc::new(ContainerOrchestrator::new(registry.clone(), config.clone()));

    match cli.command {
        Commands::Export => {
            let summary = runner.export_graph().await?;
            println!("Graph exported to {}", summary.graph_path);
            println!(
                "{} nodes, {} ways, {} segments skipped",
                summary.nodes, summary.ways, summary.skipped_segments
            );
        }
        Commands::Generate => {
            let report = runner.run_generation().await?;
            println!("Run {} finished: {}", report.parent.id, report.parent.status.as_str());
            for child in &report.variants {
                print_record(child);
            }
            if let Some(message) = &report.parent.error_message {
                anyhow::bail!("generation failed: {message}");
            }
        }
        Commands::Status { instance } => match instance {
            Some(instance) => {
                let record = match registry.current_build(&instance)? {
                    Some(record) => Some(record),
                    None => registry.history(&instance, 1)?.into_iter().next(),
                };
                match record {
                    Some(record) => print_record(&record),
                    None => println!("No builds for instance '{instance}'"),
                }
            }
            None => {
                for record in registry.overview()? {
                    print_record(&record);
                }
            }
        },
        Commands::History { instance, limit } => {
            let records = registry.history(&instance, limit)?;
            if records.is_empty() {
                println!("No builds for instance '{instance}'");
            }
            for record in &records {
                print_record(record);
            }
        }
        Commands::Container { action, variant } => {
            if config.variant_named(&variant).is_none() {
                anyhow::bail!("unknown variant '{variant}'");
            }
            match action.as_str() {
                "start" => orchestrator.start(&variant).await?,
                "stop" => orchestrator.stop(&variant).await?,
                "restart" => orchestrator.restart(&variant).await?,
                "rebuild" => orchestrator.rebuild(&variant).await?,
                "health" => {
                    let health = orchestrator.health_check(&variant).await;
                    println!("{variant}: {health:?}");
                    return Ok(());
                }
                "status" => {
                    let status = orchestrator.status(&variant).await;
                    println!("{variant}: {:?} ({:?})", status.state, status.health);
                    return Ok(());
                }
                other => anyhow::bail!("unknown container action '{other}'"),
            }
            let status = orchestrator.status(&variant).await;
            println!("{variant}: {:?} ({:?})", status.state, status.health);
        }
        Commands::Serve { port } => {
            let state = Arc::new(AppState { registry, runner, orchestrator });
            run_server(state, port).await?;
        }
    }

    Ok(())
}
