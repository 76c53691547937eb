use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use courier_graph::cli::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run(Cli::parse()).await
}
