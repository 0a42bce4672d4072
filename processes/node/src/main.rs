//! 'main' for the Obelisk node process

use anyhow::Result;
use caryatid_process::Process;
use clap::Parser;
use config::{Config, Environment, File};
use obelisk_common::messages::Message;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

// External modules
use obelisk_module_block_oracle::BlockOracle;

use caryatid_module_clock::Clock;
use caryatid_module_spy::Spy;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["node.toml".to_string()])]
    config: Vec<String>,
}

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {
    // Get arguments and config
    let args = Args::parse();

    // Standard logging using RUST_LOG for log levels, default INFO
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Obelisk node process");

    // Read the config
    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = Arc::new(builder.add_source(Environment::with_prefix("OBELISK")).build()?);

    // Create the process
    let mut process = Process::<Message>::create(config).await;

    // Register modules
    BlockOracle::register(&mut process);

    Clock::<Message>::register(&mut process);
    Spy::<Message>::register(&mut process);

    // Run it
    process.run().await?;

    // Bye!
    info!("Exiting");

    Ok(())
}
