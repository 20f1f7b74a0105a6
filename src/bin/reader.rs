//! Reader binary - receives Digilynx UDP packets and publishes batches via ZeroMQ
//!
//! Usage:
//!   cargo run --bin reader                                  # Use config.toml / defaults
//!   cargo run --bin reader -- --config rig.toml             # Use config file
//!   cargo run --bin reader -- --port 26090 -n 320000        # Stop after 10 s of data

use std::path::Path;

use clap::Parser;
use digilynx_rs::common::{setup_shutdown, ReaderArgs};
use digilynx_rs::config::Config;
use digilynx_rs::reader::{Reader, ReaderConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (logging)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("digilynx_rs=info".parse()?))
        .init();

    let args = ReaderArgs::parse();

    let config_path = &args.common.config_file;
    let mut config = if Path::new(config_path).exists() {
        info!(config_file = %config_path, "Loaded configuration");
        Config::load(config_path)?
    } else {
        info!(config_file = %config_path, "Config file not found, using defaults");
        Config::default()
    };

    // CLI overrides
    if let Some(address) = args.udp_address {
        config.reader.address = address;
    }
    if let Some(port) = args.port {
        config.reader.port = port;
    }
    if let Some(npackets) = args.npackets {
        config.reader.npackets = npackets;
    }
    if let Some(bind) = args.pub_address {
        config.publisher.bind = bind;
    }
    if let Some(source_id) = args.source_id {
        config.publisher.source_id = source_id;
    }

    let reader_config = ReaderConfig::from_settings(&config.reader)?;

    println!(
        "Reader listening on {}:{}, publishing to {}",
        reader_config.address, reader_config.port, config.publisher.bind
    );
    println!("Press Ctrl+C to stop.");

    let reader = Reader::new(reader_config, config.publisher)?;
    let (_shutdown_tx, shutdown_rx) = setup_shutdown();

    let summary = reader.run(shutdown_rx).await?;

    println!();
    println!("{}", summary);
    Ok(())
}
