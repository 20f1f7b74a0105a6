//! DataSink binary - subscribes to the reader's batches via ZeroMQ
//!
//! Usage:
//!   cargo run --bin data_sink                              # Use config.toml / defaults
//!   cargo run --bin data_sink -- --address tcp://localhost:5555
//!   cargo run --bin data_sink -- --json                    # Stats reports as JSON lines

use std::path::Path;

use clap::Parser;
use digilynx_rs::common::{setup_shutdown, DataSinkArgs};
use digilynx_rs::config::Config;
use digilynx_rs::data_sink::DataSink;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so JSON output stays clean
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("digilynx_rs=info".parse()?))
        .init();

    let args = DataSinkArgs::parse();

    let config_path = &args.common.config_file;
    let config = if Path::new(config_path).exists() {
        info!(config_file = %config_path, "Loaded configuration");
        Config::load(config_path)?
    } else {
        Config::default()
    };

    let mut sink_config = config.data_sink;
    if let Some(address) = args.address {
        sink_config.subscribe = address;
    }

    if !args.json {
        println!("DataSink running. Connecting to {}", sink_config.subscribe);
        println!("Press Ctrl+C to stop.");
    }

    let (_shutdown_tx, shutdown_rx) = setup_shutdown();
    let mut sink = DataSink::new(sink_config, args.json);
    sink.run(shutdown_rx).await?;

    if !args.json {
        println!("DataSink stopped.");
    }
    Ok(())
}
