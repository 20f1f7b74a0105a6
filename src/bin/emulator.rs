//! Emulator binary - sends a synthetic Digilynx packet stream over UDP
//!
//! Usage:
//!   cargo run --bin emulator                                # Use config.toml / defaults
//!   cargo run --bin emulator -- --target 127.0.0.1:5000     # Override destination
//!   cargo run --bin emulator -- -n 32000 --drop-rate 0.01   # 1 s of data, 1% loss

use std::path::Path;

use clap::Parser;
use digilynx_rs::common::{setup_shutdown, EmulatorArgs};
use digilynx_rs::config::Config;
use digilynx_rs::data_source_emulator::Emulator;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (logging)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("digilynx_rs=info".parse()?))
        .init();

    let args = EmulatorArgs::parse();

    let config_path = &args.common.config_file;
    let config = if Path::new(config_path).exists() {
        info!(config_file = %config_path, "Loaded configuration");
        Config::load(config_path)?
    } else {
        Config::default()
    };

    let mut emulator_config = config.emulator;
    if let Some(target) = args.target {
        emulator_config.target = target;
    }
    if let Some(packets) = args.packets {
        emulator_config.packets = packets;
    }
    if let Some(rate) = args.drop_rate {
        emulator_config.drop_rate = rate;
    }
    if args.trigger_after.is_some() {
        emulator_config.trigger_after = args.trigger_after;
    }

    println!(
        "Emulator sending {} channels to {}",
        emulator_config.nchannels, emulator_config.target
    );
    if emulator_config.packets == 0 {
        println!("Press Ctrl+C to stop.");
    } else {
        println!("Will send {} packets.", emulator_config.packets);
    }

    let emulator = Emulator::new(emulator_config)?;
    let (_shutdown_tx, shutdown_rx) = setup_shutdown();

    let summary = emulator.run(shutdown_rx).await?;

    println!(
        "Emulator stopped. datagrams={} bytes={} dropped={} duplicated={} reordered={} corrupted={}",
        summary.datagrams_sent,
        summary.bytes_sent,
        summary.faults.dropped,
        summary.faults.duplicated,
        summary.faults.reordered,
        summary.faults.corrupted
    );
    Ok(())
}
