//! CLI argument parsing for Digilynx components
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Common arguments shared via composition, not inheritance
//! - Each binary has its own Args struct that embeds CommonArgs
//! - Command-line values override the configuration file

use clap::Parser;

/// Common arguments shared across all Digilynx components
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "config.toml")]
    pub config_file: String,
}

/// Arguments for the reader stage
#[derive(Parser, Debug, Clone)]
pub struct ReaderArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Override UDP bind address
    #[arg(long = "udp-address")]
    pub udp_address: Option<String>,

    /// Override UDP bind port
    #[arg(long)]
    pub port: Option<u16>,

    /// Override ZMQ publish address (e.g., tcp://*:5555)
    #[arg(short = 'p', long = "pub")]
    pub pub_address: Option<String>,

    /// Stop after this many accepted packets (0 = unbounded)
    #[arg(short = 'n', long)]
    pub npackets: Option<u64>,

    /// Source ID announced in published messages
    #[arg(long = "source-id")]
    pub source_id: Option<u32>,
}

/// Arguments for the packet emulator
#[derive(Parser, Debug, Clone)]
pub struct EmulatorArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Override destination (host:port) of the generated datagrams
    #[arg(short = 't', long)]
    pub target: Option<String>,

    /// Stop after sending this many packets (0 = unbounded)
    #[arg(short = 'n', long)]
    pub packets: Option<u64>,

    /// Override the drop probability
    #[arg(long = "drop-rate")]
    pub drop_rate: Option<f64>,

    /// Assert the trigger bit from this packet onward
    #[arg(long = "trigger-after")]
    pub trigger_after: Option<u64>,
}

/// Arguments for DataSink (test subscriber)
#[derive(Parser, Debug, Clone)]
pub struct DataSinkArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// ZMQ address to subscribe to
    #[arg(short = 'a', long = "address")]
    pub address: Option<String>,

    /// Print upstream stats reports as JSON lines
    #[arg(long)]
    pub json: bool,
}
