//! Configuration module for the Digilynx reader
//!
//! All components read one TOML file:
//! - `[reader]` / `[reader.channelmap]` - UDP input and demultiplexing
//! - `[publisher]` - ZMQ output of the reader
//! - `[emulator]` - synthetic packet source
//! - `[data_sink]` - test subscriber
//!
//! # Example
//! ```ignore
//! let config = Config::load("config.toml")?;
//! let reader = ReaderConfig::from_settings(&config.reader)?;
//! ```

use std::fmt;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::common::StatsCadence;
use crate::reader::record::constants::MAX_NCHANNELS;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("nchannels must be between 1 and {max}, got {0}", max = MAX_NCHANNELS)]
    InvalidChannelCount(usize),

    #[error("batch_size must be at least 1")]
    InvalidBatchSize,

    #[error("hardware_trigger_channel must be below 32, got {0}")]
    InvalidTriggerChannel(u32),

    #[error("channelmap has no destinations")]
    EmptyChannelMap,

    #[error("destination '{0}' has no channels")]
    EmptyDestination(String),

    #[error("destination '{0}' is declared twice")]
    DuplicateDestination(String),

    #[error("destination '{destination}' uses channel {channel}, but records have {nchannels} channels")]
    ChannelOutOfRange {
        destination: String,
        channel: usize,
        nchannels: usize,
    },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub reader: ReaderSettings,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
    #[serde(default)]
    pub data_sink: DataSinkConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

// =============================================================================
// Channel map
// =============================================================================

/// Destination name -> hardware channel indices, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMap {
    entries: Vec<(String, Vec<usize>)>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a destination
    pub fn insert(&mut self, name: impl Into<String>, channels: Vec<usize>) {
        self.entries.push((name.into(), channels));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate destinations in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.entries
            .iter()
            .map(|(name, channels)| (name.as_str(), channels.as_slice()))
    }

    pub fn get(&self, name: &str) -> Option<&[usize]> {
        self.iter().find(|(n, _)| *n == name).map(|(_, c)| c)
    }

    /// Check the map against the record channel count
    pub fn validate(&self, nchannels: usize) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Err(ConfigError::EmptyChannelMap);
        }
        for (i, (name, channels)) in self.entries.iter().enumerate() {
            if self.entries[..i].iter().any(|(other, _)| other == name) {
                return Err(ConfigError::DuplicateDestination(name.clone()));
            }
            if channels.is_empty() {
                return Err(ConfigError::EmptyDestination(name.clone()));
            }
            if let Some(&channel) = channels.iter().find(|&&c| c >= nchannels) {
                return Err(ConfigError::ChannelOutOfRange {
                    destination: name.clone(),
                    channel,
                    nchannels,
                });
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, Vec<usize>)> for ChannelMap {
    fn from_iter<I: IntoIterator<Item = (String, Vec<usize>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'de> Deserialize<'de> for ChannelMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ChannelMapVisitor;

        impl<'de> Visitor<'de> for ChannelMapVisitor {
            type Value = ChannelMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of destination names to channel index arrays")
            }

            fn visit_map<A>(self, mut access: A) -> Result<ChannelMap, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut map = ChannelMap::new();
                while let Some((name, channels)) = access.next_entry::<String, Vec<usize>>()? {
                    map.insert(name, channels);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(ChannelMapVisitor)
    }
}

// =============================================================================
// Reader settings
// =============================================================================

/// Unit of `update_interval`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateUnit {
    #[default]
    Seconds,
    Packets,
}

/// `[reader]` section as written in the file
#[derive(Debug, Clone, Deserialize)]
pub struct ReaderSettings {
    /// UDP bind address
    #[serde(default = "default_address")]
    pub address: String,

    /// UDP bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Channels per hardware record
    #[serde(default = "default_nchannels")]
    pub nchannels: usize,

    /// Rows per emitted batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Accepted-packet ceiling (0 = unbounded)
    #[serde(default)]
    pub npackets: u64,

    /// Stats report cadence (0 = disabled)
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,

    #[serde(default)]
    pub update_unit: UpdateUnit,

    /// Records arrive in network byte order
    #[serde(default = "default_true")]
    pub convert_byte_order: bool,

    /// Withhold batches until the trigger bit is seen
    #[serde(default)]
    pub hardware_trigger: bool,

    /// Digital input bit used as trigger
    #[serde(default)]
    pub hardware_trigger_channel: u32,

    /// Receive wait bound in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub channelmap: ChannelMap,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            nchannels: default_nchannels(),
            batch_size: default_batch_size(),
            npackets: 0,
            update_interval: default_update_interval(),
            update_unit: UpdateUnit::default(),
            convert_byte_order: true,
            hardware_trigger: false,
            hardware_trigger_channel: 0,
            timeout_ms: default_timeout_ms(),
            channelmap: ChannelMap::default(),
        }
    }
}

impl ReaderSettings {
    /// Check every constraint the reader relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nchannels == 0 || self.nchannels > MAX_NCHANNELS {
            return Err(ConfigError::InvalidChannelCount(self.nchannels));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.hardware_trigger_channel >= 32 {
            return Err(ConfigError::InvalidTriggerChannel(
                self.hardware_trigger_channel,
            ));
        }
        self.channelmap.validate(self.nchannels)
    }

    /// Stats report cadence
    pub fn stats_cadence(&self) -> StatsCadence {
        match (self.update_interval, self.update_unit) {
            (0, _) => StatsCadence::Disabled,
            (n, UpdateUnit::Packets) => StatsCadence::Packets(n),
            (n, UpdateUnit::Seconds) => StatsCadence::WallClock(std::time::Duration::from_secs(n)),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_nchannels() -> usize {
    128
}
fn default_batch_size() -> usize {
    1
}
fn default_update_interval() -> u64 {
    20
}
fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    3000
}

// =============================================================================
// Publisher / emulator / data sink
// =============================================================================

/// `[publisher]` section: where the reader publishes its messages
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// ZMQ bind address (e.g., "tcp://*:5555")
    #[serde(default = "default_publish_bind")]
    pub bind: String,

    /// Source ID carried in published messages
    #[serde(default)]
    pub source_id: u32,

    /// Heartbeat interval in milliseconds (0 = disabled)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            bind: default_publish_bind(),
            source_id: 0,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

fn default_publish_bind() -> String {
    "tcp://*:5555".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}

/// `[emulator]` section: synthetic Digilynx stream
#[derive(Debug, Clone, Deserialize)]
pub struct EmulatorConfig {
    /// Destination of the datagrams (host:port)
    #[serde(default = "default_target")]
    pub target: String,

    #[serde(default = "default_nchannels")]
    pub nchannels: usize,

    /// Packets to send (0 = unbounded)
    #[serde(default)]
    pub packets: u64,

    /// Write words in network byte order
    #[serde(default = "default_true")]
    pub convert_byte_order: bool,

    /// Hardware timestamp of the first packet (microseconds)
    #[serde(default)]
    pub start_timestamp: u64,

    /// Sine amplitude in ADC counts
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,

    /// Gaussian noise sigma in ADC counts
    #[serde(default = "default_noise_sigma")]
    pub noise_sigma: f64,

    /// RNG seed (random when absent)
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub drop_rate: f64,
    #[serde(default)]
    pub duplicate_rate: f64,
    #[serde(default)]
    pub reorder_rate: f64,
    #[serde(default)]
    pub corrupt_rate: f64,

    /// Assert the trigger bit from this packet onward
    #[serde(default)]
    pub trigger_after: Option<u64>,

    /// Digital input bit driven as trigger
    #[serde(default)]
    pub trigger_channel: u32,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            nchannels: default_nchannels(),
            packets: 0,
            convert_byte_order: true,
            start_timestamp: 0,
            amplitude: default_amplitude(),
            noise_sigma: default_noise_sigma(),
            seed: None,
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            corrupt_rate: 0.0,
            trigger_after: None,
            trigger_channel: 0,
        }
    }
}

fn default_target() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_amplitude() -> f64 {
    1000.0
}
fn default_noise_sigma() -> f64 {
    20.0
}

/// `[data_sink]` section
#[derive(Debug, Clone, Deserialize)]
pub struct DataSinkConfig {
    /// ZMQ address to subscribe to
    #[serde(default = "default_subscribe")]
    pub subscribe: String,

    /// Console report interval in seconds
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for DataSinkConfig {
    fn default() -> Self {
        Self {
            subscribe: default_subscribe(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

fn default_subscribe() -> String {
    "tcp://localhost:5555".to_string()
}
fn default_stats_interval_secs() -> u64 {
    5
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings_with_map(entries: &[(&str, &[usize])]) -> ReaderSettings {
        ReaderSettings {
            channelmap: entries
                .iter()
                .map(|(n, c)| (n.to_string(), c.to_vec()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
[reader.channelmap]
tetrode1 = [0, 1, 2, 3]
"#;
        let config = Config::from_toml(toml).unwrap();
        let reader = &config.reader;
        assert_eq!(reader.address, "127.0.0.1");
        assert_eq!(reader.port, 5000);
        assert_eq!(reader.nchannels, 128);
        assert_eq!(reader.batch_size, 1);
        assert_eq!(reader.npackets, 0);
        assert_eq!(reader.update_interval, 20);
        assert_eq!(reader.update_unit, UpdateUnit::Seconds);
        assert!(reader.convert_byte_order);
        assert!(!reader.hardware_trigger);
        assert_eq!(reader.timeout_ms, 3000);
        assert_eq!(reader.channelmap.get("tetrode1"), Some(&[0, 1, 2, 3][..]));
        assert!(reader.validate().is_ok());

        assert_eq!(config.publisher.bind, "tcp://*:5555");
        assert_eq!(config.data_sink.subscribe, "tcp://localhost:5555");
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[reader]
address = "0.0.0.0"
port = 26090
nchannels = 64
batch_size = 32
npackets = 320000
update_interval = 1000
update_unit = "packets"
convert_byte_order = false
hardware_trigger = true
hardware_trigger_channel = 5
timeout_ms = 500

[reader.channelmap]
lfp = [0, 8, 16]
spikes = [1, 2]

[publisher]
bind = "tcp://*:6000"
source_id = 3
heartbeat_interval_ms = 0

[emulator]
target = "127.0.0.1:26090"
nchannels = 64
seed = 42
drop_rate = 0.01
trigger_after = 100

[data_sink]
subscribe = "tcp://localhost:6000"
stats_interval_secs = 1
"#;
        let config = Config::from_toml(toml).unwrap();
        let reader = &config.reader;
        assert_eq!(reader.port, 26090);
        assert_eq!(reader.nchannels, 64);
        assert_eq!(reader.batch_size, 32);
        assert_eq!(reader.npackets, 320_000);
        assert_eq!(reader.stats_cadence(), StatsCadence::Packets(1000));
        assert!(!reader.convert_byte_order);
        assert!(reader.hardware_trigger);
        assert_eq!(reader.hardware_trigger_channel, 5);
        assert_eq!(reader.timeout_ms, 500);
        assert_eq!(reader.channelmap.len(), 2);
        assert!(reader.validate().is_ok());

        assert_eq!(config.publisher.source_id, 3);
        assert_eq!(config.publisher.heartbeat_interval_ms, 0);
        assert_eq!(config.emulator.seed, Some(42));
        assert_eq!(config.emulator.trigger_after, Some(100));
        assert_eq!(config.emulator.drop_rate, 0.01);
        assert_eq!(config.data_sink.stats_interval_secs, 1);
    }

    #[test]
    fn channelmap_keeps_declaration_order() {
        let toml = r#"
[reader.channelmap]
zeta = [3]
alpha = [0]
mid = [1, 2]
"#;
        let config = Config::from_toml(toml).unwrap();
        let names: Vec<&str> = config.reader.channelmap.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn channelmap_rejects_non_integer_channels() {
        let toml = r#"
[reader.channelmap]
a = ["zero"]
"#;
        assert!(matches!(
            Config::from_toml(toml),
            Err(ConfigError::TomlError(_))
        ));
    }

    #[test]
    fn unknown_update_unit_is_rejected() {
        let toml = r#"
[reader]
update_unit = "minutes"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn stats_cadence_defaults_to_wall_clock() {
        let settings = ReaderSettings::default();
        assert_eq!(
            settings.stats_cadence(),
            StatsCadence::WallClock(Duration::from_secs(20))
        );
        let disabled = ReaderSettings {
            update_interval: 0,
            ..Default::default()
        };
        assert_eq!(disabled.stats_cadence(), StatsCadence::Disabled);
    }

    #[test]
    fn empty_channelmap_is_rejected() {
        let settings = ReaderSettings::default();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::EmptyChannelMap)
        ));
    }

    #[test]
    fn empty_destination_is_rejected() {
        let settings = settings_with_map(&[("a", &[0]), ("b", &[])]);
        match settings.validate() {
            Err(ConfigError::EmptyDestination(name)) => assert_eq!(name, "b"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn duplicate_destination_is_rejected() {
        let settings = settings_with_map(&[("a", &[0]), ("a", &[1])]);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::DuplicateDestination(_))
        ));
    }

    #[test]
    fn channel_out_of_range_is_rejected() {
        let settings = ReaderSettings {
            nchannels: 4,
            ..settings_with_map(&[("x", &[0, 4])])
        };
        match settings.validate() {
            Err(ConfigError::ChannelOutOfRange {
                destination,
                channel,
                nchannels,
            }) => {
                assert_eq!(destination, "x");
                assert_eq!(channel, 4);
                assert_eq!(nchannels, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn channel_count_bounds() {
        for n in [0, MAX_NCHANNELS + 1] {
            let settings = ReaderSettings {
                nchannels: n,
                ..settings_with_map(&[("x", &[0])])
            };
            assert!(matches!(
                settings.validate(),
                Err(ConfigError::InvalidChannelCount(c)) if c == n
            ));
        }
        let max = ReaderSettings {
            nchannels: MAX_NCHANNELS,
            ..settings_with_map(&[("x", &[MAX_NCHANNELS - 1])])
        };
        assert!(max.validate().is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let settings = ReaderSettings {
            batch_size: 0,
            ..settings_with_map(&[("x", &[0])])
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidBatchSize)
        ));
    }

    #[test]
    fn trigger_channel_bound() {
        let settings = ReaderSettings {
            hardware_trigger_channel: 32,
            ..settings_with_map(&[("x", &[0])])
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidTriggerChannel(32))
        ));
    }

    #[test]
    fn error_messages() {
        let err = ConfigError::ChannelOutOfRange {
            destination: "A".to_string(),
            channel: 130,
            nchannels: 128,
        };
        assert_eq!(
            err.to_string(),
            "destination 'A' uses channel 130, but records have 128 channels"
        );
        assert_eq!(
            ConfigError::InvalidChannelCount(0).to_string(),
            "nchannels must be between 1 and 256, got 0"
        );
    }
}
