//! Common data types shared across components
//!
//! This module defines the messages the reader publishes and the data
//! structures they carry.

use serde::{Deserialize, Serialize};

pub mod cli;
pub mod error;
pub mod metrics;
pub mod shutdown;

pub use cli::{CommonArgs, DataSinkArgs, EmulatorArgs, ReaderArgs};
pub use error::{PipelineError, PipelineResult};
pub use metrics::{AtomicCounters, StatsAggregator, StatsCadence, StatsSnapshot};
pub use shutdown::setup_shutdown;

/// Unix time in nanoseconds
pub(crate) fn unix_time_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Heartbeat message for liveness detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Source identifier
    pub source_id: u32,
    /// Unix timestamp in nanoseconds
    pub timestamp: u64,
    /// Monotonic counter
    pub counter: u64,
}

impl Heartbeat {
    /// Create a new heartbeat
    pub fn new(source_id: u32, counter: u64) -> Self {
        Self {
            source_id,
            timestamp: unix_time_ns(),
            counter,
        }
    }
}

/// Samples of one destination for `rows()` consecutive records
///
/// `samples` is row-major: row `r` holds `channels.len()` values, one per
/// configured channel, in the configured order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    /// Destination name from the channel map
    pub destination: String,
    /// Per-destination flush counter, starting at 0
    pub sequence_number: u64,
    /// Hardware timestamp of the first row (microseconds)
    pub hardware_timestamp: u64,
    /// Batch creation timestamp (Unix time in nanoseconds)
    pub timestamp: u64,
    /// Nominal sample rate in Hz
    pub sample_rate: f64,
    /// Hardware channel index of each column
    pub channels: Vec<u32>,
    /// Hardware timestamp of each row
    pub sample_timestamps: Vec<u64>,
    /// Row-major sample values
    pub samples: Vec<i32>,
}

impl SampleBatch {
    pub fn new(
        destination: String,
        sequence_number: u64,
        hardware_timestamp: u64,
        sample_rate: f64,
        channels: Vec<u32>,
        sample_timestamps: Vec<u64>,
        samples: Vec<i32>,
    ) -> Self {
        Self {
            destination,
            sequence_number,
            hardware_timestamp,
            timestamp: unix_time_ns(),
            sample_rate,
            channels,
            sample_timestamps,
            samples,
        }
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.sample_timestamps.len()
    }

    /// Number of columns
    pub fn width(&self) -> usize {
        self.channels.len()
    }

    /// Samples of one row
    pub fn row(&self, index: usize) -> Option<&[i32]> {
        let width = self.width();
        self.samples.get(index * width..(index + 1) * width)
    }
}

/// Scheduling hint for the enclosing pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagePriority {
    Low,
    Normal,
    High,
    /// Run first and most eagerly
    Max,
}

/// Shape of one destination's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationInfo {
    pub name: String,
    pub channels: Vec<u32>,
    pub batch_size: usize,
}

/// Stream metadata announced before the first batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub source_id: u32,
    /// Nominal sample rate in Hz
    pub sample_rate: f64,
    /// Channels per hardware record
    pub nchannels: usize,
    pub priority: StagePriority,
    /// Destinations in declaration order
    pub destinations: Vec<DestinationInfo>,
}

/// Periodic integrity report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub source_id: u32,
    /// Unix timestamp in nanoseconds
    pub timestamp: u64,
    /// Counters since the previous report
    pub interval: StatsSnapshot,
    /// Counters since the start of the run
    pub totals: StatsSnapshot,
    /// Accepted records since the start of the run
    pub valid_packets: u64,
}

impl StatsReport {
    pub fn new(
        source_id: u32,
        interval: StatsSnapshot,
        totals: StatsSnapshot,
        valid_packets: u64,
    ) -> Self {
        Self {
            source_id,
            timestamp: unix_time_ns(),
            interval,
            totals,
            valid_packets,
        }
    }
}

/// Message type for pipeline communication
///
/// Wraps sample data, stream metadata or control signals (like EOS/Heartbeat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// One destination's batch
    Data(SampleBatch),
    /// Stream metadata
    StreamInfo(StreamInfo),
    /// Periodic integrity report
    Stats(StatsReport),
    /// End of stream signal - source is shutting down
    EndOfStream { source_id: u32 },
    /// Heartbeat for liveness detection
    Heartbeat(Heartbeat),
}

impl Message {
    /// Create a data message
    pub fn data(batch: SampleBatch) -> Self {
        Self::Data(batch)
    }

    /// Create an EOS message
    pub fn eos(source_id: u32) -> Self {
        Self::EndOfStream { source_id }
    }

    /// Check if this is an EOS message
    pub fn is_eos(&self) -> bool {
        matches!(self, Self::EndOfStream { .. })
    }

    /// Create a heartbeat message
    pub fn heartbeat(source_id: u32, counter: u64) -> Self {
        Self::Heartbeat(Heartbeat::new(source_id, counter))
    }

    /// Serialize to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> SampleBatch {
        SampleBatch::new(
            "tetrode1".to_string(),
            7,
            1_000_000,
            32_000.0,
            vec![0, 1, 2],
            vec![1_000_000, 1_000_031],
            vec![1, 2, 3, 4, 5, 6],
        )
    }

    #[test]
    fn sample_batch_rows() {
        let batch = batch();
        assert_eq!(batch.rows(), 2);
        assert_eq!(batch.width(), 3);
        assert_eq!(batch.row(1), Some(&[4, 5, 6][..]));
        assert_eq!(batch.row(2), None);
        assert!(batch.timestamp > 0);
    }

    #[test]
    fn message_data_roundtrip() {
        let msg = Message::data(batch());
        let bytes = msg.to_msgpack().unwrap();

        match Message::from_msgpack(&bytes).unwrap() {
            Message::Data(decoded) => assert_eq!(decoded, batch_with_ts(decoded.timestamp)),
            other => panic!("Expected Data, got {:?}", other),
        }
    }

    fn batch_with_ts(timestamp: u64) -> SampleBatch {
        SampleBatch {
            timestamp,
            ..batch()
        }
    }

    #[test]
    fn message_eos_roundtrip() {
        let msg = Message::eos(99);
        assert!(msg.is_eos());

        let bytes = msg.to_msgpack().unwrap();
        let decoded = Message::from_msgpack(&bytes).unwrap();
        assert!(decoded.is_eos());
        assert!(!Message::heartbeat(99, 0).is_eos());
    }

    #[test]
    fn message_stream_info_roundtrip() {
        let info = StreamInfo {
            source_id: 0,
            sample_rate: 32_000.0,
            nchannels: 128,
            priority: StagePriority::Max,
            destinations: vec![DestinationInfo {
                name: "A".to_string(),
                channels: vec![0, 1],
                batch_size: 4,
            }],
        };
        let bytes = Message::StreamInfo(info.clone()).to_msgpack().unwrap();
        match Message::from_msgpack(&bytes).unwrap() {
            Message::StreamInfo(decoded) => assert_eq!(decoded, info),
            other => panic!("Expected StreamInfo, got {:?}", other),
        }
    }

    #[test]
    fn message_heartbeat() {
        let msg = Message::heartbeat(3, 12);
        match msg {
            Message::Heartbeat(hb) => {
                assert_eq!(hb.source_id, 3);
                assert_eq!(hb.counter, 12);
            }
            _ => unreachable!(),
        }
    }
}
