//! Cycle-driven reader stage
//!
//! One cycle receives at most one datagram and carries it through
//! validation, continuity tracking, trigger observation and
//! demultiplexing. Full batches leave through a [`BatchSink`].
//!
//! [`ReaderConfig`] is immutable; everything a cycle mutates lives in
//! [`RunState`].

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::common::{
    DestinationInfo, SampleBatch, StagePriority, StatsAggregator, StatsSnapshot, StreamInfo,
};

use super::demux::{DestinationBatch, Demultiplexer};
use super::record::constants::{RECEIVE_SLACK_BYTES, SAMPLING_FREQUENCY_HZ, SAMPLING_PERIOD_US};
use super::record::{HardwareRecord, RecordDecoder, RecordError};
use super::sequence::{Continuity, SequenceTracker};
use super::source::{DatagramSource, Received};
use super::trigger::TriggerGate;
use super::{ReaderConfig, ReaderError};

/// Receiver of full destination batches
///
/// Called once per destination per flush, in declaration order. An error
/// aborts the cycle and is fatal for the stage.
pub trait BatchSink {
    fn emit(&mut self, batch: &DestinationBatch) -> Result<(), ReaderError>;
}

impl<S: BatchSink + ?Sized> BatchSink for &mut S {
    fn emit(&mut self, batch: &DestinationBatch) -> Result<(), ReaderError> {
        (**self).emit(batch)
    }
}

/// Collects owned copies of every emitted batch
impl BatchSink for Vec<SampleBatch> {
    fn emit(&mut self, batch: &DestinationBatch) -> Result<(), ReaderError> {
        self.push(batch.to_sample_batch());
        Ok(())
    }
}

/// What a cycle did with its datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing arrived within the wait bound
    Timeout,
    /// Datagram rejected by the validator
    Invalid(RecordError),
    /// Dropped: same timestamp as the last accepted record
    Duplicate,
    /// Dropped: older than the last accepted record
    OutOfOrder,
    /// Demultiplexed (`Fresh` or `Gap`)
    Accepted(Continuity),
    /// Packet ceiling reached; the source was not read
    Finished,
}

/// Outcome of one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub disposition: Disposition,
    /// Batches handed to the sink during this cycle
    pub flushed: usize,
    /// The trigger gate opened during this cycle
    pub gate_opened: bool,
    /// Stats report that became due after this cycle
    pub stats: Option<StatsSnapshot>,
}

impl CycleReport {
    fn bare(disposition: Disposition) -> Self {
        Self {
            disposition,
            flushed: 0,
            gate_opened: false,
            stats: None,
        }
    }
}

/// Mutable state of one run
#[derive(Debug)]
pub struct RunState {
    record: HardwareRecord,
    tracker: SequenceTracker,
    demux: Demultiplexer,
    gate: TriggerGate,
    stats: StatsAggregator,
    valid_packets: u64,
    first_valid: Option<(Instant, DateTime<Utc>)>,
}

impl RunState {
    pub fn new(config: &ReaderConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    /// Run state whose stats reference point is `now`
    pub fn starting_at(config: &ReaderConfig, now: Instant) -> Self {
        Self {
            record: HardwareRecord::new(config.nchannels),
            tracker: SequenceTracker::new(SAMPLING_PERIOD_US),
            demux: Demultiplexer::new(&config.channelmap, config.batch_size),
            gate: TriggerGate::new(config.hardware_trigger, config.hardware_trigger_channel),
            stats: StatsAggregator::starting_at(config.stats_cadence, now),
            valid_packets: 0,
            first_valid: None,
        }
    }

    /// Accepted records so far
    pub fn valid_packets(&self) -> u64 {
        self.valid_packets
    }

    /// Last successfully decoded record
    pub fn record(&self) -> &HardwareRecord {
        &self.record
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    pub fn demux(&self) -> &Demultiplexer {
        &self.demux
    }

    pub fn gate(&self) -> &TriggerGate {
        &self.gate
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    /// Arrival time of the first accepted record
    pub fn first_valid_at(&self) -> Option<DateTime<Utc>> {
        self.first_valid.map(|(_, at)| at)
    }

    /// Carry one datagram through the pipeline
    pub fn process<S: BatchSink + ?Sized>(
        &mut self,
        decoder: &RecordDecoder,
        datagram: &[u8],
        sink: &mut S,
        now: Instant,
    ) -> Result<CycleReport, ReaderError> {
        if let Err(e) = decoder.decode_into(datagram, &mut self.record) {
            self.stats.record_invalid();
            debug!(error = %e, len = datagram.len(), "Invalid datagram");
            return Ok(CycleReport::bare(Disposition::Invalid(e)));
        }

        let timestamp = self.record.timestamp;
        let continuity = self.tracker.classify(timestamp);
        match continuity {
            Continuity::Duplicate => {
                self.stats.record_duplicate();
                debug!(timestamp, "Duplicate record");
                return Ok(CycleReport::bare(Disposition::Duplicate));
            }
            Continuity::OutOfOrder => {
                self.stats.record_out_of_order();
                debug!(
                    timestamp,
                    last = self.tracker.last_timestamp(),
                    "Out-of-order record"
                );
                return Ok(CycleReport::bare(Disposition::OutOfOrder));
            }
            Continuity::Gap { missed } => {
                self.stats.record_gap(missed);
                debug!(timestamp, missed, "Timestamp gap");
            }
            Continuity::Fresh => {}
        }

        self.valid_packets += 1;
        self.stats.record_accepted();
        if self.first_valid.is_none() {
            self.first_valid = Some((now, Utc::now()));
            info!(timestamp, "First valid record received");
        }

        let gate_opened = self.gate.observe(self.record.dio);
        if gate_opened {
            info!(
                channel = self.gate.channel(),
                timestamp, "Hardware trigger received, dispatching batches"
            );
        }

        let mut flushed = 0;
        if self.demux.push(&self.record) {
            if self.gate.is_open() {
                flushed = self.demux.flush(|batch| sink.emit(batch))?;
            } else {
                self.demux.discard();
            }
        }

        Ok(CycleReport {
            disposition: Disposition::Accepted(continuity),
            flushed,
            gate_opened,
            stats: None,
        })
    }

    /// Report stats if due at `now`
    pub fn poll_stats(&mut self, now: Instant) -> Option<StatsSnapshot> {
        self.stats.poll(now)
    }

    /// Totals for the end of the run
    pub fn summary(&self, now: Instant) -> RunSummary {
        RunSummary {
            valid_packets: self.valid_packets,
            first_valid_at: self.first_valid_at(),
            elapsed: self
                .first_valid
                .map(|(at, _)| now.saturating_duration_since(at)),
            totals: self.stats.totals(),
            batches_emitted: self.demux.destinations().iter().map(|d| d.flushes()).sum(),
        }
    }
}

/// The reader stage: immutable configuration plus run state
#[derive(Debug)]
pub struct ReaderStage {
    config: ReaderConfig,
    decoder: RecordDecoder,
    /// Receive buffer, one word larger than a valid record
    buffer: Vec<u8>,
    state: RunState,
}

impl ReaderStage {
    /// Allocate every buffer for an already validated configuration
    pub fn new(config: ReaderConfig) -> Self {
        let decoder = RecordDecoder::new(config.nchannels, config.convert_byte_order);
        let buffer = vec![0; decoder.expected_size() + RECEIVE_SLACK_BYTES];
        let state = RunState::new(&config);
        info!(
            nchannels = config.nchannels,
            batch_size = config.batch_size,
            destinations = config.channelmap.len(),
            record_size = decoder.expected_size(),
            hardware_trigger = config.hardware_trigger,
            "Reader stage configured"
        );
        Self {
            config,
            decoder,
            buffer,
            state,
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn decoder(&self) -> &RecordDecoder {
        &self.decoder
    }

    /// Packet ceiling reached
    pub fn is_finished(&self) -> bool {
        self.config.npackets > 0 && self.state.valid_packets >= self.config.npackets
    }

    /// Run one cycle: wait for at most one datagram and process it
    pub fn cycle<D, S>(&mut self, source: &mut D, sink: &mut S) -> Result<CycleReport, ReaderError>
    where
        D: DatagramSource + ?Sized,
        S: BatchSink + ?Sized,
    {
        if self.is_finished() {
            return Ok(CycleReport::bare(Disposition::Finished));
        }

        let len = match source.recv(&mut self.buffer)? {
            Received::Timeout => return Ok(CycleReport::bare(Disposition::Timeout)),
            Received::Datagram(len) => len,
        };

        let now = Instant::now();
        let mut report = self
            .state
            .process(&self.decoder, &self.buffer[..len], sink, now)?;

        report.stats = self.state.poll_stats(now);
        if let Some(snapshot) = &report.stats {
            info!(
                invalid = snapshot.invalid,
                duplicated = snapshot.duplicated,
                out_of_order = snapshot.out_of_order,
                missed = snapshot.missed,
                gaps = snapshot.gaps,
                valid_packets = self.state.valid_packets,
                "Stream statistics"
            );
        }

        Ok(report)
    }

    /// Metadata for the enclosing pipeline
    pub fn stream_info(&self, source_id: u32) -> StreamInfo {
        StreamInfo {
            source_id,
            sample_rate: SAMPLING_FREQUENCY_HZ,
            nchannels: self.config.nchannels,
            priority: StagePriority::Max,
            destinations: self
                .state
                .demux
                .destinations()
                .iter()
                .map(|d| DestinationInfo {
                    name: d.name().to_string(),
                    channels: d.channels().iter().map(|&c| c as u32).collect(),
                    batch_size: d.batch_size(),
                })
                .collect(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        self.state.summary(Instant::now())
    }
}

/// End-of-run totals
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub valid_packets: u64,
    /// Wall-clock arrival of the first accepted record
    pub first_valid_at: Option<DateTime<Utc>>,
    /// Time since the first accepted record
    pub elapsed: Option<Duration>,
    /// Integrity counters over the whole run
    pub totals: StatsSnapshot,
    /// Batches handed to the sink, all destinations
    pub batches_emitted: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Valid packets:    {}", self.valid_packets)?;
        match (self.first_valid_at, self.elapsed) {
            (Some(at), Some(elapsed)) => {
                writeln!(f, "First packet at:  {}", at.to_rfc3339())?;
                writeln!(f, "Elapsed:          {:.3} s", elapsed.as_secs_f64())?;
            }
            _ => writeln!(f, "First packet at:  (none)")?,
        }
        writeln!(f, "Batches emitted:  {}", self.batches_emitted)?;
        writeln!(f, "Invalid:          {}", self.totals.invalid)?;
        writeln!(f, "Duplicated:       {}", self.totals.duplicated)?;
        writeln!(f, "Out of order:     {}", self.totals.out_of_order)?;
        writeln!(f, "Missed:           {}", self.totals.missed)?;
        write!(f, "Gaps:             {}", self.totals.gaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::StatsCadence;
    use crate::config::ChannelMap;
    use crate::reader::source::ScriptedSource;

    fn config(nchannels: usize, batch_size: usize, map: &[(&str, &[usize])]) -> ReaderConfig {
        ReaderConfig {
            nchannels,
            batch_size,
            channelmap: map
                .iter()
                .map(|(n, c)| (n.to_string(), c.to_vec()))
                .collect::<ChannelMap>(),
            stats_cadence: StatsCadence::Disabled,
            ..ReaderConfig::default()
        }
    }

    fn packet(timestamp: u64, dio: u32, samples: Vec<i32>) -> Vec<u8> {
        HardwareRecord::with_samples(timestamp, dio, samples).encode(true)
    }

    #[test]
    fn receive_buffer_is_one_word_larger() {
        let stage = ReaderStage::new(config(4, 1, &[("x", &[0])]));
        assert_eq!(stage.buffer.len(), (18 + 4) * 4 + 4);
    }

    #[test]
    fn timeout_cycle_is_noop() {
        let mut stage = ReaderStage::new(config(4, 1, &[("x", &[0])]));
        let mut source = ScriptedSource::new();
        source.push_timeout();
        let mut sink = Vec::new();

        let report = stage.cycle(&mut source, &mut sink).unwrap();
        assert_eq!(report.disposition, Disposition::Timeout);
        assert!(sink.is_empty());
        assert_eq!(stage.state().valid_packets(), 0);
        assert!(stage.state().stats().current().is_clean());
    }

    #[test]
    fn oversized_datagram_is_invalid() {
        let mut stage = ReaderStage::new(config(4, 1, &[("x", &[0])]));
        let mut data = packet(100, 0, vec![1, 2, 3, 4]);
        data.extend_from_slice(&[0, 0, 0, 0]);
        let mut source = ScriptedSource::from_datagrams([data]);
        let mut sink = Vec::new();

        let report = stage.cycle(&mut source, &mut sink).unwrap();
        assert!(matches!(
            report.disposition,
            Disposition::Invalid(RecordError::WrongSize { .. })
        ));
        assert_eq!(stage.state().stats().current().invalid, 1);
    }

    #[test]
    fn transport_error_is_fatal() {
        let mut stage = ReaderStage::new(config(4, 1, &[("x", &[0])]));
        let mut source = ScriptedSource::new();
        source.push_error(std::io::ErrorKind::ConnectionRefused);
        let mut sink = Vec::new();

        assert!(matches!(
            stage.cycle(&mut source, &mut sink),
            Err(ReaderError::Transport(_))
        ));
    }

    #[test]
    fn sink_error_is_fatal() {
        struct Closed;
        impl BatchSink for Closed {
            fn emit(&mut self, _: &DestinationBatch) -> Result<(), ReaderError> {
                Err(ReaderError::ChannelSend)
            }
        }

        let mut stage = ReaderStage::new(config(4, 1, &[("x", &[0])]));
        let mut source = ScriptedSource::from_datagrams([packet(100, 0, vec![1, 2, 3, 4])]);
        assert!(matches!(
            stage.cycle(&mut source, &mut Closed),
            Err(ReaderError::ChannelSend)
        ));
    }

    #[test]
    fn stage_recovers_after_sink_error() {
        /// Rejects every batch of one destination until re-opened
        struct Flaky {
            reject: Option<&'static str>,
            accepted: Vec<String>,
        }
        impl BatchSink for Flaky {
            fn emit(&mut self, batch: &DestinationBatch) -> Result<(), ReaderError> {
                if self.reject == Some(batch.name()) {
                    return Err(ReaderError::ChannelSend);
                }
                self.accepted.push(batch.name().to_string());
                Ok(())
            }
        }

        let mut stage = ReaderStage::new(config(4, 1, &[("a", &[0]), ("b", &[1])]));
        let mut source = ScriptedSource::from_datagrams([
            packet(100, 0, vec![1, 2, 3, 4]),
            packet(131, 0, vec![5, 6, 7, 8]),
        ]);
        let mut sink = Flaky {
            reject: Some("b"),
            accepted: Vec::new(),
        };

        assert!(stage.cycle(&mut source, &mut sink).is_err());
        assert_eq!(stage.state().demux().cursor(), 0);

        sink.reject = None;
        let report = stage.cycle(&mut source, &mut sink).unwrap();
        assert_eq!(report.flushed, 2);
        assert_eq!(sink.accepted, vec!["a", "a", "b"]);
    }

    #[test]
    fn packet_ceiling_stops_reading() {
        let mut stage = ReaderStage::new(ReaderConfig {
            npackets: 2,
            ..config(4, 1, &[("x", &[0])])
        });
        let mut source = ScriptedSource::from_datagrams(
            (0..4).map(|n| packet(1000 + n * 31, 0, vec![n as i32, 0, 0, 0])),
        );
        let mut sink = Vec::new();

        stage.cycle(&mut source, &mut sink).unwrap();
        assert!(!stage.is_finished());
        stage.cycle(&mut source, &mut sink).unwrap();
        assert!(stage.is_finished());

        let report = stage.cycle(&mut source, &mut sink).unwrap();
        assert_eq!(report.disposition, Disposition::Finished);
        assert_eq!(source.remaining(), 2);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn invalid_packets_do_not_count_toward_ceiling() {
        let mut stage = ReaderStage::new(ReaderConfig {
            npackets: 1,
            ..config(4, 1, &[("x", &[0])])
        });
        let mut source = ScriptedSource::from_datagrams([vec![0u8; 3], packet(5, 0, vec![0; 4])]);
        let mut sink = Vec::new();

        stage.cycle(&mut source, &mut sink).unwrap();
        assert!(!stage.is_finished());
        stage.cycle(&mut source, &mut sink).unwrap();
        assert!(stage.is_finished());
    }

    #[test]
    fn stats_reported_on_packet_cadence() {
        let mut stage = ReaderStage::new(ReaderConfig {
            stats_cadence: StatsCadence::Packets(2),
            ..config(4, 1, &[("x", &[0])])
        });
        let mut source = ScriptedSource::from_datagrams([
            packet(1000, 0, vec![0; 4]),
            packet(1000, 0, vec![0; 4]),
            packet(1031, 0, vec![0; 4]),
        ]);
        let mut sink = Vec::new();

        assert_eq!(stage.cycle(&mut source, &mut sink).unwrap().stats, None);
        assert_eq!(stage.cycle(&mut source, &mut sink).unwrap().stats, None);
        let report = stage.cycle(&mut source, &mut sink).unwrap();
        let snapshot = report.stats.unwrap();
        assert_eq!(snapshot.duplicated, 1);
        assert!(stage.state().stats().current().is_clean());
        assert_eq!(stage.state().stats().totals().duplicated, 1);
    }

    #[test]
    fn stream_info_lists_destinations() {
        let stage = ReaderStage::new(config(8, 16, &[("A", &[0, 1]), ("B", &[7])]));
        let info = stage.stream_info(4);
        assert_eq!(info.source_id, 4);
        assert_eq!(info.priority, StagePriority::Max);
        assert_eq!(info.sample_rate, 32_000.0);
        assert_eq!(info.nchannels, 8);
        assert_eq!(info.destinations.len(), 2);
        assert_eq!(info.destinations[0].name, "A");
        assert_eq!(info.destinations[0].channels, vec![0, 1]);
        assert_eq!(info.destinations[1].batch_size, 16);
    }

    #[test]
    fn summary_totals() {
        let mut stage = ReaderStage::new(config(4, 2, &[("x", &[0])]));
        let mut source = ScriptedSource::from_datagrams([
            packet(1000, 0, vec![0; 4]),
            packet(1031, 0, vec![0; 4]),
            packet(1125, 0, vec![0; 4]),
            vec![1, 2, 3],
        ]);
        let mut sink = Vec::new();
        for _ in 0..4 {
            stage.cycle(&mut source, &mut sink).unwrap();
        }

        let summary = stage.summary();
        assert_eq!(summary.valid_packets, 3);
        assert_eq!(summary.batches_emitted, 1);
        assert_eq!(summary.totals.invalid, 1);
        assert_eq!(summary.totals.gaps, 1);
        assert_eq!(summary.totals.missed, 2);
        assert!(summary.first_valid_at.is_some());
        assert!(summary.to_string().contains("Valid packets:    3"));
    }

    #[test]
    fn summary_without_packets() {
        let stage = ReaderStage::new(config(4, 1, &[("x", &[0])]));
        let summary = stage.summary();
        assert_eq!(summary.elapsed, None);
        assert!(summary.to_string().contains("(none)"));
    }
}
