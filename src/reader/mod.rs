//! Reader for the Digilynx raw signal stream
//!
//! This module provides:
//! - Record validation and decoding (record)
//! - Timestamp continuity tracking (sequence)
//! - Channel demultiplexing into batches (demux)
//! - Hardware trigger gating (trigger)
//! - Datagram sources (source)
//! - The cycle-driven stage (stage)
//! - Reader integration with two-task architecture

pub mod demux;
pub mod record;
pub mod sequence;
pub mod source;
pub mod stage;
pub mod trigger;

// Re-exports
pub use demux::{DestinationBatch, Demultiplexer};
pub use record::{HardwareRecord, RecordDecoder, RecordError};
pub use sequence::{Continuity, SequenceTracker};
pub use source::{DatagramSource, Received, ScriptedSource, UdpDatagramSource};
pub use stage::{BatchSink, CycleReport, Disposition, ReaderStage, RunState, RunSummary};
pub use trigger::{GateState, TriggerGate};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::SinkExt;
use thiserror::Error;
use tmq::publish;
use tmq::Context;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::common::metrics::CounterSnapshot;
use crate::common::shutdown::{forward_to_flag, ShutdownReceiver};
use crate::common::{AtomicCounters, Message, StatsCadence, StatsReport};
use crate::config::{ChannelMap, ConfigError, PublisherConfig, ReaderSettings};

/// Reader error type
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("UDP transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("ZMQ error: {0}")]
    Zmq(#[from] tmq::TmqError),

    #[error("MessagePack serialization error: {0}")]
    MsgPack(#[from] rmp_serde::encode::Error),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Read task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Immutable reader configuration
///
/// Built from [`ReaderSettings`] after validation; never changes once the
/// stage exists.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// UDP bind address
    pub address: String,
    /// UDP bind port
    pub port: u16,
    /// Channels per hardware record
    pub nchannels: usize,
    /// Rows per emitted batch
    pub batch_size: usize,
    /// Accepted-packet ceiling (0 = unbounded)
    pub npackets: u64,
    pub stats_cadence: StatsCadence,
    /// Records arrive in network byte order
    pub convert_byte_order: bool,
    pub hardware_trigger: bool,
    pub hardware_trigger_channel: u32,
    /// Receive wait bound
    pub timeout: Duration,
    pub channelmap: ChannelMap,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        let settings = ReaderSettings::default();
        Self {
            address: settings.address,
            port: settings.port,
            nchannels: settings.nchannels,
            batch_size: settings.batch_size,
            npackets: settings.npackets,
            stats_cadence: StatsCadence::WallClock(Duration::from_secs(settings.update_interval)),
            convert_byte_order: settings.convert_byte_order,
            hardware_trigger: settings.hardware_trigger,
            hardware_trigger_channel: settings.hardware_trigger_channel,
            timeout: Duration::from_millis(settings.timeout_ms),
            channelmap: settings.channelmap,
        }
    }
}

impl ReaderConfig {
    /// Validate the `[reader]` section and freeze it
    pub fn from_settings(settings: &ReaderSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            address: settings.address.clone(),
            port: settings.port,
            nchannels: settings.nchannels,
            batch_size: settings.batch_size,
            npackets: settings.npackets,
            stats_cadence: settings.stats_cadence(),
            convert_byte_order: settings.convert_byte_order,
            hardware_trigger: settings.hardware_trigger,
            hardware_trigger_channel: settings.hardware_trigger_channel,
            timeout: Duration::from_millis(settings.timeout_ms),
            channelmap: settings.channelmap.clone(),
        })
    }
}

/// Datagram source that feeds the transport counters
struct CountingSource<S> {
    inner: S,
    metrics: Arc<AtomicCounters>,
}

impl<S: DatagramSource> DatagramSource for CountingSource<S> {
    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<Received> {
        let received = self.inner.recv(buf)?;
        if let Received::Datagram(len) = received {
            self.metrics.add_datagram(len);
        }
        Ok(received)
    }
}

/// Batch sink that forwards to the publish task
struct ChannelSink {
    tx: mpsc::UnboundedSender<Message>,
    metrics: Arc<AtomicCounters>,
}

impl BatchSink for ChannelSink {
    fn emit(&mut self, batch: &DestinationBatch) -> Result<(), ReaderError> {
        self.tx
            .send(Message::data(batch.to_sample_batch()))
            .map_err(|_| ReaderError::ChannelSend)?;
        self.metrics.inc_batches();
        Ok(())
    }
}

/// Reader for the Digilynx UDP stream
///
/// Uses two-task architecture:
/// - ReadLoop: blocking UDP receive and stage cycles (spawn_blocking)
/// - PublishLoop: async ZMQ publishing and heartbeats
pub struct Reader {
    config: ReaderConfig,
    publisher: PublisherConfig,
    data_socket: publish::Publish,
    metrics: Arc<AtomicCounters>,
}

impl Reader {
    /// Create a new Reader and bind its publish socket
    pub fn new(config: ReaderConfig, publisher: PublisherConfig) -> Result<Self, ReaderError> {
        let context = Context::new();
        let data_socket = publish(&context).bind(&publisher.bind)?;

        info!(
            data_address = %publisher.bind,
            udp_address = %config.address,
            udp_port = config.port,
            "Reader bound to data address"
        );

        Ok(Self {
            config,
            publisher,
            data_socket,
            metrics: Arc::new(AtomicCounters::new()),
        })
    }

    /// Get metrics
    pub fn metrics(&self) -> &Arc<AtomicCounters> {
        &self.metrics
    }

    /// Publish a message via ZMQ
    async fn publish_message(
        socket: &mut publish::Publish,
        message: &Message,
    ) -> Result<(), ReaderError> {
        let bytes = message.to_msgpack()?;
        let msg: tmq::Multipart = vec![tmq::Message::from(bytes.as_slice())].into();
        socket.send(msg).await?;

        match message {
            Message::Data(batch) => {
                debug!(
                    destination = %batch.destination,
                    seq = batch.sequence_number,
                    rows = batch.rows(),
                    "Published batch"
                );
            }
            Message::StreamInfo(info) => {
                info!(
                    destinations = info.destinations.len(),
                    "Published stream info"
                );
            }
            Message::Stats(report) => {
                debug!(valid_packets = report.valid_packets, "Published stats");
            }
            Message::EndOfStream { source_id } => {
                info!(source_id = source_id, "Published EOS");
            }
            Message::Heartbeat(hb) => {
                debug!(
                    source_id = hb.source_id,
                    counter = hb.counter,
                    "Published heartbeat"
                );
            }
        }

        Ok(())
    }

    /// ReadLoop task - runs in spawn_blocking to avoid blocking tokio runtime
    ///
    /// Binds the UDP socket, then cycles the stage until shutdown, the
    /// packet ceiling, or a fatal error.
    fn read_loop(
        config: ReaderConfig,
        source_id: u32,
        tx: mpsc::UnboundedSender<Message>,
        metrics: Arc<AtomicCounters>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<RunSummary, ReaderError> {
        info!(
            address = %config.address,
            port = config.port,
            "ReadLoop starting"
        );

        let udp = UdpDatagramSource::bind(&config.address, config.port, config.timeout)?;
        let mut source = CountingSource {
            inner: udp,
            metrics: metrics.clone(),
        };
        let mut stage = ReaderStage::new(config);

        tx.send(Message::StreamInfo(stage.stream_info(source_id)))
            .map_err(|_| ReaderError::ChannelSend)?;

        let mut sink = ChannelSink {
            tx: tx.clone(),
            metrics,
        };

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("ReadLoop received shutdown signal");
                break;
            }

            let report = match stage.cycle(&mut source, &mut sink) {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Read cycle failed");
                    return Err(e);
                }
            };

            if let Some(interval) = report.stats {
                let state = stage.state();
                let msg = Message::Stats(StatsReport::new(
                    source_id,
                    interval,
                    state.stats().totals(),
                    state.valid_packets(),
                ));
                tx.send(msg).map_err(|_| ReaderError::ChannelSend)?;
            }

            if report.disposition == Disposition::Finished {
                info!(npackets = stage.config().npackets, "Packet limit reached");
                break;
            }
        }

        let summary = stage.summary();
        info!(
            valid_packets = summary.valid_packets,
            batches = summary.batches_emitted,
            "ReadLoop stopped"
        );
        Ok(summary)
    }

    /// PublishLoop task - forwards messages to ZMQ until the ReadLoop ends
    ///
    /// Returns the socket so the caller can still send EOS.
    async fn publish_loop(
        source_id: u32,
        heartbeat_interval_ms: u64,
        mut rx: mpsc::UnboundedReceiver<Message>,
        mut data_socket: publish::Publish,
    ) -> Result<publish::Publish, ReaderError> {
        info!("PublishLoop starting");

        let mut heartbeat_counter: u64 = 0;
        let use_heartbeat = heartbeat_interval_ms > 0;
        let mut heartbeat_ticker = interval(Duration::from_millis(heartbeat_interval_ms.max(100)));

        loop {
            tokio::select! {
                biased;

                _ = heartbeat_ticker.tick(), if use_heartbeat => {
                    let hb = Message::heartbeat(source_id, heartbeat_counter);
                    heartbeat_counter += 1;
                    Self::publish_message(&mut data_socket, &hb).await?;
                }

                msg = rx.recv() => {
                    match msg {
                        Some(message) => Self::publish_message(&mut data_socket, &message).await?,
                        None => {
                            info!("Message channel closed, stopping publish loop");
                            break;
                        }
                    }
                }
            }
        }

        Ok(data_socket)
    }

    /// Run the reader until shutdown or the packet ceiling
    ///
    /// Publishes EOS on the way out, even when the ReadLoop failed.
    pub async fn run(self, shutdown: ShutdownReceiver) -> Result<RunSummary, ReaderError> {
        let Reader {
            config,
            publisher,
            data_socket,
            metrics,
        } = self;
        let source_id = publisher.source_id;
        let started = Instant::now();

        info!(source_id, "Reader running");

        let (tx, rx) = mpsc::unbounded_channel::<Message>();

        // ReadLoop runs in spawn_blocking and cannot await the broadcast channel
        let read_shutdown = Arc::new(AtomicBool::new(false));
        let forwarder = forward_to_flag(shutdown, read_shutdown.clone());

        let read_metrics = metrics.clone();
        let read_flag = read_shutdown.clone();
        let read_handle = tokio::task::spawn_blocking(move || {
            Self::read_loop(config, source_id, tx, read_metrics, read_flag)
        });

        let published =
            Self::publish_loop(source_id, publisher.heartbeat_interval_ms, rx, data_socket).await;

        // Publishing failed: stop the ReadLoop as well
        read_shutdown.store(true, Ordering::Relaxed);
        forwarder.abort();
        let read_result = read_handle.await?;

        let mut data_socket = published?;
        if let Err(e) = Self::publish_message(&mut data_socket, &Message::eos(source_id)).await {
            warn!(error = %e, "Failed to publish EOS");
        }

        let totals = metrics.snapshot();
        let rate = totals.rate_from(&CounterSnapshot::default(), started.elapsed().as_secs_f64());
        info!(
            total_datagrams = totals.datagrams,
            total_bytes = totals.bytes,
            total_batches = totals.batches,
            throughput = %rate.format_bytes_rate(),
            "Reader stopped"
        );

        read_result
    }
}
