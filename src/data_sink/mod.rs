//! Data sink - receives the reader's messages via ZeroMQ
//!
//! Architecture (Lock-Free):
//! - Receiver task: SUB socket → mpsc channel (non-blocking)
//! - Processor task: mpsc channel → stats update + console output
//!
//! Tracks every destination's batch stream for sequence gaps and shows the
//! reader's own integrity reports.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tmq::{subscribe, Context};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::common::error::PipelineResult;
use crate::common::shutdown::ShutdownReceiver;
use crate::common::{Message, SampleBatch, StatsReport, StreamInfo};
use crate::config::DataSinkConfig;

/// Per-destination statistics with sequence tracking
#[derive(Debug, Default, Clone)]
pub struct DestinationStats {
    pub last_sequence: Option<u64>,
    pub total_batches: u64,
    pub total_rows: u64,
    pub gaps_detected: u64,
    pub total_gap_size: u64,
    pub restart_count: u32,
}

impl DestinationStats {
    fn update(&mut self, batch: &SampleBatch) {
        let seq = batch.sequence_number;

        if let Some(last) = self.last_sequence {
            if seq <= last {
                // Sequence numbers restart with the reader
                self.restart_count += 1;
                info!(
                    destination = %batch.destination,
                    last_seq = last,
                    new_seq = seq,
                    restarts = self.restart_count,
                    "Reader restart detected"
                );
            } else {
                let expected = last + 1;
                if seq > expected {
                    let gap = seq - expected;
                    self.gaps_detected += 1;
                    self.total_gap_size += gap;
                    warn!(
                        destination = %batch.destination,
                        expected = expected,
                        received = seq,
                        gap = gap,
                        total_gaps = self.gaps_detected,
                        "Sequence gap detected"
                    );
                }
            }
        }

        self.last_sequence = Some(seq);
        self.total_batches += 1;
        self.total_rows += batch.rows() as u64;
    }
}

/// Statistics tracker
#[derive(Debug, Default, Clone)]
pub struct DataSinkStats {
    pub destinations: BTreeMap<String, DestinationStats>,
    pub stream_info: Option<StreamInfo>,
    /// Most recent report published by the reader
    pub latest_report: Option<StatsReport>,
    pub total_batches: u64,
    pub total_rows: u64,
    pub heartbeats: u64,
    pub eos_received: u64,
    rows_since_last_report: u64,
}

impl DataSinkStats {
    fn update(&mut self, batch: &SampleBatch) {
        self.destinations
            .entry(batch.destination.clone())
            .or_default()
            .update(batch);
        self.total_batches += 1;
        self.total_rows += batch.rows() as u64;
        self.rows_since_last_report += batch.rows() as u64;
    }

    /// Apply one upstream message
    fn apply(&mut self, message: Message) {
        match message {
            Message::Data(batch) => self.update(&batch),
            Message::StreamInfo(info) => {
                info!(
                    source_id = info.source_id,
                    destinations = info.destinations.len(),
                    sample_rate = info.sample_rate,
                    "Stream info received"
                );
                self.stream_info = Some(info);
            }
            Message::Stats(report) => self.latest_report = Some(report),
            Message::EndOfStream { source_id } => {
                info!(source_id = source_id, "Received EOS from upstream");
                self.eos_received += 1;
            }
            Message::Heartbeat(_) => self.heartbeats += 1,
        }
    }

    /// Get summary of all gaps across destinations
    pub fn total_gaps(&self) -> u64 {
        self.destinations.values().map(|s| s.gaps_detected).sum()
    }

    /// Get total missing batches across destinations
    pub fn total_missing(&self) -> u64 {
        self.destinations.values().map(|s| s.total_gap_size).sum()
    }

    fn report(&mut self, total_elapsed: f64, interval_elapsed: f64) -> String {
        let rows_per_sec = if interval_elapsed > 0.0 {
            self.rows_since_last_report as f64 / interval_elapsed
        } else {
            0.0
        };
        let total_rate = if total_elapsed > 0.0 {
            self.total_rows as f64 / total_elapsed
        } else {
            0.0
        };

        let mut report = format!(
            "Rows: {} total ({:.0}/s avg, {:.0}/s current) | Batches: {} | Gaps: {} | Missing: {}",
            self.total_rows,
            total_rate,
            rows_per_sec,
            self.total_batches,
            self.total_gaps(),
            self.total_missing()
        );
        if let Some(upstream) = &self.latest_report {
            let _ = write!(
                report,
                " | Reader: {} valid, {}",
                upstream.valid_packets, upstream.totals
            );
        }

        self.rows_since_last_report = 0;
        report
    }

    /// Multi-line summary printed when the sink stops
    pub fn final_report(&self, total_elapsed: f64) -> String {
        let batch_rate = if total_elapsed > 0.0 {
            self.total_batches as f64 / total_elapsed
        } else {
            0.0
        };

        let mut out = String::new();
        let _ = writeln!(out, "========== Final Statistics ==========");
        let _ = writeln!(out, "Duration:      {:.2} s", total_elapsed);
        let _ = writeln!(out, "Total Rows:    {}", self.total_rows);
        let _ = writeln!(out, "Total Batches: {}", self.total_batches);
        let _ = writeln!(out, "Batch Rate:    {:.0} batches/s", batch_rate);
        let _ = writeln!(
            out,
            "Gaps:          {} ({} missing batches)",
            self.total_gaps(),
            self.total_missing()
        );
        for (name, dest) in &self.destinations {
            let _ = writeln!(
                out,
                "  {:<12} batches={} rows={} gaps={} last_seq={}",
                name,
                dest.total_batches,
                dest.total_rows,
                dest.gaps_detected,
                dest.last_sequence.map_or("-".to_string(), |s| s.to_string())
            );
        }
        if let Some(upstream) = &self.latest_report {
            let _ = writeln!(out, "Reader valid:  {}", upstream.valid_packets);
            let _ = writeln!(out, "Reader totals: {}", upstream.totals);
        }
        let _ = write!(out, "=======================================");
        out
    }
}

/// Atomic counters for hot-path statistics (lock-free)
struct AtomicStats {
    received_messages: AtomicU64,
    processed_batches: AtomicU64,
    eos_received: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            received_messages: AtomicU64::new(0),
            processed_batches: AtomicU64::new(0),
            eos_received: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record_received(&self) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_processed(&self) {
        self.processed_batches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_eos(&self) {
        self.eos_received.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.received_messages.load(Ordering::Relaxed),
            self.processed_batches.load(Ordering::Relaxed),
            self.eos_received.load(Ordering::Relaxed),
        )
    }
}

/// Data sink - subscribes to the reader via ZeroMQ
pub struct DataSink {
    config: DataSinkConfig,
    /// Print upstream stats reports as JSON lines
    json: bool,
    atomic_stats: Arc<AtomicStats>,
}

impl DataSink {
    /// Create a new data sink with the given configuration
    pub fn new(config: DataSinkConfig, json: bool) -> Self {
        info!(data_address = %config.subscribe, json, "DataSink created");

        Self {
            config,
            json,
            atomic_stats: Arc::new(AtomicStats::new()),
        }
    }

    /// Run until shutdown or end-of-stream
    pub async fn run(&mut self, mut shutdown: ShutdownReceiver) -> PipelineResult<DataSinkStats> {
        // Unbounded: memory growth indicates a bottleneck
        let (proc_tx, proc_rx) = mpsc::unbounded_channel::<Message>();
        let (eos_tx, eos_rx) = oneshot::channel::<()>();

        let context = Context::new();
        let socket = subscribe(&context)
            .connect(&self.config.subscribe)?
            .subscribe(b"")?;

        info!(address = %self.config.subscribe, "DataSink connected to upstream");

        let recv_handle = tokio::spawn(Self::receiver_task(
            socket,
            proc_tx,
            self.atomic_stats.clone(),
        ));
        let proc_handle = tokio::spawn(Self::processor_task(
            proc_rx,
            self.atomic_stats.clone(),
            self.config.stats_interval_secs,
            self.json,
            eos_tx,
        ));

        tokio::select! {
            _ = shutdown.recv() => info!("DataSink received shutdown signal"),
            _ = eos_rx => info!("Upstream finished"),
        }

        // Dropping the receiver's sender ends the processor loop
        recv_handle.abort();
        let _ = recv_handle.await;
        let stats = proc_handle.await?;

        let (recv, proc, eos) = self.atomic_stats.snapshot();
        info!(
            received = recv,
            processed = proc,
            eos = eos,
            "DataSink stopped"
        );

        Ok(stats)
    }

    /// Receiver task: SUB → channel (non-blocking)
    async fn receiver_task(
        mut socket: subscribe::Subscribe,
        tx: mpsc::UnboundedSender<Message>,
        atomic_stats: Arc<AtomicStats>,
    ) {
        while let Some(msg) = socket.next().await {
            let multipart = match msg {
                Ok(multipart) => multipart,
                Err(e) => {
                    warn!(error = %e, "ZMQ receive error");
                    continue;
                }
            };
            let Some(data) = multipart.into_iter().next() else {
                continue;
            };
            match Message::from_msgpack(&data) {
                Ok(message) => {
                    atomic_stats.record_received();
                    if let Message::Heartbeat(hb) = &message {
                        debug!(source_id = hb.source_id, counter = hb.counter, "Received heartbeat");
                    }
                    if tx.send(message).is_err() {
                        info!("Processor channel closed, exiting");
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to deserialize message");
                }
            }
        }
        info!("Socket closed");
    }

    /// Processor task: channel → stats + console output
    async fn processor_task(
        mut rx: mpsc::UnboundedReceiver<Message>,
        atomic_stats: Arc<AtomicStats>,
        stats_interval_secs: u64,
        json: bool,
        eos_tx: oneshot::Sender<()>,
    ) -> DataSinkStats {
        let mut stats = DataSinkStats::default();
        let start_time = Instant::now();
        let mut last_report_time = Instant::now();
        let stats_interval = Duration::from_secs(stats_interval_secs);
        let mut eos_tx = Some(eos_tx);

        while let Some(msg) = rx.recv().await {
            match &msg {
                Message::Data(batch) => {
                    debug!(
                        destination = %batch.destination,
                        seq = batch.sequence_number,
                        rows = batch.rows(),
                        "Received batch"
                    );
                    atomic_stats.record_processed();
                }
                Message::Stats(report) if json => match serde_json::to_string(report) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Failed to encode stats report"),
                },
                _ => {}
            }
            if msg.is_eos() {
                atomic_stats.record_eos();
                if let Some(tx) = eos_tx.take() {
                    let _ = tx.send(());
                }
            }
            stats.apply(msg);

            if !json && last_report_time.elapsed() >= stats_interval {
                let total_elapsed = start_time.elapsed().as_secs_f64();
                let interval_elapsed = last_report_time.elapsed().as_secs_f64();
                println!("{}", stats.report(total_elapsed, interval_elapsed));
                last_report_time = Instant::now();
            }
        }

        if !json {
            println!();
            println!("{}", stats.final_report(start_time.elapsed().as_secs_f64()));
        }

        info!("Processor task completed");
        stats
    }
}
