//! Counters and periodic statistics for the reader stage
//!
//! # Design Principles (KISS)
//! - Plain counters on the single-threaded cycle path
//! - Atomic counters only where a second task reads them (transport metrics)
//! - Snapshot-and-clear on a configurable cadence

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Integrity counters of the record stream
///
/// Only [`StatsAggregator`] reports clear them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Datagrams rejected by the validator
    pub invalid: u64,
    /// Records repeating the last accepted timestamp
    pub duplicated: u64,
    /// Records older than the last accepted timestamp
    pub out_of_order: u64,
    /// Samples inferred lost inside gaps
    pub missed: u64,
    /// Gap events
    pub gaps: u64,
}

impl StatsSnapshot {
    /// True when no anomaly was counted
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid={} duplicated={} out_of_order={} missed={} gaps={}",
            self.invalid, self.duplicated, self.out_of_order, self.missed, self.gaps
        )
    }
}

/// When the aggregator produces a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsCadence {
    /// Never report periodically
    Disabled,
    /// Every N accepted records
    Packets(u64),
    /// Every time the interval has elapsed
    WallClock(Duration),
}

/// Owns the counters and the reporting reference point
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    cadence: StatsCadence,
    current: StatsSnapshot,
    totals: StatsSnapshot,
    accepted_since_report: u64,
    last_report: Instant,
}

impl StatsAggregator {
    pub fn new(cadence: StatsCadence) -> Self {
        Self::starting_at(cadence, Instant::now())
    }

    /// Aggregator whose wall-clock reference point is `now`
    pub fn starting_at(cadence: StatsCadence, now: Instant) -> Self {
        Self {
            cadence,
            current: StatsSnapshot::default(),
            totals: StatsSnapshot::default(),
            accepted_since_report: 0,
            last_report: now,
        }
    }

    pub fn cadence(&self) -> StatsCadence {
        self.cadence
    }

    #[inline]
    pub fn record_invalid(&mut self) {
        self.current.invalid += 1;
        self.totals.invalid += 1;
    }

    #[inline]
    pub fn record_duplicate(&mut self) {
        self.current.duplicated += 1;
        self.totals.duplicated += 1;
    }

    #[inline]
    pub fn record_out_of_order(&mut self) {
        self.current.out_of_order += 1;
        self.totals.out_of_order += 1;
    }

    #[inline]
    pub fn record_gap(&mut self, missed: u64) {
        self.current.missed += missed;
        self.current.gaps += 1;
        self.totals.missed += missed;
        self.totals.gaps += 1;
    }

    /// Count one record that reached the demultiplexer
    #[inline]
    pub fn record_accepted(&mut self) {
        self.accepted_since_report += 1;
    }

    /// Counters since the last report
    pub fn current(&self) -> StatsSnapshot {
        self.current
    }

    /// Counters since the aggregator was created
    pub fn totals(&self) -> StatsSnapshot {
        self.totals
    }

    pub fn accepted_since_report(&self) -> u64 {
        self.accepted_since_report
    }

    /// Whether a report is due at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        match self.cadence {
            StatsCadence::Disabled => false,
            StatsCadence::Packets(n) => self.accepted_since_report >= n,
            StatsCadence::WallClock(interval) => {
                now.saturating_duration_since(self.last_report) >= interval
            }
        }
    }

    /// Snapshot and clear the counters, moving the reference point to `now`
    pub fn take(&mut self, now: Instant) -> StatsSnapshot {
        let snapshot = self.current;
        self.current = StatsSnapshot::default();
        self.accepted_since_report = 0;
        self.last_report = now;
        snapshot
    }

    /// Report if due
    pub fn poll(&mut self, now: Instant) -> Option<StatsSnapshot> {
        if self.is_due(now) {
            Some(self.take(now))
        } else {
            None
        }
    }
}

/// Transport counters shared between the read task and the publisher
///
/// All operations use Relaxed ordering; values are for monitoring only.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    /// Datagrams received from the socket
    pub datagrams: AtomicU64,
    /// Bytes received from the socket
    pub bytes: AtomicU64,
    /// Batches handed to the publisher
    pub batches: AtomicU64,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_datagram(&self, bytes: usize) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_batches(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of transport counters at a point in time
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub datagrams: u64,
    pub bytes: u64,
    pub batches: u64,
}

impl CounterSnapshot {
    /// Calculate rate between two snapshots given elapsed seconds
    pub fn rate_from(&self, prev: &CounterSnapshot, elapsed_secs: f64) -> RateSnapshot {
        if elapsed_secs <= 0.0 {
            return RateSnapshot::default();
        }

        RateSnapshot {
            datagram_rate: self.datagrams.saturating_sub(prev.datagrams) as f64 / elapsed_secs,
            bytes_rate: self.bytes.saturating_sub(prev.bytes) as f64 / elapsed_secs,
            batch_rate: self.batches.saturating_sub(prev.batches) as f64 / elapsed_secs,
        }
    }
}

/// Rate calculations from counter snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct RateSnapshot {
    pub datagram_rate: f64,
    pub bytes_rate: f64,
    pub batch_rate: f64,
}

impl RateSnapshot {
    /// Format bytes rate as human-readable string (KB/s, MB/s, etc.)
    pub fn format_bytes_rate(&self) -> String {
        if self.bytes_rate >= 1_000_000_000.0 {
            format!("{:.2} GB/s", self.bytes_rate / 1_000_000_000.0)
        } else if self.bytes_rate >= 1_000_000.0 {
            format!("{:.2} MB/s", self.bytes_rate / 1_000_000.0)
        } else if self.bytes_rate >= 1_000.0 {
            format!("{:.2} KB/s", self.bytes_rate / 1_000.0)
        } else {
            format!("{:.0} B/s", self.bytes_rate)
        }
    }
}
