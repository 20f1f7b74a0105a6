//! Emulator data source - generates a synthetic Digilynx packet stream
//!
//! Produces raw signal records at the hardware rate and sends them as UDP
//! datagrams, optionally dropping, duplicating, reordering or corrupting
//! some of them to exercise the reader's integrity checks.
//!
//! Architecture:
//! - PacketGenerator: deterministic record synthesis (sine + Gaussian noise)
//! - FaultInjector: per-packet fault decisions
//! - Emulator: paced blocking send loop (spawn_blocking), stopped by shutdown

use std::f64::consts::TAU;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use thiserror::Error;
use tracing::{debug, info};

use crate::common::shutdown::{forward_to_flag, ShutdownReceiver};
use crate::config::EmulatorConfig;
use crate::reader::record::constants::{MAX_NCHANNELS, SAMPLING_FREQUENCY_HZ, SAMPLING_PERIOD_US};
use crate::reader::record::HardwareRecord;

/// Datagrams are released in bursts of this length
const BURST_INTERVAL: Duration = Duration::from_millis(1);

/// Emulator errors
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot resolve target address: {0}")]
    Resolve(String),

    #[error("{name} must be within [0, 1], got {value}")]
    InvalidRate { name: &'static str, value: f64 },

    #[error("nchannels must be between 1 and {max}, got {0}", max = MAX_NCHANNELS)]
    InvalidChannelCount(usize),

    #[error("Invalid noise distribution: {0}")]
    Noise(#[from] rand_distr::NormalError),

    #[error("Send task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Synthesises consecutive raw signal records
pub struct PacketGenerator {
    nchannels: usize,
    start_timestamp: u64,
    amplitude: f64,
    noise: Normal<f64>,
    trigger_after: Option<u64>,
    trigger_channel: u32,
    rng: StdRng,
    counter: u64,
}

impl PacketGenerator {
    pub fn new(config: &EmulatorConfig) -> Result<Self, EmulatorError> {
        if config.nchannels == 0 || config.nchannels > MAX_NCHANNELS {
            return Err(EmulatorError::InvalidChannelCount(config.nchannels));
        }
        Ok(Self {
            nchannels: config.nchannels,
            start_timestamp: config.start_timestamp,
            amplitude: config.amplitude,
            noise: Normal::new(0.0, config.noise_sigma)?,
            trigger_after: config.trigger_after,
            trigger_channel: config.trigger_channel,
            rng: seeded_rng(config.seed),
            counter: 0,
        })
    }

    /// Records generated so far
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Hardware timestamp of the n-th record
    pub fn timestamp_of(&self, n: u64) -> u64 {
        self.start_timestamp + (n as f64 * SAMPLING_PERIOD_US).round() as u64
    }

    /// Generate the next record in sequence
    pub fn next_record(&mut self) -> HardwareRecord {
        let n = self.counter;
        self.counter += 1;

        let t = n as f64 / SAMPLING_FREQUENCY_HZ;
        let samples = (0..self.nchannels)
            .map(|ch| {
                // 10 Hz apart so channels are distinguishable on a scope
                let freq = 10.0 * (ch + 1) as f64;
                let value = self.amplitude * (TAU * freq * t).sin() + self.noise.sample(&mut self.rng);
                value.round() as i32
            })
            .collect();

        let dio = match self.trigger_after {
            Some(after) if n >= after && self.trigger_channel < 32 => 1u32 << self.trigger_channel,
            _ => 0,
        };

        HardwareRecord::with_samples(self.timestamp_of(n), dio, samples)
    }
}

/// Counters of what the injector did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounts {
    pub generated: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
    pub corrupted: u64,
}

/// Decides per packet whether to drop, duplicate, reorder or corrupt it
pub struct FaultInjector {
    drop_rate: f64,
    duplicate_rate: f64,
    reorder_rate: f64,
    corrupt_rate: f64,
    rng: StdRng,
    /// Packet held back to be sent after its successor
    held: Option<Vec<u8>>,
    counts: FaultCounts,
}

impl FaultInjector {
    pub fn new(config: &EmulatorConfig) -> Result<Self, EmulatorError> {
        for (name, value) in [
            ("drop_rate", config.drop_rate),
            ("duplicate_rate", config.duplicate_rate),
            ("reorder_rate", config.reorder_rate),
            ("corrupt_rate", config.corrupt_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EmulatorError::InvalidRate { name, value });
            }
        }
        Ok(Self {
            drop_rate: config.drop_rate,
            duplicate_rate: config.duplicate_rate,
            reorder_rate: config.reorder_rate,
            corrupt_rate: config.corrupt_rate,
            // Offset the seed so faults do not correlate with the noise
            rng: seeded_rng(config.seed.map(|s| s.wrapping_add(1))),
            held: None,
            counts: FaultCounts::default(),
        })
    }

    pub fn counts(&self) -> FaultCounts {
        self.counts
    }

    /// Route one packet, appending whatever should go on the wire to `out`
    pub fn apply(&mut self, mut packet: Vec<u8>, out: &mut Vec<Vec<u8>>) {
        self.counts.generated += 1;

        if self.rng.gen_bool(self.drop_rate) {
            self.counts.dropped += 1;
            return;
        }
        if self.rng.gen_bool(self.corrupt_rate) {
            packet.pop();
            self.counts.corrupted += 1;
        }
        if self.held.is_none() && self.rng.gen_bool(self.reorder_rate) {
            self.held = Some(packet);
            self.counts.reordered += 1;
            return;
        }

        let duplicate = self.rng.gen_bool(self.duplicate_rate);
        if duplicate {
            out.push(packet.clone());
            self.counts.duplicated += 1;
        }
        out.push(packet);
        if let Some(held) = self.held.take() {
            out.push(held);
        }
    }

    /// Release a packet still held for reordering
    pub fn finish(&mut self, out: &mut Vec<Vec<u8>>) {
        if let Some(held) = self.held.take() {
            out.push(held);
        }
    }
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Totals of one emulator run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmulatorSummary {
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub faults: FaultCounts,
}

/// Emulator data source
///
/// Sends generated records to a UDP target at the hardware rate.
pub struct Emulator {
    config: EmulatorConfig,
    target: SocketAddr,
    socket: UdpSocket,
    generator: PacketGenerator,
    injector: FaultInjector,
}

impl Emulator {
    /// Create a new emulator with the given configuration
    pub fn new(config: EmulatorConfig) -> Result<Self, EmulatorError> {
        let target = config
            .target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EmulatorError::Resolve(config.target.clone()))?;
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        let generator = PacketGenerator::new(&config)?;
        let injector = FaultInjector::new(&config)?;

        info!(
            target = %target,
            nchannels = config.nchannels,
            packets = config.packets,
            "Emulator ready"
        );

        Ok(Self {
            config,
            target,
            socket,
            generator,
            injector,
        })
    }

    /// Send loop - paced to the sampling rate in 1 ms bursts
    ///
    /// Stops when `shutdown` is raised or the packet limit is reached.
    pub fn send_loop(&mut self, shutdown: &AtomicBool) -> Result<EmulatorSummary, EmulatorError> {
        let limit = self.config.packets;
        let started = Instant::now();
        let mut summary = EmulatorSummary::default();
        let mut wire: Vec<Vec<u8>> = Vec::new();

        'outer: loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Emulator received shutdown signal");
                break;
            }

            // Packets that should have left by now
            let due = (started.elapsed().as_secs_f64() * SAMPLING_FREQUENCY_HZ) as u64;
            while self.generator.counter() < due {
                if limit > 0 && self.generator.counter() >= limit {
                    break 'outer;
                }
                let packet = self.generator.next_record().encode(self.config.convert_byte_order);
                self.injector.apply(packet, &mut wire);
            }
            if !wire.is_empty() {
                debug!(datagrams = wire.len(), "Sending burst");
            }
            self.send_all(&mut wire, &mut summary)?;

            if limit > 0 && self.generator.counter() >= limit {
                break;
            }
            std::thread::sleep(BURST_INTERVAL);
        }

        self.injector.finish(&mut wire);
        self.send_all(&mut wire, &mut summary)?;
        summary.faults = self.injector.counts();

        info!(
            datagrams = summary.datagrams_sent,
            dropped = summary.faults.dropped,
            duplicated = summary.faults.duplicated,
            reordered = summary.faults.reordered,
            corrupted = summary.faults.corrupted,
            "Emulator stopped"
        );
        Ok(summary)
    }

    fn send_all(
        &self,
        wire: &mut Vec<Vec<u8>>,
        summary: &mut EmulatorSummary,
    ) -> Result<(), EmulatorError> {
        for datagram in wire.drain(..) {
            self.socket.send_to(&datagram, self.target)?;
            summary.datagrams_sent += 1;
            summary.bytes_sent += datagram.len() as u64;
        }
        Ok(())
    }

    /// Run the emulator until shutdown or the packet limit
    pub async fn run(mut self, shutdown: ShutdownReceiver) -> Result<EmulatorSummary, EmulatorError> {
        let stop = Arc::new(AtomicBool::new(false));
        let forwarder = forward_to_flag(shutdown, stop.clone());

        let result = tokio::task::spawn_blocking(move || self.send_loop(&stop)).await;
        forwarder.abort();
        result?
    }
}
