//! Channel demultiplexing into per-destination batches
//!
//! Every accepted record contributes one row to every destination. All
//! destinations advance in lock-step and therefore fill up on the same
//! record; a full batch is handed out once and then rewound.

use crate::common::SampleBatch;
use crate::config::ChannelMap;

use super::record::constants::SAMPLING_FREQUENCY_HZ;
use super::record::HardwareRecord;

/// Accumulating `[batch_size × channels]` buffer for one destination
#[derive(Debug, Clone)]
pub struct DestinationBatch {
    name: String,
    channels: Vec<usize>,
    batch_size: usize,
    /// Row-major samples, allocated once
    samples: Vec<i32>,
    /// Hardware timestamp of each row
    timestamps: Vec<u64>,
    cursor: usize,
    /// Number of batches handed out so far
    flushes: u64,
}

impl DestinationBatch {
    pub fn new(name: impl Into<String>, channels: Vec<usize>, batch_size: usize) -> Self {
        let width = channels.len();
        Self {
            name: name.into(),
            channels,
            batch_size,
            samples: vec![0; batch_size * width],
            timestamps: vec![0; batch_size],
            cursor: 0,
            flushes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel indices copied into each row
    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Rows written since the last flush
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.cursor == self.batch_size
    }

    /// Sequence number the batch currently being filled will carry
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Samples of a filled row
    pub fn row(&self, index: usize) -> Option<&[i32]> {
        if index >= self.cursor {
            return None;
        }
        let width = self.channels.len();
        self.samples.get(index * width..(index + 1) * width)
    }

    /// Iterate over the filled rows
    pub fn rows(&self) -> impl Iterator<Item = &[i32]> {
        (0..self.cursor).filter_map(move |i| self.row(i))
    }

    /// Timestamps of the filled rows
    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps[..self.cursor]
    }

    /// Hardware timestamp of the first row
    pub fn first_timestamp(&self) -> Option<u64> {
        self.timestamps().first().copied()
    }

    /// Copy this destination's channels of `record` into the next row
    ///
    /// Returns `true` when the batch became full.
    fn push(&mut self, record: &HardwareRecord) -> bool {
        debug_assert!(self.cursor < self.batch_size);
        let width = self.channels.len();
        let row = &mut self.samples[self.cursor * width..(self.cursor + 1) * width];
        for (slot, &channel) in row.iter_mut().zip(&self.channels) {
            *slot = record.samples[channel];
        }
        self.timestamps[self.cursor] = record.timestamp;
        self.cursor += 1;
        self.is_full()
    }

    /// Rewind; `emitted` advances the sequence number
    fn reset(&mut self, emitted: bool) {
        self.cursor = 0;
        if emitted {
            self.flushes += 1;
        }
    }

    /// Owned copy of the filled rows for publishing
    pub fn to_sample_batch(&self) -> SampleBatch {
        let width = self.channels.len();
        SampleBatch::new(
            self.name.clone(),
            self.flushes,
            self.first_timestamp().unwrap_or_default(),
            SAMPLING_FREQUENCY_HZ,
            self.channels.iter().map(|&c| c as u32).collect(),
            self.timestamps().to_vec(),
            self.samples[..self.cursor * width].to_vec(),
        )
    }
}

/// Splits accepted records across all configured destinations
#[derive(Debug, Clone)]
pub struct Demultiplexer {
    destinations: Vec<DestinationBatch>,
    batch_size: usize,
}

impl Demultiplexer {
    /// Allocate one batch buffer per destination, in declaration order
    pub fn new(channelmap: &ChannelMap, batch_size: usize) -> Self {
        let destinations = channelmap
            .iter()
            .map(|(name, channels)| DestinationBatch::new(name, channels.to_vec(), batch_size))
            .collect();
        Self {
            destinations,
            batch_size,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn destinations(&self) -> &[DestinationBatch] {
        &self.destinations
    }

    pub fn destination(&self, name: &str) -> Option<&DestinationBatch> {
        self.destinations.iter().find(|d| d.name() == name)
    }

    /// Shared fill cursor of all destinations
    pub fn cursor(&self) -> usize {
        self.destinations.first().map_or(0, |d| d.cursor())
    }

    /// Write one row into every destination
    ///
    /// Returns `true` when the batches are full and must be flushed.
    pub fn push(&mut self, record: &HardwareRecord) -> bool {
        let mut full = false;
        for destination in &mut self.destinations {
            full |= destination.push(record);
        }
        full
    }

    /// Hand every full batch to `emit` in declaration order, then rewind
    ///
    /// If `emit` fails, the batches not yet handed out are discarded so
    /// all destinations stay in lock-step and can accept the next row.
    pub fn flush<E, F>(&mut self, mut emit: F) -> Result<usize, E>
    where
        F: FnMut(&DestinationBatch) -> Result<(), E>,
    {
        let mut emitted = 0;
        for index in 0..self.destinations.len() {
            if !self.destinations[index].is_full() {
                continue;
            }
            if let Err(e) = emit(&self.destinations[index]) {
                self.discard();
                return Err(e);
            }
            self.destinations[index].reset(true);
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Rewind every full batch without handing it out
    pub fn discard(&mut self) {
        for destination in self.destinations.iter_mut().filter(|d| d.is_full()) {
            destination.reset(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &[usize])]) -> ChannelMap {
        entries
            .iter()
            .map(|(name, channels)| (name.to_string(), channels.to_vec()))
            .collect()
    }

    fn record(timestamp: u64, samples: Vec<i32>) -> HardwareRecord {
        HardwareRecord::with_samples(timestamp, 0, samples)
    }

    #[test]
    fn rows_pick_configured_channels() {
        let mut demux = Demultiplexer::new(&map(&[("A", &[0, 1]), ("B", &[5])]), 4);
        let samples: Vec<i32> = (0..128).map(|i| 1000 + i).collect();

        assert!(!demux.push(&record(10, samples)));

        let a = demux.destination("A").unwrap();
        assert_eq!(a.cursor(), 1);
        assert_eq!(a.row(0), Some(&[1000, 1001][..]));
        let b = demux.destination("B").unwrap();
        assert_eq!(b.row(0), Some(&[1005][..]));
        assert_eq!(b.row(1), None);
    }

    #[test]
    fn flush_emits_in_declaration_order() {
        let mut demux = Demultiplexer::new(&map(&[("z", &[1]), ("a", &[0])]), 2);
        demux.push(&record(1, vec![1, 2]));
        assert!(demux.push(&record(2, vec![3, 4])));

        let mut order = Vec::new();
        let emitted = demux
            .flush(|d| -> Result<(), ()> {
                let rows: Vec<Vec<i32>> = d.rows().map(<[i32]>::to_vec).collect();
                order.push((d.name().to_string(), rows));
                Ok(())
            })
            .unwrap();

        assert_eq!(emitted, 2);
        assert_eq!(order[0], ("z".to_string(), vec![vec![2], vec![4]]));
        assert_eq!(order[1], ("a".to_string(), vec![vec![1], vec![3]]));
        assert_eq!(demux.cursor(), 0);
        assert_eq!(demux.destinations()[0].flushes(), 1);
    }

    #[test]
    fn failed_emit_keeps_destinations_in_step() {
        let mut demux = Demultiplexer::new(&map(&[("a", &[0]), ("b", &[1])]), 1);
        assert!(demux.push(&record(1, vec![1, 2])));

        let result = demux.flush(|d| if d.name() == "b" { Err("closed") } else { Ok(()) });
        assert_eq!(result, Err("closed"));

        let a = demux.destination("a").unwrap();
        let b = demux.destination("b").unwrap();
        assert_eq!((a.cursor(), a.flushes()), (0, 1));
        assert_eq!((b.cursor(), b.flushes()), (0, 0));

        // Next record still fits and flushes normally
        assert!(demux.push(&record(2, vec![3, 4])));
        assert_eq!(demux.flush(|_| -> Result<(), ()> { Ok(()) }), Ok(2));
        assert_eq!(demux.destination("b").unwrap().flushes(), 1);
    }

    #[test]
    fn discarded_flush_still_rewinds() {
        let mut demux = Demultiplexer::new(&map(&[("x", &[0])]), 1);
        assert!(demux.push(&record(1, vec![7])));

        demux.discard();
        assert_eq!(demux.cursor(), 0);
        assert_eq!(demux.destinations()[0].flushes(), 0);
    }

    #[test]
    fn sample_batch_carries_first_timestamp() {
        let mut demux = Demultiplexer::new(&map(&[("x", &[0, 2])]), 3);
        demux.push(&record(100, vec![1, 0, 2]));
        demux.push(&record(131, vec![3, 0, 4]));
        demux.push(&record(163, vec![5, 0, 6]));

        let batch = demux.destination("x").unwrap().to_sample_batch();
        assert_eq!(batch.destination, "x");
        assert_eq!(batch.hardware_timestamp, 100);
        assert_eq!(batch.sample_timestamps, vec![100, 131, 163]);
        assert_eq!(batch.channels, vec![0, 2]);
        assert_eq!(batch.samples, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(batch.rows(), 3);
        assert_eq!(batch.sequence_number, 0);
    }

    #[test]
    fn buffers_are_reused_across_flushes() {
        let mut demux = Demultiplexer::new(&map(&[("x", &[0])]), 2);
        let capacity = demux.destinations()[0].samples.capacity();

        for n in 0..10 {
            if demux.push(&record(n, vec![n as i32])) {
                demux.flush(|_| -> Result<(), ()> { Ok(()) }).unwrap();
            }
        }

        assert_eq!(demux.destinations()[0].samples.capacity(), capacity);
        assert_eq!(demux.destinations()[0].flushes(), 5);
    }
}
