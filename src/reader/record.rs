//! Digilynx raw signal record decoding
//!
//! Decodes the fixed-size 32-bit word format emitted by the acquisition
//! system. Layout (one word per row):
//!
//! ```text
//! word  0          STX (0x800)
//! word  1          packet type (1 = raw signal)
//! word  2          packet size (nchannels + 10)
//! word  3          timestamp, high 32 bits (microseconds)
//! word  4          timestamp, low 32 bits
//! word  5          status
//! word  6          digital input (parallel port)
//! word  7..=16     extra words
//! word 17..        one signed sample per channel
//! last word        CRC (XOR of all preceding words)
//! ```

use thiserror::Error;

/// Wire format constants (32-bit words)
pub mod constants {
    pub const WORD_SIZE: usize = 4;

    pub const STX: u32 = 0x0000_0800;
    pub const RAW_PACKET_ID: u32 = 1;

    pub const FIELD_STX: usize = 0;
    pub const FIELD_PACKET_ID: usize = 1;
    pub const FIELD_PACKET_SIZE: usize = 2;
    pub const FIELD_TIMESTAMP_HIGH: usize = 3;
    pub const FIELD_TIMESTAMP_LOW: usize = 4;
    pub const FIELD_STATUS: usize = 5;
    pub const FIELD_DIO: usize = 6;
    pub const FIELD_EXTRA_FIRST: usize = 7;
    pub const FIELD_DATA_FIRST: usize = 17;

    pub const NUM_EXTRA_FIELDS: usize = 10;
    /// Header words before the first sample
    pub const HEADER_WORDS: usize = FIELD_DATA_FIRST;
    /// Header words plus the trailing CRC word
    pub const OVERHEAD_WORDS: usize = HEADER_WORDS + 1;

    /// Largest channel count the hardware can be configured for
    pub const MAX_NCHANNELS: usize = 256;

    /// Receive buffers are this much larger than a record so that an
    /// oversized datagram shows up as a length mismatch
    pub const RECEIVE_SLACK_BYTES: usize = WORD_SIZE;

    /// Fixed acquisition rate of the signal stream
    pub const SAMPLING_FREQUENCY_HZ: f64 = 32_000.0;
    pub const SAMPLING_PERIOD_US: f64 = 1e6 / SAMPLING_FREQUENCY_HZ;
}

/// Total byte size of one record for the given channel count
pub const fn record_size(nchannels: usize) -> usize {
    (constants::OVERHEAD_WORDS + nchannels) * constants::WORD_SIZE
}

/// Value of the packet-size word for the given channel count
pub const fn packet_size_field(nchannels: usize) -> u32 {
    (nchannels + constants::NUM_EXTRA_FIELDS) as u32
}

/// Reasons a datagram is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("wrong datagram size: expected {expected} bytes, got {actual}")]
    WrongSize { expected: usize, actual: usize },

    #[error("invalid STX marker: 0x{0:08x}")]
    InvalidStx(u32),

    #[error("unexpected packet type: {0}")]
    InvalidPacketId(u32),

    #[error("packet size field mismatch: expected {expected}, got {actual}")]
    InvalidPacketSize { expected: u32, actual: u32 },

    #[error("CRC mismatch: residual 0x{0:08x}")]
    CrcMismatch(u32),
}

/// Decoded view of one raw signal record
///
/// Allocated once for the configured channel count and overwritten by each
/// successful decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareRecord {
    /// Hardware timestamp in microseconds
    pub timestamp: u64,
    /// Status word
    pub status: u32,
    /// Digital input word
    pub dio: u32,
    /// Extra words (unused by the demultiplexer)
    pub extra: [u32; constants::NUM_EXTRA_FIELDS],
    /// One sample per channel, in channel order
    pub samples: Vec<i32>,
}

impl HardwareRecord {
    /// Create a zeroed record for `nchannels` channels
    pub fn new(nchannels: usize) -> Self {
        Self {
            timestamp: 0,
            status: 0,
            dio: 0,
            extra: [0; constants::NUM_EXTRA_FIELDS],
            samples: vec![0; nchannels],
        }
    }

    /// Create a record from a timestamp, digital word and samples
    pub fn with_samples(timestamp: u64, dio: u32, samples: Vec<i32>) -> Self {
        Self {
            timestamp,
            status: 0,
            dio,
            extra: [0; constants::NUM_EXTRA_FIELDS],
            samples,
        }
    }

    /// Number of channels carried by this record
    #[inline]
    pub fn nchannels(&self) -> usize {
        self.samples.len()
    }

    /// Sample for a channel, if the channel exists
    #[inline]
    pub fn sample(&self, channel: usize) -> Option<i32> {
        self.samples.get(channel).copied()
    }

    /// Check whether a digital input bit is set
    #[inline]
    pub fn dio_bit(&self, bit: u32) -> bool {
        bit < 32 && (self.dio >> bit) & 1 == 1
    }

    /// Encode into wire format, computing packet size and CRC
    pub fn encode(&self, convert_byte_order: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(record_size(self.nchannels()));
        self.encode_into(&mut out, convert_byte_order);
        out
    }

    /// Encode into an existing buffer (cleared first)
    pub fn encode_into(&self, out: &mut Vec<u8>, convert_byte_order: bool) {
        out.clear();

        let mut words = Vec::with_capacity(constants::OVERHEAD_WORDS + self.nchannels());
        words.push(constants::STX);
        words.push(constants::RAW_PACKET_ID);
        words.push(packet_size_field(self.nchannels()));
        words.push((self.timestamp >> 32) as u32);
        words.push(self.timestamp as u32);
        words.push(self.status);
        words.push(self.dio);
        words.extend_from_slice(&self.extra);
        words.extend(self.samples.iter().map(|&s| s as u32));
        let crc = words.iter().fold(0u32, |acc, w| acc ^ w);
        words.push(crc);

        for word in words {
            let bytes = if convert_byte_order {
                word.to_be_bytes()
            } else {
                word.to_ne_bytes()
            };
            out.extend_from_slice(&bytes);
        }
    }
}

/// Validates and decodes raw datagrams for a fixed channel count
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    nchannels: usize,
    convert_byte_order: bool,
    expected_size: usize,
}

impl RecordDecoder {
    pub fn new(nchannels: usize, convert_byte_order: bool) -> Self {
        Self {
            nchannels,
            convert_byte_order,
            expected_size: record_size(nchannels),
        }
    }

    /// Exact byte size a valid datagram must have
    pub fn expected_size(&self) -> usize {
        self.expected_size
    }

    pub fn nchannels(&self) -> usize {
        self.nchannels
    }

    #[inline]
    fn read_word(&self, data: &[u8], index: usize) -> u32 {
        let offset = index * constants::WORD_SIZE;
        let bytes = [
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ];
        if self.convert_byte_order {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_ne_bytes(bytes)
        }
    }

    /// Validate a datagram without decoding its payload
    pub fn validate(&self, data: &[u8]) -> Result<(), RecordError> {
        if data.len() != self.expected_size {
            return Err(RecordError::WrongSize {
                expected: self.expected_size,
                actual: data.len(),
            });
        }

        let stx = self.read_word(data, constants::FIELD_STX);
        if stx != constants::STX {
            return Err(RecordError::InvalidStx(stx));
        }

        let packet_id = self.read_word(data, constants::FIELD_PACKET_ID);
        if packet_id != constants::RAW_PACKET_ID {
            return Err(RecordError::InvalidPacketId(packet_id));
        }

        let expected = packet_size_field(self.nchannels);
        let actual = self.read_word(data, constants::FIELD_PACKET_SIZE);
        if actual != expected {
            return Err(RecordError::InvalidPacketSize { expected, actual });
        }

        // XOR over every word, CRC included, cancels out for an intact record
        let n_words = self.expected_size / constants::WORD_SIZE;
        let residual = (0..n_words).fold(0u32, |acc, i| acc ^ self.read_word(data, i));
        if residual != 0 {
            return Err(RecordError::CrcMismatch(residual));
        }

        Ok(())
    }

    /// Validate `data` and decode it into `record`
    ///
    /// `record` is only written when validation succeeds.
    pub fn decode_into(&self, data: &[u8], record: &mut HardwareRecord) -> Result<(), RecordError> {
        self.validate(data)?;

        let high = self.read_word(data, constants::FIELD_TIMESTAMP_HIGH) as u64;
        let low = self.read_word(data, constants::FIELD_TIMESTAMP_LOW) as u64;
        record.timestamp = (high << 32) | low;
        record.status = self.read_word(data, constants::FIELD_STATUS);
        record.dio = self.read_word(data, constants::FIELD_DIO);
        for (i, extra) in record.extra.iter_mut().enumerate() {
            *extra = self.read_word(data, constants::FIELD_EXTRA_FIRST + i);
        }

        record.samples.resize(self.nchannels, 0);
        for (ch, sample) in record.samples.iter_mut().enumerate() {
            *sample = self.read_word(data, constants::FIELD_DATA_FIRST + ch) as i32;
        }

        Ok(())
    }

    /// Validate and decode into a freshly allocated record
    pub fn decode(&self, data: &[u8]) -> Result<HardwareRecord, RecordError> {
        let mut record = HardwareRecord::new(self.nchannels);
        self.decode_into(data, &mut record)?;
        Ok(record)
    }
}
