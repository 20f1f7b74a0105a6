//! DIGILYNX-RS: Reader for the Digilynx UDP multi-channel signal stream
//!
//! Validates hardware records, tracks timestamp continuity, demultiplexes
//! channels into per-destination batches and publishes them via ZeroMQ.

pub mod common;
pub mod config;
pub mod data_sink;
pub mod data_source_emulator;
pub mod reader;
