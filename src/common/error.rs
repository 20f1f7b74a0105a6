//! Errors of the ZeroMQ-facing consumers
//!
//! The reader and emulator carry their own error enums; this one covers
//! subscribers that only fail on socket setup or a crashed worker task.

use thiserror::Error;

/// Fatal failures of a pipeline consumer
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Connecting or subscribing the ZeroMQ socket failed
    #[error("ZMQ transport error: {0}")]
    ZmqTransport(#[from] tmq::TmqError),

    /// Receiver or processor task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
