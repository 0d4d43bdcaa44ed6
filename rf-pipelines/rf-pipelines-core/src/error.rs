//! Error types for the pipeline runtime

use std::io;
use thiserror::Error;

/// Result type for pipeline runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pipeline runtime operations
///
/// Programmer errors (mismatched `get`/`put` pairs, out-of-ring windows,
/// position-counter violations inside a stage) are asserted, not returned;
/// the variants here cover configuration, resource, and run-time failures
/// that a correct caller can still encounter.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or lifecycle failure reported by a pipeline stage.
    /// The message carries the stage name when the stage has one.
    #[error("rf_pipelines: {0}")]
    Stage(String),

    /// Ring buffer construction or sizing failure
    #[error("rf_pipelines: ring_buffer: {0}")]
    RingBuffer(String),

    /// Memory allocation failed
    #[error("Memory allocation failed")]
    MemoryAllocationFailed,

    /// Memory layout error (alignment, stride, etc.)
    #[error("Memory layout error: {0}")]
    Layout(String),

    /// IO error during output file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure captured from the advance loop and re-raised after
    /// `end_pipeline` has flushed partial outputs
    #[error("{0}")]
    Runtime(String),
}
