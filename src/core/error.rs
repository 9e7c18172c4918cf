//! Error types for tomochunk.
//!
//! Uses thiserror for structured errors with context. Errors are designed to:
//! - Fail fast: planning errors surface before any work is dispatched
//! - Attribute failures to the slice or chunk that caused them
//! - Carry enough range information to resume an aborted run

use std::ops::Range;
use thiserror::Error;

/// Boxed error produced by external collaborators (filters, loaders, stages).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for tomochunk.
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Axis {axis} is outside a shape of rank {rank}")]
    InvalidAxis { axis: usize, rank: usize },

    #[error("Invalid shape {shape:?}: {reason}")]
    InvalidShape { shape: Vec<usize>, reason: String },

    #[error("Cannot resolve dtype from '{0}'")]
    UnresolvedDtype(String),

    #[error("Dtype mismatch: array holds {actual}, requested {requested}")]
    DtypeMismatch { actual: String, requested: String },

    #[error("Invalid calibration input: {0}")]
    InvalidCalibrationInput(String),

    #[error("Worker failed on slice {slice}: {source}")]
    WorkerFailure {
        slice: usize,
        #[source]
        source: BoxError,
    },

    #[error("Degenerate chunk plan: {0}")]
    DegenerateChunkPlan(String),

    #[error("Insufficient memory: need {required_kb:.0} KB, ceiling is {available_kb:.0} KB")]
    InsufficientMemory { required_kb: f64, available_kb: f64 },

    #[error("'{label}' cancelled by user")]
    Cancelled { label: String },

    #[error(
        "Chunk {}..{} failed (completed {}..{}): {}",
        .attempted.start, .attempted.end, .completed.start, .completed.end, .source
    )]
    ChunkFailed {
        attempted: Range<usize>,
        completed: Range<usize>,
        #[source]
        source: BoxError,
    },

    #[error("Run cancelled after completing {}..{}", .completed.start, .completed.end)]
    RunCancelled { completed: Range<usize> },

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Shared memory mapping failed: {0}")]
    Map(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChunkError {
    /// Slice index responsible for a worker failure, if any.
    pub fn failed_slice(&self) -> Option<usize> {
        match self {
            ChunkError::WorkerFailure { slice, .. } => Some(*slice),
            _ => None,
        }
    }

    /// Range that completed before a multi-chunk run stopped.
    pub fn completed_range(&self) -> Option<Range<usize>> {
        match self {
            ChunkError::ChunkFailed { completed, .. } | ChunkError::RunCancelled { completed } => {
                Some(completed.clone())
            }
            _ => None,
        }
    }

    /// Check if a caller could retry with different inputs or resources.
    ///
    /// Precondition violations are not recoverable; a failing worker or
    /// chunk might be.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ChunkError::InvalidAxis { .. }
                | ChunkError::InvalidShape { .. }
                | ChunkError::UnresolvedDtype(_)
                | ChunkError::DtypeMismatch { .. }
                | ChunkError::InvalidCalibrationInput(_)
                | ChunkError::DegenerateChunkPlan(_)
                | ChunkError::Cancelled { .. }
                | ChunkError::RunCancelled { .. }
        )
    }
}

/// Result type alias for tomochunk operations.
pub type ChunkResult<T> = Result<T, ChunkError>;
