//! Chunked pipeline runs.
//!
//! Contains the pipeline configuration, the chunk runner that drives an
//! executable over a chunk plan, and a staged pipeline usable as that
//! executable.

pub mod config;
pub mod runner;
pub mod stages;

pub use config::{CalibrationPoints, ChunkConfig, PipelineConfig};
pub use runner::{run_pipeline_in_chunks, ChunkedRun, RunSummary};
pub use stages::{Reconstructor, StagedPipeline};
