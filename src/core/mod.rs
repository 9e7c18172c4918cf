//! Core types and planning for tomochunk.
//!
//! This module contains the building blocks every other module relies on:
//! - Shapes and element dtypes
//! - Memory size estimation and chunk planning
//! - Shared-memory arrays
//! - Chunked stack sources and sinks
//! - Error types

pub mod calibration;
pub mod chunked;
pub mod error;
pub mod planner;
pub mod shared;
pub mod size;
pub mod types;

// Re-export commonly used types
pub use chunked::{ChunkSink, SliceSource};
pub use error::{BoxError, ChunkError, ChunkResult};
pub use planner::{ChunkPlan, MemoryBudget};
pub use shared::SharedArray;
pub use types::{Element, ElementDtype, Shape};
