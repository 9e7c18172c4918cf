//! # Tomochunk - Memory-bounded tomography stack processing
//!
//! Tomochunk processes image stacks that are too large to hold in memory at
//! once. A stack is split along a traversal axis into chunks that fit a
//! memory budget, each chunk is loaded into shared memory, and per-slice
//! filters run over it on a pool of worker threads.
//!
//! ## Features
//!
//! - **Chunk planning**: Split a stack so every chunk fits a memory budget
//! - **Shared arrays**: Stacks live in one anonymous mapping; workers borrow disjoint slices
//! - **Parallel slices**: Apply per-slice transforms across a rayon pool, with cancellation
//! - **Chunk runner**: Drive an external multi-stage pipeline over successive chunks
//! - **Calibration**: Interpolate sparse per-slice calibration values
//!
//! ## Quick Start
//!
//! ```rust
//! use tomochunk::prelude::*;
//!
//! let shape = Shape::new([40, 8, 8]).unwrap();
//! let data: Vec<f32> = (0..shape.element_count()).map(|i| i as f32).collect();
//! let stack = SharedArray::from_slice(&shape, &data).unwrap();
//!
//! let doubled = apply_parallel(
//!     stack,
//!     None,
//!     |src: &[f32], dst: &mut [f32]| {
//!         for (d, s) in dst.iter_mut().zip(src) {
//!             *d = s * 2.0;
//!         }
//!         Ok(())
//!     },
//!     &ParallelOptions::new().with_cores(4).with_chunksize(5),
//!     &NullProgress,
//! )
//! .unwrap();
//! assert_eq!(doubled.slice::<f32>(1).unwrap()[0], 128.0);
//! ```
//!
//! ## Running a pipeline in chunks
//!
//! ```rust
//! use tomochunk::prelude::*;
//!
//! let shape = Shape::new([1000, 512, 512]).unwrap();
//! let mut config = PipelineConfig::new();
//! let mut ranges = Vec::new();
//!
//! let summary = run_pipeline_in_chunks(
//!     &shape,
//!     0,
//!     "float32",
//!     512.0,
//!     1.0,
//!     |config: &PipelineConfig| {
//!         ranges.push(config.indices.clone().unwrap());
//!         Ok(())
//!     },
//!     &mut config,
//! )
//! .unwrap();
//! assert_eq!(ranges.len(), summary.chunks);
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: Shapes, dtypes, size estimation, planning, shared arrays, calibration
//! - [`execution`]: Parallel executor, stack loader and progress reporting
//! - [`filters`]: Per-slice filters and their registry
//! - [`pipeline`]: Configuration, chunk runner and staged pipelines

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod core;
pub mod execution;
pub mod filters;
pub mod pipeline;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use tomochunk::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::types::{Element, ElementDtype, IntoDtype, Shape};

    // Errors
    pub use crate::core::error::{BoxError, ChunkError, ChunkResult};

    // Planning
    pub use crate::core::planner::{compute_chunk_plan, plan_chunks, ChunkPlan, MemoryBudget};
    pub use crate::core::size::{full_size_bytes, full_size_kb, full_size_mb, single_size};
    pub use crate::core::calibration::{calibration_from_tilt, interpolate_calibration};

    // Shared memory
    pub use crate::core::shared::{create_shared_array, MemoryTracker, SharedArray};
    pub use crate::core::chunked::{
        ChunkSink, FnSliceSource, MemoryStackSink, MemoryStackSource, SliceSource,
    };

    // Execution
    pub use crate::execution::loader::{load_stack_into_shared, LoadRequest, LoadStrategy};
    pub use crate::execution::parallel::{apply_into, apply_parallel, ParallelOptions};
    pub use crate::execution::progress::{
        NullProgress, ProgressCallback, ProgressReporter, ProgressTracker, ProgressUpdate,
    };

    // Filters
    pub use crate::filters::builtin::{ClipValues, Scale};
    pub use crate::filters::{filter_fn, FilterRegistry, FilterSpec, SliceFilter};

    // Pipelines
    pub use crate::pipeline::config::{CalibrationPoints, ChunkConfig, PipelineConfig};
    pub use crate::pipeline::runner::{run_pipeline_in_chunks, ChunkedRun, RunSummary};
    pub use crate::pipeline::stages::{Reconstructor, StagedPipeline};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
