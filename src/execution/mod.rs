//! Execution module.
//!
//! This module handles running per-slice work over shared arrays.

pub mod loader;
pub mod parallel;
pub mod progress;

pub use loader::{load_stack_into_shared, LoadRequest, LoadStrategy};
pub use parallel::{apply_parallel, ParallelOptions};
pub use progress::{NullProgress, ProgressReporter, ProgressTracker, ProgressUpdate};
