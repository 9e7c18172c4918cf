//! Loading stacks into shared memory.
//!
//! Slices are decoded straight into a freshly allocated [`SharedArray`],
//! either one after another on the calling thread or by the parallel
//! executor. Both strategies produce bit-identical arrays.

use crate::core::chunked::SliceSource;
use crate::core::error::{ChunkError, ChunkResult};
use crate::core::shared::SharedArray;
use crate::core::types::Element;
use crate::execution::parallel::{for_each_slice_mut, ParallelOptions};
use crate::execution::progress::ProgressReporter;
use log::info;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// How slices are read into the destination array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// One slice at a time on the calling thread.
    #[default]
    Sequential,
    /// Slices distributed over the worker pool.
    Parallel,
}

/// What to load and how.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadRequest {
    /// Label attached to the shared array's name.
    pub name: Option<String>,
    /// Loading strategy.
    pub strategy: LoadStrategy,
    /// Sub-range of source slices to load; the whole stack when `None`.
    pub indices: Option<Range<usize>>,
}

impl LoadRequest {
    /// Request the whole stack with the given strategy.
    pub fn new(strategy: LoadStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Label the resulting array.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Load only `indices` of the source.
    pub fn with_indices(mut self, indices: Range<usize>) -> Self {
        self.indices = Some(indices);
        self
    }
}

/// Load `source` (or the requested sub-range of it) into a new shared array
/// of element type `T`.
///
/// Slice `i` of the result holds source slice `start + i`.
pub fn load_stack_into_shared<T, S>(
    source: &S,
    request: &LoadRequest,
    options: &ParallelOptions,
    progress: &dyn ProgressReporter,
) -> ChunkResult<SharedArray>
where
    T: Element,
    S: SliceSource<T> + ?Sized,
{
    let full = source.shape();
    let range = match &request.indices {
        Some(range) if range.start < range.end && range.end <= full.slices() => range.clone(),
        Some(range) => {
            return Err(ChunkError::InvalidShape {
                shape: full.dims().to_vec(),
                reason: format!("cannot load slices {}..{}", range.start, range.end),
            })
        }
        None => 0..full.slices(),
    };
    let shape = full.with_axis_len(0, range.len())?;
    let mut array = match &request.name {
        Some(name) => SharedArray::create_named(&shape, T::DTYPE, name)?,
        None => SharedArray::create(&shape, T::DTYPE)?,
    };
    info!(
        "Loading {} slices {}..{} {:?}",
        shape, range.start, range.end, request.strategy
    );

    let offset = range.start;
    match request.strategy {
        LoadStrategy::Sequential => {
            // A single core never dispatches to the pool.
            let options = options.clone().with_cores(1);
            for_each_slice_mut(&mut array, &options, progress, |index, out: &mut [T]| {
                source.read_slice(offset + index, out)
            })?;
        }
        LoadStrategy::Parallel => {
            for_each_slice_mut(&mut array, options, progress, |index, out: &mut [T]| {
                source.read_slice(offset + index, out)
            })?;
        }
    }
    Ok(array)
}
