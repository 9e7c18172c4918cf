//! Per-slice filters.
//!
//! A filter maps one axis-0 slice to one output slice and knows nothing
//! about chunks or workers; [`SliceFilter::run`] hands it to the parallel
//! executor. Filters are created by name from a [`FilterRegistry`] so that
//! pipelines can be described in configuration files.

pub mod builtin;
pub mod registry;

pub use registry::{FilterFactory, FilterRegistry, FilterSpec};

use crate::core::error::{BoxError, ChunkResult};
use crate::core::shared::SharedArray;
use crate::core::types::Element;
use crate::execution::parallel::{apply_parallel, ParallelOptions};
use crate::execution::progress::ProgressReporter;

/// A slice-independent transform.
pub trait SliceFilter<T: Element>: Send + Sync {
    /// Name used for logging and progress.
    fn name(&self) -> &str;

    /// Compute `dst` from `src`. Both hold exactly one slice.
    fn apply(&self, src: &[T], dst: &mut [T]) -> Result<(), BoxError>;

    /// Apply this filter in place to every slice of `stack`.
    fn run(
        &self,
        stack: SharedArray,
        options: &ParallelOptions,
        progress: &dyn ProgressReporter,
    ) -> ChunkResult<SharedArray> {
        let options = options.clone().with_label(self.name());
        apply_parallel(stack, None, |src: &[T], dst: &mut [T]| self.apply(src, dst), &options, progress)
    }
}

/// Filter built from a closure.
pub struct FnFilter<F> {
    name: String,
    f: F,
}

/// Wrap `f` as a named filter.
pub fn filter_fn<F>(name: impl Into<String>, f: F) -> FnFilter<F> {
    FnFilter {
        name: name.into(),
        f,
    }
}

impl<T, F> SliceFilter<T> for FnFilter<F>
where
    T: Element,
    F: Fn(&[T], &mut [T]) -> Result<(), BoxError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, src: &[T], dst: &mut [T]) -> Result<(), BoxError> {
        (self.f)(src, dst)
    }
}
