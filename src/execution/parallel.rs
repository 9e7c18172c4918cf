//! Parallel per-slice execution over shared arrays.
//!
//! The axis-0 slices of a [`SharedArray`] are partitioned into contiguous
//! work items of `chunksize` slices. Each work item is a disjoint mutable
//! region of the destination, handed to exactly one worker of a rayon pool,
//! so no locking is needed. The calling thread blocks until every work item
//! has finished.
//!
//! Transforms must be slice-independent: results may not depend on which
//! worker handles a slice or in which order slices complete.

use crate::core::error::{BoxError, ChunkError, ChunkResult};
use crate::core::shared::SharedArray;
use crate::core::types::Element;
use crate::execution::progress::ProgressReporter;
use log::{debug, info};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Stacks with at most this many slices are processed on the calling thread.
pub const SEQUENTIAL_THRESHOLD: usize = 10;

/// Options for one parallel call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelOptions {
    /// Number of worker threads (0 = use all available).
    pub cores: usize,
    /// Slices per work item.
    pub chunksize: usize,
    /// Label used for progress reporting.
    pub label: String,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            cores: 0,
            chunksize: 1,
            label: String::from("Parallel"),
        }
    }
}

impl ParallelOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    /// Set the number of slices per work item.
    pub fn with_chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = chunksize;
        self
    }

    /// Set the progress label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Worker count with 0 resolved to the available parallelism.
    pub fn resolved_cores(&self) -> usize {
        if self.cores > 0 {
            return self.cores;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Check the options before dispatching anything.
    pub fn validate(&self) -> ChunkResult<()> {
        if self.chunksize == 0 {
            return Err(ChunkError::Config(
                "chunksize must be at least 1 slice".to_string(),
            ));
        }
        Ok(())
    }

    fn task_name(&self, cores: usize) -> String {
        format!("{} {}c {}chs", self.label, cores, self.chunksize)
    }
}

/// Whether dispatching to a pool is worth it for `slices` slices.
pub fn uses_pool(slices: usize, cores: usize) -> bool {
    cores > 1 && slices > SEQUENTIAL_THRESHOLD
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Run one slice, attributing errors and panics to its index.
fn run_slice<F>(index: usize, work: F) -> ChunkResult<()>
where
    F: FnOnce() -> Result<(), BoxError>,
{
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(ChunkError::WorkerFailure {
            slice: index,
            source,
        }),
        Err(payload) => Err(ChunkError::WorkerFailure {
            slice: index,
            source: panic_message(payload).into(),
        }),
    }
}

/// Call `f(index, slice)` for every axis-0 slice of `array`.
///
/// This is the work-item partitioning shared by every parallel operation.
/// On error the array may be partially written; callers own the decision of
/// what to do with it.
pub fn for_each_slice_mut<T, F>(
    array: &mut SharedArray,
    options: &ParallelOptions,
    progress: &dyn ProgressReporter,
    f: F,
) -> ChunkResult<()>
where
    T: Element,
    F: Fn(usize, &mut [T]) -> Result<(), BoxError> + Sync,
{
    options.validate()?;
    let slices = array.slices();
    let slice_len = array.shape().slice_len();
    let cores = options.resolved_cores();
    // A work item never spans more than the whole array.
    let chunksize = options.chunksize.min(slices);
    let item_len = chunksize * slice_len;

    let data = array.as_mut_slice::<T>()?;
    progress.begin(&options.task_name(cores), slices);

    let run_item = |(item, block): (usize, &mut [T])| -> ChunkResult<()> {
        if progress.is_cancelled() {
            return Err(ChunkError::Cancelled {
                label: options.label.clone(),
            });
        }
        let first = item * chunksize;
        for (offset, slice) in block.chunks_mut(slice_len).enumerate() {
            let index = first + offset;
            run_slice(index, || f(index, slice))?;
            progress.advance(1);
        }
        Ok(())
    };

    let result = if uses_pool(slices, cores) {
        info!("Running '{}' on {} cores", options.label, cores);
        let pool = ThreadPoolBuilder::new()
            .num_threads(cores)
            .thread_name(|i| format!("tomochunk-worker-{}", i))
            .build()?;
        pool.install(|| {
            data.par_chunks_mut(item_len)
                .enumerate()
                .try_for_each(&run_item)
        })
    } else {
        debug!("Running '{}' synchronously on 1 core", options.label);
        data.chunks_mut(item_len).enumerate().try_for_each(&run_item)
    };

    if let Err(ref e) = result {
        progress.error(&e.to_string());
    }
    progress.end();
    result
}

/// Apply `f(src_slice, dst_slice)` to every slice of `source`, writing into
/// `destination`.
///
/// `destination` is returned only if every slice succeeded; on failure it is
/// dropped, so a partially written array never reaches the caller.
pub fn apply_into<T, F>(
    source: &SharedArray,
    mut destination: SharedArray,
    f: F,
    options: &ParallelOptions,
    progress: &dyn ProgressReporter,
) -> ChunkResult<SharedArray>
where
    T: Element,
    F: Fn(&[T], &mut [T]) -> Result<(), BoxError> + Sync,
{
    if source.shape() != destination.shape() {
        return Err(ChunkError::InvalidShape {
            shape: destination.shape().dims().to_vec(),
            reason: format!("destination does not match source shape {}", source.shape()),
        });
    }
    let src = source.as_slice::<T>()?;
    let slice_len = source.shape().slice_len();

    for_each_slice_mut(&mut destination, options, progress, |index, dst: &mut [T]| {
        f(&src[index * slice_len..(index + 1) * slice_len], dst)
    })?;
    Ok(destination)
}

/// Apply `f(src_slice, dst_slice)` to every slice of `array` in place.
///
/// `f` receives a copy of the original slice as `src` and the live slice as
/// `dst`. A failed call consumes the array.
pub fn apply_in_place<T, F>(
    mut array: SharedArray,
    f: F,
    options: &ParallelOptions,
    progress: &dyn ProgressReporter,
) -> ChunkResult<SharedArray>
where
    T: Element,
    F: Fn(&[T], &mut [T]) -> Result<(), BoxError> + Sync,
{
    for_each_slice_mut(&mut array, options, progress, |_, slice: &mut [T]| {
        let original = slice.to_vec();
        f(&original, slice)
    })?;
    Ok(array)
}

/// Apply a per-slice transform over `source`, into `destination` when given
/// or in place otherwise, and return the array holding the results.
///
/// Both arrays are consumed; use [`apply_into`] to keep the source.
pub fn apply_parallel<T, F>(
    source: SharedArray,
    destination: Option<SharedArray>,
    f: F,
    options: &ParallelOptions,
    progress: &dyn ProgressReporter,
) -> ChunkResult<SharedArray>
where
    T: Element,
    F: Fn(&[T], &mut [T]) -> Result<(), BoxError> + Sync,
{
    match destination {
        Some(destination) => apply_into(&source, destination, f, options, progress),
        None => apply_in_place(source, f, options, progress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared::MemoryTracker;
    use crate::core::types::Shape;
    use crate::execution::progress::{NullProgress, ProgressTracker};
    use std::sync::Arc;

    fn random_stack(shape: &Shape, seed: u64) -> SharedArray {
        // xorshift keeps the data deterministic without a rand dependency
        let mut state = seed.max(1);
        let data: Vec<f32> = (0..shape.element_count())
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state % 10_000) as f32 / 7.0
            })
            .collect();
        SharedArray::from_slice(shape, &data).unwrap()
    }

    fn identity(src: &[f32], dst: &mut [f32]) -> Result<(), BoxError> {
        dst.copy_from_slice(src);
        Ok(())
    }

    #[test]
    fn test_identity_is_bit_identical() {
        let shape = Shape::new([37, 8, 9]).unwrap();
        let source = random_stack(&shape, 42);
        let expected = source.to_vec::<f32>().unwrap();

        for cores in [1, 2, 8] {
            for chunksize in [1, 3, 64] {
                let destination = SharedArray::create(&shape, "float32").unwrap();
                let options = ParallelOptions::new().with_cores(cores).with_chunksize(chunksize);
                let result = apply_into(&source, destination, identity, &options, &NullProgress).unwrap();
                assert_eq!(result.to_vec::<f32>().unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_doubling_with_four_cores() {
        let shape = Shape::new([100, 4, 4]).unwrap();
        let source = random_stack(&shape, 7);
        let expected: Vec<f32> = source.to_vec::<f32>().unwrap().iter().map(|v| v * 2.0).collect();

        let destination = SharedArray::create(&shape, "float32").unwrap();
        let options = ParallelOptions::new().with_cores(4).with_chunksize(10);
        let result = apply_parallel(
            source,
            Some(destination),
            |src: &[f32], dst: &mut [f32]| {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = s * 2.0;
                }
                Ok(())
            },
            &options,
            &NullProgress,
        )
        .unwrap();

        assert_eq!(result.to_vec::<f32>().unwrap(), expected);
    }

    #[test]
    fn test_in_place() {
        let shape = Shape::new([20, 3, 3]).unwrap();
        let data: Vec<i32> = (0..180).collect();
        let array = SharedArray::from_slice(&shape, &data).unwrap();

        let options = ParallelOptions::new().with_cores(3);
        let result = apply_parallel(
            array,
            None,
            |src: &[i32], dst: &mut [i32]| {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = s + 1;
                }
                Ok(())
            },
            &options,
            &NullProgress,
        )
        .unwrap();

        let expected: Vec<i32> = (1..181).collect();
        assert_eq!(result.to_vec::<i32>().unwrap(), expected);
    }

    #[test]
    fn test_failure_identifies_slice() {
        let shape = Shape::new([100, 4, 4]).unwrap();
        let mut data: Vec<f32> = (0..shape.element_count()).map(|v| v as f32).collect();
        let slice_len = shape.slice_len();
        data[37 * slice_len..38 * slice_len].fill(-1.0);
        let source = SharedArray::from_slice(&shape, &data).unwrap();
        let destination = SharedArray::create(&shape, "float32").unwrap();
        let options = ParallelOptions::new().with_cores(4).with_chunksize(10);

        let error = apply_parallel(
            source,
            Some(destination),
            |src: &[f32], dst: &mut [f32]| {
                if src[0] < 0.0 {
                    return Err("corrupt slice".into());
                }
                dst.copy_from_slice(src);
                Ok(())
            },
            &options,
            &NullProgress,
        )
        .unwrap_err();

        assert_eq!(error.failed_slice(), Some(37));
        assert!(error.to_string().contains("corrupt slice"));
    }

    #[test]
    fn test_panic_becomes_worker_failure() {
        let shape = Shape::new([12, 2, 2]).unwrap();
        let mut array = SharedArray::create(&shape, "float64").unwrap();
        let options = ParallelOptions::new().with_cores(2);

        let error = for_each_slice_mut(&mut array, &options, &NullProgress, |index, _: &mut [f64]| {
            if index == 5 {
                panic!("bad geometry");
            }
            Ok(())
        })
        .unwrap_err();

        assert_eq!(error.failed_slice(), Some(5));
        assert!(error.to_string().contains("bad geometry"));
    }

    #[test]
    fn test_failed_destination_is_released() {
        let tracker = Arc::new(MemoryTracker::new(1 << 20));
        let shape = Shape::new([30, 4, 4]).unwrap();
        let source = random_stack(&shape, 11);
        let destination = SharedArray::create_tracked(&shape, "float32", Some("out"), &tracker).unwrap();
        assert_eq!(tracker.current_usage(), 30 * 16 * 4);

        let result = apply_into(
            &source,
            destination,
            |_: &[f32], _: &mut [f32]| Err("always".into()),
            &ParallelOptions::new().with_cores(2),
            &NullProgress,
        );

        assert!(result.is_err());
        assert_eq!(tracker.current_usage(), 0);
    }

    #[test]
    fn test_cancelled_before_dispatch() {
        let shape = Shape::new([50, 2, 2]).unwrap();
        let mut array = SharedArray::create(&shape, "int16").unwrap();
        let tracker = ProgressTracker::new();
        tracker.cancel();

        let options = ParallelOptions::new().with_cores(2);
        let error = for_each_slice_mut(&mut array, &options, &tracker, |_, _: &mut [i16]| Ok(()))
            .unwrap_err();
        assert!(matches!(error, ChunkError::Cancelled { .. }));
    }

    #[test]
    fn test_progress_counts_every_slice() {
        let shape = Shape::new([25, 2, 2]).unwrap();
        let mut array = SharedArray::create(&shape, "float32").unwrap();
        let tracker = ProgressTracker::new();

        for_each_slice_mut(
            &mut array,
            &ParallelOptions::new().with_cores(4).with_chunksize(4),
            &tracker,
            |index, slice: &mut [f32]| {
                slice.fill(index as f32);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(tracker.completed_steps(), 25);
        assert_eq!(array.slice::<f32>(24).unwrap(), &[24.0; 4]);
    }

    #[test]
    fn test_rejects_mismatched_shapes_and_zero_chunksize() {
        let source = SharedArray::create(&Shape::new([4, 2]).unwrap(), "float32").unwrap();
        let destination = SharedArray::create(&Shape::new([4, 3]).unwrap(), "float32").unwrap();
        assert!(apply_into(&source, destination, identity, &ParallelOptions::new(), &NullProgress).is_err());

        let destination = SharedArray::create(&Shape::new([4, 2]).unwrap(), "float32").unwrap();
        let options = ParallelOptions::new().with_chunksize(0);
        assert!(matches!(
            apply_into(&source, destination, identity, &options, &NullProgress),
            Err(ChunkError::Config(_))
        ));
    }

    #[test]
    fn test_oversized_chunksize_is_one_work_item() {
        let shape = Shape::new([20, 4, 4]).unwrap();
        let mut array = SharedArray::create(&shape, "float32").unwrap();
        let tracker = ProgressTracker::new();
        let options = ParallelOptions::new()
            .with_cores(4)
            .with_chunksize(usize::MAX / 8);

        for_each_slice_mut(&mut array, &options, &tracker, |index, slice: &mut [f32]| {
            slice.fill(index as f32);
            Ok(())
        })
        .unwrap();

        assert_eq!(tracker.completed_steps(), 20);
        assert_eq!(array.slice::<f32>(19).unwrap(), &[19.0; 16]);
    }

    #[test]
    fn test_sequential_fallback() {
        assert!(!uses_pool(100, 1));
        assert!(!uses_pool(SEQUENTIAL_THRESHOLD, 8));
        assert!(uses_pool(SEQUENTIAL_THRESHOLD + 1, 2));
    }
}
