//! Load, filter, reconstruct and save, one chunk at a time.
//!
//! A [`StagedPipeline`] is the executable a [`ChunkedRun`] calls per chunk:
//! - Load the chunk's slices into a shared array
//! - Run the pre-processing filters, optionally saving their output
//! - Reconstruct with the chunk's calibration, unless the config skips it
//! - Run the post-processing filters and hand the chunk to the sink
//!
//! Progress reports the stage currently running.

use crate::core::chunked::{ChunkSink, SliceSource};
use crate::core::error::{BoxError, ChunkError, ChunkResult};
use crate::core::shared::SharedArray;
use crate::core::types::{Element, Shape};
use crate::execution::loader::{load_stack_into_shared, LoadRequest};
use crate::execution::parallel::ParallelOptions;
use crate::execution::progress::ProgressReporter;
use crate::filters::{FilterRegistry, SliceFilter};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::runner::{ChunkedRun, RunSummary};
use log::{debug, info, warn};

fn stage_error(what: &str, source: BoxError) -> anyhow::Error {
    anyhow::anyhow!("{}: {}", what, source)
}

/// Turns a pre-processed chunk into its reconstruction.
pub trait Reconstructor: Send {
    /// Shape of the full reconstruction of an input of shape `input`.
    fn output_shape(&self, input: &Shape) -> Shape {
        input.clone()
    }

    /// Reconstruct one chunk. `calibration` holds one value per chunk slice.
    fn reconstruct(
        &mut self,
        chunk: SharedArray,
        calibration: Option<&[f64]>,
        options: &ParallelOptions,
        progress: &dyn ProgressReporter,
    ) -> anyhow::Result<SharedArray>;
}

impl<F> Reconstructor for F
where
    F: FnMut(SharedArray, Option<&[f64]>) -> anyhow::Result<SharedArray> + Send,
{
    fn reconstruct(
        &mut self,
        chunk: SharedArray,
        calibration: Option<&[f64]>,
        _options: &ParallelOptions,
        _progress: &dyn ProgressReporter,
    ) -> anyhow::Result<SharedArray> {
        self(chunk, calibration)
    }
}

/// A complete chunked processing pipeline over one source.
pub struct StagedPipeline<T: Element> {
    source: Box<dyn SliceSource<T>>,
    pre_filters: Vec<Box<dyn SliceFilter<T>>>,
    reconstructor: Option<Box<dyn Reconstructor>>,
    post_filters: Vec<Box<dyn SliceFilter<T>>>,
    sink: Box<dyn ChunkSink<T>>,
    preproc_sink: Option<Box<dyn ChunkSink<T>>>,
    initialized: bool,
}

impl<T: Element> StagedPipeline<T> {
    /// Create a pipeline that copies `source` to `sink`.
    pub fn new(source: Box<dyn SliceSource<T>>, sink: Box<dyn ChunkSink<T>>) -> Self {
        Self {
            source,
            pre_filters: Vec::new(),
            reconstructor: None,
            post_filters: Vec::new(),
            sink,
            preproc_sink: None,
            initialized: false,
        }
    }

    /// Create a pipeline whose filters are described by `config`.
    pub fn from_config(
        source: Box<dyn SliceSource<T>>,
        sink: Box<dyn ChunkSink<T>>,
        config: &PipelineConfig,
        registry: &FilterRegistry<T>,
    ) -> ChunkResult<Self> {
        let mut pipeline = Self::new(source, sink);
        pipeline.pre_filters = registry.create_all(&config.pre_filters)?;
        pipeline.post_filters = registry.create_all(&config.post_filters)?;
        Ok(pipeline)
    }

    /// Append a pre-processing filter.
    pub fn with_pre_filter(mut self, filter: impl SliceFilter<T> + 'static) -> Self {
        self.pre_filters.push(Box::new(filter));
        self
    }

    /// Append a post-processing filter.
    pub fn with_post_filter(mut self, filter: impl SliceFilter<T> + 'static) -> Self {
        self.post_filters.push(Box::new(filter));
        self
    }

    /// Set the reconstruction stage.
    pub fn with_reconstructor(mut self, reconstructor: impl Reconstructor + 'static) -> Self {
        self.reconstructor = Some(Box::new(reconstructor));
        self
    }

    /// Also save every pre-processed chunk to `sink`.
    pub fn with_preproc_sink(mut self, sink: Box<dyn ChunkSink<T>>) -> Self {
        self.preproc_sink = Some(sink);
        self
    }

    fn reconstructs(&self, config: &PipelineConfig) -> bool {
        self.reconstructor.is_some() && !config.only_preproc && !config.only_postproc
    }

    fn initialize(&mut self, config: &PipelineConfig) -> Result<(), BoxError> {
        let input = self.source.shape().clone();
        let output = match &self.reconstructor {
            Some(reconstructor) if self.reconstructs(config) => reconstructor.output_shape(&input),
            _ => input.clone(),
        };
        if let Some(sink) = self.preproc_sink.as_mut() {
            sink.initialize(&input)?;
        }
        if config.only_preproc && self.preproc_sink.is_some() {
            // The pre-processed output has its own sink; the main one stays empty.
            return Ok(());
        }
        self.sink.initialize(&output)
    }

    /// Process the chunk selected by `config.indices`.
    pub fn process_chunk(
        &mut self,
        config: &PipelineConfig,
        progress: &dyn ProgressReporter,
    ) -> anyhow::Result<()> {
        if !self.initialized {
            self.initialize(config)
                .map_err(|e| stage_error("initializing output", e))?;
            self.initialized = true;
        }
        let range = config
            .indices
            .clone()
            .unwrap_or(0..self.source.shape().slices());
        let options = &config.parallel;

        let request = LoadRequest::new(config.load_strategy)
            .with_name("chunk")
            .with_indices(range.clone());
        let mut stack = load_stack_into_shared(self.source.as_ref(), &request, options, progress)?;

        for filter in &self.pre_filters {
            debug!("Pre-processing {}..{} with {}", range.start, range.end, filter.name());
            stack = filter.run(stack, options, progress)?;
        }
        if let Some(sink) = self.preproc_sink.as_mut() {
            sink.write_chunk(range.clone(), &stack)
                .map_err(|e| stage_error("saving pre-processed chunk", e))?;
        }
        if config.only_preproc {
            if self.preproc_sink.is_none() {
                self.sink
                    .write_chunk(range.clone(), &stack)
                    .map_err(|e| stage_error("saving pre-processed chunk", e))?;
            }
            info!("Pre-processing only, skipping reconstruction of {}..{}", range.start, range.end);
            return Ok(());
        }

        if self.reconstructs(config) {
            if let Some(reconstructor) = self.reconstructor.as_mut() {
                stack = reconstructor.reconstruct(
                    stack,
                    config.chunk_calibration.as_deref(),
                    options,
                    progress,
                )?;
            }
        }

        for filter in &self.post_filters {
            debug!("Post-processing {}..{} with {}", range.start, range.end, filter.name());
            stack = filter.run(stack, options, progress)?;
        }
        self.sink
            .write_chunk(range, &stack)
            .map_err(|e| stage_error("saving processed chunk", e))?;
        Ok(())
    }

    /// Finalize every sink.
    pub fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(sink) = self.preproc_sink.as_mut() {
            sink.finalize().map_err(|e| stage_error("finalizing pre-processed output", e))?;
        }
        self.sink.finalize().map_err(|e| stage_error("finalizing output", e))?;
        Ok(())
    }

    /// Plan the source against `config.memory` and process it chunk by chunk.
    ///
    /// Sinks are finalized even when a chunk fails, so output written for
    /// earlier chunks is kept.
    pub fn run(
        &mut self,
        config: &mut PipelineConfig,
        progress: &dyn ProgressReporter,
    ) -> ChunkResult<RunSummary> {
        config.validate()?;
        if config.axis != 0 {
            return Err(ChunkError::Config(format!(
                "staged pipelines traverse axis 0, not axis {}",
                config.axis
            )));
        }
        if config.dtype != T::DTYPE {
            return Err(ChunkError::DtypeMismatch {
                actual: T::DTYPE.to_string(),
                requested: config.dtype.to_string(),
            });
        }

        let budget = if self.reconstructs(config) {
            config.memory
        } else {
            config.memory.without_reconstruction()
        };
        let shape = self.source.shape().clone();
        let run = ChunkedRun::plan(&shape, 0, T::DTYPE, &budget)?;

        let result = run.run(
            config,
            |config: &PipelineConfig| self.process_chunk(config, progress),
            progress,
        );
        if let Err(e) = self.finish() {
            warn!("Failed to finalize output: {:#}", e);
            if result.is_ok() {
                return Err(ChunkError::Config(format!("finalizing output: {:#}", e)));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunked::{MemoryStackSink, MemoryStackSource};
    use crate::execution::loader::LoadStrategy;
    use crate::execution::progress::{NullProgress, ProgressTracker, ProgressUpdate};
    use crate::filters::builtin::{ClipValues, Scale};
    use crate::filters::FilterSpec;
    use anyhow::Context;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::ops::Range;
    use std::sync::Arc;

    /// Sink sharing its state with the test after the pipeline took ownership.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<MemoryStackSink<f32>>>);

    impl ChunkSink<f32> for SharedSink {
        fn initialize(&mut self, shape: &Shape) -> Result<(), BoxError> {
            self.0.lock().initialize(shape)
        }

        fn write_chunk(&mut self, range: Range<usize>, chunk: &SharedArray) -> Result<(), BoxError> {
            self.0.lock().write_chunk(range, chunk)
        }

        fn finalize(&mut self) -> Result<(), BoxError> {
            self.0.lock().finalize()
        }
    }

    impl SharedSink {
        fn data(&self) -> Vec<f32> {
            self.0.lock().data().map(|d| d.to_vec()).unwrap_or_default()
        }

        fn chunks(&self) -> Vec<Range<usize>> {
            self.0.lock().chunks_written().to_vec()
        }

        fn finalized(&self) -> bool {
            self.0.lock().is_finalized()
        }
    }

    fn source(slices: usize) -> Box<dyn SliceSource<f32>> {
        let shape = Shape::new([slices, 4, 4]).unwrap();
        let data = (0..shape.element_count()).map(|i| i as f32).collect();
        Box::new(MemoryStackSource::new(shape, data).unwrap())
    }

    fn small_chunks() -> PipelineConfig {
        let mut config = PipelineConfig::new();
        // 4 float32 slices of 4x4 per chunk with the reconstruction multiplier
        config.memory.budget_mb = 4.0 * 16.0 * 4.0 * 2.0 / (1024.0 * 1024.0);
        config.parallel = ParallelOptions::new().with_cores(2);
        config
    }

    /// Adds the slice's calibration value to every pixel.
    fn shift_by_calibration(
        mut chunk: SharedArray,
        calibration: Option<&[f64]>,
    ) -> anyhow::Result<SharedArray> {
        let calibration = calibration.context("missing calibration")?.to_vec();
        for (index, offset) in calibration.iter().enumerate() {
            for value in chunk.slice_mut::<f32>(index)? {
                *value += *offset as f32;
            }
        }
        Ok(chunk)
    }

    #[test]
    fn test_full_pipeline() {
        let _ = env_logger::builder().is_test(true).try_init();
        let sink = SharedSink::default();
        let preproc = SharedSink::default();
        let mut config = small_chunks().with_calibration(
            crate::pipeline::config::CalibrationPoints::new(vec![0], vec![1.0]),
        );

        let mut pipeline = StagedPipeline::new(source(16), Box::new(sink.clone()))
            .with_pre_filter(Scale::new(2.0))
            .with_reconstructor(shift_by_calibration)
            .with_post_filter(ClipValues::new(None, Some(100.0)))
            .with_preproc_sink(Box::new(preproc.clone()));

        let summary = pipeline.run(&mut config, &NullProgress).unwrap();

        assert_eq!(summary.chunks, 4);
        assert_eq!(sink.chunks(), vec![0..4, 4..8, 8..12, 12..16]);
        let expected: Vec<f32> = (0..256).map(|i| (i as f32 * 2.0 + 1.0).min(100.0)).collect();
        assert_eq!(sink.data(), expected);
        let scaled: Vec<f32> = (0..256).map(|i| i as f32 * 2.0).collect();
        assert_eq!(preproc.data(), scaled);
        assert!(sink.finalized() && preproc.finalized());
    }

    #[test]
    fn test_only_preproc_skips_reconstruction() {
        let sink = SharedSink::default();
        let mut config = small_chunks();
        config.only_preproc = true;

        let mut pipeline = StagedPipeline::new(source(8), Box::new(sink.clone()))
            .with_pre_filter(Scale::new(-1.0))
            .with_reconstructor(|_: SharedArray, _: Option<&[f64]>| -> anyhow::Result<SharedArray> {
                anyhow::bail!("reconstruction must not run")
            })
            .with_post_filter(Scale::new(10.0));

        pipeline.run(&mut config, &NullProgress).unwrap();
        let expected: Vec<f32> = (0..128).map(|i| -(i as f32)).collect();
        assert_eq!(sink.data(), expected);
    }

    #[test]
    fn test_only_postproc_skips_reconstruction() {
        let sink = SharedSink::default();
        let mut config = small_chunks();
        config.only_postproc = true;
        config.load_strategy = LoadStrategy::Parallel;

        let mut pipeline = StagedPipeline::new(source(8), Box::new(sink.clone()))
            .with_reconstructor(|_: SharedArray, _: Option<&[f64]>| -> anyhow::Result<SharedArray> {
                anyhow::bail!("reconstruction must not run")
            })
            .with_post_filter(Scale::new(0.5));

        let summary = pipeline.run(&mut config, &NullProgress).unwrap();
        // Without reconstruction each chunk may be twice as long.
        assert_eq!(summary.chunks, 1);
        let expected: Vec<f32> = (0..128).map(|i| i as f32 * 0.5).collect();
        assert_eq!(sink.data(), expected);
    }

    #[test]
    fn test_filters_from_config() {
        let sink = SharedSink::default();
        let mut config = small_chunks();
        config.pre_filters = vec![FilterSpec::new("clip_values").with_params(json!({ "clip_max": 10.0 }))];
        config.post_filters = vec![FilterSpec::new("scale").with_params(json!({ "factor": 3.0 }))];

        let registry = FilterRegistry::with_builtins();
        let mut pipeline =
            StagedPipeline::from_config(source(4), Box::new(sink.clone()), &config, &registry).unwrap();
        pipeline.run(&mut config, &NullProgress).unwrap();

        let expected: Vec<f32> = (0..64).map(|i| (i as f32).min(10.0) * 3.0).collect();
        assert_eq!(sink.data(), expected);

        config.pre_filters = vec![FilterSpec::new("unsharp_mask")];
        assert!(StagedPipeline::from_config(source(4), Box::new(SharedSink::default()), &config, &registry).is_err());
    }

    #[test]
    fn test_failing_chunk_keeps_earlier_output() {
        let sink = SharedSink::default();
        let mut config = small_chunks();
        let mut pipeline = StagedPipeline::new(source(12), Box::new(sink.clone())).with_reconstructor(
            |chunk: SharedArray, _: Option<&[f64]>| -> anyhow::Result<SharedArray> {
                if chunk.slice::<f32>(0)?[0] >= 128.0 {
                    anyhow::bail!("detector saturated");
                }
                Ok(chunk)
            },
        );

        let err = pipeline.run(&mut config, &NullProgress).unwrap_err();
        assert_eq!(err.completed_range(), Some(0..8));
        assert_eq!(sink.chunks(), vec![0..4, 4..8]);
        assert!(sink.finalized());
    }

    #[test]
    fn test_rejects_mismatched_config() {
        let mut pipeline = StagedPipeline::new(source(4), Box::new(SharedSink::default()));

        let mut config = small_chunks();
        config.dtype = crate::core::types::ElementDtype::Float64;
        assert!(matches!(
            pipeline.run(&mut config, &NullProgress),
            Err(ChunkError::DtypeMismatch { .. })
        ));

        let mut config = small_chunks();
        config.axis = 1;
        assert!(matches!(
            pipeline.run(&mut config, &NullProgress),
            Err(ChunkError::Config(_))
        ));
    }

    #[test]
    fn test_chunk_progress_survives_slice_tasks() {
        let (tracker, updates) = ProgressTracker::channel();
        let mut config = small_chunks();
        config.load_strategy = LoadStrategy::Parallel;
        let mut pipeline = StagedPipeline::new(source(16), Box::new(SharedSink::default()))
            .with_pre_filter(Scale::new(2.0));

        let summary = pipeline.run(&mut config, &tracker).unwrap();

        let completed: Vec<(String, usize)> = updates
            .try_iter()
            .filter_map(|update| match update {
                ProgressUpdate::Completed { task, steps, .. } => Some((task, steps)),
                _ => None,
            })
            .collect();
        assert!(completed.len() > summary.chunks);
        assert_eq!(
            completed.last(),
            Some(&("Chunks".to_string(), summary.chunks))
        );
        assert_eq!(tracker.completed_steps(), summary.chunks);
        assert_eq!(tracker.depth(), 0);
    }

    #[test]
    fn test_cancellation_stops_run() {
        let tracker = ProgressTracker::new();
        tracker.cancel();
        let sink = SharedSink::default();
        let mut pipeline = StagedPipeline::new(source(8), Box::new(sink.clone()));

        let err = pipeline.run(&mut small_chunks(), &tracker).unwrap_err();
        assert!(matches!(err, ChunkError::RunCancelled { .. }));
        assert!(sink.chunks().is_empty());
    }
}
