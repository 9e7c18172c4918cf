//! Pipeline configuration.
//!
//! [`PipelineConfig`] is the unit handed to a pipeline executable. The chunk
//! runner rewrites its per-chunk fields (`indices` and the sliced
//! calibration) before every call; everything else is read from TOML or JSON
//! files.

use crate::core::error::{ChunkError, ChunkResult};
use crate::core::planner::MemoryBudget;
use crate::core::types::ElementDtype;
use crate::execution::loader::LoadStrategy;
use crate::execution::parallel::ParallelOptions;
use crate::filters::FilterSpec;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;

/// What a chunk runner needs from a pipeline configuration.
pub trait ChunkConfig {
    /// Restrict the next executable call to `indices` along the traversal axis.
    fn set_indices(&mut self, indices: Range<usize>);

    /// Sparse calibration measurements to interpolate, if any.
    fn calibration_points(&self) -> Option<&CalibrationPoints> {
        None
    }

    /// Dense calibration for the current chunk only.
    fn set_chunk_calibration(&mut self, _values: Vec<f64>) {}
}

/// Calibration values known at a few slices.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationPoints {
    /// Slice indices with a measured value.
    pub slices: Vec<usize>,
    /// Measured values, one per entry of `slices`.
    pub values: Vec<f64>,
}

impl CalibrationPoints {
    /// Create from parallel index and value lists.
    pub fn new(slices: Vec<usize>, values: Vec<f64>) -> Self {
        Self { slices, values }
    }
}

/// Full configuration of one chunked pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Traversal axis.
    pub axis: usize,
    /// Element type of the loaded stack.
    pub dtype: ElementDtype,
    /// Per-chunk memory budget.
    pub memory: MemoryBudget,
    /// Worker pool options.
    pub parallel: ParallelOptions,
    /// How chunk data is loaded.
    pub load_strategy: LoadStrategy,
    /// Sparse calibration, interpolated over the whole stack.
    pub calibration: Option<CalibrationPoints>,
    /// Filters applied before reconstruction.
    pub pre_filters: Vec<FilterSpec>,
    /// Filters applied after reconstruction.
    pub post_filters: Vec<FilterSpec>,
    /// Stop after pre-processing.
    pub only_preproc: bool,
    /// Skip reconstruction and run only post-processing.
    pub only_postproc: bool,
    /// Slices handled by the current call; the whole stack when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indices: Option<Range<usize>>,
    /// Calibration of the current chunk, set by the runner.
    #[serde(skip)]
    pub chunk_calibration: Option<Vec<f64>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            axis: 0,
            dtype: ElementDtype::default(),
            memory: MemoryBudget::default(),
            parallel: ParallelOptions::default(),
            load_strategy: LoadStrategy::default(),
            calibration: None,
            pre_filters: Vec::new(),
            post_filters: Vec::new(),
            only_preproc: false,
            only_postproc: false,
            indices: None,
            chunk_calibration: None,
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory budget.
    pub fn with_memory(mut self, memory: MemoryBudget) -> Self {
        self.memory = memory;
        self
    }

    /// Set the worker pool options.
    pub fn with_parallel(mut self, parallel: ParallelOptions) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set sparse calibration points.
    pub fn with_calibration(mut self, calibration: CalibrationPoints) -> Self {
        self.calibration = Some(calibration);
        self
    }

    /// Parse from TOML.
    pub fn from_toml_str(text: &str) -> ChunkResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ChunkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from JSON.
    pub fn from_json_str(text: &str) -> ChunkResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ChunkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or TOML for any other extension.
    pub fn from_file(path: impl AsRef<Path>) -> ChunkResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ChunkError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> ChunkResult<String> {
        toml::to_string(self).map_err(|e| ChunkError::Config(e.to_string()))
    }

    /// Check option combinations that cannot run.
    pub fn validate(&self) -> ChunkResult<()> {
        self.memory.validate()?;
        self.parallel.validate()?;
        if self.only_preproc && self.only_postproc {
            return Err(ChunkError::Config(
                "only_preproc and only_postproc are mutually exclusive".to_string(),
            ));
        }
        if let Some(calibration) = &self.calibration {
            if calibration.slices.len() != calibration.values.len() {
                return Err(ChunkError::InvalidCalibrationInput(format!(
                    "{} slices but {} values",
                    calibration.slices.len(),
                    calibration.values.len()
                )));
            }
        }
        Ok(())
    }
}

impl ChunkConfig for PipelineConfig {
    fn set_indices(&mut self, indices: Range<usize>) {
        self.indices = Some(indices);
    }

    fn calibration_points(&self) -> Option<&CalibrationPoints> {
        self.calibration.as_ref()
    }

    fn set_chunk_calibration(&mut self, values: Vec<f64>) {
        self.chunk_calibration = Some(values);
    }
}
