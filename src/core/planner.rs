//! Memory-budget-aware chunk planning.
//!
//! A stack is split along a traversal axis into contiguous chunks whose
//! estimated working footprint stays within a memory budget:
//! - The footprint of a chunk is its raw size times a working multiplier
//!   (2 for reconstruction: input and output of equal size)
//! - Boundaries are evenly spaced integers over `[0, length]`
//! - The number of boundaries grows until the longest chunk fits
//!
//! # Example
//!
//! ```
//! use tomochunk::core::planner::compute_chunk_plan;
//! use tomochunk::core::types::Shape;
//!
//! let shape = Shape::new([1000, 512, 512]).unwrap();
//! let plan = compute_chunk_plan(&shape, 0, "float32", 512.0, 1.0).unwrap();
//! assert_eq!(plan.split.first(), Some(&0));
//! assert_eq!(plan.split.last(), Some(&1000));
//! ```

use crate::core::error::{ChunkError, ChunkResult};
use crate::core::size::full_size_mb;
use crate::core::types::{ElementDtype, IntoDtype, Shape};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Default chunk budget (500 MB)
pub const DEFAULT_BUDGET_MB: f64 = 500.0;

/// Working-memory multiplier when a reconstruction output of equal size is held.
pub const RECONSTRUCTION_MULTIPLIER: f64 = 2.0;

/// Memory limits for a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBudget {
    /// Maximum megabytes for one chunk's buffer.
    pub budget_mb: f64,
    /// Maximum allowed ratio of estimated footprint to budget.
    pub max_ratio: f64,
    /// Multiplier for transient working memory.
    pub working_multiplier: f64,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            budget_mb: DEFAULT_BUDGET_MB,
            max_ratio: 1.0,
            working_multiplier: RECONSTRUCTION_MULTIPLIER,
        }
    }
}

impl MemoryBudget {
    /// Create a budget with the reconstruction multiplier.
    pub fn new(budget_mb: f64, max_ratio: f64) -> Self {
        Self {
            budget_mb,
            max_ratio,
            working_multiplier: RECONSTRUCTION_MULTIPLIER,
        }
    }

    /// Set the working-memory multiplier.
    pub fn with_working_multiplier(mut self, multiplier: f64) -> Self {
        self.working_multiplier = multiplier;
        self
    }

    /// Only account for the chunk itself, no reconstruction output.
    pub fn without_reconstruction(self) -> Self {
        self.with_working_multiplier(1.0)
    }

    /// Reject budgets that would make planning loop forever.
    pub fn validate(&self) -> ChunkResult<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.budget_mb) {
            return Err(ChunkError::DegenerateChunkPlan(format!(
                "budget must be a positive number of MB, got {}",
                self.budget_mb
            )));
        }
        if !positive(self.max_ratio) {
            return Err(ChunkError::DegenerateChunkPlan(format!(
                "max ratio must be positive, got {}",
                self.max_ratio
            )));
        }
        if !positive(self.working_multiplier) {
            return Err(ChunkError::DegenerateChunkPlan(format!(
                "working multiplier must be positive, got {}",
                self.working_multiplier
            )));
        }
        Ok(())
    }

    /// Estimated footprint of `size_mb` relative to the budget.
    pub fn ratio(&self, size_mb: f64) -> f64 {
        size_mb * self.working_multiplier / self.budget_mb
    }
}

/// Boundaries of the chunks along one axis.
///
/// `split` is ascending, starts at 0 and ends at the axis length; every
/// adjacent pair is one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    /// Axis the stack is traversed along.
    pub axis: usize,
    /// Chunk boundaries.
    pub split: Vec<usize>,
    /// Nominal chunk length.
    pub step: usize,
}

impl ChunkPlan {
    /// Build a plan from explicit boundaries.
    pub fn from_split(axis: usize, split: Vec<usize>) -> ChunkResult<Self> {
        if split.len() < 2 || split[0] != 0 {
            return Err(ChunkError::DegenerateChunkPlan(format!(
                "boundaries must start at 0 and contain at least two points, got {:?}",
                split
            )));
        }
        if split.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ChunkError::DegenerateChunkPlan(format!(
                "boundaries must be strictly ascending, got {:?}",
                split
            )));
        }
        let step = split[split.len() - 1] / (split.len() - 1);
        Ok(Self { axis, split, step })
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.split.len() - 1
    }

    /// Length of the traversed axis.
    pub fn axis_length(&self) -> usize {
        self.split[self.split.len() - 1]
    }

    /// Chunk index ranges in traversal order.
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.split.windows(2).map(|w| w[0]..w[1])
    }

    /// Length of the longest chunk.
    pub fn longest_chunk(&self) -> usize {
        self.ranges().map(|r| r.len()).max().unwrap_or(0)
    }
}

/// Evenly spaced integer boundaries over `[0, length]`, both ends included.
fn even_boundaries(length: usize, points: usize) -> Vec<usize> {
    let intervals = (points - 1) as u128;
    (0..points)
        .map(|i| ((i as u128 * length as u128) / intervals) as usize)
        .map(|b| b.min(length))
        .collect()
}

/// Plan chunks along `axis` so each chunk satisfies the budget.
pub fn plan_chunks(
    shape: &Shape,
    axis: usize,
    dtype: impl IntoDtype,
    budget: &MemoryBudget,
) -> ChunkResult<ChunkPlan> {
    let length = shape.len_along(axis)?;
    let dtype: ElementDtype = dtype.into_dtype()?;
    budget.validate()?;

    let chunk_ratio = |chunk_len: usize| -> ChunkResult<f64> {
        let chunk_shape = shape.with_axis_len(axis, chunk_len)?;
        Ok(budget.ratio(full_size_mb(&chunk_shape, axis, dtype)?))
    };

    // No number of boundaries can help if one traversal unit is already too big.
    let unit_ratio = chunk_ratio(1)?;
    if unit_ratio > budget.max_ratio {
        return Err(ChunkError::DegenerateChunkPlan(format!(
            "a single unit along axis {} has ratio {:.3}, above the maximum {}",
            axis, unit_ratio, budget.max_ratio
        )));
    }

    let full_mb = full_size_mb(shape, axis, dtype)?;
    let mut points = budget.ratio(full_mb).ceil() as usize;
    // A single boundary point has no interval; treat the whole axis as one chunk.
    if points <= 1 {
        points = 2;
    }
    points = points.min(length + 1);

    loop {
        let split = even_boundaries(length, points);
        let longest = split.windows(2).map(|w| w[1] - w[0]).max().unwrap_or(length);
        let ratio = chunk_ratio(longest)?;

        if ratio <= budget.max_ratio {
            let step = length / (points - 1);
            info!(
                "Data step: {}, with a ratio to memory: {:.3}, chunks: {}",
                step,
                ratio,
                points - 1
            );
            return Ok(ChunkPlan { axis, split, step });
        }

        debug!(
            "Chunk ratio {:.3} exceeds {} with {} boundaries, splitting further",
            ratio, budget.max_ratio, points
        );
        points += 1;
    }
}

/// Plan chunks using the reconstruction multiplier.
pub fn compute_chunk_plan(
    shape: &Shape,
    axis: usize,
    dtype: impl IntoDtype,
    budget_mb: f64,
    max_ratio: f64,
) -> ChunkResult<ChunkPlan> {
    plan_chunks(shape, axis, dtype, &MemoryBudget::new(budget_mb, max_ratio))
}
