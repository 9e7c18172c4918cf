//! Sequential chunk loop around an external pipeline executable.
//!
//! The runner plans once, then calls the executable for each chunk range in
//! order. Nothing but the configuration is carried between calls, so peak
//! memory is bounded by a single chunk's working set. A failing chunk stops
//! the run; output already saved for earlier chunks stays where the
//! executable put it.

use crate::core::calibration::interpolate_calibration;
use crate::core::error::{ChunkError, ChunkResult};
use crate::core::planner::{plan_chunks, ChunkPlan, MemoryBudget};
use crate::core::types::{IntoDtype, Shape};
use crate::execution::progress::{NullProgress, ProgressReporter};
use crate::pipeline::config::ChunkConfig;
use log::{error, info, warn};
use std::time::{Duration, Instant};

/// Outcome of a completed chunked run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Plan that was executed.
    pub plan: ChunkPlan,
    /// Number of executable calls.
    pub chunks: usize,
    /// Wall time of the whole run.
    pub elapsed: Duration,
}

/// A planned run over one stack.
#[derive(Debug, Clone)]
pub struct ChunkedRun {
    shape: Shape,
    plan: ChunkPlan,
}

impl ChunkedRun {
    /// Plan a run of `shape` along `axis` within `budget`.
    pub fn plan(
        shape: &Shape,
        axis: usize,
        dtype: impl IntoDtype,
        budget: &MemoryBudget,
    ) -> ChunkResult<Self> {
        Ok(Self {
            shape: shape.clone(),
            plan: plan_chunks(shape, axis, dtype, budget)?,
        })
    }

    /// Run with an explicit plan, which must cover the stack along its axis.
    pub fn with_plan(shape: &Shape, plan: ChunkPlan) -> ChunkResult<Self> {
        let length = shape.len_along(plan.axis)?;
        if plan.axis_length() != length {
            return Err(ChunkError::DegenerateChunkPlan(format!(
                "plan covers {} slices, axis {} of {} has {}",
                plan.axis_length(),
                plan.axis,
                shape,
                length
            )));
        }
        Ok(Self {
            shape: shape.clone(),
            plan,
        })
    }

    /// The chunk plan.
    pub fn chunk_plan(&self) -> &ChunkPlan {
        &self.plan
    }

    /// Call `executable` once per chunk, strictly in order.
    ///
    /// Before each call the config is restricted to the chunk range and, when
    /// it carries calibration points, given the matching slice of the
    /// interpolated calibration.
    pub fn run<C, E>(
        &self,
        config: &mut C,
        mut executable: E,
        progress: &dyn ProgressReporter,
    ) -> ChunkResult<RunSummary>
    where
        C: ChunkConfig,
        E: FnMut(&C) -> anyhow::Result<()>,
    {
        let start = Instant::now();
        let length = self.plan.axis_length();
        let calibration = match config.calibration_points() {
            Some(points) => Some(interpolate_calibration(length, &points.slices, &points.values)?),
            None => None,
        };

        let total = self.plan.chunk_count();
        info!("Running {} in {} chunks", self.shape, total);
        progress.begin("Chunks", total);

        let mut done = 0;
        for (number, range) in self.plan.ranges().enumerate() {
            if progress.is_cancelled() {
                warn!("Run cancelled before chunk {}..{}", range.start, range.end);
                progress.end();
                return Err(ChunkError::RunCancelled { completed: 0..done });
            }

            info!(
                "Running chunk {}/{}: slices {}..{}",
                number + 1,
                total,
                range.start,
                range.end
            );
            config.set_indices(range.clone());
            if let Some(values) = &calibration {
                config.set_chunk_calibration(values[range.clone()].to_vec());
            }

            let chunk_start = Instant::now();
            if let Err(source) = executable(&*config) {
                error!("Chunk {}..{} failed: {:#}", range.start, range.end, source);
                progress.error(&source.to_string());
                progress.end();
                return Err(ChunkError::ChunkFailed {
                    attempted: range,
                    completed: 0..done,
                    source: source.into(),
                });
            }
            info!(
                "Finished chunk {}..{} in {:?}",
                range.start,
                range.end,
                chunk_start.elapsed()
            );
            done = range.end;
            progress.advance(1);
        }
        progress.end();

        Ok(RunSummary {
            plan: self.plan.clone(),
            chunks: total,
            elapsed: start.elapsed(),
        })
    }
}

/// Plan `shape` along `axis` with the reconstruction multiplier and run
/// `executable` once per chunk.
pub fn run_pipeline_in_chunks<C, E>(
    shape: &Shape,
    axis: usize,
    dtype: impl IntoDtype,
    budget_mb: f64,
    max_ratio: f64,
    executable: E,
    config: &mut C,
) -> ChunkResult<RunSummary>
where
    C: ChunkConfig,
    E: FnMut(&C) -> anyhow::Result<()>,
{
    ChunkedRun::plan(shape, axis, dtype, &MemoryBudget::new(budget_mb, max_ratio))?.run(
        config,
        executable,
        &NullProgress,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::progress::ProgressTracker;
    use crate::pipeline::config::{CalibrationPoints, PipelineConfig};
    use std::ops::Range;

    fn scenario_d() -> ChunkedRun {
        let shape = Shape::new([10, 4, 4]).unwrap();
        let plan = ChunkPlan::from_split(0, vec![0, 4, 7, 10]).unwrap();
        ChunkedRun::with_plan(&shape, plan).unwrap()
    }

    #[test]
    fn test_explicit_plan_runs_in_order() {
        let mut seen: Vec<Range<usize>> = Vec::new();
        let mut config = PipelineConfig::new();

        let summary = scenario_d()
            .run(
                &mut config,
                |config: &PipelineConfig| {
                    seen.push(config.indices.clone().unwrap());
                    Ok(())
                },
                &NullProgress,
            )
            .unwrap();

        assert_eq!(seen, vec![0..4, 4..7, 7..10]);
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.plan.split, vec![0, 4, 7, 10]);
    }

    #[test]
    fn test_call_count_matches_plan() {
        let shape = Shape::new([1000, 512, 512]).unwrap();
        let mut calls = 0;
        let mut covered = 0;
        let mut config = PipelineConfig::new();

        let summary = run_pipeline_in_chunks(
            &shape,
            0,
            "float32",
            512.0,
            1.0,
            |config: &PipelineConfig| {
                let range = config.indices.clone().unwrap();
                assert_eq!(range.start, covered);
                covered = range.end;
                calls += 1;
                Ok(())
            },
            &mut config,
        )
        .unwrap();

        assert_eq!(calls, summary.plan.chunk_count());
        assert_eq!(covered, 1000);
    }

    #[test]
    fn test_calibration_sliced_per_chunk() {
        let mut config =
            PipelineConfig::new().with_calibration(CalibrationPoints::new(vec![0, 9], vec![100.0, 109.0]));
        let mut chunks: Vec<Vec<f64>> = Vec::new();

        scenario_d()
            .run(
                &mut config,
                |config: &PipelineConfig| {
                    chunks.push(config.chunk_calibration.clone().unwrap());
                    Ok(())
                },
                &NullProgress,
            )
            .unwrap();

        assert_eq!(chunks[0], vec![100.0, 101.0, 102.0, 103.0]);
        assert_eq!(chunks[1], vec![104.0, 105.0, 106.0]);
        assert_eq!(chunks[2], vec![107.0, 108.0, 109.0]);
    }

    #[test]
    fn test_bad_calibration_fails_before_any_chunk() {
        let mut config =
            PipelineConfig::new().with_calibration(CalibrationPoints::new(vec![10], vec![1.0]));
        let mut calls = 0;
        let err = scenario_d()
            .run(
                &mut config,
                |_: &PipelineConfig| {
                    calls += 1;
                    Ok(())
                },
                &NullProgress,
            )
            .unwrap_err();
        assert!(matches!(err, ChunkError::InvalidCalibrationInput(_)));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_failure_reports_ranges() {
        let mut config = PipelineConfig::new();
        let mut calls = 0;
        let err = scenario_d()
            .run(
                &mut config,
                |config: &PipelineConfig| {
                    calls += 1;
                    if config.indices == Some(4..7) {
                        anyhow::bail!("reconstruction diverged");
                    }
                    Ok(())
                },
                &NullProgress,
            )
            .unwrap_err();

        assert_eq!(calls, 2);
        match err {
            ChunkError::ChunkFailed {
                attempted,
                completed,
                source,
            } => {
                assert_eq!(attempted, 4..7);
                assert_eq!(completed, 0..4);
                assert_eq!(source.to_string(), "reconstruction diverged");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_cancel_before_first_chunk() {
        let tracker = ProgressTracker::new();
        tracker.cancel();
        let mut config = PipelineConfig::new();
        let mut calls = 0;

        let err = scenario_d()
            .run(
                &mut config,
                |_: &PipelineConfig| {
                    calls += 1;
                    Ok(())
                },
                &tracker,
            )
            .unwrap_err();

        assert_eq!(calls, 0);
        assert_eq!(err.completed_range(), Some(0..0));
    }

    #[test]
    fn test_cancel_between_chunks() {
        let tracker = ProgressTracker::new();
        let mut config = PipelineConfig::new();

        let err = scenario_d()
            .run(
                &mut config,
                |config: &PipelineConfig| {
                    if config.indices == Some(0..4) {
                        tracker.cancel();
                    }
                    Ok(())
                },
                &tracker,
            )
            .unwrap_err();

        assert!(matches!(err, ChunkError::RunCancelled { .. }));
        assert_eq!(err.completed_range(), Some(0..4));
    }

    #[test]
    fn test_plan_must_match_shape() {
        let shape = Shape::new([12, 4]).unwrap();
        let plan = ChunkPlan::from_split(0, vec![0, 5, 10]).unwrap();
        assert!(matches!(
            ChunkedRun::with_plan(&shape, plan),
            Err(ChunkError::DegenerateChunkPlan(_))
        ));
    }
}
