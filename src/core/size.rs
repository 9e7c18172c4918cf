//! Memory footprint estimation for stacks.
//!
//! Sizes are computed from shape and dtype alone, so a plan can be built from
//! a cheap shape probe without loading any data.

use crate::core::error::ChunkResult;
use crate::core::types::{IntoDtype, Shape};

const BYTES_PER_KB: f64 = 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Element count of one traversal unit: the product of every dimension
/// except `axis`.
pub fn single_size(shape: &Shape, axis: usize) -> ChunkResult<usize> {
    shape.check_axis(axis)?;
    Ok(shape
        .dims()
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != axis)
        .map(|(_, &d)| d)
        .product())
}

/// Size of the whole stack in bytes.
pub fn full_size_bytes(shape: &Shape, axis: usize, dtype: impl IntoDtype) -> ChunkResult<f64> {
    let dtype = dtype.into_dtype()?;
    let single_bits = single_size(shape, axis)? as f64 * dtype.bits() as f64;
    Ok(shape.dims()[axis] as f64 * single_bits / 8.0)
}

/// Size of the whole stack in kilobytes.
pub fn full_size_kb(shape: &Shape, axis: usize, dtype: impl IntoDtype) -> ChunkResult<f64> {
    Ok(full_size_bytes(shape, axis, dtype)? / BYTES_PER_KB)
}

/// Size of the whole stack in megabytes.
pub fn full_size_mb(shape: &Shape, axis: usize, dtype: impl IntoDtype) -> ChunkResult<f64> {
    Ok(full_size_bytes(shape, axis, dtype)? / BYTES_PER_MB)
}
