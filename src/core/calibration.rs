//! Dense per-slice calibration from sparse samples.
//!
//! Calibration values such as the centre of rotation are measured at a few
//! slices and interpolated linearly in between. Outside the measured range
//! the nearest measured value is held constant.

use crate::core::error::{ChunkError, ChunkResult};

/// Interpolate calibration values for every slice `0..length`.
///
/// Known points need not be sorted. A single known point yields a constant
/// array.
///
/// # Example
///
/// ```
/// use tomochunk::core::calibration::interpolate_calibration;
///
/// let values = interpolate_calibration(5, &[0, 4], &[10.0, 14.0]).unwrap();
/// assert_eq!(values, vec![10.0, 11.0, 12.0, 13.0, 14.0]);
/// ```
pub fn interpolate_calibration(
    length: usize,
    known_indices: &[usize],
    known_values: &[f64],
) -> ChunkResult<Vec<f64>> {
    let points = known_points(length, known_indices, known_values)?;

    let mut values = Vec::with_capacity(length);
    let mut segment = 0;
    for slice in 0..length {
        while segment + 1 < points.len() && points[segment + 1].0 <= slice {
            segment += 1;
        }
        let (left_index, left_value) = points[segment];
        let value = match points.get(segment + 1) {
            Some(&(right_index, right_value)) if slice > left_index => {
                let t = (slice - left_index) as f64 / (right_index - left_index) as f64;
                left_value + t * (right_value - left_value)
            }
            // At or before the first point, or past the last one.
            _ => left_value,
        };
        values.push(value);
    }
    Ok(values)
}

fn known_points(
    length: usize,
    known_indices: &[usize],
    known_values: &[f64],
) -> ChunkResult<Vec<(usize, f64)>> {
    if known_indices.is_empty() {
        return Err(ChunkError::InvalidCalibrationInput(
            "at least one known point is required".to_string(),
        ));
    }
    if known_indices.len() != known_values.len() {
        return Err(ChunkError::InvalidCalibrationInput(format!(
            "{} indices but {} values",
            known_indices.len(),
            known_values.len()
        )));
    }
    if let Some(&index) = known_indices.iter().find(|&&i| i >= length) {
        return Err(ChunkError::InvalidCalibrationInput(format!(
            "index {} outside 0..{}",
            index, length
        )));
    }
    if let Some(value) = known_values.iter().find(|v| !v.is_finite()) {
        return Err(ChunkError::InvalidCalibrationInput(format!(
            "value {} is not finite",
            value
        )));
    }

    let mut points: Vec<(usize, f64)> = known_indices
        .iter()
        .copied()
        .zip(known_values.iter().copied())
        .collect();
    points.sort_by_key(|&(index, _)| index);
    if let Some(pair) = points.windows(2).find(|pair| pair[0].0 == pair[1].0) {
        return Err(ChunkError::InvalidCalibrationInput(format!(
            "index {} given more than once",
            pair[0].0
        )));
    }
    Ok(points)
}

/// Per-slice calibration implied by a tilted rotation axis.
///
/// The value changes by `tan(tilt_rad)` per slice, starting from
/// `value_at_zero` at slice 0.
pub fn calibration_from_tilt(
    length: usize,
    tilt_rad: f64,
    value_at_zero: f64,
) -> ChunkResult<Vec<f64>> {
    if !tilt_rad.is_finite() || !value_at_zero.is_finite() {
        return Err(ChunkError::InvalidCalibrationInput(format!(
            "tilt {} and value {} must be finite",
            tilt_rad, value_at_zero
        )));
    }
    if length == 0 {
        return Ok(Vec::new());
    }
    let last = length - 1;
    let value_at_last = value_at_zero + tilt_rad.tan() * last as f64;
    if last == 0 {
        return Ok(vec![value_at_zero]);
    }
    interpolate_calibration(length, &[0, last], &[value_at_zero, value_at_last])
}
