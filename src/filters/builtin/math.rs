//! Value-mapping filters.

use crate::core::error::BoxError;
use crate::core::types::Element;
use crate::filters::registry::FilterRegistry;
use crate::filters::SliceFilter;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Register math filters.
pub fn register<T: Element>(registry: &mut FilterRegistry<T>) {
    registry.register("scale", |params: &Value| {
        let filter: Scale = serde_json::from_value(params.clone())?;
        Ok(Box::new(filter) as Box<dyn SliceFilter<T>>)
    });
    registry.register("clip_values", |params: &Value| {
        let filter: ClipValues = serde_json::from_value(params.clone())?;
        Ok(Box::new(filter) as Box<dyn SliceFilter<T>>)
    });
}

/// Multiply every value by a constant factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    /// Multiplier applied to every value.
    pub factor: f64,
}

impl Scale {
    /// Create a scale filter.
    pub fn new(factor: f64) -> Self {
        Self { factor }
    }
}

impl<T: Element> SliceFilter<T> for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn apply(&self, src: &[T], dst: &mut [T]) -> Result<(), BoxError> {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = T::from_f64(s.to_f64() * self.factor);
        }
        Ok(())
    }
}

/// Clip values below `clip_min` and above `clip_max`.
///
/// A missing bound leaves that side untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipValues {
    /// Lower bound.
    pub clip_min: Option<f64>,
    /// Upper bound.
    pub clip_max: Option<f64>,
}

impl ClipValues {
    /// Create a clip filter.
    pub fn new(clip_min: Option<f64>, clip_max: Option<f64>) -> Self {
        Self { clip_min, clip_max }
    }
}

impl<T: Element> SliceFilter<T> for ClipValues {
    fn name(&self) -> &str {
        "clip_values"
    }

    fn apply(&self, src: &[T], dst: &mut [T]) -> Result<(), BoxError> {
        if let (Some(min), Some(max)) = (self.clip_min, self.clip_max) {
            if min > max {
                return Err(format!("clip_min {} is above clip_max {}", min, max).into());
            }
        }
        let low = self.clip_min.map(T::from_f64);
        let high = self.clip_max.map(T::from_f64);
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = match (low, high) {
                (Some(low), _) if s < low => low,
                (_, Some(high)) if s > high => high,
                _ => s,
            };
        }
        Ok(())
    }
}
