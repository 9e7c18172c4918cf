//! Core value types describing image stacks.
//!
//! The dtype system uses a closed enum:
//! - Closed set of types: tomography stacks come in six element formats
//! - One parsing table at the boundary for legacy string tags
//! - Serialization: serde handles enums natively
//! - Typed access goes through the [`Element`] trait, so a buffer can only be
//!   viewed as the Rust type that matches its dtype

use crate::core::error::{ChunkError, ChunkResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered tuple of positive dimension sizes, typically (slices, height, width).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a shape, rejecting empty shapes, zero-length dimensions and
    /// shapes whose element count does not fit in `usize`.
    pub fn new(dims: impl Into<Vec<usize>>) -> ChunkResult<Self> {
        let dims = dims.into();
        if dims.is_empty() {
            return Err(ChunkError::InvalidShape {
                shape: dims,
                reason: "shape has no dimensions".to_string(),
            });
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(ChunkError::InvalidShape {
                shape: dims,
                reason: "every dimension must be positive".to_string(),
            });
        }
        if dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).is_none() {
            return Err(ChunkError::InvalidShape {
                shape: dims,
                reason: "element count overflows usize".to_string(),
            });
        }
        Ok(Self(dims))
    }

    /// Dimension sizes.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Fail with `InvalidAxis` unless `axis` indexes a dimension.
    pub fn check_axis(&self, axis: usize) -> ChunkResult<()> {
        if axis >= self.rank() {
            return Err(ChunkError::InvalidAxis {
                axis,
                rank: self.rank(),
            });
        }
        Ok(())
    }

    /// Length along `axis`.
    pub fn len_along(&self, axis: usize) -> ChunkResult<usize> {
        self.check_axis(axis)?;
        Ok(self.0[axis])
    }

    /// Number of slices along axis 0.
    pub fn slices(&self) -> usize {
        self.0[0]
    }

    /// Elements in a single axis-0 slice.
    pub fn slice_len(&self) -> usize {
        self.0[1..].iter().product()
    }

    /// Total number of elements.
    pub fn element_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Copy of this shape with the length along `axis` replaced.
    pub fn with_axis_len(&self, axis: usize, len: usize) -> ChunkResult<Shape> {
        self.check_axis(axis)?;
        let mut dims = self.0.clone();
        dims[axis] = len;
        Shape::new(dims)
    }
}

impl TryFrom<Vec<usize>> for Shape {
    type Error = ChunkError;

    fn try_from(dims: Vec<usize>) -> Result<Self, Self::Error> {
        Shape::new(dims)
    }
}

impl From<Shape> for Vec<usize> {
    fn from(shape: Shape) -> Self {
        shape.0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "({})", dims.join(", "))
    }
}

/// Element format of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ElementDtype {
    Int16,
    Float16,
    Int32,
    Float32,
    Int64,
    Float64,
}

impl ElementDtype {
    /// Every supported dtype.
    pub const ALL: [ElementDtype; 6] = [
        ElementDtype::Int16,
        ElementDtype::Float16,
        ElementDtype::Int32,
        ElementDtype::Float32,
        ElementDtype::Int64,
        ElementDtype::Float64,
    ];

    /// Bit width of one element.
    pub fn bits(self) -> usize {
        match self {
            ElementDtype::Int16 | ElementDtype::Float16 => 16,
            ElementDtype::Int32 | ElementDtype::Float32 => 32,
            ElementDtype::Int64 | ElementDtype::Float64 => 64,
        }
    }

    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        self.bits() / 8
    }

    /// Whether this is a floating point format.
    pub fn is_float(self) -> bool {
        matches!(
            self,
            ElementDtype::Float16 | ElementDtype::Float32 | ElementDtype::Float64
        )
    }

    /// Canonical lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            ElementDtype::Int16 => "int16",
            ElementDtype::Float16 => "float16",
            ElementDtype::Int32 => "int32",
            ElementDtype::Float32 => "float32",
            ElementDtype::Int64 => "int64",
            ElementDtype::Float64 => "float64",
        }
    }

    /// Resolve a legacy string tag.
    ///
    /// Accepts the canonical names, an optional `np.` prefix, and the bare
    /// bit widths `"16"`, `"32"` and `"64"`, which resolve to float formats.
    pub fn parse_legacy(tag: &str) -> ChunkResult<Self> {
        let normalized = tag.trim().to_ascii_lowercase();
        let normalized = normalized.strip_prefix("np.").unwrap_or(&normalized);
        let dtype = match normalized {
            "int16" => ElementDtype::Int16,
            "float16" | "16" => ElementDtype::Float16,
            "int32" => ElementDtype::Int32,
            "float32" | "32" => ElementDtype::Float32,
            "int64" => ElementDtype::Int64,
            "float64" | "64" => ElementDtype::Float64,
            _ => return Err(ChunkError::UnresolvedDtype(tag.to_string())),
        };
        Ok(dtype)
    }
}

impl Default for ElementDtype {
    fn default() -> Self {
        ElementDtype::Float32
    }
}

impl fmt::Display for ElementDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementDtype {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ElementDtype::parse_legacy(s)
    }
}

impl TryFrom<String> for ElementDtype {
    type Error = ChunkError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        ElementDtype::parse_legacy(&tag)
    }
}

impl From<ElementDtype> for String {
    fn from(dtype: ElementDtype) -> Self {
        dtype.name().to_string()
    }
}

/// Anything that can be resolved to an [`ElementDtype`].
pub trait IntoDtype {
    /// Resolve to a concrete dtype.
    fn into_dtype(self) -> ChunkResult<ElementDtype>;
}

impl IntoDtype for ElementDtype {
    fn into_dtype(self) -> ChunkResult<ElementDtype> {
        Ok(self)
    }
}

impl IntoDtype for &str {
    fn into_dtype(self) -> ChunkResult<ElementDtype> {
        ElementDtype::parse_legacy(self)
    }
}

impl IntoDtype for &String {
    fn into_dtype(self) -> ChunkResult<ElementDtype> {
        ElementDtype::parse_legacy(self)
    }
}

impl IntoDtype for String {
    fn into_dtype(self) -> ChunkResult<ElementDtype> {
        ElementDtype::parse_legacy(&self)
    }
}

/// Rust element type backing one [`ElementDtype`].
pub trait Element: bytemuck::Pod + PartialOrd + fmt::Debug + Send + Sync + 'static {
    /// The dtype this Rust type represents.
    const DTYPE: ElementDtype;

    /// Widen to f64.
    fn to_f64(self) -> f64;

    /// Narrow from f64, saturating for integer formats.
    fn from_f64(value: f64) -> Self;
}

impl Element for i16 {
    const DTYPE: ElementDtype = ElementDtype::Int16;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as i16
    }
}

impl Element for half::f16 {
    const DTYPE: ElementDtype = ElementDtype::Float16;

    fn to_f64(self) -> f64 {
        half::f16::to_f64(self)
    }

    fn from_f64(value: f64) -> Self {
        half::f16::from_f64(value)
    }
}

impl Element for i32 {
    const DTYPE: ElementDtype = ElementDtype::Int32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as i32
    }
}

impl Element for f32 {
    const DTYPE: ElementDtype = ElementDtype::Float32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Element for i64 {
    const DTYPE: ElementDtype = ElementDtype::Int64;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as i64
    }
}

impl Element for f64 {
    const DTYPE: ElementDtype = ElementDtype::Float64;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}
