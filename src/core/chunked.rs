//! Chunked stack sources and sinks.
//!
//! Stacks larger than memory are never materialized whole. A
//! [`SliceSource`] answers a cheap shape probe and decodes one axis-0 slice at
//! a time; a [`ChunkSink`] receives processed chunks independently, so output
//! written for earlier chunks survives a failure in a later one.
//!
//! File formats live outside this crate; they plug in by implementing these
//! traits.

use crate::core::error::{BoxError, ChunkError, ChunkResult};
use crate::core::shared::SharedArray;
use crate::core::types::{Element, Shape};
use std::ops::Range;

/// Trait for sources of already-decoded stack data.
pub trait SliceSource<T: Element>: Sync {
    /// Shape of the full stack, without loading pixel data.
    fn shape(&self) -> &Shape;

    /// Decode slice `index` into `out`, which holds exactly one slice.
    fn read_slice(&self, index: usize, out: &mut [T]) -> Result<(), BoxError>;
}

/// Trait for destinations of processed chunks.
pub trait ChunkSink<T: Element>: Send {
    /// Prepare the destination for a stack of `shape`.
    fn initialize(&mut self, shape: &Shape) -> Result<(), BoxError>;

    /// Write a processed chunk covering `range` of the full stack.
    fn write_chunk(&mut self, range: Range<usize>, chunk: &SharedArray) -> Result<(), BoxError>;

    /// Flush buffers, close files.
    fn finalize(&mut self) -> Result<(), BoxError>;
}

/// In-memory stack source.
#[derive(Debug, Clone)]
pub struct MemoryStackSource<T> {
    shape: Shape,
    data: Vec<T>,
}

impl<T: Element> MemoryStackSource<T> {
    /// Wrap `data`, which must hold exactly `shape.element_count()` elements.
    pub fn new(shape: Shape, data: Vec<T>) -> ChunkResult<Self> {
        if data.len() != shape.element_count() {
            return Err(ChunkError::InvalidShape {
                shape: shape.dims().to_vec(),
                reason: format!("{} elements supplied", data.len()),
            });
        }
        Ok(Self { shape, data })
    }

    /// The underlying elements.
    pub fn data(&self) -> &[T] {
        &self.data
    }
}

impl<T: Element> SliceSource<T> for MemoryStackSource<T> {
    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn read_slice(&self, index: usize, out: &mut [T]) -> Result<(), BoxError> {
        let len = self.shape.slice_len();
        let slice = self
            .data
            .get(index * len..(index + 1) * len)
            .ok_or_else(|| format!("slice {} outside stack of {}", index, self.shape.slices()))?;
        out.copy_from_slice(slice);
        Ok(())
    }
}

/// Source backed by a per-slice loader function.
pub struct FnSliceSource<F> {
    shape: Shape,
    loader: F,
}

impl<F> FnSliceSource<F> {
    /// Create a source reading slices through `loader(index, out)`.
    pub fn new(shape: Shape, loader: F) -> Self {
        Self { shape, loader }
    }
}

impl<T, F> SliceSource<T> for FnSliceSource<F>
where
    T: Element,
    F: Fn(usize, &mut [T]) -> Result<(), BoxError> + Sync,
{
    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn read_slice(&self, index: usize, out: &mut [T]) -> Result<(), BoxError> {
        (self.loader)(index, out)
    }
}

/// In-memory sink that assembles chunks into a full stack.
#[derive(Debug, Default)]
pub struct MemoryStackSink<T> {
    output: Option<Vec<T>>,
    shape: Option<Shape>,
    chunks_written: Vec<Range<usize>>,
    finalized: bool,
}

impl<T: Element> MemoryStackSink<T> {
    /// Create a new memory sink.
    pub fn new() -> Self {
        Self {
            output: None,
            shape: None,
            chunks_written: Vec::new(),
            finalized: false,
        }
    }

    /// Ranges written so far, in write order.
    pub fn chunks_written(&self) -> &[Range<usize>] {
        &self.chunks_written
    }

    /// Whether `finalize` was called.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The assembled stack.
    pub fn data(&self) -> Option<&[T]> {
        self.output.as_deref()
    }
}

impl<T: Element> ChunkSink<T> for MemoryStackSink<T> {
    fn initialize(&mut self, shape: &Shape) -> Result<(), BoxError> {
        self.output = Some(vec![T::zeroed(); shape.element_count()]);
        self.shape = Some(shape.clone());
        Ok(())
    }

    fn write_chunk(&mut self, range: Range<usize>, chunk: &SharedArray) -> Result<(), BoxError> {
        let (output, shape) = match (self.output.as_mut(), self.shape.as_ref()) {
            (Some(output), Some(shape)) => (output, shape),
            _ => return Err("sink not initialized".into()),
        };
        if range.start > range.end || range.end > shape.slices() {
            return Err(format!(
                "range {}..{} is outside the {} slices of the output",
                range.start,
                range.end,
                shape.slices()
            )
            .into());
        }
        let len = shape.slice_len();
        if chunk.slices() != range.len() || chunk.shape().slice_len() != len {
            return Err(format!(
                "chunk of shape {} does not fit range {}..{}",
                chunk.shape(),
                range.start,
                range.end
            )
            .into());
        }
        output[range.start * len..range.end * len].copy_from_slice(chunk.as_slice::<T>()?);
        self.chunks_written.push(range);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BoxError> {
        self.finalized = true;
        Ok(())
    }
}
