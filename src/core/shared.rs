//! Shared-memory stacks.
//!
//! A [`SharedArray`] owns an anonymous shared OS mapping holding one
//! (shape, dtype) tensor. Workers never own or free the mapping: they borrow
//! disjoint axis-0 regions of it for the duration of a single parallel call,
//! and the owner frees it on drop once no borrow remains.

use crate::core::error::{ChunkError, ChunkResult};
use crate::core::types::{Element, ElementDtype, IntoDtype, Shape};
use log::{debug, info};
use memmap2::MmapMut;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Prefix shared by every array created in this process.
fn instance_prefix() -> &'static str {
    static PREFIX: OnceLock<String> = OnceLock::new();
    PREFIX.get_or_init(|| Uuid::new_v4().to_string())
}

/// Unique name for a new shared array, optionally tagged with a label.
pub fn create_shared_name(label: Option<&str>) -> String {
    match label {
        Some(label) => format!("{}-{}-{}", instance_prefix(), Uuid::new_v4(), label),
        None => format!("{}-{}", instance_prefix(), Uuid::new_v4()),
    }
}

/// Memory tracker for shared allocations.
///
/// Arrays created through [`SharedArray::create_tracked`] reserve their size
/// here and release it when dropped.
#[derive(Debug)]
pub struct MemoryTracker {
    /// Current memory usage in bytes.
    current: AtomicUsize,
    /// Peak memory usage in bytes.
    peak: AtomicUsize,
    /// Memory limit in bytes.
    limit: usize,
}

impl MemoryTracker {
    /// Create a new memory tracker with the given limit.
    pub fn new(limit: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit,
        }
    }

    /// Create a tracker limited to `mb` megabytes, wrapped for sharing.
    pub fn with_limit_mb(mb: f64) -> Arc<Self> {
        Arc::new(Self::new((mb * 1024.0 * 1024.0) as usize))
    }

    /// Try to reserve memory. Returns true if successful.
    pub fn try_allocate(&self, bytes: usize) -> bool {
        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(next) if next <= self.limit => next,
                _ => return false,
            };
            match self.current.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::SeqCst);
                    return true;
                }
                Err(c) => current = c,
            }
        }
    }

    /// Release reserved memory.
    pub fn release(&self, bytes: usize) {
        self.current.fetch_sub(bytes, Ordering::SeqCst);
    }

    /// Get current memory usage.
    pub fn current_usage(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Get peak memory usage.
    pub fn peak_usage(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Get remaining available memory.
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.current.load(Ordering::Relaxed))
    }

    /// Get the memory limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// A tensor living in a shared memory mapping.
pub struct SharedArray {
    name: String,
    shape: Shape,
    dtype: ElementDtype,
    map: MmapMut,
    tracker: Option<Arc<MemoryTracker>>,
}

impl SharedArray {
    /// Allocate a zero-initialized shared array.
    pub fn create(shape: &Shape, dtype: impl IntoDtype) -> ChunkResult<Self> {
        Self::allocate(shape, dtype.into_dtype()?, None, None)
    }

    /// Allocate a zero-initialized shared array whose name carries `label`.
    pub fn create_named(shape: &Shape, dtype: impl IntoDtype, label: &str) -> ChunkResult<Self> {
        Self::allocate(shape, dtype.into_dtype()?, Some(label), None)
    }

    /// Allocate against a memory tracker, failing if the tracker's limit
    /// would be exceeded.
    pub fn create_tracked(
        shape: &Shape,
        dtype: impl IntoDtype,
        label: Option<&str>,
        tracker: &Arc<MemoryTracker>,
    ) -> ChunkResult<Self> {
        Self::allocate(shape, dtype.into_dtype()?, label, Some(tracker.clone()))
    }

    /// Allocate a shared array holding a copy of `data`.
    pub fn from_slice<T: Element>(shape: &Shape, data: &[T]) -> ChunkResult<Self> {
        if data.len() != shape.element_count() {
            return Err(ChunkError::InvalidShape {
                shape: shape.dims().to_vec(),
                reason: format!("{} elements supplied", data.len()),
            });
        }
        let mut array = Self::create(shape, T::DTYPE)?;
        array.as_mut_slice::<T>()?.copy_from_slice(data);
        Ok(array)
    }

    fn allocate(
        shape: &Shape,
        dtype: ElementDtype,
        label: Option<&str>,
        tracker: Option<Arc<MemoryTracker>>,
    ) -> ChunkResult<Self> {
        let bytes = shape
            .element_count()
            .checked_mul(dtype.size_in_bytes())
            .ok_or_else(|| ChunkError::InvalidShape {
                shape: shape.dims().to_vec(),
                reason: format!("{} array is larger than the address space", dtype),
            })?;

        if let Some(tracker) = &tracker {
            if !tracker.try_allocate(bytes) {
                return Err(ChunkError::InsufficientMemory {
                    required_kb: bytes as f64 / 1024.0,
                    available_kb: tracker.available() as f64 / 1024.0,
                });
            }
        }

        let map = match MmapMut::map_anon(bytes) {
            Ok(map) => map,
            Err(e) => {
                if let Some(tracker) = &tracker {
                    tracker.release(bytes);
                }
                return Err(e.into());
            }
        };

        let name = create_shared_name(label);
        info!(
            "Requested shared array with name={}, shape={}, size={}, dtype={}",
            name, shape, bytes, dtype
        );

        Ok(Self {
            name,
            shape: shape.clone(),
            dtype,
            map,
            tracker,
        })
    }

    /// Unique name of this array.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Element format.
    pub fn dtype(&self) -> ElementDtype {
        self.dtype
    }

    /// Number of axis-0 slices.
    pub fn slices(&self) -> usize {
        self.shape.slices()
    }

    /// Size of the mapping in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.map.len()
    }

    fn check_dtype<T: Element>(&self) -> ChunkResult<()> {
        if T::DTYPE != self.dtype {
            return Err(ChunkError::DtypeMismatch {
                actual: self.dtype.to_string(),
                requested: T::DTYPE.to_string(),
            });
        }
        Ok(())
    }

    fn check_slice(&self, index: usize) -> ChunkResult<()> {
        if index >= self.slices() {
            return Err(ChunkError::InvalidShape {
                shape: self.shape.dims().to_vec(),
                reason: format!("slice {} out of range", index),
            });
        }
        Ok(())
    }

    /// View the whole tensor as elements of `T`.
    pub fn as_slice<T: Element>(&self) -> ChunkResult<&[T]> {
        self.check_dtype::<T>()?;
        bytemuck::try_cast_slice(&self.map[..])
            .map_err(|e| ChunkError::Config(format!("cannot view {}: {:?}", self.name, e)))
    }

    /// Mutable view of the whole tensor as elements of `T`.
    pub fn as_mut_slice<T: Element>(&mut self) -> ChunkResult<&mut [T]> {
        self.check_dtype::<T>()?;
        let name = &self.name;
        bytemuck::try_cast_slice_mut(&mut self.map[..])
            .map_err(|e| ChunkError::Config(format!("cannot view {}: {:?}", name, e)))
    }

    /// One axis-0 slice.
    pub fn slice<T: Element>(&self, index: usize) -> ChunkResult<&[T]> {
        self.check_slice(index)?;
        let len = self.shape.slice_len();
        Ok(&self.as_slice::<T>()?[index * len..(index + 1) * len])
    }

    /// One mutable axis-0 slice.
    pub fn slice_mut<T: Element>(&mut self, index: usize) -> ChunkResult<&mut [T]> {
        self.check_slice(index)?;
        let len = self.shape.slice_len();
        Ok(&mut self.as_mut_slice::<T>()?[index * len..(index + 1) * len])
    }

    /// Copy the contents out into a vector.
    pub fn to_vec<T: Element>(&self) -> ChunkResult<Vec<T>> {
        Ok(self.as_slice::<T>()?.to_vec())
    }
}

impl fmt::Debug for SharedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArray")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("bytes", &self.map.len())
            .finish()
    }
}

impl Drop for SharedArray {
    fn drop(&mut self) {
        debug!("Deleting shared array with name: {}", self.name);
        if let Some(tracker) = &self.tracker {
            tracker.release(self.map.len());
        }
    }
}

/// Allocate a zero-initialized shared array.
pub fn create_shared_array(shape: &Shape, dtype: impl IntoDtype) -> ChunkResult<SharedArray> {
    SharedArray::create(shape, dtype)
}
