//! Built-in filter implementations.

mod math;

use crate::core::types::Element;
use crate::filters::registry::FilterRegistry;

/// Register all built-in filters.
pub fn register_all<T: Element>(registry: &mut FilterRegistry<T>) {
    math::register(registry);
}

pub use math::{ClipValues, Scale};
