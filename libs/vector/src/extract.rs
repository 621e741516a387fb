// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::NonNull;
use std::sync::Arc;

use crate::data::SharedSource;
use crate::element::Value;

/// A contiguous array of values extracted from a vector.
///
/// Extraction against shared storage yields a foreign-source array that
/// keeps the shared source alive and references its data without copying;
/// any other layout is copied into an owned buffer.
pub enum ExtractedArray<T: Value> {
    Owned(Vec<T>),
    Foreign {
        // Keeps the referenced storage alive.
        source: Arc<SharedSource>,
        ptr: NonNull<T>,
        len: usize,
    },
}

// Safety: the foreign variant references immutable shared storage of a
// Send + Sync element type and owns a strong count on its source.
unsafe impl<T: Value> Send for ExtractedArray<T> {}
// Safety: see above.
unsafe impl<T: Value> Sync for ExtractedArray<T> {}

// === impl ExtractedArray ===

impl<T: Value> ExtractedArray<T> {
    /// Whether this array shares storage with the vector it came from.
    pub fn is_foreign(&self) -> bool {
        matches!(self, Self::Foreign { .. })
    }

    pub(crate) fn foreign(
        source: Arc<SharedSource>,
        ptr: NonNull<T>,
        len: usize,
    ) -> Self {
        Self::Foreign { source, ptr, len }
    }
}

impl<T: Value> std::ops::Deref for ExtractedArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match self {
            Self::Owned(v) => v,
            Self::Foreign { ptr, len, source: _ } => {
                // Safety: the held Arc keeps the shared storage alive and
                // immutable for the lifetime of this array.
                unsafe { core::slice::from_raw_parts(ptr.as_ptr(), *len) }
            }
        }
    }
}

impl<T: Value + std::fmt::Debug> std::fmt::Debug for ExtractedArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
