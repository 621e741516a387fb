// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The polymorphic value container carried along network connections.
//!
//! A [`Vector`] holds a sequence of values of one runtime-resolved
//! element type in one of five storage layouts (empty, single,
//! contiguous, compressed, boxed), optionally wrapped in a refcounted
//! shared source. The element type is fixed for the vector's lifetime;
//! only the layout changes. Values can only be put in atomically, there
//! is no incremental append.
//!
//! Runtime type mismatches are fatal. Size mismatches on masked copies
//! and merges are reported and decline the operation.

mod accessor;
mod boxed;
mod compressed;
mod data;
mod element;
mod extract;

use core::ptr::NonNull;
use std::sync::Arc;

use bits::Bits;
use mask::Mask;
use static_assertions::const_assert;

pub use accessor::{ReadAccessor, ReadWriteAccessor, SubrangeAccessor};
pub use boxed::{BoxedContainer, BoxedRange, BoxedRanges};
pub use element::{ElementVtable, Value};
pub use extract::ExtractedArray;

use crate::data::{
    ContiguousData, SharedSource, SingleData, VectorData, should_store_compressed,
};

/// A typed, layout-polymorphic value container.
pub struct Vector {
    elem: &'static ElementVtable,
    data: VectorData,
}

// The whole handle, vtable pointer included, stays within four cache
// words; layouts that need more storage spill to the heap.
const_assert!(size_of::<Vector>() <= 64);

// Safety: every element type admitted by `Value` is Send + Sync; raw
// storage is owned uniquely or behind the shared source's refcount.
unsafe impl Send for Vector {}
// Safety: see above; shared access is read-only.
unsafe impl Sync for Vector {}

// === impl Vector ===

impl Vector {
    /// An empty vector of element type `T` and logical size zero.
    pub fn new<T: Value>() -> Self {
        Self::empty::<T>(0)
    }

    /// An empty vector of logical size `size`: no elements are stored.
    pub fn empty<T: Value>(size: usize) -> Self {
        Self {
            elem: ElementVtable::of::<T>(),
            data: VectorData::Empty { size },
        }
    }

    /// A single-element vector holding `value`.
    pub fn single<T: Value>(value: T) -> Self {
        Self {
            elem: ElementVtable::of::<T>(),
            data: VectorData::Single(SingleData::from_value(value)),
        }
    }

    /// A dense vector of `size` default-constructed elements.
    pub fn dense<T: Value>(size: usize) -> Self {
        let vt = ElementVtable::of::<T>();
        let data = match size {
            0 => VectorData::Empty { size: 0 },
            1 => VectorData::Single(SingleData::new_default(vt)),
            _ => VectorData::Contiguous(ContiguousData::dense(vt, size)),
        };
        Self { elem: vt, data }
    }

    /// A sparse vector of logical size `size` storing the closed range
    /// `[first, last]`, default constructed.
    pub fn sparse<T: Value>(size: usize, first: usize, last: usize) -> Self {
        let vt = ElementVtable::of::<T>();
        Self {
            elem: vt,
            data: VectorData::Contiguous(ContiguousData::sparse(vt, size, first, last)),
        }
    }

    /// A dense vector holding copies of `values`.
    pub fn from_slice<T: Value>(values: &[T]) -> Self {
        let mut v = Self::dense::<T>(values.len());
        if values.len() > 1 {
            let mut rw = v.read_write::<T>();
            for (i, value) in values.iter().enumerate() {
                rw[i] = value.clone();
            }
        } else if let Some(value) = values.first() {
            v.set(value.clone());
        }
        v
    }

    /// A vector of logical size `bits.size()` storing copies of the
    /// elements of `values` at the set bits, laid out contiguous-sparse
    /// or compressed per the compression heuristic.
    pub fn from_slice_masked<T: Value>(values: &[T], bits: &Bits) -> Self {
        assert_eq!(values.len(), bits.size());
        let vt = ElementVtable::of::<T>();
        if bits.are_all_unset() {
            return Self {
                elem: vt,
                data: VectorData::Empty { size: bits.size() },
            };
        }

        let src =
            // Safety: bits.is_any_set() implies values is non-empty.
            unsafe { NonNull::new_unchecked(values.as_ptr().cast_mut().cast::<u8>()) };
        let data = if should_store_compressed(bits, vt.size) {
            // Safety: values covers every logical index starting at 0.
            VectorData::Compressed(unsafe {
                data::CompressedData::from_storage(vt, src, 0, bits)
            })
        } else {
            // Safety: as above.
            VectorData::Contiguous(unsafe {
                ContiguousData::from_storage(vt, src, 0, bits)
            })
        };
        Self { elem: vt, data }
    }

    /// The logical number of elements.
    pub fn size(&self) -> usize {
        self.data.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The number of elements the layout actually stores.
    pub fn num_stored_elements(&self) -> usize {
        self.data.num_stored()
    }

    /// Whether the vector holds elements of type `T`.
    pub fn holds<T: Value>(&self) -> bool {
        self.elem.is::<T>()
    }

    /// The name of the held element type.
    pub fn element_type_name(&self) -> &'static str {
        self.elem.name()
    }

    /// The estimated allocation size of a single element.
    pub fn estimate_element_memory(&self) -> usize {
        self.elem.size
    }

    /// Replaces the contents with the single element `value`.
    #[track_caller]
    pub fn set<T: Value>(&mut self, value: T) {
        self.elem.check::<T>();
        self.replace_data(VectorData::Single(SingleData::from_value(value)));
    }

    /// Replaces the contents with a boxed container of `T`.
    #[track_caller]
    pub fn set_boxed<T: Value>(&mut self, container: BoxedContainer<T>) {
        self.elem.check::<T>();
        let ptr =
            // Safety: Box::into_raw never returns null.
            unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(container)).cast::<u8>()) };
        self.replace_data(VectorData::Boxed(data::BoxedData { ptr }));
    }

    /// Allocates default-initialized storage for `size` elements,
    /// discarding the previous contents.
    #[track_caller]
    pub fn resize<T: Value>(&mut self, size: usize) {
        self.elem.check::<T>();
        // Never produces a compressed layout: resizing prepares storage
        // for merging, and merges do not target compressed vectors.
        let data = match size {
            0 => VectorData::Empty { size: 0 },
            1 => VectorData::Single(SingleData::new_default(self.elem)),
            _ => VectorData::Contiguous(ContiguousData::dense(self.elem, size)),
        };
        self.replace_data(data);
    }

    /// Allocates default-initialized storage covering the set range of
    /// `bits`, discarding the previous contents.
    #[track_caller]
    pub fn resize_bits<T: Value>(&mut self, bits: &Bits) {
        self.elem.check::<T>();
        let data = match bits.size() {
            0 => VectorData::Empty { size: 0 },
            1 => VectorData::Single(SingleData::new_default(self.elem)),
            size if bits.are_all_unset() => VectorData::Empty { size },
            _ => VectorData::Contiguous(ContiguousData::covering_bits(self.elem, bits)),
        };
        self.replace_data(data);
    }

    /// Copies the elements of `rhs` selected by `mask` into this vector,
    /// replacing its contents. Both vectors must hold the same type.
    #[track_caller]
    pub fn copy_from(&mut self, rhs: &Vector, mask: &Mask) {
        self.check_same_type(rhs);
        if !mask.is_empty() && rhs.size() != mask.size() {
            log::error!(
                "size mismatch in masked copy: vector {} vs. mask {}",
                rhs.size(),
                mask.size()
            );
            return;
        }

        // Mutating a shared vector first detaches the local data.
        if self.is_shared() {
            self.detach();
        }

        let data = Self::subset_data(rhs, mask);
        self.replace_data(data);
    }

    /// A new vector holding the elements of `self` selected by `mask`.
    #[track_caller]
    pub fn copy_masked(&self, mask: &Mask) -> Vector {
        if !mask.is_empty() && self.size() != mask.size() {
            log::error!(
                "size mismatch in masked copy: vector {} vs. mask {}",
                self.size(),
                mask.size()
            );
            return Vector {
                elem: self.elem,
                data: VectorData::Empty { size: self.size() },
            };
        }
        Vector {
            elem: self.elem,
            data: Self::subset_data(self, mask),
        }
    }

    fn subset_data(src: &Vector, mask: &Mask) -> VectorData {
        if mask.is_all_ones() {
            // All-ones takes the potentially faster whole-vector clone.
            src.data.clone_with(src.elem)
        } else if mask.is_any_set() {
            src.data.clone_subset(src.elem, mask)
        } else {
            // All-zeros produces an empty vector of the right size
            // rather than duplicating the source layout with an empty
            // data section.
            VectorData::Empty { size: mask.size() }
        }
    }

    /// A new single-element vector boxing the elements of `self` selected
    /// by `mask`.
    #[track_caller]
    pub fn boxed_copy(&self, mask: &Mask) -> Vector {
        if self.size() != mask.size() {
            log::error!(
                "size mismatch in boxed copy: vector {} vs. mask {}",
                self.size(),
                mask.size()
            );
        }
        let data = if mask.is_any_set() {
            self.data.box_into(self.elem, mask.bits())
        } else {
            VectorData::Empty { size: 0 }
        };
        Vector {
            elem: self.elem,
            data,
        }
    }

    /// Merges the elements of `rhs` selected by `bits` into this vector.
    ///
    /// The receiver, `rhs` and `bits` must agree on the logical size. A
    /// compressed receiver is materialized to contiguous-sparse once;
    /// subsequent merges target the sparse layout directly.
    #[track_caller]
    pub fn merge_from(&mut self, rhs: &Vector, bits: &Bits) {
        self.check_same_type(rhs);

        let size = self.size();
        if rhs.is_empty() || bits.are_all_unset() {
            return;
        }
        if size != rhs.size() {
            log::error!(
                "size mismatch in merge: receiver {size} vs. source {}",
                rhs.size()
            );
            return;
        }
        if size != bits.size() {
            log::error!(
                "size mismatch in merge: receiver {size} vs. bits {}",
                bits.size()
            );
            return;
        }

        if self.is_shared() {
            self.detach();
        }

        // Grow sparse or compressed receivers to cover the merged range.
        if self.num_stored_elements() < size {
            enum Expansion {
                Grow { first: usize, last: usize },
                Decompress { first: usize, last: usize, stored: Bits },
                Unsupported,
            }

            let expansion = match &self.data {
                VectorData::Contiguous(c) => Expansion::Grow {
                    first: if c.buf.is_some() {
                        bits.first_set().min(c.first)
                    } else {
                        bits.first_set()
                    },
                    last: if c.buf.is_some() {
                        bits.last_set().max(c.last)
                    } else {
                        bits.last_set()
                    },
                },
                VectorData::Compressed(c) => Expansion::Decompress {
                    first: bits.first_set().min(c.mapping.first_index()),
                    last: bits.last_set().max(c.mapping.last_index()),
                    stored: c.mapping.stored_bits(size),
                },
                _ => Expansion::Unsupported,
            };

            match expansion {
                Expansion::Grow { first, last } => {
                    let VectorData::Contiguous(c) = &mut self.data else {
                        unreachable!()
                    };
                    c.expand(self.elem, first, last);
                }
                Expansion::Decompress { first, last, stored } => {
                    // Uncompress once; this can be expensive, so every
                    // subsequent merge targets the now-sparse layout.
                    let mut sparse = VectorData::Contiguous(
                        ContiguousData::sparse(self.elem, size, first, last),
                    );
                    self.data.merge_into(self.elem, &stored, &mut sparse);
                    self.replace_data(sparse);
                }
                Expansion::Unsupported => {
                    log::error!(
                        "cannot expand storage of {} vector for merging",
                        self.layout_name()
                    );
                    return;
                }
            }
        }

        rhs.data.merge_into(self.elem, bits, &mut self.data);
    }

    /// Same as [`Self::merge_from`], taking a mask.
    #[track_caller]
    pub fn merge_from_mask(&mut self, rhs: &Vector, mask: &Mask) {
        self.merge_from(rhs, mask.bits());
    }

    /// Wraps the current storage in a refcounted source so that the data
    /// can be shared without copying. Returns `true` on success.
    ///
    /// Mutating shared contents detaches first: the unique owner takes
    /// the data back without a copy, everyone else deep-copies.
    pub fn share(&mut self) -> bool {
        if !self.data.is_sharable() {
            return false;
        }
        let data = core::mem::replace(&mut self.data, VectorData::Empty { size: 0 });
        self.data = VectorData::Shared(Arc::new(SharedSource::new(self.elem, data)));
        true
    }

    /// Whether the vector currently shares its storage.
    pub fn is_shared(&self) -> bool {
        matches!(self.data, VectorData::Shared(_))
    }

    /// Whether the vector's data could be shared.
    pub fn is_sharable(&self) -> bool {
        self.data.is_sharable()
    }

    /// Read-only element access. The vector must hold `T`.
    #[track_caller]
    pub fn read<T: Value>(&self) -> ReadAccessor<'_, T> {
        ReadAccessor::new(self.elem, self.data.info(self.elem))
    }

    /// Mutable element access; detaches shared storage first. The vector
    /// must hold `T`.
    #[track_caller]
    pub fn read_write<T: Value>(&mut self) -> ReadWriteAccessor<'_, T> {
        if self.is_shared() {
            self.detach();
        }
        // Safety: self is exclusively borrowed and no longer shared.
        unsafe { ReadWriteAccessor::new(self.elem, self.data.info(self.elem)) }
    }

    /// Access to the logical subranges of a boxed vector.
    #[track_caller]
    pub fn subrange_accessor<T: Value>(&self) -> SubrangeAccessor<'_, T> {
        SubrangeAccessor::new(self.elem, self.data.info(self.elem))
    }

    /// Extracts `size` elements starting at logical index `offset` into a
    /// contiguous array, bit-exact for the stored values.
    ///
    /// Shared storage yields a foreign-source array without copying;
    /// every other layout is copied. Compressed extraction requires the
    /// requested range to lie within a single stored block.
    #[track_caller]
    pub fn extract_as_array<T: Value>(
        &self,
        size: usize,
        offset: usize,
    ) -> ExtractedArray<T> {
        self.elem.check::<T>();
        let info = self.data.info(self.elem);

        if let Some(mapping) = info.mapping {
            // Compressed vectors are never sharable, always copy.
            let hint = core::cell::Cell::new(0);
            let data_idx = mapping.find_data_index(offset, &hint);
            let block = hint.get();
            let block_start = mapping.block_first_index(block);
            let block_len = mapping.block_len(block);
            if offset + size > block_start + block_len {
                log::error!(
                    "extraction range (idx={offset}, len={size}) outside block \
                     {block} range (idx={block_start}, len={block_len})"
                );
                return ExtractedArray::Owned(Vec::new());
            }
            let base = info.data.expect("compressed vector without storage");
            // Safety: the whole range lies within one stored block.
            let src = unsafe {
                core::slice::from_raw_parts(
                    base.as_ptr().cast::<T>().add(data_idx),
                    size,
                )
            };
            return ExtractedArray::Owned(src.to_vec());
        }

        if size == 0 {
            return ExtractedArray::Owned(Vec::new());
        }

        let base = info.data.expect("vector has no stored elements");
        let start = if info.boxed {
            // Boxed element access goes through the container's data.
            // Safety: boxed layouts point at a live BoxedContainer<T>.
            let container = unsafe { &*base.as_ptr().cast::<BoxedContainer<T>>() };
            debug_assert!(offset + size <= container.len());
            container.data()[offset..].as_ptr()
        } else {
            debug_assert!(offset >= info.first && offset + size <= info.last + 1);
            // Safety: the range lies within the stored span.
            unsafe { base.as_ptr().cast::<T>().add(offset - info.first) }
        };

        if let VectorData::Shared(source) = &self.data {
            return ExtractedArray::foreign(
                Arc::clone(source),
                // Safety: start points into live shared storage.
                unsafe { NonNull::new_unchecked(start.cast_mut()) },
                size,
            );
        }

        // Safety: the range is in bounds of live storage.
        let src = unsafe { core::slice::from_raw_parts(start, size) };
        ExtractedArray::Owned(src.to_vec())
    }

    fn replace_data(&mut self, new: VectorData) {
        let old = core::mem::replace(&mut self.data, new);
        old.destroy(self.elem);
    }

    /// Detaches from the shared source: the unique owner transfers the
    /// payload without copying, otherwise a deep copy is made.
    fn detach(&mut self) {
        let VectorData::Shared(source) =
            core::mem::replace(&mut self.data, VectorData::Empty { size: 0 })
        else {
            return;
        };
        self.data = match Arc::try_unwrap(source) {
            Ok(mut unique) => unique.take_data(),
            Err(source) => source.data().clone_with(self.elem),
        };
    }

    #[track_caller]
    fn check_same_type(&self, rhs: &Vector) {
        if !core::ptr::eq(self.elem, rhs.elem)
            && (self.elem.type_id)() != (rhs.elem.type_id)()
        {
            panic!(
                "invalid type: vector is holding {}, tried to combine with {}",
                self.elem.name(),
                rhs.elem.name(),
            );
        }
    }

    fn layout_name(&self) -> &'static str {
        match &self.data {
            VectorData::Empty { .. } => "empty",
            VectorData::Single(_) => "single",
            VectorData::Contiguous(_) => "contiguous",
            VectorData::Compressed(_) => "compressed",
            VectorData::Boxed(_) => "boxed",
            VectorData::Shared(_) => "shared",
        }
    }
}

impl Clone for Vector {
    fn clone(&self) -> Self {
        Self {
            elem: self.elem,
            data: self.data.clone_with(self.elem),
        }
    }
}

impl Drop for Vector {
    fn drop(&mut self) {
        let data = core::mem::replace(&mut self.data, VectorData::Empty { size: 0 });
        data.destroy(self.elem);
    }
}

impl std::fmt::Debug for Vector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vector")
            .field("type", &self.element_type_name())
            .field("layout", &self.layout_name())
            .field("size", &self.size())
            .field("stored", &self.num_stored_elements())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(
        clippy::cast_precision_loss,
        reason = "test data stays well within f64 precision"
    )]
    fn iota(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn layout_selection() {
        assert_eq!(Vector::new::<f64>().size(), 0);
        assert_eq!(Vector::empty::<f64>(10).num_stored_elements(), 0);
        assert_eq!(Vector::single(2.5f64).num_stored_elements(), 1);
        assert_eq!(Vector::dense::<f64>(8).num_stored_elements(), 8);

        let sparse = Vector::sparse::<f64>(100, 10, 19);
        assert_eq!(sparse.size(), 100);
        assert_eq!(sparse.num_stored_elements(), 10);
    }

    #[test]
    fn accessors_match_logical_size() {
        let v = Vector::from_slice(&iota(16));
        let a = v.read::<f64>();
        assert_eq!(a.num_values(), v.size());
        assert!(!a.is_boxed());
        assert_eq!(a[3], 3.0);
        assert_eq!(a[15], 15.0);
    }

    #[test]
    fn single_element_round_trip() {
        let mut v = Vector::single(41i64);
        assert_eq!(v.size(), 1);
        assert_eq!(v.read::<i64>()[0], 41);
        v.read_write::<i64>()[0] += 1;
        assert_eq!(v.read::<i64>()[0], 42);

        // Strings exercise the heap-spill-free inline path with drops.
        let s = Vector::single(String::from("pose"));
        assert_eq!(s.read::<String>()[0], "pose");
        let c = s.clone();
        drop(s);
        assert_eq!(c.read::<String>()[0], "pose");
    }

    #[test]
    fn oversize_single_spills_to_heap() {
        #[derive(Clone, Default, PartialEq, Debug)]
        struct Matrix([f64; 16]);
        impl Value for Matrix {}

        let mut m = Matrix::default();
        m.0[5] = 2.0;
        let v = Vector::single(m.clone());
        assert_eq!(v.read::<Matrix>()[0], m);
        assert_eq!(v.clone().read::<Matrix>()[0], m);
    }

    #[test]
    fn compressed_copy_round_trip() {
        // A dense vector of 1500 doubles with v[i] = i and a mask with
        // four scattered bits compresses on copy.
        let v = Vector::from_slice(&iota(1500));
        let mask = Mask::from_bits(&Bits::from_indices(1500, &[1, 3, 4, 1499]));

        let w = v.copy_masked(&mask);
        assert_eq!(w.size(), 1500);
        assert_eq!(w.num_stored_elements(), 4);

        let a = w.read::<f64>();
        for i in [1, 3, 4, 1499] {
            #[allow(clippy::cast_precision_loss, reason = "test data")]
            let expected = i as f64;
            assert_eq!(a[i], expected);
        }
    }

    #[test]
    fn masked_copy_stays_sparse_below_threshold() {
        let v = Vector::from_slice(&iota(100));
        let mask = Mask::from_bits(&Bits::from_indices(100, &[10, 11, 12, 90]));

        let w = v.copy_masked(&mask);
        // Too small to compress: a single contiguous range [10, 90].
        assert_eq!(w.num_stored_elements(), 81);
        let a = w.read::<f64>();
        assert_eq!(a[10], 10.0);
        assert_eq!(a[90], 90.0);
    }

    #[test]
    fn copy_with_all_zeros_short_circuits() {
        let v = Vector::from_slice(&iota(64));
        let w = v.copy_masked(&Mask::all_zeros(64));
        assert_eq!(w.size(), 64);
        assert_eq!(w.num_stored_elements(), 0);
    }

    #[test]
    fn copy_size_mismatch_is_reported_noop() {
        let v = Vector::from_slice(&iota(8));
        let mut w = Vector::from_slice(&iota(8));
        w.copy_from(&v, &Mask::all_ones(9));
        // The receiver declined the copy.
        assert_eq!(w.read::<f64>()[7], 7.0);
    }

    #[test]
    fn merge_expands_sparse_receiver() {
        let src = Vector::from_slice(&iota(32));

        // Receiver stores [4, 7] only.
        let mut dst = Vector::sparse::<f64>(32, 4, 7);
        dst.merge_from(&src, &Bits::from_indices(32, &[5, 6]));
        assert_eq!(dst.read::<f64>()[5], 5.0);

        // Merging bits outside the stored range grows the storage.
        dst.merge_from(&src, &Bits::from_indices(32, &[2, 20]));
        assert_eq!(dst.num_stored_elements(), 19);
        let a = dst.read::<f64>();
        assert_eq!(a[2], 2.0);
        assert_eq!(a[20], 20.0);
        assert_eq!(a[5], 5.0);
    }

    #[test]
    fn merge_uncompresses_receiver_once() {
        let src = Vector::from_slice(&iota(1500));
        let mask = Mask::from_bits(&Bits::from_indices(1500, &[1, 3, 4, 1499]));
        let mut dst = src.copy_masked(&mask);
        assert_eq!(dst.num_stored_elements(), 4);

        dst.merge_from(&src, &Bits::from_indices(1500, &[2]));
        // Materialized to the contiguous range [1, 1499].
        assert_eq!(dst.num_stored_elements(), 1499);
        let a = dst.read::<f64>();
        for i in [1, 2, 3, 4, 1499] {
            #[allow(clippy::cast_precision_loss, reason = "test data")]
            let expected = i as f64;
            assert_eq!(a[i], expected);
        }
    }

    #[test]
    fn merge_size_mismatch_is_reported_noop() {
        let src = Vector::from_slice(&iota(8));
        let mut dst = Vector::from_slice(&iota(9));
        dst.merge_from(&src, &Bits::all_set(8));
        assert_eq!(dst.read::<f64>()[8], 8.0);
    }

    #[test]
    fn sharing_thresholds() {
        // Small vectors and single elements never share.
        assert!(!Vector::from_slice(&iota(100)).share());
        assert!(!Vector::single(1.0f64).share());

        let mut big = Vector::from_slice(&iota(6000));
        assert!(big.is_sharable());
        assert!(big.share());
        assert!(big.is_shared());

        // Sharing is idempotent: the second call has nothing to do but
        // the vector stays shared.
        assert!(!big.share());
        assert!(big.is_shared());
    }

    #[test]
    fn copy_on_write_detach() {
        let mut v = Vector::from_slice(&iota(6000));
        assert!(v.share());

        let mut c = v.clone();
        c.read_write::<f64>()[123] = -1.0;

        // The copy detached; the original observes unchanged data and is
        // still shared.
        assert_eq!(c.read::<f64>()[123], -1.0);
        assert_eq!(v.read::<f64>()[123], 123.0);
        assert!(v.is_shared());
        assert!(!c.is_shared());
    }

    #[test]
    fn unique_owner_detaches_without_copy() {
        let mut v = Vector::from_slice(&iota(6000));
        assert!(v.share());
        // Sole reference: the write transfers ownership back in place.
        v.read_write::<f64>()[0] = 7.0;
        assert!(!v.is_shared());
        assert_eq!(v.read::<f64>()[0], 7.0);
    }

    #[test]
    fn extract_owned_and_foreign() {
        let values = iota(6000);
        let mut v = Vector::from_slice(&values);

        let owned = v.extract_as_array::<f64>(100, 50);
        assert!(!owned.is_foreign());
        assert_eq!(&*owned, &values[50..150]);

        assert!(v.share());
        let foreign = v.extract_as_array::<f64>(100, 50);
        assert!(foreign.is_foreign());
        assert_eq!(&*foreign, &values[50..150]);

        // The foreign array outlives the vector it came from.
        drop(v);
        assert_eq!(foreign[0], 50.0);
    }

    #[test]
    fn extract_from_compressed_block() {
        let v = Vector::from_slice(&iota(1500));
        let mask = Mask::from_bits(&Bits::from_indices(
            1500,
            &[10, 11, 12, 13, 1400],
        ));
        let w = v.copy_masked(&mask);
        assert_eq!(w.num_stored_elements(), 5);

        let got = w.extract_as_array::<f64>(4, 10);
        assert_eq!(&*got, &[10.0, 11.0, 12.0, 13.0]);

        // Ranges spanning a block boundary are declined.
        let bad = w.extract_as_array::<f64>(5, 12);
        assert!(bad.is_empty());
    }

    #[test]
    fn boxed_values() {
        let mut v = Vector::new::<f64>();
        let mut container = BoxedContainer::from_slice(&[1.0, 2.0, 3.0]);
        container.append_range([4.0, 5.0]);
        v.set_boxed(container);

        assert_eq!(v.size(), 1);
        let a = v.read::<f64>();
        assert!(a.is_boxed());
        assert_eq!(a.num_values(), 5);
        assert_eq!(a[4], 5.0);

        let sub = v.subrange_accessor::<f64>();
        assert_eq!(sub.num_ranges(), 2);
        assert_eq!(sub.range_data(0), &[1.0, 2.0, 3.0]);
        assert_eq!(sub.range_data(1), &[4.0, 5.0]);
    }

    #[test]
    fn boxed_copy_gathers_masked_elements() {
        let v = Vector::from_slice(&iota(10));
        let mask = Mask::from_bits(&Bits::from_indices(10, &[2, 5, 6]));
        let b = v.boxed_copy(&mask);

        let a = b.read::<f64>();
        assert!(a.is_boxed());
        assert_eq!(a.num_values(), 3);
        assert_eq!((a[0], a[1], a[2]), (2.0, 5.0, 6.0));
    }

    #[test]
    fn resize_discards_contents() {
        let mut v = Vector::from_slice(&iota(4));
        v.resize::<f64>(16);
        assert_eq!(v.size(), 16);
        assert_eq!(v.read::<f64>()[3], 0.0);

        v.resize_bits::<f64>(&Bits::from_indices(64, &[8, 9]));
        assert_eq!(v.size(), 64);
        assert_eq!(v.num_stored_elements(), 2);

        v.resize_bits::<f64>(&Bits::new(64));
        assert_eq!(v.num_stored_elements(), 0);
    }

    #[test]
    #[should_panic(expected = "invalid type")]
    fn type_mismatch_is_fatal() {
        let v = Vector::from_slice(&iota(4));
        let _ = v.read::<i32>();
    }
}
