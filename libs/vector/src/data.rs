// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The storage layouts of a vector.
//!
//! [`VectorData`] is a closed sum over the five layouts plus the shared
//! wrapper; every operation pattern-matches on the tag and crosses the
//! type-erasure boundary only through the element vtable. None of the
//! variants own a `Drop` impl for their raw buffers: destruction always
//! goes through [`VectorData::destroy`] with the owning vector's vtable.

use core::cell::Cell;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use std::sync::Arc;

use bits::Bits;

use crate::compressed::CompressedIndexMapping;
use crate::element::{
    ElementVtable, SINGLE_INLINE_SIZE, Value, heap_single,
};

/// The logical size a vector needs to reach before sharing is worthwhile.
pub(crate) const SHARING_SIZE: usize = 5000;

/// Whether a vector characterized by `bits` should use the compressed
/// block layout rather than a single contiguous range.
pub(crate) fn should_store_compressed(bits: &Bits, _elem_bytes: usize) -> bool {
    // Never compress small vectors or ones whose set bits are contiguous
    // (of the form 0*1+0*).
    const BIG_VECTOR_SIZE: usize = 1000;
    if bits.size() < BIG_VECTOR_SIZE || bits.are_contiguously_set() {
        return false;
    }

    // Small data sections are not worth the indirection either.
    let span = bits.last_set() - bits.first_set() + 1;
    if span < bits.size() / 2 {
        return false;
    }

    // Compress when less than 12.5% of the data-holding span is occupied.
    bits.num_set() < span / 8
}

pub(crate) enum VectorData {
    Empty { size: usize },
    Single(SingleData),
    Contiguous(ContiguousData),
    Compressed(CompressedData),
    Boxed(BoxedData),
    Shared(Arc<SharedSource>),
}

/// The untyped facts an accessor needs about a vector's storage.
pub(crate) struct Info<'a> {
    /// Unbiased base pointer of the element storage; for boxed layouts
    /// this addresses the container itself.
    pub data: Option<NonNull<u8>>,
    pub size: usize,
    pub first: usize,
    pub last: usize,
    /// Number of stored elements behind `data`.
    pub stored: usize,
    pub mapping: Option<&'a CompressedIndexMapping>,
    pub boxed: bool,
    pub shared: bool,
}

// === impl VectorData ===

impl VectorData {
    pub(crate) fn size(&self) -> usize {
        match self {
            Self::Empty { size } => *size,
            Self::Single(_) | Self::Boxed(_) => 1,
            Self::Contiguous(c) => c.size,
            Self::Compressed(c) => c.size,
            Self::Shared(source) => source.data().size(),
        }
    }

    pub(crate) fn num_stored(&self) -> usize {
        match self {
            Self::Empty { .. } => 0,
            Self::Single(_) | Self::Boxed(_) => 1,
            Self::Contiguous(c) => c.stored_len(),
            Self::Compressed(c) => c.mapping.num_stored(),
            Self::Shared(source) => source.data().num_stored(),
        }
    }

    pub(crate) fn is_sharable(&self) -> bool {
        // Every layout but Single shares once it is big enough; a shared
        // vector does not share again.
        match self {
            Self::Single(_) | Self::Shared(_) => false,
            _ => self.size() >= SHARING_SIZE,
        }
    }

    pub(crate) fn info(&self, vt: &ElementVtable) -> Info<'_> {
        match self {
            Self::Empty { size } => Info {
                data: None,
                size: *size,
                first: 0,
                last: 0,
                stored: 0,
                mapping: None,
                boxed: false,
                shared: false,
            },
            Self::Single(s) => Info {
                data: Some(s.element_ptr(vt)),
                size: 1,
                first: 0,
                last: 0,
                stored: 1,
                mapping: None,
                boxed: false,
                shared: false,
            },
            Self::Contiguous(c) => Info {
                data: c.buf,
                size: c.size,
                first: c.first,
                last: c.last,
                stored: c.stored_len(),
                mapping: None,
                boxed: false,
                shared: false,
            },
            Self::Compressed(c) => Info {
                data: c.buf,
                size: c.size,
                first: c.mapping.first_index(),
                last: c.mapping.last_index(),
                stored: c.mapping.num_stored(),
                mapping: Some(&c.mapping),
                boxed: false,
                shared: false,
            },
            Self::Boxed(b) => Info {
                data: Some(b.ptr),
                size: 1,
                first: 0,
                last: 0,
                stored: 1,
                mapping: None,
                boxed: true,
                shared: false,
            },
            Self::Shared(source) => Info {
                shared: true,
                ..source.data().info(vt)
            },
        }
    }

    /// Releases all storage. This consumes the data; the vector replaces
    /// it before calling.
    pub(crate) fn destroy(self, vt: &'static ElementVtable) {
        match self {
            Self::Empty { .. } => {}
            // Safety: the storage was allocated through the same vtable.
            Self::Single(s) => unsafe { s.destroy(vt) },
            Self::Contiguous(c) => {
                if let Some(buf) = c.buf {
                    // Safety: buf holds exactly stored_len elements.
                    unsafe { (vt.dealloc)(buf, c.last - c.first + 1) }
                }
            }
            Self::Compressed(c) => {
                if let Some(buf) = c.buf {
                    // Safety: buf holds exactly the mapped element count.
                    unsafe { (vt.dealloc)(buf, c.mapping.num_stored()) }
                }
            }
            // Safety: the container was allocated through the same vtable.
            Self::Boxed(b) => unsafe { (vt.drop_boxed)(b.ptr) },
            Self::Shared(source) => drop(source),
        }
    }

    pub(crate) fn clone_with(&self, vt: &'static ElementVtable) -> Self {
        match self {
            Self::Empty { size } => Self::Empty { size: *size },
            // Safety: storage and vtable belong together.
            Self::Single(s) => Self::Single(unsafe { s.clone_with(vt) }),
            Self::Contiguous(c) => Self::Contiguous(c.clone_with(vt)),
            Self::Compressed(c) => Self::Compressed(c.clone_with(vt)),
            Self::Boxed(b) => Self::Boxed(BoxedData {
                // Safety: the container was allocated through vt.
                ptr: unsafe { (vt.clone_boxed)(b.ptr) },
            }),
            // Cloning shared storage bumps the refcount, no data moves.
            Self::Shared(source) => Self::Shared(Arc::clone(source)),
        }
    }

    /// Clones the subset of elements selected by `mask`, choosing the
    /// destination layout from the mask's shape.
    pub(crate) fn clone_subset(
        &self,
        vt: &'static ElementVtable,
        mask: &mask::Mask,
    ) -> Self {
        let bits = mask.bits();
        match self {
            Self::Empty { size } => Self::Empty { size: *size },
            // One element; the mask has nothing to subset.
            Self::Single(s) => Self::Single(unsafe {
                // Safety: storage and vtable belong together.
                s.clone_with(vt)
            }),
            Self::Boxed(b) => Self::Boxed(BoxedData {
                // Safety: the container was allocated through vt.
                ptr: unsafe { (vt.clone_boxed)(b.ptr) },
            }),
            Self::Contiguous(c) => {
                if bits.are_all_unset() {
                    // Keep the size, drop all storage. Duplicating the
                    // source layout with an empty data section would
                    // leave a compressed destination without an index
                    // mapping.
                    return Self::Empty { size: bits.size() };
                }
                let Some(buf) = c.buf else {
                    return Self::Empty { size: c.size };
                };
                if should_store_compressed(bits, vt.size) {
                    // Safety: the mask selects stored elements only.
                    Self::Compressed(unsafe {
                        CompressedData::from_storage(vt, buf, c.first, bits)
                    })
                } else if bits.first_set() == c.first && bits.last_set() == c.last {
                    Self::Contiguous(c.clone_with(vt))
                } else {
                    // Safety: the mask selects stored elements only.
                    Self::Contiguous(unsafe {
                        ContiguousData::from_storage(vt, buf, c.first, bits)
                    })
                }
            }
            Self::Compressed(c) => {
                if bits.are_all_unset() {
                    return Self::Empty { size: bits.size() };
                }
                let Some(buf) = c.buf else {
                    return Self::Empty { size: c.size };
                };

                // Build the destination mapping from the mask, then copy
                // the selected runs; each run lies within one source
                // block because the mask is a subset of the stored bits.
                let mapping = CompressedIndexMapping::initialize(bits);
                let dst_buf = (vt.alloc_default)(bits.num_set());
                let src_hint = Cell::new(0);
                let mut dst_idx = 0;
                for p in bits.platforms().filter(|p| p.is_set()) {
                    let src_idx = c.mapping.find_data_index(p.first, &src_hint);
                    // Safety: both ranges are in bounds and distinct.
                    unsafe {
                        (vt.assign_range)(dst_buf, dst_idx, buf, src_idx, p.len);
                    }
                    dst_idx += p.len;
                }
                Self::Compressed(CompressedData {
                    buf: Some(dst_buf),
                    size: c.size,
                    mapping,
                })
            }
            Self::Shared(source) => source.data().clone_subset(vt, mask),
        }
    }

    /// Gathers the elements selected by `bits` into a boxed container
    /// with a single range.
    pub(crate) fn box_into(&self, vt: &'static ElementVtable, bits: &Bits) -> Self {
        match self {
            Self::Empty { .. } => Self::Boxed(BoxedData {
                ptr: (vt.new_boxed)(0),
            }),
            Self::Single(_) | Self::Boxed(_) => {
                // Single elements and already-boxed values never box.
                log::error!("attempted to box a single-element vector");
                self.clone_with(vt)
            }
            Self::Contiguous(c) => {
                let ptr = (vt.new_boxed)(bits.num_set());
                if let Some(buf) = c.buf {
                    // Safety: the container was just allocated through vt
                    // with room for every set bit.
                    unsafe {
                        let dst = (vt.boxed_data)(ptr);
                        let mut dst_idx = 0;
                        for p in bits.platforms().filter(|p| p.is_set()) {
                            (vt.assign_range)(
                                dst,
                                dst_idx,
                                buf,
                                p.first - c.first,
                                p.len,
                            );
                            dst_idx += p.len;
                        }
                    }
                }
                Self::Boxed(BoxedData { ptr })
            }
            Self::Compressed(c) => {
                let ptr = (vt.new_boxed)(bits.num_set());
                if let Some(buf) = c.buf {
                    let src_hint = Cell::new(0);
                    // Safety: as above; every selected run is stored.
                    unsafe {
                        let dst = (vt.boxed_data)(ptr);
                        let mut dst_idx = 0;
                        for p in bits.platforms().filter(|p| p.is_set()) {
                            let src_idx =
                                c.mapping.find_data_index(p.first, &src_hint);
                            (vt.assign_range)(dst, dst_idx, buf, src_idx, p.len);
                            dst_idx += p.len;
                        }
                    }
                }
                Self::Boxed(BoxedData { ptr })
            }
            Self::Shared(source) => source.data().box_into(vt, bits),
        }
    }

    /// Merges the elements selected by `bits` into `dst`.
    ///
    /// The destination must already be a contiguous vector covering the
    /// selected range; the vector-level merge guarantees this.
    pub(crate) fn merge_into(
        &self,
        vt: &'static ElementVtable,
        bits: &Bits,
        dst: &mut VectorData,
    ) {
        match self {
            Self::Empty { .. } => {}
            Self::Single(_) => {
                // A one-element merge either takes the whole value or
                // nothing.
                if bits.are_all_set() {
                    let old = core::mem::replace(dst, self.clone_with(vt));
                    old.destroy(vt);
                }
            }
            Self::Boxed(_) => {
                log::error!("cannot merge from a boxed vector");
            }
            Self::Contiguous(c) => {
                let Some(src_buf) = c.buf else { return };
                let Some((dst_buf, dst_first)) = contiguous_target(dst) else {
                    return;
                };
                for p in bits.platforms().filter(|p| p.is_set()) {
                    // Safety: the vector-level merge expanded dst to
                    // cover every selected index and both buffers are
                    // distinct allocations.
                    unsafe {
                        (vt.assign_range)(
                            dst_buf,
                            p.first - dst_first,
                            src_buf,
                            p.first - c.first,
                            p.len,
                        );
                    }
                }
            }
            Self::Compressed(c) => {
                let Some(src_buf) = c.buf else { return };
                let Some((dst_buf, dst_first)) = contiguous_target(dst) else {
                    return;
                };
                let src_hint = Cell::new(0);
                for p in bits.platforms().filter(|p| p.is_set()) {
                    let src_idx = c.mapping.find_data_index(p.first, &src_hint);
                    // Safety: as above.
                    unsafe {
                        (vt.assign_range)(
                            dst_buf,
                            p.first - dst_first,
                            src_buf,
                            src_idx,
                            p.len,
                        );
                    }
                }
            }
            Self::Shared(source) => source.data().merge_into(vt, bits, dst),
        }
    }
}

/// The destination storage of a merge, or a reported no-op.
fn contiguous_target(dst: &mut VectorData) -> Option<(NonNull<u8>, usize)> {
    match dst {
        VectorData::Contiguous(d) => {
            let buf = d.buf?;
            Some((buf, d.first))
        }
        _ => {
            log::error!("merge destination is not a contiguous vector");
            None
        }
    }
}

/// Single-element storage of fixed handle size.
///
/// Elements within the inline budget live directly in these bytes;
/// anything bigger (or over-aligned) lives on the heap behind a pointer
/// stored in the same bytes. The vtable's `single_inline` flag says
/// which.
#[repr(align(16))]
pub(crate) struct SingleData {
    bytes: [MaybeUninit<u8>; SINGLE_INLINE_SIZE],
}

// === impl SingleData ===

impl SingleData {
    pub(crate) fn from_value<T: Value>(value: T) -> Self {
        let mut slot = Self::uninit();
        if ElementVtable::of::<T>().single_inline {
            // Safety: the slot is big and aligned enough per the flag.
            unsafe { slot.bytes.as_mut_ptr().cast::<T>().write(value) };
        } else {
            let heap = heap_single(value);
            // Safety: the slot always fits a pointer.
            unsafe { slot.bytes.as_mut_ptr().cast::<*mut u8>().write(heap.as_ptr()) };
        }
        slot
    }

    pub(crate) fn new_default(vt: &'static ElementVtable) -> Self {
        let mut slot = Self::uninit();
        if vt.single_inline {
            // Safety: inline slot is valid storage for the element.
            unsafe { (vt.default_in_place)(slot.slot_ptr_mut()) };
        } else {
            let heap = (vt.alloc_default)(1);
            // Safety: the slot always fits a pointer.
            unsafe { slot.bytes.as_mut_ptr().cast::<*mut u8>().write(heap.as_ptr()) };
        }
        slot
    }

    fn uninit() -> Self {
        Self {
            bytes: [MaybeUninit::uninit(); SINGLE_INLINE_SIZE],
        }
    }

    /// The address of the held element.
    ///
    /// The caller must know (via the vtable) whether the element is
    /// inline; this accessor resolves the indirection either way. Only
    /// valid while `self` does not move.
    pub(crate) fn slot_ptr(&self) -> NonNull<u8> {
        // The heap case stores the element pointer in the first bytes.
        // Both cases yield the element address because the vtable decided
        // the representation at construction.
        let base = self.bytes.as_ptr().cast_mut().cast::<u8>();
        // Safety: base points into self, never null.
        unsafe { NonNull::new_unchecked(base) }
    }

    fn slot_ptr_mut(&mut self) -> NonNull<u8> {
        // Safety: as in slot_ptr.
        unsafe { NonNull::new_unchecked(self.bytes.as_mut_ptr().cast::<u8>()) }
    }

    /// The address of the element, resolving the heap indirection.
    pub(crate) fn element_ptr(&self, vt: &ElementVtable) -> NonNull<u8> {
        if vt.single_inline {
            self.slot_ptr()
        } else {
            // Safety: the heap representation stored a valid pointer.
            unsafe {
                NonNull::new_unchecked(
                    self.bytes.as_ptr().cast::<*mut u8>().read(),
                )
            }
        }
    }

    /// # Safety
    /// The slot must have been constructed through the same vtable.
    pub(crate) unsafe fn destroy(self, vt: &'static ElementVtable) {
        // Safety: representation matches the vtable's single_inline flag.
        unsafe {
            if vt.single_inline {
                (vt.drop_in_place)(self.slot_ptr());
            } else {
                (vt.dealloc)(self.element_ptr(vt), 1);
            }
        }
    }

    /// # Safety
    /// The slot must have been constructed through the same vtable.
    pub(crate) unsafe fn clone_with(&self, vt: &'static ElementVtable) -> Self {
        let mut clone = Self::uninit();
        // Safety: representation matches the vtable's single_inline flag.
        unsafe {
            if vt.single_inline {
                (vt.clone_in_place)(clone.slot_ptr_mut(), self.slot_ptr());
            } else {
                let heap = (vt.alloc_default)(1);
                (vt.assign_range)(heap, 0, self.element_ptr(vt), 0, 1);
                clone
                    .bytes
                    .as_mut_ptr()
                    .cast::<*mut u8>()
                    .write(heap.as_ptr());
            }
        }
        clone
    }
}

/// Storage for a contiguous range `[first, last]` of a logical vector.
pub(crate) struct ContiguousData {
    pub(crate) buf: Option<NonNull<u8>>,
    pub(crate) size: usize,
    pub(crate) first: usize,
    pub(crate) last: usize,
}

// === impl ContiguousData ===

impl ContiguousData {
    /// Dense storage covering `[0, size - 1]`, default initialized.
    pub(crate) fn dense(vt: &'static ElementVtable, size: usize) -> Self {
        debug_assert!(size > 0);
        Self {
            buf: Some((vt.alloc_default)(size)),
            size,
            first: 0,
            last: size - 1,
        }
    }

    /// Sparse storage covering `[first, last]`, default initialized.
    pub(crate) fn sparse(
        vt: &'static ElementVtable,
        size: usize,
        first: usize,
        last: usize,
    ) -> Self {
        debug_assert!(first <= last && last < size);
        Self {
            buf: Some((vt.alloc_default)(last - first + 1)),
            size,
            first,
            last,
        }
    }

    /// Sparse storage covering the set range of `bits`, default
    /// initialized; no storage at all when no bit is set.
    pub(crate) fn covering_bits(vt: &'static ElementVtable, bits: &Bits) -> Self {
        if bits.are_all_unset() {
            return Self {
                buf: None,
                size: bits.size(),
                first: 0,
                last: 0,
            };
        }
        Self::sparse(vt, bits.size(), bits.first_set(), bits.last_set())
    }

    /// Sparse storage holding copies of the set elements of an existing
    /// storage buffer.
    ///
    /// # Safety
    /// `src` must hold storage through the same vtable covering every set
    /// bit of `bits` with logical index `i` stored at `src[i - src_first]`.
    pub(crate) unsafe fn from_storage(
        vt: &'static ElementVtable,
        src: NonNull<u8>,
        src_first: usize,
        bits: &Bits,
    ) -> Self {
        let new = Self::covering_bits(vt, bits);
        if let Some(buf) = new.buf {
            for p in bits.platforms().filter(|p| p.is_set()) {
                // Safety: per contract, plus covering_bits sized the
                // destination to the set range.
                unsafe {
                    (vt.assign_range)(
                        buf,
                        p.first - new.first,
                        src,
                        p.first - src_first,
                        p.len,
                    );
                }
            }
        }
        new
    }

    pub(crate) fn stored_len(&self) -> usize {
        if self.buf.is_some() {
            self.last - self.first + 1
        } else {
            0
        }
    }

    pub(crate) fn clone_with(&self, vt: &'static ElementVtable) -> Self {
        let buf = self.buf.map(|src| {
            let dst = (vt.alloc_default)(self.stored_len());
            // Safety: fresh allocation of identical length.
            unsafe { (vt.assign_range)(dst, 0, src, 0, self.stored_len()) };
            dst
        });
        Self {
            buf,
            size: self.size,
            first: self.first,
            last: self.last,
        }
    }

    /// Grows (never shrinks) the stored range to cover
    /// `[new_first, new_last]`.
    pub(crate) fn expand(
        &mut self,
        vt: &'static ElementVtable,
        first: usize,
        last: usize,
    ) {
        let (new_first, new_last) = if self.buf.is_some() {
            (self.first.min(first), self.last.max(last))
        } else {
            (first, last)
        };
        if self.buf.is_some() && new_first == self.first && new_last == self.last {
            return;
        }

        let new_buf = (vt.alloc_default)(new_last - new_first + 1);
        if let Some(old) = self.buf.take() {
            let old_len = self.last - self.first + 1;
            // Safety: the new buffer covers the old range.
            unsafe {
                (vt.assign_range)(
                    new_buf,
                    self.first - new_first,
                    old,
                    0,
                    old_len,
                );
                (vt.dealloc)(old, old_len);
            }
        }

        self.buf = Some(new_buf);
        self.first = new_first;
        self.last = new_last;
    }
}

/// Packed storage for the set bits of a seeding mask, with the
/// logical-to-data block mapping.
pub(crate) struct CompressedData {
    pub(crate) buf: Option<NonNull<u8>>,
    pub(crate) size: usize,
    pub(crate) mapping: CompressedIndexMapping,
}

// === impl CompressedData ===

impl CompressedData {
    /// Packed storage holding copies of the set elements of an existing
    /// storage buffer.
    ///
    /// # Safety
    /// As for [`ContiguousData::from_storage`].
    pub(crate) unsafe fn from_storage(
        vt: &'static ElementVtable,
        src: NonNull<u8>,
        src_first: usize,
        bits: &Bits,
    ) -> Self {
        let mapping = CompressedIndexMapping::initialize(bits);
        let num_set = bits.num_set();
        if num_set == 0 {
            return Self {
                buf: None,
                size: bits.size(),
                mapping,
            };
        }

        let buf = (vt.alloc_default)(num_set);
        let mut dst_idx = 0;
        for p in bits.platforms().filter(|p| p.is_set()) {
            // Safety: per contract; the packed buffer holds num_set
            // elements in platform order.
            unsafe {
                (vt.assign_range)(buf, dst_idx, src, p.first - src_first, p.len);
            }
            dst_idx += p.len;
        }
        Self {
            buf: Some(buf),
            size: bits.size(),
            mapping,
        }
    }

    pub(crate) fn clone_with(&self, vt: &'static ElementVtable) -> Self {
        let stored = self.mapping.num_stored();
        let buf = self.buf.map(|src| {
            let dst = (vt.alloc_default)(stored);
            // Safety: fresh allocation of identical length.
            unsafe { (vt.assign_range)(dst, 0, src, 0, stored) };
            dst
        });
        Self {
            buf,
            size: self.size,
            mapping: self.mapping.clone(),
        }
    }
}

/// A heap-allocated, type-erased boxed container.
pub(crate) struct BoxedData {
    pub(crate) ptr: NonNull<u8>,
}

/// The refcounted source behind a shared vector.
///
/// The payload is immutable while shared; mutation goes through
/// detachment, which either transfers ownership (unique reference) or
/// deep-copies.
pub(crate) struct SharedSource {
    elem: &'static ElementVtable,
    data: Option<VectorData>,
}

// Safety: every element type admitted by `Value` is Send + Sync, and the
// payload is immutable while shared.
unsafe impl Send for SharedSource {}
// Safety: see above.
unsafe impl Sync for SharedSource {}

// === impl SharedSource ===

impl SharedSource {
    pub(crate) fn new(elem: &'static ElementVtable, data: VectorData) -> Self {
        Self {
            elem,
            data: Some(data),
        }
    }

    pub(crate) fn data(&self) -> &VectorData {
        self.data
            .as_ref()
            .expect("shared source accessed after ownership transfer")
    }

    /// Transfers the payload out; only valid for the unique owner.
    pub(crate) fn take_data(&mut self) -> VectorData {
        self.data
            .take()
            .expect("shared source detached twice")
    }
}

impl Drop for SharedSource {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            data.destroy(self.elem);
        }
    }
}
