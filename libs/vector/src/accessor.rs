// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::boxed::{BoxedContainer, BoxedRange};
use crate::compressed::CompressedIndexMapping;
use crate::data::Info;
use crate::element::{ElementVtable, Value};

/// The typed core shared by the read and read/write accessors.
///
/// Element lookup first consults the compressed index mapping (if any),
/// remembering the last successful block so monotonic access stays cheap;
/// otherwise it addresses `base[i - first]`.
pub(crate) struct RawAccessor<'a, T: Value> {
    num_values: usize,
    base: Option<NonNull<T>>,
    first: usize,
    stored: usize,
    mapping: Option<&'a CompressedIndexMapping>,
    hint: Cell<usize>,
    boxed: bool,
    _marker: PhantomData<&'a T>,
}

// === impl RawAccessor ===

impl<'a, T: Value> RawAccessor<'a, T> {
    #[track_caller]
    pub(crate) fn new(vt: &'static ElementVtable, info: Info<'a>) -> Self {
        vt.check::<T>();

        if info.boxed {
            // Exactly one data element holding the container.
            debug_assert!(info.mapping.is_none() && info.size == 1);
            let (base, len) = match info.data {
                Some(ptr) => {
                    // Safety: a boxed layout's data pointer addresses a
                    // live BoxedContainer<T>; the borrow is tied to 'a.
                    let container =
                        unsafe { &mut *ptr.as_ptr().cast::<BoxedContainer<T>>() };
                    (
                        NonNull::new(container.data_mut().as_mut_ptr()),
                        container.len(),
                    )
                }
                None => (None, 0),
            };
            return Self {
                num_values: len,
                base,
                first: 0,
                stored: len,
                mapping: None,
                hint: Cell::new(0),
                boxed: true,
                _marker: PhantomData,
            };
        }

        Self {
            num_values: info.size,
            base: info.data.map(NonNull::cast),
            first: if info.mapping.is_some() { 0 } else { info.first },
            stored: info.stored,
            mapping: info.mapping,
            hint: Cell::new(0),
            boxed: false,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn num_values(&self) -> usize {
        self.num_values
    }

    #[inline]
    pub(crate) fn is_boxed(&self) -> bool {
        self.boxed
    }

    /// The storage address of logical element `i`.
    fn element_ptr(&self, i: usize) -> NonNull<T> {
        let base = self.base.expect("vector has no stored elements");
        let idx = match self.mapping {
            Some(mapping) => mapping.find_data_index(i, &self.hint),
            None => i - self.first,
        };
        debug_assert!(idx < self.stored, "element {i} is not stored");
        // Safety: idx addresses a stored element of the live buffer the
        // accessor borrows.
        unsafe { NonNull::new_unchecked(base.as_ptr().add(idx)) }
    }

    pub(crate) fn get(&self, i: usize) -> &'a T {
        // Safety: element_ptr yields a live element; shared access only.
        unsafe { self.element_ptr(i).as_ref() }
    }

    /// # Safety
    /// The accessor must have been created from an exclusively borrowed
    /// vector.
    pub(crate) unsafe fn get_mut(&mut self, i: usize) -> &'a mut T {
        // Safety: exclusivity per contract; the pointee is live.
        unsafe { self.element_ptr(i).as_mut() }
    }
}

/// Read-only element access into a vector.
///
/// Indices are logical; accessing an element the layout does not store is
/// checked in debug builds only.
pub struct ReadAccessor<'a, T: Value> {
    raw: RawAccessor<'a, T>,
}

// === impl ReadAccessor ===

impl<'a, T: Value> ReadAccessor<'a, T> {
    pub(crate) fn new(vt: &'static ElementVtable, info: Info<'a>) -> Self {
        Self {
            raw: RawAccessor::new(vt, info),
        }
    }

    /// The logical size of the vector (number of values it holds).
    pub fn num_values(&self) -> usize {
        self.raw.num_values()
    }

    pub fn is_empty(&self) -> bool {
        self.num_values() == 0
    }

    /// Whether this accessor provides element-wise access into a boxed
    /// container.
    pub fn is_boxed(&self) -> bool {
        self.raw.is_boxed()
    }

    pub fn at(&self, i: usize) -> &T {
        self.raw.get(i)
    }

    /// Like [`Self::at`], but borrowing for the full lifetime of the
    /// underlying vector. Lets callers hold elements beyond the accessor
    /// itself.
    pub fn get(&self, i: usize) -> &'a T {
        self.raw.get(i)
    }
}

impl<T: Value> std::ops::Index<usize> for ReadAccessor<'_, T> {
    type Output = T;

    fn index(&self, i: usize) -> &T {
        self.raw.get(i)
    }
}

/// Mutable element access into a vector.
///
/// Obtaining one detaches shared storage first, so writes never alias
/// another vector's data.
pub struct ReadWriteAccessor<'a, T: Value> {
    raw: RawAccessor<'a, T>,
}

// === impl ReadWriteAccessor ===

impl<'a, T: Value> ReadWriteAccessor<'a, T> {
    /// # Safety
    /// `info` must describe storage behind an exclusive borrow for 'a.
    pub(crate) unsafe fn new(vt: &'static ElementVtable, info: Info<'a>) -> Self {
        Self {
            raw: RawAccessor::new(vt, info),
        }
    }

    pub fn num_values(&self) -> usize {
        self.raw.num_values()
    }

    pub fn is_empty(&self) -> bool {
        self.num_values() == 0
    }

    pub fn is_boxed(&self) -> bool {
        self.raw.is_boxed()
    }

    pub fn at(&self, i: usize) -> &T {
        self.raw.get(i)
    }

    pub fn at_mut(&mut self, i: usize) -> &mut T {
        // Safety: constructed from an exclusive borrow per new().
        unsafe { self.raw.get_mut(i) }
    }
}

impl<T: Value> std::ops::Index<usize> for ReadWriteAccessor<'_, T> {
    type Output = T;

    fn index(&self, i: usize) -> &T {
        self.raw.get(i)
    }
}

impl<T: Value> std::ops::IndexMut<usize> for ReadWriteAccessor<'_, T> {
    fn index_mut(&mut self, i: usize) -> &mut T {
        self.at_mut(i)
    }
}

/// Read-only access to the logical subranges of a vector.
///
/// Boxed vectors expose their range table; any other layout presents its
/// stored elements as a single range.
pub struct SubrangeAccessor<'a, T: Value> {
    container: Option<&'a BoxedContainer<T>>,
    raw: RawAccessor<'a, T>,
}

// === impl SubrangeAccessor ===

impl<'a, T: Value> SubrangeAccessor<'a, T> {
    pub(crate) fn new(vt: &'static ElementVtable, info: Info<'a>) -> Self {
        vt.check::<T>();
        let container = if info.boxed {
            // Safety: boxed layouts point at a live BoxedContainer<T>.
            info.data
                .map(|ptr| unsafe { &*ptr.as_ptr().cast::<BoxedContainer<T>>() })
        } else {
            None
        };
        Self {
            container,
            raw: RawAccessor::new(vt, info),
        }
    }

    pub fn num_ranges(&self) -> usize {
        match self.container {
            Some(c) => c.ranges().len(),
            None => usize::from(self.raw.num_values() > 0),
        }
    }

    pub fn range(&self, i: usize) -> BoxedRange {
        match self.container {
            Some(c) => c.ranges().get(i),
            None => {
                debug_assert_eq!(i, 0);
                BoxedRange {
                    begin: 0,
                    end: self.raw.num_values(),
                }
            }
        }
    }

    /// The elements of range `i` as a slice.
    pub fn range_data(&self, i: usize) -> &'a [T] {
        match self.container {
            Some(c) => {
                let r = c.ranges().get(i);
                &c.data()[r.begin..r.end]
            }
            None => {
                debug_assert_eq!(i, 0);
                let len = self.raw.num_values();
                if len == 0 {
                    return &[];
                }
                let first = self.raw.get(self.raw.first);
                // Safety: non-boxed storage is contiguous over the stored
                // range starting at `first`.
                unsafe { core::slice::from_raw_parts(first, self.raw.stored) }
            }
        }
    }
}
