// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Flyweighted bit masks.
//!
//! A [`Mask`] denotes which elements of a vectorized value are live on a
//! connection. Masks are value-interned: constructing a mask looks its
//! bit content up in a global striped registry and hands back a handle to
//! the single shared node, so equality is pointer equality and copies are
//! refcount bumps. Small masks (8 bits or fewer) are immortal and skip
//! reference counting entirely.

mod registry;

use core::ptr::NonNull;
use std::sync::LazyLock;

use bits::{AllSetIter, Bits};

use crate::registry::{BitsNode, registry};

static EMPTY_BITS: LazyLock<Bits> = LazyLock::new(|| Bits::new(0));

// All-ones mask of size 1; constructed once to keep the hottest mask
// constructor off the registry lock.
static ALL_ONES_1: LazyLock<Mask> =
    LazyLock::new(|| Mask::intern_owned(Bits::all_set(1)));

/// A value-interned handle onto a [`Bits`] container.
///
/// The null handle denotes a mask of logical size zero. Two masks compare
/// equal iff they reference the same interned node.
pub struct Mask {
    node: Option<NonNull<BitsNode>>,
}

// Safety: the interned node is only accessed through atomics (refcount)
// and immutable data (bits, hash); the registry serializes structural
// mutation.
unsafe impl Send for Mask {}
// Safety: see above; shared access never mutates the node.
unsafe impl Sync for Mask {}

// === impl Mask ===

impl Mask {
    /// Creates a mask of size `size` with no bits set. Size zero yields
    /// the null mask.
    pub fn new(size: usize) -> Self {
        if size == 0 {
            return Self { node: None };
        }
        Self::intern_owned(Bits::new(size))
    }

    /// Creates a mask of size `size` with every bit set.
    pub fn all_ones(size: usize) -> Self {
        match size {
            0 => Self { node: None },
            1 => ALL_ONES_1.clone(),
            _ => Self::intern_owned(Bits::all_set(size)),
        }
    }

    /// Creates a mask of size `size` with no bits set.
    pub fn all_zeros(size: usize) -> Self {
        Self::new(size)
    }

    /// Interns a copy of `bits`.
    pub fn from_bits(bits: &Bits) -> Self {
        if bits.size() == 1 && bits.are_all_set() {
            return ALL_ONES_1.clone();
        }
        if bits.size() == 0 {
            return Self { node: None };
        }
        Self {
            node: Some(registry().find_or_insert(bits)),
        }
    }

    /// Interns `bits`, moving the content into the node on a miss.
    pub fn from_bits_owned(bits: Bits) -> Self {
        if bits.size() == 0 {
            return Self { node: None };
        }
        Self::intern_owned(bits)
    }

    fn intern_owned(bits: Bits) -> Self {
        Self {
            node: Some(registry().find_or_emplace(bits)),
        }
    }

    fn node_ref(&self) -> Option<&BitsNode> {
        // Safety: a non-null handle holds a reference, keeping the node
        // alive for at least as long as self.
        self.node.map(|node| unsafe { &*node.as_ptr() })
    }

    /// The interned bit content; a zero-size container for the null mask.
    #[inline]
    pub fn bits(&self) -> &Bits {
        match self.node_ref() {
            Some(node) => node.bits(),
            None => &EMPTY_BITS,
        }
    }

    /// The logical size of the mask.
    #[inline]
    pub fn size(&self) -> usize {
        self.bits().size()
    }

    /// Returns `true` for the null (size zero) mask.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.node.is_none()
    }

    /// Returns `true` if every bit is set; vacuously true for the null
    /// mask.
    pub fn is_all_ones(&self) -> bool {
        self.bits().are_all_set()
    }

    /// Returns `true` if no bit is set; vacuously true for the null mask.
    pub fn is_all_zeros(&self) -> bool {
        self.bits().are_all_unset()
    }

    /// Returns `true` if at least one bit is set.
    pub fn is_any_set(&self) -> bool {
        self.bits().is_any_set()
    }

    /// The number of set bits.
    pub fn num_set(&self) -> usize {
        self.bits().num_set()
    }

    /// The first set bit, or `size()` for a mask without set bits. The
    /// null mask yields 0.
    pub fn first_set(&self) -> usize {
        self.bits().first_set()
    }

    /// The last set bit, or `size()` for a mask without set bits. The
    /// null mask yields 0.
    pub fn last_set(&self) -> usize {
        self.bits().last_set()
    }

    /// Returns `true` if the set bits are contiguous; false when no bits
    /// are set.
    pub fn is_contiguous(&self) -> bool {
        self.bits().are_contiguously_set()
    }

    /// Returns `true` if the bit at `index` is set.
    pub fn is_set(&self, index: usize) -> bool {
        match self.node_ref() {
            Some(node) => node.bits().is_set(index),
            None => {
                log::error!("is_set({index}) queried on a null mask");
                false
            }
        }
    }

    /// Returns `true` if `self` and `rhs` have any set bits in common.
    pub fn overlaps(&self, rhs: &Self) -> bool {
        if self.node == rhs.node {
            return self.is_any_set();
        }
        self.bits().has_nonempty_intersection(rhs.bits())
    }

    /// Returns `true` if `rhs` is a subset of (or equal to) `self`.
    pub fn contains(&self, rhs: &Self) -> bool {
        if self.node == rhs.node {
            return true;
        }
        !rhs.bits().has_nonempty_difference(self.bits())
    }

    /// Sets every bit.
    pub fn set_all(&mut self) {
        if self.node.is_some() {
            *self = Self::all_ones(self.size());
        }
    }

    /// Sets the bit at `index`, re-interning.
    pub fn set_index(&mut self, index: usize) {
        let Some(node) = self.node_ref() else {
            log::error!("set_index({index}) on a null mask");
            return;
        };
        let mut copy = node.bits().clone();
        copy.set(index);
        *self = Self::from_bits_owned(copy);
    }

    /// Clears the bit at `index`, re-interning.
    pub fn clear_index(&mut self, index: usize) {
        let Some(node) = self.node_ref() else {
            log::error!("clear_index({index}) on a null mask");
            return;
        };
        let mut copy = node.bits().clone();
        copy.clear(index);
        *self = Self::from_bits_owned(copy);
    }

    /// Flips every bit.
    #[must_use]
    pub fn complemented(&self) -> Self {
        match self.node_ref() {
            Some(node) => Self::from_bits_owned(node.bits().complemented()),
            None => Self { node: None },
        }
    }

    /// Assigns `rhs` if this mask is null, otherwise ORs `rhs` in.
    pub fn set_or_append(&mut self, rhs: &Self) {
        if self.node.is_none() {
            *self = rhs.clone();
        } else {
            *self = &*self | rhs;
        }
    }

    /// Iterates the set bit indices in ascending order.
    pub fn iter(&self) -> MaskIter<'_> {
        MaskIter {
            inner: self.bits().all_set_view(),
        }
    }

    /// A hash over the interned node identity. Stable for the lifetime of
    /// the process, not across runs.
    pub fn hash_value(&self) -> u64 {
        self.node.map_or(0, |node| node.as_ptr() as usize as u64)
    }
}

impl Default for Mask {
    /// The null mask of logical size zero.
    fn default() -> Self {
        Self { node: None }
    }
}

impl Clone for Mask {
    fn clone(&self) -> Self {
        if let Some(node) = self.node_ref() {
            node.retain();
        }
        Self { node: self.node }
    }
}

impl Drop for Mask {
    fn drop(&mut self) {
        let Some(ptr) = self.node else { return };
        // Safety: this handle holds a reference, the node is alive.
        let node = unsafe { &*ptr.as_ptr() };
        if node.release() {
            registry().erase(ptr);
        }
    }
}

impl PartialEq for Mask {
    /// Equality is identity of the interned node.
    fn eq(&self, rhs: &Self) -> bool {
        self.node == rhs.node
    }
}

impl Eq for Mask {}

impl core::hash::Hash for Mask {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_value());
    }
}

impl std::fmt::Debug for Mask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.bits().fmt(f)
    }
}

impl std::ops::BitAnd for &Mask {
    type Output = Mask;

    fn bitand(self, rhs: &Mask) -> Mask {
        if self.node == rhs.node {
            return self.clone();
        }
        Mask::from_bits_owned(self.bits() & rhs.bits())
    }
}

impl std::ops::BitOr for &Mask {
    type Output = Mask;

    fn bitor(self, rhs: &Mask) -> Mask {
        if self.node == rhs.node {
            return self.clone();
        }
        Mask::from_bits_owned(self.bits() | rhs.bits())
    }
}

impl std::ops::BitXor for &Mask {
    type Output = Mask;

    fn bitxor(self, rhs: &Mask) -> Mask {
        if self.node.is_none() && rhs.node.is_none() {
            return Mask::default();
        }
        Mask::from_bits_owned(self.bits() ^ rhs.bits())
    }
}

impl std::ops::Sub for &Mask {
    type Output = Mask;

    /// Asymmetric difference: clears the bits that are set in `rhs`.
    fn sub(self, rhs: &Mask) -> Mask {
        if self.node.is_none() && rhs.node.is_none() {
            return Mask::default();
        }
        Mask::from_bits_owned(self.bits() - rhs.bits())
    }
}

/// Iterator over the set bits of a mask.
pub struct MaskIter<'a> {
    inner: AllSetIter<'a>,
}

impl MaskIter<'_> {
    /// Skips ahead to the first set index at or after `index`, consuming
    /// and returning it.
    pub fn advance_to(&mut self, index: usize) -> Option<usize> {
        self.inner.advance_to(index)
    }
}

impl Iterator for MaskIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.inner.next()
    }
}

/// The total number of interned masks across all registry shards. For
/// test use only.
pub fn registry_size() -> usize {
    registry().len()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;

    use super::*;

    // Tests asserting on the global registry size serialize on this lock
    // so parallel tests in this crate cannot skew the counts.
    static SIZE_LOCK: Mutex<()> = Mutex::new(());

    fn mortal_bits(tag: usize) -> Bits {
        // Unique, > 8 bits, so the interned node is mortal.
        Bits::from_indices(4000, &[tag, tag + 7, 3999])
    }

    #[test]
    fn equality_is_interned_identity() {
        let a = Mask::from_bits(&Bits::from_indices(100, &[2, 30]));
        let b = Mask::from_bits(&Bits::from_indices(100, &[2, 30]));
        let c = Mask::from_bits(&Bits::from_indices(100, &[2, 31]));
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
        assert_ne!(a, c);
        assert_eq!(a.bits(), b.bits());
    }

    #[test]
    fn null_mask() {
        let m = Mask::default();
        assert!(m.is_empty());
        assert_eq!(m.size(), 0);
        assert!(m.is_all_ones());
        assert!(m.is_all_zeros());
        assert!(!m.is_any_set());
        assert_eq!(m.iter().count(), 0);
        assert_eq!(Mask::all_ones(0), m);
        assert_eq!(Mask::new(0), m);
    }

    #[test]
    fn all_ones_of_size_one_is_a_singleton() {
        let a = Mask::all_ones(1);
        let b = Mask::from_bits(&Bits::all_set(1));
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn operators_match_bit_algebra() {
        let b1 = Bits::from_indices(64, &[1, 5, 9]);
        let b2 = Bits::from_indices(64, &[5, 9, 11]);
        let (m1, m2) = (Mask::from_bits(&b1), Mask::from_bits(&b2));

        assert_eq!(&m1 & &m2, Mask::from_bits_owned(&b1 & &b2));
        assert_eq!(&m1 | &m2, Mask::from_bits_owned(&b1 | &b2));
        assert_eq!(&m1 ^ &m2, Mask::from_bits_owned(&b1 ^ &b2));
        assert_eq!(&m1 - &m2, Mask::from_bits_owned(&b1 - &b2));
        assert_eq!(m1.complemented(), Mask::from_bits_owned(b1.complemented()));

        assert!(m1.overlaps(&m2));
        assert!(m1.contains(&(&m1 & &m2)));
        assert!(!m1.contains(&m2));

        // Identical nodes short-circuit.
        assert_eq!(&m1 & &m1, m1);
        assert_eq!(&m1 | &m1, m1);
    }

    #[test]
    fn set_or_append() {
        let mut m = Mask::default();
        let ones = Mask::all_ones(16);
        m.set_or_append(&ones);
        assert_eq!(m, ones);

        let other = Mask::from_bits(&Bits::from_indices(16, &[3]));
        m.set_or_append(&other);
        assert_eq!(m, ones);
    }

    #[test]
    fn set_and_clear_index_reintern() {
        let mut m = Mask::new(32);
        m.set_index(4);
        m.set_index(9);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![4, 9]);
        m.clear_index(4);
        assert_eq!(m, Mask::from_bits(&Bits::from_indices(32, &[9])));
    }

    #[test]
    fn immortal_masks_survive_all_drops() {
        let _guard = SIZE_LOCK.lock().unwrap();

        let first = Mask::from_bits(&Bits::from_indices(4, &[1, 2]));
        let addr = first.hash_value();
        let size_after_insert = registry_size();
        drop(first);

        // Re-inserting an equal mask must find the same interned node and
        // leave the registry size unchanged.
        let second = Mask::from_bits(&Bits::from_indices(4, &[1, 2]));
        assert_eq!(second.hash_value(), addr);
        assert_eq!(registry_size(), size_after_insert);
    }

    #[test]
    fn mortal_masks_are_erased_on_last_drop() {
        let _guard = SIZE_LOCK.lock().unwrap();

        let baseline = registry_size();
        let m = Mask::from_bits_owned(mortal_bits(11));
        let copy = m.clone();
        assert_eq!(registry_size(), baseline + 1);

        drop(m);
        assert_eq!(registry_size(), baseline + 1);
        drop(copy);
        assert_eq!(registry_size(), baseline);
    }

    #[test]
    fn concurrent_intern_and_drop_churn() {
        let _guard = SIZE_LOCK.lock().unwrap();

        let baseline = registry_size();
        let threads: Vec<_> = (0..8)
            .map(|t| {
                thread::spawn(move || {
                    for i in 0..500 {
                        // Half the values collide across threads to force
                        // find/erase races on shared nodes.
                        let tag = 100 + (i % 5) + if t % 2 == 0 { 0 } else { 50 };
                        let m = Mask::from_bits_owned(mortal_bits(tag));
                        let n = m.clone();
                        assert_eq!(m, n);
                        drop(m);
                        drop(n);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        // Every handle was dropped, the churn must leave no net entries.
        assert_eq!(registry_size(), baseline);
    }
}
