// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A compressed bit container.
//!
//! [`Bits`] stores a fixed-size sequence of bits as alternating runs
//! ("platforms") of zeros and ones. Masks flowing through a dataflow
//! network tend to be long stretches of identical bits, which makes the
//! run-length encoding both compact and fast to combine: set algebra runs
//! over the runs, not over the individual bits.
//!
//! The run vector always begins with a zeros platform, which may have
//! length zero; every other platform has nonzero length. The sum of all
//! run lengths equals the logical size.

mod view;

use smallvec::SmallVec;

pub use view::{AllSetIter, Platform, PlatformsIter};

/// Multiplicative constant of the fx hash family.
const HASH_K: u64 = 0x51_7c_c1_b7_27_22_0a_95;

type Runs = SmallVec<[u32; 6]>;

/// A fixed-size set of bits in run-length encoded form.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bits {
    // Alternating run lengths; runs[0] counts leading zeros and is the only
    // run permitted to be empty. Odd positions hold set runs.
    runs: Runs,
    size: u32,
    num_set: u32,
}

// === impl Bits ===

impl Bits {
    /// Creates a container of `size` bits, all unset.
    pub fn new(size: usize) -> Self {
        let size = to_u32(size);
        let mut runs = Runs::new();
        if size > 0 {
            runs.push(size);
        }
        Self {
            runs,
            size,
            num_set: 0,
        }
    }

    /// Creates a container of `size` bits, all set.
    pub fn all_set(size: usize) -> Self {
        let size = to_u32(size);
        let mut runs = Runs::new();
        if size > 0 {
            runs.push(0);
            runs.push(size);
        }
        Self {
            runs,
            size,
            num_set: size,
        }
    }

    /// Creates a container of `size` bits with only `index` set.
    pub fn single(size: usize, index: usize) -> Self {
        assert!(index < size);
        let mut bits = Self::builder();
        bits.append(index, false);
        bits.append(1, true);
        bits.append(size - index - 1, false);
        bits
    }

    /// Creates a container of `size` bits with the given ascending indices
    /// set.
    pub fn from_indices(size: usize, indices: &[usize]) -> Self {
        let mut bits = Self::builder();
        let mut cursor = 0;
        for &i in indices {
            assert!(i >= cursor, "indices must be ascending");
            bits.append(i - cursor, false);
            bits.append(1, true);
            cursor = i + 1;
        }
        bits.append(size - cursor, false);
        bits
    }

    /// Creates an empty builder; grow it with [`Bits::append`].
    pub fn builder() -> Self {
        Self::default()
    }

    /// Appends `len` bits of the given value.
    pub fn append(&mut self, len: usize, value: bool) {
        if len == 0 {
            return;
        }
        let len = to_u32(len);

        if self.runs.is_empty() && value {
            self.runs.push(0);
        }

        match self.runs.len() {
            0 => self.runs.push(len),
            n => {
                // Odd run positions hold set runs.
                let last_is_set = (n - 1) % 2 == 1;
                if last_is_set == value {
                    self.runs[n - 1] += len;
                } else {
                    self.runs.push(len);
                }
            }
        }

        self.size += len;
        if value {
            self.num_set += len;
        }
    }

    /// The number of bits held, set or not.
    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// The number of set bits.
    #[inline]
    pub fn num_set(&self) -> usize {
        self.num_set as usize
    }

    /// Returns `true` if every bit is set. A zero-size container counts as
    /// all-set.
    #[inline]
    pub fn are_all_set(&self) -> bool {
        self.num_set == self.size
    }

    /// Returns `true` if no bit is set.
    #[inline]
    pub fn are_all_unset(&self) -> bool {
        self.num_set == 0
    }

    /// Returns `true` if at least one bit is set.
    #[inline]
    pub fn is_any_set(&self) -> bool {
        self.num_set > 0
    }

    /// Returns `true` if the set bits form exactly one contiguous run.
    /// False when no bits are set.
    pub fn are_contiguously_set(&self) -> bool {
        self.num_set > 0 && self.platforms().filter(Platform::is_set).count() == 1
    }

    /// The index of the first set bit, or `size()` when no bit is set.
    pub fn first_set(&self) -> usize {
        if self.num_set == 0 {
            return self.size();
        }
        self.runs[0] as usize
    }

    /// The index of the last set bit, or `size()` when no bit is set.
    pub fn last_set(&self) -> usize {
        if self.num_set == 0 {
            return self.size();
        }
        let mut last = 0;
        for p in self.platforms() {
            if p.is_set() {
                last = p.first + p.len - 1;
            }
        }
        last
    }

    /// Returns `true` if the bit at `index` is set.
    pub fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < self.size());
        for p in self.platforms() {
            if index < p.first + p.len {
                return p.set;
            }
        }
        false
    }

    /// The index of the `n`-th (zero-based) set bit.
    ///
    /// Must only be called with `n < num_set()`.
    pub fn find_nth_set(&self, n: usize) -> usize {
        debug_assert!(n < self.num_set());
        let mut remaining = n;
        for p in self.platforms() {
            if p.set {
                if remaining < p.len {
                    return p.first + remaining;
                }
                remaining -= p.len;
            }
        }
        unreachable!("find_nth_set called with n >= num_set");
    }

    /// The number of set platforms, i.e. contiguous runs of set bits.
    pub fn num_set_platforms(&self) -> usize {
        self.platforms().filter(Platform::is_set).count()
    }

    /// Returns `true` if `self` and `rhs` have at least one set bit in
    /// common.
    pub fn has_nonempty_intersection(&self, rhs: &Self) -> bool {
        self.any_chunk(rhs, |a, b| a && b)
    }

    /// Returns `true` if at least one bit is set in `self` that is not set
    /// in `rhs`.
    pub fn has_nonempty_difference(&self, rhs: &Self) -> bool {
        self.any_chunk(rhs, |a, b| a && !b)
    }

    /// Returns `true` if every set bit of `rhs` is also set in `self`.
    pub fn contains(&self, rhs: &Self) -> bool {
        !rhs.has_nonempty_difference(self)
    }

    /// Flips every bit in place.
    pub fn complement(&mut self) {
        let mut out = Self::builder();
        for p in self.platforms() {
            out.append(p.len, !p.set);
        }
        *self = out;
    }

    /// Returns a complemented copy.
    #[must_use]
    pub fn complemented(&self) -> Self {
        let mut copy = self.clone();
        copy.complement();
        copy
    }

    /// Sets the bit at `index`.
    pub fn set(&mut self, index: usize) {
        if !self.is_set(index) {
            *self = self.combine(&Self::single(self.size(), index), |a, b| a | b);
        }
    }

    /// Clears the bit at `index`.
    pub fn clear(&mut self, index: usize) {
        if self.is_set(index) {
            *self = self.combine(&Self::single(self.size(), index), |a, b| a & !b);
        }
    }

    /// Iterates the platforms (runs) of this container in order.
    pub fn platforms(&self) -> PlatformsIter<'_> {
        PlatformsIter::new(self)
    }

    /// Iterates the indices of the set bits in ascending order.
    pub fn all_set_view(&self) -> AllSetIter<'_> {
        AllSetIter::new(self)
    }

    /// A cheap content hash: equal bits hash equal. Used as the interning
    /// hash by the mask registry.
    pub fn fast_hash(&self) -> u64 {
        let mut h = u64::from(self.size);
        for &run in &self.runs {
            h = (h.rotate_left(5) ^ u64::from(run)).wrapping_mul(HASH_K);
        }
        h
    }

    /// Combines two equal-size containers chunk-by-chunk with `op`.
    fn combine(&self, rhs: &Self, op: impl Fn(bool, bool) -> bool) -> Self {
        debug_assert_eq!(self.size, rhs.size);

        let mut out = Self::builder();
        let mut lhs_iter = self.platforms().peekable();
        let mut rhs_iter = rhs.platforms().peekable();
        let (mut lhs_used, mut rhs_used) = (0usize, 0usize);

        while let (Some(a), Some(b)) = (lhs_iter.peek(), rhs_iter.peek()) {
            let chunk = (a.len - lhs_used).min(b.len - rhs_used);
            out.append(chunk, op(a.set, b.set));

            lhs_used += chunk;
            rhs_used += chunk;
            if lhs_used == a.len {
                lhs_iter.next();
                lhs_used = 0;
            }
            if rhs_used == b.len {
                rhs_iter.next();
                rhs_used = 0;
            }
        }
        out
    }

    /// Returns `true` for the first chunk where `op` holds; early-exits.
    fn any_chunk(&self, rhs: &Self, op: impl Fn(bool, bool) -> bool) -> bool {
        debug_assert_eq!(self.size, rhs.size);

        let mut lhs_iter = self.platforms().peekable();
        let mut rhs_iter = rhs.platforms().peekable();
        let (mut lhs_used, mut rhs_used) = (0usize, 0usize);

        while let (Some(a), Some(b)) = (lhs_iter.peek(), rhs_iter.peek()) {
            if op(a.set, b.set) {
                return true;
            }
            let chunk = (a.len - lhs_used).min(b.len - rhs_used);
            lhs_used += chunk;
            rhs_used += chunk;
            if lhs_used == a.len {
                lhs_iter.next();
                lhs_used = 0;
            }
            if rhs_used == b.len {
                rhs_iter.next();
                rhs_used = 0;
            }
        }
        false
    }

    // Size disagreement on binary operators is a reported error; the
    // operation declines and leaves the left operand unchanged.
    fn check_sizes(&self, rhs: &Self, what: &str) -> bool {
        if self.size != rhs.size {
            log::error!(
                "size mismatch in bit {what}: {} vs. {}",
                self.size,
                rhs.size
            );
            return false;
        }
        true
    }

    pub(crate) fn runs(&self) -> &[u32] {
        &self.runs
    }
}

impl std::ops::BitAnd for &Bits {
    type Output = Bits;

    fn bitand(self, rhs: &Bits) -> Bits {
        if !self.check_sizes(rhs, "intersection") {
            return self.clone();
        }
        self.combine(rhs, |a, b| a & b)
    }
}

impl std::ops::BitOr for &Bits {
    type Output = Bits;

    fn bitor(self, rhs: &Bits) -> Bits {
        if !self.check_sizes(rhs, "union") {
            return self.clone();
        }
        self.combine(rhs, |a, b| a | b)
    }
}

impl std::ops::BitXor for &Bits {
    type Output = Bits;

    fn bitxor(self, rhs: &Bits) -> Bits {
        if !self.check_sizes(rhs, "symmetric difference") {
            return self.clone();
        }
        self.combine(rhs, |a, b| a ^ b)
    }
}

impl std::ops::Sub for &Bits {
    type Output = Bits;

    /// Asymmetric set difference: clears the bits that are set in `rhs`.
    fn sub(self, rhs: &Bits) -> Bits {
        if !self.check_sizes(rhs, "difference") {
            return self.clone();
        }
        self.combine(rhs, |a, b| a & !b)
    }
}

impl std::fmt::Debug for Bits {
    /// Formats the container as an RLE string, e.g. `110001111` prints as
    /// `1x2-0x3-1x4`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for p in self.platforms() {
            if !first {
                f.write_str("-")?;
            }
            write!(f, "{}x{}", u32::from(p.set), p.len)?;
            first = false;
        }
        Ok(())
    }
}

fn to_u32(x: usize) -> u32 {
    u32::try_from(x).expect("bit container size exceeds u32::MAX")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(b: &Bits) -> Vec<usize> {
        b.all_set_view().collect()
    }

    #[test]
    fn construction() {
        let b = Bits::new(10);
        assert_eq!(b.size(), 10);
        assert_eq!(b.num_set(), 0);
        assert!(b.are_all_unset());
        assert!(!b.is_any_set());
        assert_eq!(b.first_set(), 10);
        assert_eq!(b.last_set(), 10);

        let b = Bits::all_set(10);
        assert_eq!(b.num_set(), 10);
        assert!(b.are_all_set());
        assert!(b.are_contiguously_set());
        assert_eq!(b.first_set(), 0);
        assert_eq!(b.last_set(), 9);

        let b = Bits::new(0);
        assert_eq!(b.size(), 0);
        assert!(b.are_all_set());
        assert!(b.are_all_unset());
    }

    #[test]
    fn from_indices_round_trips() {
        let b = Bits::from_indices(1500, &[1, 3, 4, 1499]);
        assert_eq!(b.size(), 1500);
        assert_eq!(b.num_set(), 4);
        assert_eq!(indices(&b), vec![1, 3, 4, 1499]);
        assert_eq!(b.first_set(), 1);
        assert_eq!(b.last_set(), 1499);
        assert!(!b.are_contiguously_set());
        assert_eq!(b.num_set_platforms(), 3);
    }

    #[test]
    fn is_set_and_nth() {
        let b = Bits::from_indices(20, &[0, 5, 6, 19]);
        assert!(b.is_set(0));
        assert!(!b.is_set(1));
        assert!(b.is_set(6));
        assert!(b.is_set(19));
        assert_eq!(b.find_nth_set(0), 0);
        assert_eq!(b.find_nth_set(2), 6);
        assert_eq!(b.find_nth_set(3), 19);
    }

    #[test]
    fn algebra() {
        let a = Bits::from_indices(10, &[1, 2, 3]);
        let b = Bits::from_indices(10, &[3, 4]);

        assert_eq!(indices(&(&a | &b)), vec![1, 2, 3, 4]);
        assert_eq!(indices(&(&a & &b)), vec![3]);
        assert_eq!(indices(&(&a ^ &b)), vec![1, 2, 4]);
        assert_eq!(indices(&(&a - &b)), vec![1, 2]);

        assert!(a.has_nonempty_intersection(&b));
        assert!(a.has_nonempty_difference(&b));
        assert!(a.contains(&(&a & &b)));
        assert!(!a.contains(&b));

        let c = a.complemented();
        assert_eq!(indices(&c), vec![0, 4, 5, 6, 7, 8, 9]);
        assert_eq!(c.complemented(), a);
    }

    #[test]
    fn size_mismatch_is_a_noop() {
        let a = Bits::from_indices(10, &[1]);
        let b = Bits::from_indices(12, &[1]);
        assert_eq!(&a | &b, a);
    }

    #[test]
    fn set_and_clear() {
        let mut b = Bits::new(8);
        b.set(3);
        b.set(4);
        assert_eq!(indices(&b), vec![3, 4]);
        assert!(b.are_contiguously_set());
        b.clear(3);
        assert_eq!(indices(&b), vec![4]);
        // Redundant updates are no-ops.
        b.set(4);
        b.clear(3);
        assert_eq!(indices(&b), vec![4]);
    }

    #[test]
    fn platforms_view() {
        let b = Bits::from_indices(10, &[2, 3, 7]);
        let platforms: Vec<_> = b.platforms().map(|p| (p.first, p.len, p.set)).collect();
        assert_eq!(
            platforms,
            vec![
                (0, 2, false),
                (2, 2, true),
                (4, 3, false),
                (7, 1, true),
                (8, 2, false)
            ]
        );
    }

    #[test]
    fn all_set_advance_to() {
        let b = Bits::from_indices(30, &[2, 9, 10, 25]);
        let mut it = b.all_set_view();
        assert_eq!(it.next(), Some(2));
        assert_eq!(it.advance_to(10), Some(10));
        assert_eq!(it.next(), Some(25));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn hash_is_content_based() {
        let a = Bits::from_indices(100, &[5, 6, 7]);
        let mut b = Bits::builder();
        b.append(5, false);
        b.append(3, true);
        b.append(92, false);
        assert_eq!(a, b);
        assert_eq!(a.fast_hash(), b.fast_hash());
        assert_ne!(a.fast_hash(), Bits::new(100).fast_hash());
    }

    #[test]
    fn append_coalesces_runs() {
        let mut b = Bits::builder();
        b.append(3, true);
        b.append(2, true);
        b.append(0, false);
        b.append(1, false);
        assert_eq!(b.size(), 6);
        assert_eq!(b.num_set(), 5);
        assert!(b.are_contiguously_set());
        assert_eq!(format!("{b:?}"), "1x5-0x1");
    }
}
