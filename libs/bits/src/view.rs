// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Bits;

/// One run of identical bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Platform {
    /// Index of the first bit in the run.
    pub first: usize,
    /// Number of bits in the run.
    pub len: usize,
    /// Whether the bits in the run are set.
    pub set: bool,
}

impl Platform {
    #[inline]
    pub fn is_set(&self) -> bool {
        self.set
    }

    /// Index one past the last bit in the run.
    #[inline]
    pub fn end(&self) -> usize {
        self.first + self.len
    }
}

/// Iterates the runs of a [`Bits`] in order. Zero-length runs (the leading
/// zeros run may be empty) are skipped.
#[derive(Clone)]
pub struct PlatformsIter<'a> {
    runs: &'a [u32],
    pos: usize,
    start: usize,
}

impl<'a> PlatformsIter<'a> {
    pub(crate) fn new(bits: &'a Bits) -> Self {
        Self {
            runs: bits.runs(),
            pos: 0,
            start: 0,
        }
    }
}

impl Iterator for PlatformsIter<'_> {
    type Item = Platform;

    fn next(&mut self) -> Option<Platform> {
        while self.pos < self.runs.len() {
            let len = self.runs[self.pos] as usize;
            let set = self.pos % 2 == 1;
            let first = self.start;
            self.pos += 1;
            self.start += len;
            if len > 0 {
                return Some(Platform { first, len, set });
            }
        }
        None
    }
}

/// Iterates the indices of the set bits of a [`Bits`] in ascending order.
#[derive(Clone)]
pub struct AllSetIter<'a> {
    platforms: PlatformsIter<'a>,
    // Remaining index range of the current set platform.
    next: usize,
    end: usize,
}

impl<'a> AllSetIter<'a> {
    pub(crate) fn new(bits: &'a Bits) -> Self {
        Self {
            platforms: bits.platforms(),
            next: 0,
            end: 0,
        }
    }

    /// Skips ahead to the first set index at or after `index` and returns
    /// it, consuming it. Returns `None` if no such index remains.
    pub fn advance_to(&mut self, index: usize) -> Option<usize> {
        loop {
            if self.next < self.end {
                if self.end <= index {
                    // The whole platform lies before the target.
                    self.next = self.end;
                    continue;
                }
                let found = self.next.max(index);
                self.next = found + 1;
                return Some(found);
            }
            let p = self.platforms.find(Platform::is_set)?;
            self.next = p.first;
            self.end = p.end();
        }
    }
}

impl Iterator for AllSetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next >= self.end {
            let p = self.platforms.find(Platform::is_set)?;
            self.next = p.first;
            self.end = p.end();
        }
        let i = self.next;
        self.next += 1;
        Some(i)
    }
}
