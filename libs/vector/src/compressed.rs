// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;

use bits::Bits;

/// One block of the compressed index mapping.
///
/// `logical_start` is the first logical index of a run of contiguous
/// stored elements; `data_end` is the packed-storage index one past the
/// run's final element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IndexBlockMapping {
    pub logical_start: usize,
    pub data_end: usize,
}

/// Maps logical element indices of a compressed vector to indices into
/// its packed storage.
///
/// An example vector with letters representing stored values:
///
/// ```text
///   logical vector:   [ A BC  DE ]
///   logical indices:   0123456789
///   packed storage:   [ABCDE]
///   block mappings:   (1,1), (3,3), (7,5)
/// ```
///
/// The third block `(7, 5)` says the third contiguous run of data (D, E)
/// starts at logical index 7 and ends before packed index 5. The packed
/// index of logical 7 is the previous block's end index, 3. The total
/// number of stored elements is the final block's end index.
#[derive(Clone, Debug, Default)]
pub(crate) struct CompressedIndexMapping {
    blocks: Vec<IndexBlockMapping>,
}

// === impl CompressedIndexMapping ===

impl CompressedIndexMapping {
    /// Builds a mapping whose block layout matches the set bits of
    /// `bits`.
    pub(crate) fn initialize(bits: &Bits) -> Self {
        let mut blocks = Vec::with_capacity(bits.num_set_platforms());
        let mut data_idx = 0;
        for p in bits.platforms().filter(|p| p.is_set()) {
            data_idx += p.len;
            blocks.push(IndexBlockMapping {
                logical_start: p.first,
                data_end: data_idx,
            });
        }
        Self { blocks }
    }

    /// The total number of stored elements.
    pub(crate) fn num_stored(&self) -> usize {
        self.blocks.last().map_or(0, |b| b.data_end)
    }

    /// The first logical index covered by the mapping.
    pub(crate) fn first_index(&self) -> usize {
        self.block_first_index(0)
    }

    /// The last logical index covered by the mapping.
    pub(crate) fn last_index(&self) -> usize {
        self.block_last_index(self.blocks.len() - 1)
    }

    /// Finds the packed index for `logical_idx`.
    ///
    /// The block in `hint` is probed first; callers that iterate
    /// monotonically almost always hit the hint or the block right after
    /// it, skipping the binary search. The containing block is written
    /// back to `hint`.
    pub(crate) fn find_data_index(&self, logical_idx: usize, hint: &Cell<usize>) -> usize {
        let block = hint.get();
        if let Some(data_idx) = self.compute_data_index(block, logical_idx) {
            return data_idx;
        }

        if block + 1 < self.blocks.len() {
            if let Some(data_idx) = self.compute_data_index(block + 1, logical_idx) {
                hint.set(block + 1);
                return data_idx;
            }
        }

        let block = self.find_block_index(logical_idx);
        hint.set(block);
        self.compute_data_index(block, logical_idx)
            .expect("logical index is not stored in the compressed mapping")
    }

    /// The index of the block containing `logical_idx`, found by binary
    /// search.
    pub(crate) fn find_block_index(&self, logical_idx: usize) -> usize {
        debug_assert!(!self.blocks.is_empty());
        // partition_point yields the first block starting after the
        // query; the containing block is right before it.
        self.blocks
            .partition_point(|b| b.logical_start <= logical_idx)
            .saturating_sub(1)
    }

    /// The packed index of `logical_idx` if the given block covers it.
    pub(crate) fn compute_data_index(
        &self,
        block_idx: usize,
        logical_idx: usize,
    ) -> Option<usize> {
        let block_start = self.block_first_index(block_idx);
        let data_start = self.block_data_start(block_idx);
        let data_end = self.blocks[block_idx].data_end;

        let data_idx = data_start
            .checked_add(logical_idx.checked_sub(block_start)?)?;
        (data_idx < data_end).then_some(data_idx)
    }

    pub(crate) fn block_first_index(&self, block_idx: usize) -> usize {
        self.blocks[block_idx].logical_start
    }

    pub(crate) fn block_last_index(&self, block_idx: usize) -> usize {
        self.block_first_index(block_idx) + self.block_len(block_idx) - 1
    }

    pub(crate) fn block_len(&self, block_idx: usize) -> usize {
        self.blocks[block_idx].data_end - self.block_data_start(block_idx)
    }

    fn block_data_start(&self, block_idx: usize) -> usize {
        if block_idx == 0 {
            0
        } else {
            self.blocks[block_idx - 1].data_end
        }
    }

    /// Reconstructs the stored-element bitset of a vector of logical size
    /// `num`.
    pub(crate) fn stored_bits(&self, num: usize) -> Bits {
        let mut bits = Bits::builder();
        let mut cursor = 0;
        for block_idx in 0..self.blocks.len() {
            let first = self.block_first_index(block_idx);
            let len = self.block_len(block_idx);
            bits.append(first - cursor, false);
            bits.append(len, true);
            cursor = first + len;
        }
        bits.append(num - cursor, false);
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The mapping from the type-level docs: [ A BC  DE ], size 10.
    fn docs_mapping() -> CompressedIndexMapping {
        CompressedIndexMapping::initialize(&Bits::from_indices(
            10,
            &[1, 3, 4, 7, 8],
        ))
    }

    #[test]
    fn initialize_matches_platforms() {
        let m = docs_mapping();
        assert_eq!(
            m.blocks,
            vec![
                IndexBlockMapping { logical_start: 1, data_end: 1 },
                IndexBlockMapping { logical_start: 3, data_end: 3 },
                IndexBlockMapping { logical_start: 7, data_end: 5 },
            ]
        );
        assert_eq!(m.num_stored(), 5);
        assert_eq!(m.first_index(), 1);
        assert_eq!(m.last_index(), 8);
    }

    #[test]
    fn data_index_lookup() {
        let m = docs_mapping();
        let hint = Cell::new(0);
        assert_eq!(m.find_data_index(1, &hint), 0);
        assert_eq!(m.find_data_index(3, &hint), 1);
        assert_eq!(m.find_data_index(4, &hint), 2);
        assert_eq!(m.find_data_index(7, &hint), 3);
        assert_eq!(m.find_data_index(8, &hint), 4);
        // Monotonic access leaves the hint at the final block.
        assert_eq!(hint.get(), 2);

        // Random access falls back to the binary search.
        let hint = Cell::new(2);
        assert_eq!(m.find_data_index(3, &hint), 1);
        assert_eq!(hint.get(), 1);
    }

    #[test]
    fn stored_bits_round_trips() {
        let bits = Bits::from_indices(64, &[0, 1, 17, 40, 41, 42]);
        let m = CompressedIndexMapping::initialize(&bits);
        assert_eq!(m.stored_bits(64), bits);
    }
}
