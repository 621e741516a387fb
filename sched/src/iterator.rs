// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The iterator suite node callbacks read and write data through.
//!
//! All iterators are non-copyable views bound to a [`Context`]. They
//! read through the executor and never mutate flow state themselves.

use mask::{Mask, MaskIter};
use smallvec::SmallVec;
use vector::{ReadAccessor, ReadWriteAccessor, Value, Vector};

use crate::context::Context;
use crate::weights::IndexedWeights;

/// The surface a weighted iterator needs from the iterator it decorates.
pub trait ElementIterator {
    fn is_at_end(&self) -> bool;
    fn advance(&mut self);
    fn advance_to_end(&mut self);
    /// The logical element index the iterator is currently at.
    fn current_index(&self) -> usize;
}

struct ReadSource<'a, T: Value> {
    accessor: ReadAccessor<'a, T>,
    mask: &'a Mask,
    iter: MaskIter<'a>,
}

/// Iterates the logical union of all of a named input's connections, in
/// connection order.
pub struct ReadIterator<'a, T: Value> {
    sources: Vec<ReadSource<'a, T>>,
    current: usize,
    index: Option<usize>,
}

// === impl ReadIterator ===

impl<'a, T: Value> ReadIterator<'a, T> {
    pub fn new(ctx: &Context<'a>, input_name: &str) -> Self {
        let network = ctx.network();
        let mut sources = Vec::new();

        match network.find_input(ctx.node(), input_name) {
            Some(input) => {
                for &connection in &network.input(input).connections {
                    let mask = &network.connection(connection).mask;
                    if let Some(value) = ctx.input_value(connection, mask) {
                        sources.push(ReadSource {
                            accessor: value.read::<T>(),
                            mask,
                            iter: mask.iter(),
                        });
                    }
                }
            }
            None => {
                tracing::error!(
                    "can't find input '{input_name}' on node '{}'",
                    network.node(ctx.node()).name
                );
            }
        }

        let mut iterator = Self {
            sources,
            current: 0,
            index: None,
        };
        iterator.advance();
        iterator
    }

    /// The total element count across all connections.
    pub fn compute_size(&self) -> usize {
        self.sources.iter().map(|s| s.mask.num_set()).sum()
    }

    /// The element the iterator is at.
    pub fn value(&self) -> &'a T {
        let index = self.index.expect("iterator is at end");
        self.sources[self.current].accessor.get(index)
    }

    /// Skips ahead to the first element at or after `index`, retrying
    /// subsequent connections when the current one is exhausted.
    pub fn advance_to(&mut self, index: usize) {
        while self.current < self.sources.len() {
            if let Some(found) = self.sources[self.current].iter.advance_to(index) {
                self.index = Some(found);
                return;
            }
            self.current += 1;
        }
        self.index = None;
    }
}

impl<T: Value> ElementIterator for ReadIterator<'_, T> {
    fn is_at_end(&self) -> bool {
        self.index.is_none()
    }

    fn advance(&mut self) {
        while self.current < self.sources.len() {
            if let Some(next) = self.sources[self.current].iter.next() {
                self.index = Some(next);
                return;
            }
            self.current += 1;
        }
        self.index = None;
    }

    fn advance_to_end(&mut self) {
        self.current = self.sources.len();
        self.index = None;
    }

    fn current_index(&self) -> usize {
        self.index.expect("iterator is at end")
    }
}

/// Produces sequential mutable references over the affects-mask subset
/// of the receiver output's write buffer.
pub struct ReadWriteIterator<'a, T: Value> {
    accessor: Option<ReadWriteAccessor<'a, T>>,
    iter: Option<MaskIter<'a>>,
    index: Option<usize>,
}

// === impl ReadWriteIterator ===

impl<'a, T: Value> ReadWriteIterator<'a, T> {
    /// An iterator over the write buffer of the output designated by
    /// `name` (see the context's output-for-writing resolution). The
    /// empty name selects the node's single output.
    pub fn new(ctx: &Context<'a>, name: &str) -> Self {
        let mut iterator = Self {
            accessor: None,
            iter: None,
            index: None,
        };

        let Some(output) = ctx.required_output_for_writing(name) else {
            return iterator;
        };
        let Some((request_mask, affects_mask)) = ctx.output_masks(output) else {
            return iterator;
        };
        let Some(buffer) = ctx.executor().output_value_for_writing(output) else {
            tracing::error!("output is missing its write buffer");
            return iterator;
        };

        // Safety: the executor guarantees exclusive access to the
        // running node's write buffer for the duration of its compute
        // task.
        let vector: &'a mut Vector = unsafe { &mut *buffer.as_ptr() };
        iterator.accessor = Some(vector.read_write::<T>());

        // Write over the affected subset; a node without an affects
        // mask writes everything requested.
        let mask = if affects_mask.is_any_set() {
            affects_mask
        } else {
            request_mask
        };
        let mut iter = mask.iter();
        iterator.index = iter.next();
        iterator.iter = Some(iter);
        iterator
    }

    /// A mutable reference to the element the iterator is at.
    pub fn value_mut(&mut self) -> &mut T {
        let index = self.index.expect("iterator is at end");
        self.accessor
            .as_mut()
            .expect("iterator has a buffer")
            .at_mut(index)
    }

    pub fn value(&self) -> &T {
        let index = self.index.expect("iterator is at end");
        self.accessor.as_ref().expect("iterator has a buffer").at(index)
    }
}

impl<T: Value> ElementIterator for ReadWriteIterator<'_, T> {
    fn is_at_end(&self) -> bool {
        self.index.is_none()
    }

    fn advance(&mut self) {
        self.index = self.iter.as_mut().and_then(Iterator::next);
    }

    fn advance_to_end(&mut self) {
        self.index = None;
    }

    fn current_index(&self) -> usize {
        self.index.expect("iterator is at end")
    }
}

/// Random access to output data in iteration space: index N addresses
/// the N-th element the read/write iterator would visit.
///
/// Contiguous data takes a fast offset path; non-contiguous affects
/// masks redirect through find-nth-set, which is costly. Prefer the
/// iterators for forward access patterns.
pub struct ReadWriteView<'a, T: Value> {
    accessor: Option<ReadWriteAccessor<'a, T>>,
    mask: Option<&'a Mask>,
    offset: usize,
    size: usize,
}

// === impl ReadWriteView ===

impl<'a, T: Value> ReadWriteView<'a, T> {
    pub fn new(ctx: &Context<'a>, name: &str) -> Self {
        let mut view = Self {
            accessor: None,
            mask: None,
            offset: 0,
            size: 0,
        };

        let Some(output) = ctx.required_output_for_writing(name) else {
            return view;
        };
        let Some((_, affects_mask)) = ctx.output_masks(output) else {
            return view;
        };
        let Some(buffer) = ctx.executor().output_value_for_writing(output) else {
            tracing::error!("output is missing its write buffer");
            return view;
        };

        // Safety: as for ReadWriteIterator; the executor hands the
        // buffer exclusively to the running task.
        let vector: &'a mut Vector = unsafe { &mut *buffer.as_ptr() };
        let accessor = vector.read_write::<T>();

        if affects_mask.is_any_set() && !affects_mask.is_all_ones() {
            // A contiguous affects mask is just an offset; anything else
            // redirects per element.
            if affects_mask.is_contiguous() {
                view.offset = affects_mask.first_set();
            } else {
                view.mask = Some(affects_mask);
            }
            view.size = affects_mask.num_set();
        } else {
            view.size = accessor.num_values();
        }
        view.accessor = Some(accessor);
        view
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn storage_index(&self, index: usize) -> usize {
        debug_assert!(index < self.size);
        match self.mask {
            None => index + self.offset,
            Some(mask) => mask.bits().find_nth_set(index),
        }
    }

    pub fn get(&self, index: usize) -> &T {
        let storage = self.storage_index(index);
        self.accessor.as_ref().expect("view has a buffer").at(storage)
    }

    pub fn get_mut(&mut self, index: usize) -> &mut T {
        let storage = self.storage_index(index);
        self.accessor
            .as_mut()
            .expect("view has a buffer")
            .at_mut(storage)
    }
}

struct WeightSlot<'a> {
    weights: Option<&'a IndexedWeights>,
    current: usize,
}

/// Decorates an element iterator with up to N sparse weight slots,
/// advancing to the least index at which both the inner iterator has a
/// value and at least one slot has an explicit weight.
pub struct WeightedIterator<'a, I> {
    inner: I,
    // One slot of inline storage; multiple weight inputs are rare.
    slots: SmallVec<[WeightSlot<'a>; 1]>,
}

// === impl WeightedIterator ===

impl<'a, I: ElementIterator> WeightedIterator<'a, I> {
    /// Builds a weighted iterator over `inner`, with one slot per name
    /// in `weight_names`. Each named input must have exactly one
    /// connection carrying a single [`IndexedWeights`] element.
    pub fn new(ctx: &Context<'a>, weight_names: &[&str], inner: I) -> Self {
        let mut iterator = Self {
            inner,
            slots: SmallVec::new(),
        };

        // Nothing set in the mask, nothing to do.
        if iterator.inner.is_at_end() {
            return iterator;
        }

        for name in weight_names {
            iterator.slots.push(resolve_weights(ctx, name));
        }

        if weight_names.is_empty() {
            tracing::error!("weighted iterator instantiated with no weights");
            return iterator;
        }

        // The inner iterator sits at its first element; advance both to
        // the first index where a mask element and an explicit weight
        // coincide.
        iterator.advance_iterator();
        iterator
    }

    pub fn is_at_end(&self) -> bool {
        self.inner.is_at_end()
    }

    pub fn advance(&mut self) {
        // Holes in the inner mask and holes in the explicit weights both
        // get skipped here.
        self.inner.advance();
        self.advance_iterator();
    }

    pub fn advance_to_end(&mut self) {
        self.inner.advance_to_end();
    }

    pub fn current_index(&self) -> usize {
        self.inner.current_index()
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }

    /// The weight at the current element, or `default` when slot has no
    /// explicit weight here.
    pub fn weight(&self, slot: usize, default: f32) -> f32 {
        self.explicit_weight(slot, default).1
    }

    /// Whether `slot` has an explicit weight at the current element.
    pub fn has_explicit_weight(&self, slot: usize) -> bool {
        self.explicit_weight(slot, 0.0).0
    }

    /// Whether `slot` is explicit at the current element, and its weight
    /// or the given default.
    pub fn explicit_weight(&self, slot: usize, default: f32) -> (bool, f32) {
        if let Some(entry) = self.slots.get(slot) {
            if let Some(weights) = entry.weights {
                if entry.current < weights.len()
                    && weights.index(entry.current) == self.inner.current_index()
                {
                    return (true, *weights.data(entry.current));
                }
            }
        }
        (false, default)
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// The number of explicit weights in `slot`.
    pub fn num_explicit_weights(&self, slot: usize) -> usize {
        self.slots
            .get(slot)
            .and_then(|s| s.weights)
            .map_or(0, IndexedWeights::len)
    }

    /// Advances the inner iterator to the first index with both a mask
    /// element and an explicit weight.
    fn advance_iterator(&mut self) {
        while !self.inner.is_at_end() {
            let current_index = self.inner.current_index();
            let next_explicit = self.advance_to_next_explicit_index(current_index);

            // No explicit weights left anywhere: done iterating.
            let Some(next_explicit) = next_explicit else {
                self.inner.advance_to_end();
                break;
            };

            if next_explicit == current_index {
                // An explicit weight at the current element.
                break;
            }

            // The next explicit weight lies ahead; try to catch up.
            while !self.inner.is_at_end() && self.inner.current_index() < next_explicit
            {
                self.inner.advance();
            }

            if self.inner.is_at_end() || self.inner.current_index() == next_explicit {
                break;
            }

            // The inner iterator skipped the explicit index entirely;
            // retry from wherever it landed.
        }
    }

    /// The smallest explicit index at or after `index` across all slots,
    /// updating every slot's cursor.
    fn advance_to_next_explicit_index(&mut self, index: usize) -> Option<usize> {
        let mut next_explicit: Option<usize> = None;

        for slot in &mut self.slots {
            let Some(weights) = slot.weights else { continue };
            if slot.current >= weights.len() {
                continue;
            }

            // A linear probe from the last known position beats a fresh
            // binary search for monotonic iteration.
            slot.current = weights.first_data_index_from(index, slot.current);
            if slot.current < weights.len() {
                let value = weights.index(slot.current);
                next_explicit =
                    Some(next_explicit.map_or(value, |best| best.min(value)));
            }
        }

        next_explicit
    }
}

fn resolve_weights<'a>(ctx: &Context<'a>, name: &str) -> WeightSlot<'a> {
    let network = ctx.network();
    let empty = WeightSlot {
        weights: None,
        current: 0,
    };

    let Some(input) = network.find_input(ctx.node(), name) else {
        tracing::error!(
            "can't find input '{name}' on node '{}'",
            network.node(ctx.node()).name
        );
        return empty;
    };

    let connections = &network.input(input).connections;
    let [connection] = connections.as_slice() else {
        if connections.len() > 1 {
            // All weight connectors carry exactly one input.
            tracing::error!(
                "weight connector must have at most one input (got {})",
                connections.len()
            );
        }
        return empty;
    };

    let mask = &network.connection(*connection).mask;
    let Some(value) = ctx.required_input_value(*connection, mask) else {
        return empty;
    };

    // Weight inputs carry exactly one element.
    if value.size() != 1 {
        tracing::error!(
            "weight input must have exactly one element (got {})",
            value.size()
        );
        return empty;
    }

    // Holding the borrowed weights is fine because iterators are bound
    // to the evaluation context's lifetime; no copy needed.
    WeightSlot {
        weights: Some(value.read::<IndexedWeights>().get(0)),
        current: 0,
    }
}
