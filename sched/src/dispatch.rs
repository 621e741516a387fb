// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scoped parallelism for the scheduler's data-parallel passes.
//!
//! Work never leaks past the scope: every helper joins all of its
//! threads before returning, so phase ordering is identical in
//! sequential and parallel operation.

use std::thread;

/// Minimum number of items per spawned thread; below this, spawning
/// costs more than it saves.
const MIN_GRAIN: usize = 64;

/// Runs `f` over disjoint chunks of `items`, in parallel when the input
/// is large enough. `f` receives the chunk's offset into `items` and the
/// chunk itself.
pub(crate) fn parallel_for_chunks<T, F>(items: &mut [T], f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync,
{
    let threads = thread::available_parallelism().map_or(1, |n| n.get());
    if threads <= 1 || items.len() < MIN_GRAIN * 2 {
        f(0, items);
        return;
    }

    let chunk = (items.len() / threads).max(MIN_GRAIN);
    thread::scope(|scope| {
        let mut offset = 0;
        for piece in items.chunks_mut(chunk) {
            let len = piece.len();
            let f = &f;
            scope.spawn(move || f(offset, piece));
            offset += len;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_every_item_exactly_once() {
        let mut items = vec![0u32; 1000];
        parallel_for_chunks(&mut items, |offset, chunk| {
            for (i, v) in chunk.iter_mut().enumerate() {
                *v = u32::try_from(offset + i).unwrap();
            }
        });
        for (i, v) in items.iter().enumerate() {
            assert_eq!(*v as usize, i);
        }
    }
}
