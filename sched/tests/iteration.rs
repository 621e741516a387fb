// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Evaluation-side iteration over inputs and outputs.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ptr::NonNull;

use bits::Bits;
use mask::Mask;
use sched::{
    ConnectionIndex, Context, ElementIterator, Executor, IndexedWeights,
    MaskedOutput, NetworkBuilder, OutputIndex, ReadIterator, ReadWriteIterator,
    ReadWriteView, Request, Schedule, WeightedIterator, schedule,
};
use vector::Vector;

#[derive(Default)]
struct TestExecutor {
    inputs: HashMap<ConnectionIndex, Vector>,
    outputs: HashMap<OutputIndex, UnsafeCell<Vector>>,
}

impl TestExecutor {
    fn output(&self, output: OutputIndex) -> &Vector {
        // Safety: test code reads back after iteration finished; no
        // writer is live.
        unsafe { &*self.outputs[&output].get() }
    }
}

impl Executor for TestExecutor {
    fn input_value(&self, connection: ConnectionIndex, _mask: &Mask) -> Option<&Vector> {
        self.inputs.get(&connection)
    }

    fn output_value_for_writing(&self, output: OutputIndex) -> Option<NonNull<Vector>> {
        self.outputs
            .get(&output)
            .map(|cell| NonNull::new(cell.get()).expect("cell pointers are non-null"))
    }
}

#[allow(clippy::cast_precision_loss, reason = "test data")]
fn iota(n: usize) -> Vec<f64> {
    (0..n).map(|i| i as f64).collect()
}

#[test]
fn weighted_iteration_visits_explicit_weights_only() {
    // Three source connections contribute the element ranges [0..9],
    // [10..19] and [20..29] of a size-30 space; weight slot 0 carries
    // explicit weights at indices 5 and 12.
    let mut b = NetworkBuilder::new();
    let n = b.add_node("n");
    let n_in = b.add_input(n, "in");
    let n_w = b.add_input(n, "w");
    let _n_out = b.add_output(n, "out");

    let mut connections = Vec::new();
    for (i, range) in [(0usize, 0..10), (1, 10..20), (2, 20..30)] {
        let source = b.add_node(format!("s{i}"));
        let source_out = b.add_output(source, "out");
        let indices: Vec<usize> = range.collect();
        let mask = Mask::from_bits_owned(Bits::from_indices(30, &indices));
        connections.push(b.connect(source_out, n_in, mask));
    }

    let weight_node = b.add_node("w");
    let weight_out = b.add_output(weight_node, "out");
    let weight_connection = b.connect(weight_out, n_w, Mask::all_ones(1));
    let network = b.build();

    let mut executor = TestExecutor::default();
    let values = iota(30);
    for (i, &connection) in connections.iter().enumerate() {
        let indices: Vec<usize> = (i * 10..(i + 1) * 10).collect();
        let bits = Bits::from_indices(30, &indices);
        executor
            .inputs
            .insert(connection, Vector::from_slice_masked(&values, &bits));
    }

    let mut weights = IndexedWeights::new();
    weights.add(5, 0.5);
    weights.add(12, 0.7);
    executor
        .inputs
        .insert(weight_connection, Vector::single(weights));

    let empty_schedule = Schedule::new();
    let ctx = Context::new(&network, &empty_schedule, &executor, n);

    let inner = ReadIterator::<f64>::new(&ctx, "in");
    assert_eq!(inner.compute_size(), 30);

    let mut it = WeightedIterator::new(&ctx, &["w"], inner);
    let mut visited = Vec::new();
    while !it.is_at_end() {
        assert!(it.has_explicit_weight(0));
        visited.push((it.current_index(), it.weight(0, 0.0), *it.inner().value()));
        it.advance();
    }

    assert_eq!(visited, vec![(5, 0.5, 5.0), (12, 0.7, 12.0)]);
    assert_eq!(it.num_slots(), 1);
    assert_eq!(it.num_explicit_weights(0), 2);
}

#[test]
fn read_iterator_walks_connections_in_order() {
    let mut b = NetworkBuilder::new();
    let n = b.add_node("n");
    let n_in = b.add_input(n, "in");
    let _n_out = b.add_output(n, "out");

    let s = b.add_node("s");
    let s_out = b.add_output(s, "out");
    let c1 = b.connect(
        s_out,
        n_in,
        Mask::from_bits_owned(Bits::from_indices(8, &[1, 3])),
    );
    let c2 = b.connect(
        s_out,
        n_in,
        Mask::from_bits_owned(Bits::from_indices(8, &[6])),
    );
    let network = b.build();

    let mut executor = TestExecutor::default();
    let values = iota(8);
    executor
        .inputs
        .insert(c1, Vector::from_slice(&values));
    executor
        .inputs
        .insert(c2, Vector::from_slice(&values));

    let empty_schedule = Schedule::new();
    let ctx = Context::new(&network, &empty_schedule, &executor, n);

    let mut it = ReadIterator::<f64>::new(&ctx, "in");
    let mut seen = Vec::new();
    while !it.is_at_end() {
        seen.push((it.current_index(), *it.value()));
        it.advance();
    }
    assert_eq!(seen, vec![(1, 1.0), (3, 3.0), (6, 6.0)]);

    // advance_to skips within and across connections.
    let mut it = ReadIterator::<f64>::new(&ctx, "in");
    it.advance_to(3);
    assert_eq!(it.current_index(), 3);
    it.advance_to(5);
    assert_eq!(it.current_index(), 6);
}

/// A read/write pair under a real schedule: root feeds p.in, which is
/// associated with p.out.
fn read_write_setup() -> (sched::Network, OutputIndex, Schedule, TestExecutor) {
    let mut b = NetworkBuilder::new();
    let root = b.add_node("root");
    let root_out = b.add_output(root, "out");
    let p = b.add_node("p");
    let p_in = b.add_input(p, "in");
    let p_out = b.add_output(p, "out");
    b.associate(p_in, p_out);
    b.connect(root_out, p_in, Mask::all_ones(8));
    let network = b.build();

    let request_mask = Mask::from_bits_owned(Bits::from_indices(8, &[2, 3, 4]));
    let request = Request::new(vec![MaskedOutput::new(p_out, request_mask)]);
    let mut s = Schedule::new();
    schedule(&network, &request, &mut s, false);

    let mut executor = TestExecutor::default();
    executor
        .outputs
        .insert(p_out, UnsafeCell::new(Vector::dense::<f64>(8)));
    (network, p_out, s, executor)
}

#[test]
fn read_write_iterator_writes_the_affected_subset() {
    let (network, p_out, s, executor) = read_write_setup();
    let p = network.output(p_out).node;
    let ctx = Context::new(&network, &s, &executor, p);

    let mut it = ReadWriteIterator::<f64>::new(&ctx, "");
    let mut indices = Vec::new();
    while !it.is_at_end() {
        indices.push(it.current_index());
        *it.value_mut() = 1.0;
        it.advance();
    }
    assert_eq!(indices, vec![2, 3, 4]);

    let written = executor.output(p_out);
    let a = written.read::<f64>();
    assert_eq!((a[1], a[2], a[3], a[4], a[5]), (0.0, 1.0, 1.0, 1.0, 0.0));
}

#[test]
fn read_write_view_random_access_in_iteration_space() {
    let (network, p_out, s, executor) = read_write_setup();
    let p = network.output(p_out).node;
    let ctx = Context::new(&network, &s, &executor, p);

    let mut view = ReadWriteView::<f64>::new(&ctx, "");
    assert_eq!(view.len(), 3);

    // Iteration space: index 0 is the first affected element.
    *view.get_mut(0) = 7.0;
    *view.get_mut(2) = 9.0;
    assert_eq!(*view.get(0), 7.0);

    let written = executor.output(p_out);
    let a = written.read::<f64>();
    assert_eq!((a[2], a[4]), (7.0, 9.0));
}
