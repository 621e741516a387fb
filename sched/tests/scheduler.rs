// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scheduling scenarios.

use std::sync::Arc;

use bits::Bits;
use mask::Mask;
use sched::{
    ElementwiseDependencies, MaskedOutput, Network, NetworkBuilder, OutputIndex,
    Request, Schedule, is_invalid_task, schedule, update_affects_mask_for_output,
};

fn ones(size: usize) -> Mask {
    Mask::all_ones(size)
}

fn mask_of(size: usize, indices: &[usize]) -> Mask {
    Mask::from_bits_owned(Bits::from_indices(size, indices))
}

fn build_schedule(network: &Network, outputs: &[(OutputIndex, Mask)]) -> Schedule {
    let request = Request::new(
        outputs
            .iter()
            .map(|(o, m)| MaskedOutput::new(*o, m.clone()))
            .collect(),
    );
    let mut s = Schedule::new();
    schedule(network, &request, &mut s, false);
    s
}

/// A root feeding a chain of pool movers of the given size. The chain
/// carries `num_movers + 1` movers; requesting the returned terminal
/// pool output leaves exactly the first `num_movers` of them passing
/// their buffers, and those get strip-mined.
fn pool_chain(
    num_movers: usize,
    size: usize,
) -> (Network, OutputIndex, Vec<OutputIndex>) {
    let mut b = NetworkBuilder::new();

    let root = b.add_node("root");
    b.mark_owns_buffers(root);
    let mut prev = b.add_output(root, "out");

    let mut movers = Vec::new();
    for i in 0..=num_movers {
        let mover = b.add_node(format!("mover{i}"));
        b.set_behavior(mover, Arc::new(ElementwiseDependencies));
        let input = b.add_input(mover, ".pool");
        let output = b.add_output(mover, ".pool");
        b.mark_pool(output);
        b.set_affects_mask(output, ones(size));
        b.associate(input, output);
        b.connect(prev, input, ones(size));
        prev = output;
        movers.push(output);
    }

    let terminal = movers.pop().expect("chain has movers");
    (b.build(), terminal, movers)
}

#[test]
fn empty_request_yields_valid_empty_schedule() {
    let mut b = NetworkBuilder::new();
    let n = b.add_node("n");
    let _ = b.add_output(n, "out");
    let network = b.build();

    let mut s = Schedule::new();
    schedule(&network, &Request::default(), &mut s, false);
    assert!(s.is_valid());
    assert_eq!(s.num_scheduled_nodes(), 0);
}

#[test]
fn request_masks_cover_the_request() {
    // a.out feeds b.in; request half of b.out.
    let mut b = NetworkBuilder::new();
    let a = b.add_node("a");
    let a_out = b.add_output(a, "out");
    let n = b.add_node("b");
    let n_in = b.add_input(n, "in");
    let n_out = b.add_output(n, "out");
    b.connect(a_out, n_in, ones(16));
    let network = b.build();

    let requested = mask_of(16, &[0, 1, 2, 3]);
    let s = build_schedule(&network, &[(n_out, requested.clone())]);

    let id = s.output_id(n_out);
    assert!(id.is_valid());
    assert!(s.request_mask(id).contains(&requested));

    // The read dependency pulls in the whole connection mask upstream.
    let a_id = s.output_id(a_out);
    assert!(a_id.is_valid());
    assert_eq!(*s.request_mask(a_id), ones(16));

    // Fewer than 32 nodes: lookup maps are dropped.
    assert!(s.is_small());
}

#[test]
fn read_write_outputs_are_always_requested() {
    // n has a read/write output fed by root, and a separate requested
    // output. The read/write output must get a buffer even though the
    // request never names it.
    let mut b = NetworkBuilder::new();
    let root = b.add_node("root");
    let root_out = b.add_output(root, "out");

    let n = b.add_node("n");
    let n_in = b.add_input(n, "in");
    let n_rw = b.add_output(n, "rw");
    b.associate(n_in, n_rw);
    b.connect(root_out, n_in, ones(8));
    let n_other = b.add_output(n, "other");
    let network = b.build();

    let s = build_schedule(&network, &[(n_other, ones(8))]);

    let rw_id = s.output_id(n_rw);
    assert!(rw_id.is_valid());
    assert_eq!(*s.request_mask(rw_id), ones(8));
}

#[test]
fn buffer_pass_chooses_biggest_connection_and_keeps_the_rest() {
    // p.out feeds two read/write consumers: a (popcount 3) and
    // b (popcount 2). The buffer goes to a; what b needs is kept.
    let mut builder = NetworkBuilder::new();
    let root = builder.add_node("root");
    let root_out = builder.add_output(root, "out");

    let p = builder.add_node("p");
    let p_in = builder.add_input(p, "in");
    let p_out = builder.add_output(p, "out");
    builder.associate(p_in, p_out);
    builder.connect(root_out, p_in, ones(8));

    let a = builder.add_node("a");
    let a_in = builder.add_input(a, "in");
    let a_out = builder.add_output(a, "out");
    builder.associate(a_in, a_out);
    builder.connect(p_out, a_in, mask_of(8, &[0, 1, 2]));

    let b = builder.add_node("b");
    let b_in = builder.add_input(b, "in");
    let b_out = builder.add_output(b, "out");
    builder.associate(b_in, b_out);
    builder.connect(p_out, b_in, mask_of(8, &[3, 4]));

    let network = builder.build();
    let s = build_schedule(
        &network,
        &[
            (a_out, mask_of(8, &[0, 1, 2])),
            (b_out, mask_of(8, &[3, 4])),
        ],
    );

    let p_id = s.output_id(p_out);
    assert_eq!(s.pass_to_output(p_id), Some(a_out));
    assert_eq!(*s.keep_mask(p_id), mask_of(8, &[3, 4]));

    // Requested outputs keep their whole request mask.
    let a_id = s.output_id(a_out);
    assert_eq!(*s.keep_mask(a_id), *s.request_mask(a_id));
}

#[test]
fn input_dependencies_on_same_output_and_mask_share_unique_index() {
    // Two read inputs of one node depend on the same (output, mask).
    let mut b = NetworkBuilder::new();
    let src = b.add_node("src");
    let src_out = b.add_output(src, "out");

    let n = b.add_node("n");
    let in1 = b.add_input(n, "in1");
    let in2 = b.add_input(n, "in2");
    let n_out = b.add_output(n, "out");
    b.connect(src_out, in1, ones(10));
    b.connect(src_out, in2, ones(10));
    let network = b.build();

    let s = build_schedule(&network, &[(n_out, ones(10))]);

    let deps: Vec<_> = s
        .input_dependencies()
        .iter()
        .filter(|d| d.output == src_out)
        .collect();
    assert_eq!(deps.len(), 2);
    assert_eq!(deps[0].unique_index, deps[1].unique_index);
    assert_eq!(s.num_unique_input_deps(), 1);

    // Without prereqs there is no inputs task; the reads fold into the
    // compute task's required count.
    assert_eq!(s.num_inputs_tasks(), 0);
    let n_index = s.schedule_node_index(network.output(n_out).node).unwrap();
    let task = s.compute_task(s.compute_tasks_of(n_index).task_id);
    assert_eq!(task.requireds_num, 2);
}

#[test]
fn pool_chain_strip_mining() {
    let size = 1500;
    let (network, result, movers) = pool_chain(4, size);
    let s = build_schedule(&network, &[(result, ones(size))]);

    // 4 movers x 3 partitions of grain 500.
    assert_eq!(s.num_invocations(), 12);
    assert_eq!(s.num_inputs_tasks(), 4);
    assert_eq!(s.num_prep_tasks(), 4);
    assert_eq!(s.num_keep_tasks(), 0);

    for &mover in &movers {
        let node_index = s
            .schedule_node_index(network.output(mover).node)
            .expect("mover is scheduled");
        let tasks = s.compute_tasks_of(node_index);
        assert_eq!(tasks.task_num, 3);

        // The partition request masks are pairwise disjoint, ascending,
        // and union to the node's request mask.
        let mut union = Mask::default();
        let mut expected_start = 0;
        for task_id in tasks.range() {
            let task = s.compute_task(u32::try_from(task_id).unwrap());
            assert!(!is_invalid_task(task.invocation_index));

            let invocation = s.invocation(task.invocation_index);
            let request = &invocation.request_mask;
            assert!(!union.overlaps(request));
            assert_eq!(request.first_set(), expected_start);
            assert_eq!(request.last_set(), expected_start + 499);
            union.set_or_append(request);
            expected_start += 500;

            // All-ones request over an all-ones affects mask: every
            // invocation is affective.
            assert_eq!(invocation.affects_mask, invocation.request_mask);
        }
        let id = s.output_id(mover);
        assert_eq!(union, *s.request_mask(id));
    }

    // The terminal mover and the root run as singular tasks.
    assert_eq!(s.num_compute_tasks(), 12 + 2);
}

#[test]
fn pool_chain_with_partial_request_skips_partitions() {
    let size = 1500;
    let (network, result, movers) = pool_chain(2, size);
    // Only the first and last partitions are occupied.
    let s = build_schedule(&network, &[(result, mask_of(size, &[10, 1400]))]);

    for &mover in &movers {
        let node_index = s
            .schedule_node_index(network.output(mover).node)
            .expect("mover is scheduled");
        assert_eq!(s.compute_tasks_of(node_index).task_num, 2);
    }
    assert_eq!(s.num_invocations(), 4);
}

#[test]
fn speculation_nodes_are_never_traversed() {
    let mut b = NetworkBuilder::new();
    let u = b.add_node("u");
    let u_out = b.add_output(u, "out");

    let spec = b.add_node("spec");
    b.mark_speculation(spec);
    let spec_in = b.add_input(spec, "in");
    let spec_out = b.add_output(spec, "out");
    b.connect(u_out, spec_in, ones(4));
    let network = b.build();

    let s = build_schedule(&network, &[(spec_out, ones(4))]);

    assert!(s.output_id(spec_out).is_valid());
    // The upstream node is not pulled in through the speculation node.
    assert!(!s.output_id(u_out).is_valid());
}

#[test]
fn affects_mask_update_in_place() {
    let size = 1500;
    let (network, result, movers) = pool_chain(2, size);
    let mut s = build_schedule(&network, &[(result, ones(size))]);

    // Re-applying the same dependencies revises the schedule in place.
    assert!(update_affects_mask_for_output(&network, &mut s, movers[0]));
    assert!(s.is_valid());

    // An unscheduled output needs no update at all.
    let (other_network, _, other_movers) = pool_chain(1, 8);
    let mut empty = Schedule::new();
    schedule(&other_network, &Request::default(), &mut empty, false);
    assert!(update_affects_mask_for_output(
        &other_network,
        &mut empty,
        other_movers[0]
    ));
}

#[test]
fn topological_sort_orders_sources_first() {
    let mut b = NetworkBuilder::new();
    let a = b.add_node("a");
    let a_out = b.add_output(a, "out");
    let n = b.add_node("b");
    let n_in = b.add_input(n, "in");
    let n_out = b.add_output(n, "out");
    b.connect(a_out, n_in, ones(4));
    let network = b.build();

    let request = Request::new(vec![MaskedOutput::new(n_out, ones(4))]);
    let mut s = Schedule::new();
    schedule(&network, &request, &mut s, true);

    let a_index = s.schedule_node_index(a).unwrap();
    let b_index = s.schedule_node_index(n).unwrap();
    assert!(a_index < b_index);
}
