// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Turns a request into a sealed schedule.
//!
//! Scheduling runs in seven phases: request-mask propagation over a
//! backwards traversal seeded by the request, buffer-pass planning,
//! affects-mask application, pass-through skipping, task-graph
//! generation with pool-chain strip-mining, input-dependency edge
//! construction, and lock-mask computation for data that stops being
//! affective further down the pool.

use std::collections::BTreeMap;

use bits::Bits;
use hashbrown::HashMap;
use mask::Mask;
use static_assertions::const_assert;

use crate::dispatch::parallel_for_chunks;
use crate::graph::{
    ConnectionIndex, MaskedOutput, Network, NodeIndex, OutputIndex,
    PoolChainIndex, Request,
};
use crate::schedule::{OutputId, Schedule};
use crate::tasks::{
    ComputeTask, ComputeTaskFlags, INVALID_TASK, InputDependency, InputsTask,
    NodeInvocation, NodeTasks, TaskIndex, is_invalid_task,
};

/// Nodes with more outputs than this, no affects mask and no associated
/// input are batched through the vectorized dependency API; sharing-style
/// nodes can have thousands of outputs.
const NODE_OUTPUT_THRESHOLD: usize = 100;

/// The strip-mining partition size. Must stay divisible by 5 so that
/// packed 5-wide transforms never straddle partitions.
const INVOCATION_GRAIN: usize = 500;
const_assert!(INVOCATION_GRAIN >= 5);
const_assert!(INVOCATION_GRAIN % 5 == 0);

/// Pool outputs ordered most-downstream first, as produced by
/// request-mask propagation.
type PoolPriority = Vec<(PoolChainIndex, OutputIndex)>;

/// Builds the schedule for `request`.
///
/// An empty request produces an empty schedule that is flagged valid.
/// With `topologically_sort`, scheduled nodes appear in topological
/// order (sources before consumers).
pub fn schedule(
    network: &Network,
    request: &Request,
    schedule: &mut Schedule,
    topologically_sort: bool,
) {
    let _span = tracing::trace_span!("schedule").entered();

    schedule.clear();

    // It's a valid schedule, it's just empty.
    if request.is_empty() {
        schedule.set_valid(true);
        return;
    }

    if topologically_sort {
        sort_topologically(network, request, schedule);
    }

    let pool_outputs = initialize_request_masks(network, request, schedule);

    schedule_buffer_passes(network, request, schedule);

    // Restrict the affects masks to the elements in the request.
    apply_affects_masks(network, schedule);

    // Fill in pass-throughs so that buffer passing skips the stretches of
    // the network that have no effect in this schedule. Must happen after
    // all the keep masks are in place.
    schedule_for_pass_throughs(network, schedule, &pool_outputs);

    schedule_task_graph(network, schedule, &pool_outputs);

    compute_lock_masks(network, schedule, &pool_outputs);

    schedule.mark_small_schedule();
    schedule.set_request(request.clone());
    schedule.set_valid(true);
}

// -----------------------------------------------------------------------------
// Phase 1: request-mask propagation

/// The input dependencies of a masked output: per-connection mask
/// contributions describing which elements of each upstream output it
/// requires.
fn find_inputs(
    network: &Network,
    masked_output: &MaskedOutput,
) -> Vec<(ConnectionIndex, Mask)> {
    let output = network.output(masked_output.output);
    let node = network.node(output.node);

    // Gather the read inputs, but only if the output is affective as
    // determined by the affects mask (or lack thereof).
    let mut dependencies = Vec::new();
    let affective = output
        .affects_mask
        .as_ref()
        .is_none_or(|am| am.overlaps(&masked_output.mask));
    if affective {
        for &input_index in &node.inputs {
            let input = network.input(input_index);
            if input.associated_output.is_some() {
                continue;
            }
            for &connection in &input.connections {
                let bits = node.behavior.compute_input_dependency_mask(
                    network,
                    masked_output,
                    connection,
                );
                if bits.is_any_set() {
                    dependencies.push((connection, Mask::from_bits_owned(bits)));
                }
            }
        }
    }

    // Add the associated input with the full request mask (ignoring
    // sparse dependencies) so that there is a buffer to write into.
    if let Some(associated_input) = output.associated_input {
        let connections = &network.input(associated_input).connections;
        if connections.len() > 1 {
            panic!(
                "multiple inputs found on '{}' associated with output '{}'; \
                 the system doesn't know how to pass the data through.\n{}",
                network.input(associated_input).name,
                output.name,
                network.describe_node(output.node),
            );
        }
        if let Some(&connection) = connections.first() {
            if network.connection(connection).mask.is_any_set() {
                dependencies.push((connection, masked_output.mask.clone()));
            }
        }
    }

    dependencies
}

fn find_inputs_vectorized(
    network: &Network,
    masked_outputs: &[MaskedOutput],
) -> Vec<(ConnectionIndex, Mask)> {
    let Some(first) = masked_outputs.first() else {
        return Vec::new();
    };
    let node = network.node(network.output(first.output).node);
    node.behavior
        .compute_input_dependency_request(network, masked_outputs)
}

/// Records dependencies as scheduled inputs and pushes their source
/// outputs for traversal.
fn add_inputs(
    dependencies: Vec<(ConnectionIndex, Mask)>,
    network: &Network,
    schedule: &mut Schedule,
    stack: &mut Vec<MaskedOutput>,
) {
    // The read/write dependencies come last and must be traversed last,
    // so they go onto the stack first: iterate in reverse.
    for (connection, mask) in dependencies.into_iter().rev() {
        schedule.add_input(network, connection, mask.clone());
        let source = network.connection(connection).source_output;
        stack.push(MaskedOutput::new(source, mask));
    }
}

/// ORs `new_mask` into the output's request mask; returns whether any
/// new bits were added.
fn set_request_mask(schedule: &mut Schedule, id: OutputId, new_mask: &Mask) -> bool {
    let request_mask = schedule.request_mask(id);
    if request_mask.is_empty() {
        schedule.set_request_mask(id, new_mask.clone());
        return true;
    }
    // No new bits means no further traversal from here.
    if request_mask.contains(new_mask) {
        return false;
    }
    let merged = request_mask | new_mask;
    schedule.set_request_mask(id, merged);
    true
}

/// Drains the stack of outputs that need no pool ordering. Pool outputs
/// encountered on the way move into the priority queue.
fn process_immediate_stack(
    network: &Network,
    schedule: &mut Schedule,
    stack: &mut Vec<MaskedOutput>,
    pool_queue: &mut BTreeMap<PoolChainIndex, MaskedOutput>,
    pool_outputs: &mut PoolPriority,
    deferred: &mut HashMap<NodeIndex, Vec<MaskedOutput>>,
) {
    while let Some(masked_output) = stack.pop() {
        let output_index = masked_output.output;
        let output = network.output(output_index);
        let node = network.node(output.node);

        if network.is_pool_output(output_index) {
            // The queue pops pool outputs most-downstream first. On a
            // repeated visit, OR the mask into the waiting entry so the
            // output is processed once with the fuller mask, avoiding
            // repeated traversals.
            let chain_index = network
                .pool_chain_index(output_index)
                .expect("pool output without chain index");
            match pool_queue.entry(chain_index) {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(masked_output);
                    pool_outputs.push((chain_index, output_index));
                }
                std::collections::btree_map::Entry::Occupied(mut e) => {
                    debug_assert_eq!(e.get().output, output_index);
                    let merged = &e.get().mask | &masked_output.mask;
                    e.get_mut().mask = merged;
                }
            }
            continue;
        }

        let id = schedule.get_or_create_output_id(network, output_index);
        let added_new_request = set_request_mask(schedule, id, &masked_output.mask);

        // Speculation nodes cause cycles and do their own scheduling.
        if node.is_speculation {
            continue;
        }

        if added_new_request {
            // Nodes with very many outputs and no pool participation are
            // queued for vectorized dependency computation.
            let vectorized = node.outputs.len() > NODE_OUTPUT_THRESHOLD
                && output.affects_mask.is_none()
                && output.associated_input.is_none();

            if vectorized {
                deferred
                    .entry(output.node)
                    .or_default()
                    .push(masked_output);
            } else {
                add_inputs(
                    find_inputs(network, &masked_output),
                    network,
                    schedule,
                    stack,
                );
            }
        }
    }
}

/// Seeds the traversal with the request and computes every scheduled
/// output's request mask. Returns the pool outputs, most downstream
/// first.
fn initialize_request_masks(
    network: &Network,
    request: &Request,
    schedule: &mut Schedule,
) -> PoolPriority {
    let _span = tracing::trace_span!("initialize_request_masks").entered();

    let mut stack: Vec<MaskedOutput> = request.iter().cloned().collect();
    let mut pool_queue: BTreeMap<PoolChainIndex, MaskedOutput> = BTreeMap::new();
    let mut pool_outputs: PoolPriority = Vec::new();
    let mut deferred: HashMap<NodeIndex, Vec<MaskedOutput>> = HashMap::new();

    // Process everything that is not pool before popping the first pool
    // output.
    process_immediate_stack(
        network,
        schedule,
        &mut stack,
        &mut pool_queue,
        &mut pool_outputs,
        &mut deferred,
    );

    while !deferred.is_empty() || !pool_queue.is_empty() {
        while let Some((_, masked_output)) = pool_queue.pop_first() {
            let id = schedule.get_or_create_output_id(network, masked_output.output);
            let added_new_request =
                set_request_mask(schedule, id, &masked_output.mask);

            // The pool never flows out of a speculation node.
            debug_assert!(
                !network
                    .node(network.output(masked_output.output).node)
                    .is_speculation
            );

            if added_new_request {
                add_inputs(
                    find_inputs(network, &masked_output),
                    network,
                    schedule,
                    &mut stack,
                );
            }

            process_immediate_stack(
                network,
                schedule,
                &mut stack,
                &mut pool_queue,
                &mut pool_outputs,
                &mut deferred,
            );
        }

        if !deferred.is_empty() {
            // One vectorized call per node computes the dependencies for
            // all of its scheduled outputs; sharing nodes answer this
            // much faster than thousands of single-output queries.
            for (_, masked_outputs) in deferred.drain() {
                add_inputs(
                    find_inputs_vectorized(network, &masked_outputs),
                    network,
                    schedule,
                    &mut stack,
                );
            }

            process_immediate_stack(
                network,
                schedule,
                &mut stack,
                &mut pool_queue,
                &mut pool_outputs,
                &mut deferred,
            );
        }
    }

    // Traversal inserts scheduled inputs without duplicate checks;
    // merging once at the end is the overall win for sharing nodes with
    // thousands of inputs.
    schedule.deduplicate_inputs();

    // Most-downstream pool outputs first; clients expect the pool in
    // bottom-up order.
    pool_outputs.sort_by_key(|&(chain_index, _)| chain_index);
    pool_outputs.dedup();
    pool_outputs
}

// -----------------------------------------------------------------------------
// Phase 2: buffer-pass planning

/// Whether `output`, reached through `connection`, is scheduled and
/// requested; on success yields the dependency mask of the target output
/// on that connection.
fn is_target_output_requested(
    network: &Network,
    schedule: &Schedule,
    output: OutputIndex,
    connection: ConnectionIndex,
) -> Option<Bits> {
    let id = schedule.output_id(output);
    if !id.is_valid() {
        return None;
    }

    let request_mask = schedule.request_mask(id);
    if request_mask.is_empty() || request_mask.is_all_zeros() {
        return None;
    }

    let target_node = network.output(output).node;
    let dependency_mask = network
        .node(target_node)
        .behavior
        .compute_input_dependency_mask(
            network,
            &MaskedOutput::new(output, request_mask.clone()),
            connection,
        );
    dependency_mask.is_any_set().then_some(dependency_mask)
}

/// Marks every read/write output on a scheduled node as requested.
///
/// The node callback has no knowledge of what was requested and may
/// write to any of its read/write outputs, so each needs a buffer.
fn schedule_unrequested_read_writes(
    network: &Network,
    node: NodeIndex,
    schedule: &mut Schedule,
) {
    let node_outputs = network.node(node).outputs.clone();

    for output_index in node_outputs {
        let output = network.output(output_index);
        let Some(associated_input) = output.associated_input else {
            continue;
        };
        if network.input(associated_input).connections.is_empty() {
            continue;
        }

        let id = schedule.get_or_create_output_id(network, output_index);
        if !schedule.request_mask(id).is_empty() {
            continue;
        }

        // Build a request mask from all the input connection masks.
        let mut request_mask = Mask::default();
        for &connection in &network.input(associated_input).connections {
            request_mask.set_or_append(&network.connection(connection).mask);
        }
        debug_assert!(!request_mask.is_empty());
        schedule.set_request_mask(id, request_mask);
    }
}

/// Chooses the pass-to output and keep mask for each output of one node.
fn set_buffer_pass_data(network: &Network, node_index: usize, schedule: &mut Schedule) {
    // Nodes that manage their own buffers never pass them.
    let node = schedule.nodes[node_index].node;
    if network.node(node).owns_buffers {
        return;
    }

    for output_pos in 0..schedule.nodes[node_index].outputs.len() {
        let so = &schedule.nodes[node_index].outputs[output_pos];
        if so.request_mask.is_empty() {
            continue;
        }
        let output_index = so.output;
        let request_mask = so.request_mask.clone();

        // Find the outgoing read/write connection with the largest
        // connection-mask popcount.
        //
        // Choosing by connection mask rather than by the amount of data
        // actually requested through the connection is not ideal, but
        // switching to the dependency-mask popcount regressed real
        // networks; the current choice stands.
        let mut max_popcount = 0;
        let mut max_connection: Option<ConnectionIndex> = None;
        for &connection in &network.output(output_index).connections {
            let target_input = network.connection(connection).target_input;
            let Some(associated) = network.input(target_input).associated_output
            else {
                continue;
            };
            if is_target_output_requested(network, schedule, associated, connection)
                .is_none()
            {
                continue;
            }

            let num_set = network.connection(connection).mask.num_set();
            if num_set > max_popcount {
                max_popcount = num_set;
                max_connection = Some(connection);
            }
        }

        let Some(max_connection) = max_connection else {
            // This output doesn't pass its buffer.
            continue;
        };

        // Union the dependency masks of every other connection: that is
        // the data that must remain readable here after the donation.
        let mut union_bits = Bits::new(request_mask.size());
        for &connection in &network.output(output_index).connections {
            if connection == max_connection {
                continue;
            }
            let target_node =
                network.input(network.connection(connection).target_input).node;
            for &target_output in &network.node(target_node).outputs {
                if let Some(dependency) = is_target_output_requested(
                    network, schedule, target_output, connection,
                ) {
                    union_bits = if union_bits.is_any_set() {
                        &union_bits | &dependency
                    } else {
                        dependency
                    };
                }
            }
        }

        // Only the bits overlapping the request matter.
        union_bits = &union_bits & request_mask.bits();

        // Keeping the entire request mask means passing gains nothing:
        // the data would be passed down and then copied right back.
        if union_bits == *request_mask.bits() {
            continue;
        }

        let target_input = network.connection(max_connection).target_input;
        let pass_to = network.input(target_input).associated_output;
        let so = &mut schedule.nodes[node_index].outputs[output_pos];
        so.keep_mask = if union_bits.is_any_set() {
            Mask::from_bits_owned(union_bits)
        } else {
            Mask::default()
        };
        so.pass_to_output = pass_to;
    }
}

fn schedule_buffer_passes(network: &Network, request: &Request, schedule: &mut Schedule) {
    let _span = tracing::trace_span!("schedule_buffer_passes").entered();

    for node_index in 0..schedule.nodes.len() {
        let node = schedule.nodes[node_index].node;
        if schedule.nodes[node_index].outputs.len()
            != network.node(node).outputs.len()
        {
            schedule_unrequested_read_writes(network, node, schedule);
        }
    }

    for node_index in 0..schedule.nodes.len() {
        set_buffer_pass_data(network, node_index, schedule);
    }

    // Keep the whole request mask at every requested output: keeping
    // more than strictly requested raises the chance that a later
    // request can reuse the cache at this output.
    for masked_output in request.iter() {
        let id = schedule.output_id(masked_output.output);
        debug_assert!(id.is_valid());
        let keep = schedule.request_mask(id).clone();
        schedule.set_keep_mask(id, keep);
    }
}

// -----------------------------------------------------------------------------
// Phase 3: affects-mask application

/// Applies the affects masks on one node and recomputes its affective
/// flag. Returns `false` if the flag changed, which invalidates
/// incremental schedule updates.
fn apply_affects_masks_for_node(
    network: &Network,
    schedule: &mut Schedule,
    node_index: usize,
) -> bool {
    let was_affective = schedule.nodes[node_index].affective;
    let node = schedule.nodes[node_index].node;

    // Root-value nodes stay non-affective: they are never run, while
    // their outputs remain scheduled.
    if network.node(node).owns_buffers {
        schedule.nodes[node_index].affective = false;
        return !was_affective;
    }

    let mut affective = false;
    for so in &mut schedule.nodes[node_index].outputs {
        let output = network.output(so.output);
        if output.associated_input.is_some() {
            so.affects_mask = match &output.affects_mask {
                Some(affects) if !so.request_mask.is_empty() => {
                    &so.request_mask & affects
                }
                _ => so.request_mask.clone(),
            };
        }

        // An output with no associated input is always affective.
        affective |= output.associated_input.is_none() || so.affects_mask.is_any_set();
    }
    schedule.nodes[node_index].affective = affective;

    was_affective == affective
}

fn apply_affects_masks(network: &Network, schedule: &mut Schedule) {
    let _span = tracing::trace_span!("apply_affects_masks").entered();

    for node_index in 0..schedule.nodes.len() {
        apply_affects_masks_for_node(network, schedule, node_index);
    }
}

// -----------------------------------------------------------------------------
// Phase 4: pass-through skipping

/// Walks upstream from `output` to the nearest output that still has an
/// effect in this schedule.
fn find_prev_affective_output(
    network: &Network,
    schedule: &Schedule,
    start: OutputIndex,
    visited: &mut hashbrown::HashSet<OutputIndex>,
) -> Option<OutputIndex> {
    let mut output = Some(start);

    while let Some(current) = output {
        let id = schedule.output_id(current);
        if !id.is_valid() {
            tracing::error!("pass-through walk reached an unscheduled output");
            return None;
        }

        // Without an associated input the output cannot source a passed
        // buffer; it is always affective.
        let Some(associated_input) = network.output(current).associated_input else {
            return Some(current);
        };

        // No further input connections to seek through.
        let connections = &network.input(associated_input).connections;
        let [connection] = connections.as_slice() else {
            return Some(current);
        };

        // An all-zeros connection mask never passes a buffer.
        if network.connection(*connection).mask.is_all_zeros() {
            return Some(current);
        }

        if schedule.affects_mask(id).is_any_set() {
            return Some(current);
        }

        // Scheduled reads force the kept bits to be copied back here, so
        // the output cannot be skipped.
        if !schedule.keep_mask(id).is_empty() || schedule.pass_to_output(id).is_none() {
            return Some(current);
        }

        // Where multiple branches of the pool converge (more than one
        // read/write fan-out on the next output), passing through would
        // require keeping the entire buffer.
        let next_output = network.connection(*connection).source_output;
        let next_connections = &network.output(next_output).connections;
        if next_connections.len() > 1 {
            let mut num_read_writes = 0;
            for &c in next_connections {
                let target = network.connection(c).target_input;
                if network.input(target).associated_output.is_some() {
                    num_read_writes += 1;
                    if num_read_writes > 1 {
                        return Some(current);
                    }
                }
            }
        }

        // Cleared for pass-through.
        if !visited.insert(current) {
            return Some(current);
        }
        output = Some(next_output);
    }

    None
}

fn schedule_pass_through_for_output(
    network: &Network,
    schedule: &mut Schedule,
    start: OutputIndex,
    visited: &mut hashbrown::HashSet<OutputIndex>,
) {
    let mut output = Some(start);

    while let Some(current) = output {
        if !visited.insert(current) {
            return;
        }

        let id = schedule.output_id(current);
        if !id.is_valid() {
            return;
        }

        let Some(immediate) = network.associated_source_output(current) else {
            return;
        };

        // Never pass through all-zeros connection masks.
        let associated_input = network
            .output(current)
            .associated_input
            .expect("associated source implies associated input");
        let connection = network.input(associated_input).connections[0];
        if network.connection(connection).mask.is_all_zeros() {
            return;
        }

        let immediate_id = schedule.output_id(immediate);
        if !immediate_id.is_valid() {
            return;
        }

        let pass_from = find_prev_affective_output(network, schedule, immediate, visited);
        if let Some(pass_from) = pass_from {
            if pass_from != immediate {
                let pass_from_id = schedule.output_id(pass_from);
                debug_assert!(pass_from_id.is_valid());

                // The immediate output sources its buffer from the first
                // output upstream that provides an affected value; the
                // provider passes directly to it, skipping the no-op
                // stretch in between.
                schedule.set_from_buffer_output(immediate_id, Some(pass_from));
                if schedule.pass_to_output(pass_from_id).is_some() {
                    schedule.set_pass_to_output(pass_from_id, Some(immediate));
                }
            }
        }

        output = pass_from;
    }
}

fn schedule_for_pass_throughs(
    network: &Network,
    schedule: &mut Schedule,
    pool_outputs: &PoolPriority,
) {
    let _span = tracing::trace_span!("schedule_for_pass_throughs").entered();

    // The visited set doubles as cycle protection and ensures each pool
    // chain branch is walked exactly once: the walk starts at the lowest
    // entry, so higher entries find their stretch already visited.
    let mut visited = hashbrown::HashSet::new();
    for &(_, output) in pool_outputs {
        schedule_pass_through_for_output(network, schedule, output, &mut visited);
    }
}

// -----------------------------------------------------------------------------
// Phase 5: task-graph generation

/// Restricts `bits` to partition `index`: bits outside the partition are
/// cleared, platform structure is preserved.
fn compute_partition_subset(index: usize, grain: usize, bits: &Bits) -> Bits {
    let partition_first = index * grain;
    let partition_last = partition_first + grain - 1;

    let mut result = Bits::builder();
    for p in bits.platforms() {
        if !p.set || p.end() <= partition_first || p.first > partition_last {
            result.append(p.len, false);
        } else {
            let leading = partition_first.saturating_sub(p.first);
            let trailing = p.end().saturating_sub(partition_last + 1);
            result.append(leading, false);
            result.append(p.len - leading - trailing, true);
            result.append(trailing, false);
        }
    }
    debug_assert_eq!(result.size(), bits.size());
    result
}

/// Flags each partition that overlaps a set bit of `bits`.
fn gather_occupied_partitions(grain: usize, bits: &Bits, occupied: &mut [bool]) {
    for p in bits.platforms().filter(|p| p.is_set()) {
        let first = p.first / grain;
        let last = (p.end() - 1) / grain;
        for slot in &mut occupied[first..=last] {
            *slot = true;
        }
    }
}

/// The output `output` sources its buffer from, if any.
fn find_from_buffer_output(
    network: &Network,
    schedule: &Schedule,
    output: OutputIndex,
    id: OutputId,
) -> Option<OutputIndex> {
    if let Some(from) = schedule.from_buffer_output(id) {
        return Some(from);
    }

    let source = network.associated_source_output(output)?;
    let from_id = schedule.output_id(source);
    if !from_id.is_valid() || schedule.pass_to_output(from_id) != Some(output) {
        return None;
    }
    Some(source)
}

/// The next pool output up the chain, if the chain continues.
fn find_next_pool_output(
    network: &Network,
    schedule: &Schedule,
    output: OutputIndex,
    id: OutputId,
) -> Option<OutputIndex> {
    let from = find_from_buffer_output(network, schedule, output, id)?;
    network.is_pool_output(from).then_some(from)
}

struct InvocationNode {
    schedule_node_index: usize,
    invocation_index: usize,
    invocation_num: usize,
    inputs_task_index: TaskIndex,
    keep_task_index: TaskIndex,
}

#[derive(Default)]
struct InvocationBitsets {
    requested: Bits,
    affected: Bits,
    kept: Bits,
}

/// The invocations of one pool chain.
#[derive(Default)]
struct Invocations {
    nodes: Vec<InvocationNode>,
    bitsets: Vec<InvocationBitsets>,
    num_inputs_tasks: TaskIndex,
    num_keep_tasks: TaskIndex,
}

/// Computes the per-partition bitsets for one node's invocations.
fn compute_invocation_bitsets(
    request_mask: &Mask,
    affects_mask: &Mask,
    keep_mask: &Mask,
    is_affective: bool,
    num_partitions: usize,
    bitsets: &mut [InvocationBitsets],
) {
    let mut offset = 0;
    for i in 0..num_partitions {
        let requested =
            compute_partition_subset(i, INVOCATION_GRAIN, request_mask.bits());
        // Affects and keep masks are subsets of the request mask, so an
        // unoccupied partition can be skipped outright.
        if requested.are_all_unset() {
            continue;
        }

        let entry = &mut bitsets[offset];
        entry.requested = requested;
        if is_affective {
            entry.affected =
                compute_partition_subset(i, INVOCATION_GRAIN, affects_mask.bits());
        }
        if !keep_mask.is_empty() {
            entry.kept =
                compute_partition_subset(i, INVOCATION_GRAIN, keep_mask.bits());
        }
        offset += 1;
    }
    debug_assert_eq!(offset, bitsets.len());
}

/// Creates invocations for every node along the pool chain starting (at
/// the downstream end) with `start`.
fn create_pool_invocations(
    network: &Network,
    schedule: &Schedule,
    start: OutputIndex,
    visited_nodes: &mut [bool],
    has_invocations: &mut [bool],
) -> Invocations {
    let mut invocations = Invocations::default();

    let first_id = schedule.output_id(start);
    let partition_size = schedule.request_mask(first_id).size();
    let num_partitions = partition_size.div_ceil(INVOCATION_GRAIN);

    // A single partition needs no invocations.
    if num_partitions <= 1 {
        return invocations;
    }

    let mut inputs_task_index: TaskIndex = 0;
    let mut keep_task_index: TaskIndex = 0;
    let mut occupied = vec![false; num_partitions];

    let mut output = Some(start);
    while let Some(current) = output {
        // Pool-chain nodes have exactly one output, and it is a pool
        // output.
        let node = network.output(current).node;
        if network.node(node).outputs.len() != 1 || !network.is_pool_output(current) {
            tracing::error!("pool chain reached a non-pool or multi-output node");
            break;
        }

        let id = schedule.output_id(current);
        if !id.is_valid() {
            break;
        }

        // Only strip-mine outputs that pass their data.
        if schedule.pass_to_output(id).is_none() {
            break;
        }

        let schedule_node_index = schedule
            .schedule_node_index(node)
            .expect("scheduled output on unscheduled node");

        if std::mem::replace(&mut visited_nodes[schedule_node_index], true) {
            break;
        }

        let request_mask = schedule.request_mask(id);
        occupied.fill(false);
        gather_occupied_partitions(INVOCATION_GRAIN, request_mask.bits(), &mut occupied);
        let num_invocations = occupied.iter().filter(|o| **o).count();
        debug_assert!(num_invocations > 0);

        let is_affective = schedule.is_affective(id);
        let keep_mask = schedule.keep_mask(id).clone();

        let invocation_index = invocations.bitsets.len();
        invocations.nodes.push(InvocationNode {
            schedule_node_index,
            invocation_index,
            invocation_num: num_invocations,
            inputs_task_index: if is_affective {
                let i = inputs_task_index;
                inputs_task_index += 1;
                i
            } else {
                INVALID_TASK
            },
            keep_task_index: if !keep_mask.is_empty() {
                let i = keep_task_index;
                keep_task_index += 1;
                i
            } else {
                INVALID_TASK
            },
        });
        invocations
            .bitsets
            .resize_with(invocation_index + num_invocations, InvocationBitsets::default);

        compute_invocation_bitsets(
            request_mask,
            schedule.affects_mask(id),
            &keep_mask,
            is_affective,
            num_partitions,
            &mut invocations.bitsets[invocation_index..],
        );

        debug_assert!(!has_invocations[schedule_node_index]);
        has_invocations[schedule_node_index] = true;

        output = find_next_pool_output(network, schedule, current, id);
    }

    invocations.num_inputs_tasks = inputs_task_index;
    invocations.num_keep_tasks = keep_task_index;
    invocations
}

/// Offsets used to append one chain's invocations into the schedule's
/// flat arrays.
struct TaskOffsets {
    node: usize,
    invocation: usize,
    inputs_task: usize,
    keep_task: usize,
}

/// Fills in the node invocations and compute tasks for one chain.
fn create_invocations_and_tasks(
    invocations: &Invocations,
    offsets: &TaskOffsets,
    schedule: &mut Schedule,
) {
    // Insert the node invocations from the per-invocation bitsets.
    for (i, bitsets) in invocations.bitsets.iter().enumerate() {
        debug_assert!(!bitsets.requested.are_all_unset());
        let invocation = &mut schedule.node_invocations[offsets.invocation + i];
        invocation.request_mask = Mask::from_bits(&bitsets.requested);
        if !bitsets.affected.are_all_unset() {
            invocation.affects_mask = Mask::from_bits(&bitsets.affected);
        }
        if !bitsets.kept.are_all_unset() {
            invocation.keep_mask = Mask::from_bits(&bitsets.kept);
        }
    }

    // Generate the compute tasks per node.
    for (i, node) in invocations.nodes.iter().enumerate() {
        for j in 0..node.invocation_num {
            let invocation_index = node.invocation_index + j;
            let bitsets = &invocations.bitsets[invocation_index];

            let is_affective =
                bitsets.affected.size() > 0 && !bitsets.affected.are_all_unset();
            let has_keep = bitsets.kept.size() > 0 && !bitsets.kept.are_all_unset();

            let task =
                &mut schedule.compute_tasks[offsets.invocation + invocation_index];
            task.invocation_index =
                to_task_index(offsets.invocation + invocation_index);

            // Inputs tasks only exist for affective invocations; a
            // non-affective invocation consumes no inputs.
            task.inputs_task_index =
                if is_affective && !is_invalid_task(node.inputs_task_index) {
                    to_task_index(
                        offsets.inputs_task + node.inputs_task_index as usize,
                    )
                } else {
                    INVALID_TASK
                };

            // All invocations of a node share one prep task: the node
            // only needs preparing once per evaluation.
            task.prep_task_index = to_task_index(offsets.node + i);

            task.flags = ComputeTaskFlags::empty();
            task.flags.set(ComputeTaskFlags::AFFECTIVE, is_affective);
            task.flags.set(ComputeTaskFlags::HAS_KEEP, has_keep);
        }

        schedule.nodes_to_compute_tasks[node.schedule_node_index] = NodeTasks {
            task_id: to_task_index(offsets.invocation + node.invocation_index),
            task_num: u32::try_from(node.invocation_num).expect("invocation count"),
        };

        if !is_invalid_task(node.keep_task_index) {
            schedule.nodes_to_keep_tasks[node.schedule_node_index] =
                to_task_index(offsets.keep_task + node.keep_task_index as usize);
        }
    }
}

/// Whether the node has at least one scheduled prereq and at least one
/// scheduled read.
fn has_prereqs_and_reads(network: &Network, schedule: &Schedule, node: NodeIndex) -> bool {
    let mut has_prereq = false;
    let mut has_read = false;

    for &input_index in &network.node(node).inputs {
        let input = network.input(input_index);

        if !has_prereq && input.is_prerequisite {
            has_prereq = input.connections.iter().any(|&c| {
                schedule
                    .output_id(network.connection(c).source_output)
                    .is_valid()
            });
        } else if !has_read && input.associated_output.is_none() {
            has_read = input.connections.iter().any(|&c| {
                schedule
                    .output_id(network.connection(c).source_output)
                    .is_valid()
            });
        }

        if has_prereq && has_read {
            return true;
        }
    }

    false
}

/// Creates the single compute task of every node without invocations.
fn create_singular_tasks(
    network: &Network,
    schedule: &mut Schedule,
    has_invocations: &[bool],
    mut compute_task_index: usize,
    mut inputs_task_index: usize,
) -> usize {
    for node_index in 0..schedule.nodes.len() {
        if has_invocations[node_index] {
            continue;
        }

        let node = schedule.nodes[node_index].node;
        let is_affective = schedule.nodes[node_index].affective;

        // An inputs task pays off only when prereqs and reads can
        // actually run concurrently with the read/writes.
        let mut task_inputs_index = INVALID_TASK;
        if is_affective
            && !network.node(node).is_speculation
            && has_prereqs_and_reads(network, schedule, node)
        {
            task_inputs_index = to_task_index(inputs_task_index);
            inputs_task_index += 1;
        }

        let has_keep = schedule.nodes[node_index]
            .outputs
            .iter()
            .any(|so| !so.keep_mask.is_empty());

        let task = &mut schedule.compute_tasks[compute_task_index];
        task.invocation_index = INVALID_TASK;
        task.inputs_task_index = task_inputs_index;
        // A single compute task preps its own node; no synchronization
        // needed. It also keeps its own data, so no separate keep task.
        task.prep_task_index = INVALID_TASK;
        task.flags = ComputeTaskFlags::empty();
        task.flags.set(ComputeTaskFlags::AFFECTIVE, is_affective);
        task.flags.set(ComputeTaskFlags::HAS_KEEP, has_keep);

        schedule.nodes_to_compute_tasks[node_index] = NodeTasks {
            task_id: to_task_index(compute_task_index),
            task_num: 1,
        };
        compute_task_index += 1;
    }

    debug_assert_eq!(compute_task_index, schedule.compute_tasks.len());
    inputs_task_index
}

fn generate_tasks(network: &Network, schedule: &mut Schedule, pool_outputs: &PoolPriority) {
    let _span = tracing::trace_span!("generate_tasks").entered();

    let num_scheduled_nodes = schedule.nodes.len();
    let mut has_invocations = vec![false; num_scheduled_nodes];
    let mut visited_nodes = vec![false; num_scheduled_nodes];

    // One set of invocations per distinct pool chain, entered from its
    // terminating (non-passing) output.
    let mut all_invocations: Vec<Invocations> = Vec::new();
    for &(_, output) in pool_outputs {
        let id = schedule.output_id(output);
        if schedule.pass_to_output(id).is_some() {
            continue;
        }
        if let Some(from) = find_next_pool_output(network, schedule, output, id) {
            all_invocations.push(create_pool_invocations(
                network,
                schedule,
                from,
                &mut visited_nodes,
                &mut has_invocations,
            ));
        }
    }

    let num_pool_nodes: usize = all_invocations.iter().map(|i| i.nodes.len()).sum();
    let num_pool_invocations: usize =
        all_invocations.iter().map(|i| i.bitsets.len()).sum();
    let num_pool_inputs_tasks: usize = all_invocations
        .iter()
        .map(|i| i.num_inputs_tasks as usize)
        .sum();
    let num_pool_keep_tasks: usize = all_invocations
        .iter()
        .map(|i| i.num_keep_tasks as usize)
        .sum();

    schedule.nodes_to_compute_tasks = vec![NodeTasks::default(); num_scheduled_nodes];
    schedule.nodes_to_keep_tasks = vec![INVALID_TASK; num_scheduled_nodes];
    schedule.node_invocations =
        vec![NodeInvocation::default(); num_pool_invocations];
    schedule.compute_tasks = vec![
        ComputeTask::default();
        num_scheduled_nodes - num_pool_nodes + num_pool_invocations
    ];
    // Upper bound; trimmed to the actual count below.
    schedule.inputs_tasks = vec![
        InputsTask::default();
        num_scheduled_nodes - num_pool_nodes + num_pool_inputs_tasks
    ];
    schedule.num_keep_tasks =
        u32::try_from(num_pool_keep_tasks).expect("keep task count");
    schedule.num_prep_tasks = u32::try_from(num_pool_nodes).expect("prep task count");

    let mut offsets = TaskOffsets {
        node: 0,
        invocation: 0,
        inputs_task: 0,
        keep_task: 0,
    };
    for invocations in &all_invocations {
        create_invocations_and_tasks(invocations, &offsets, schedule);
        offsets.node += invocations.nodes.len();
        offsets.invocation += invocations.bitsets.len();
        offsets.inputs_task += invocations.num_inputs_tasks as usize;
        offsets.keep_task += invocations.num_keep_tasks as usize;
    }

    let num_inputs_tasks = create_singular_tasks(
        network,
        schedule,
        &has_invocations,
        offsets.invocation,
        offsets.inputs_task,
    );

    // Fewer inputs tasks may have materialized than assumed.
    debug_assert!(num_inputs_tasks <= schedule.inputs_tasks.len());
    schedule.inputs_tasks.truncate(num_inputs_tasks);
}

// -----------------------------------------------------------------------------
// Phase 6: input-dependency edges

/// Positions of a node's dependencies within its scheduled inputs,
/// sorted into the three classes.
#[derive(Default)]
struct NodeDependencies {
    read_writes: Vec<usize>,
    prereqs: Vec<usize>,
    reads: Vec<usize>,
}

fn gather_node_dependencies(
    network: &Network,
    schedule: &Schedule,
    node_index: usize,
) -> NodeDependencies {
    let mut deps = NodeDependencies::default();
    let schedule_node = &schedule.nodes[node_index];

    // Speculation nodes contribute no dependencies to the task graph.
    if network.node(schedule_node.node).is_speculation {
        return deps;
    }

    let is_affective = schedule_node.affective;
    for (i, si) in schedule_node.inputs.iter().enumerate() {
        let input = network.input(si.input);
        let is_read_write = input.associated_output.is_some();

        if is_affective && input.is_prerequisite {
            debug_assert!(!is_read_write);
            deps.prereqs.push(i);
        } else if is_affective && !is_read_write {
            deps.reads.push(i);
        } else if is_read_write {
            debug_assert!(input.connections.len() <= 1);
            deps.read_writes.push(i);
        }
    }
    deps
}

/// The key deduplicating input dependencies: dependencies on the same
/// (output, mask) pair share one dense index and one runtime cache slot.
type UniqueIndexMap = HashMap<(OutputIndex, Mask), u32>;

fn unique_input_dependency_index(
    output: OutputIndex,
    mask: &Mask,
    unique_indices: &mut UniqueIndexMap,
) -> u32 {
    let next = u32::try_from(unique_indices.len()).expect("unique index count");
    *unique_indices
        .entry((output, mask.clone()))
        .or_insert(next)
}

/// Establishes the task dependencies of one consumer on one scheduled
/// source output.
#[allow(clippy::too_many_arguments, reason = "mirrors the traversal state")]
fn establish_task_dependency(
    network: &Network,
    schedule: &Schedule,
    from_id: OutputId,
    is_pass_to: bool,
    dependency_mask: &Mask,
    input_deps: &mut Vec<InputDependency>,
    unique_indices: &mut UniqueIndexMap,
    start_hint: &mut usize,
) {
    let output = schedule.output_of(from_id);
    let node = network.output(output).node;
    let source_node_index = schedule
        .schedule_node_index(node)
        .expect("scheduled output on unscheduled node");

    // When the source does not pass its buffer here, a keep task at the
    // source may satisfy the dependency instead of the compute tasks.
    if !is_pass_to {
        let keep_mask = schedule.keep_mask(from_id);
        if !keep_mask.is_empty() {
            if !keep_mask.overlaps(dependency_mask) {
                return;
            }
            let keep_task = schedule.keep_task_of(source_node_index);
            if !is_invalid_task(keep_task) {
                // Intersecting the keep mask with the dependency mask
                // would narrow the dependency but multiply the unique
                // indices, and with them the runtime cache lookups.
                input_deps.push(InputDependency {
                    unique_index: unique_input_dependency_index(
                        output,
                        keep_mask,
                        unique_indices,
                    ),
                    output,
                    mask: keep_mask.clone(),
                    compute_or_keep_task_id: keep_task,
                    compute_task_num: 0,
                });
                return;
            }
        }
    }

    // Otherwise depend on the overlapping compute tasks of the source
    // node.
    let tasks = schedule.compute_tasks_of(source_node_index);
    let range = tasks.range();

    // Compute tasks are partitioned in ascending bit order, so the scan
    // can stop at the first partition past the dependency's last bit.
    let last_relevant_bit = dependency_mask.last_set();

    let mut first_task = usize::MAX;
    let mut last_task = 0usize;
    let mut found = false;

    debug_assert!(range.start + *start_hint < range.end);
    for task_id in (range.start + *start_hint)..range.end {
        let compute_task = &schedule.compute_tasks[task_id];

        // A task without an invocation is the node's only task, and the
        // dependency is on it by construction.
        let mut is_dependent = is_invalid_task(compute_task.invocation_index);

        if !is_dependent {
            let request_mask =
                &schedule.node_invocations[compute_task.invocation_index as usize]
                    .request_mask;
            if request_mask.first_set() > last_relevant_bit {
                *start_hint = task_id - range.start;
                break;
            }
            is_dependent = request_mask.overlaps(dependency_mask);
        }

        if is_dependent {
            first_task = first_task.min(task_id);
            last_task = last_task.max(task_id);
            found = true;
        }
    }

    if !found {
        tracing::error!(
            "input dependency without any overlapping source compute task"
        );
        return;
    }

    let from_request_mask = schedule.request_mask(from_id).clone();
    input_deps.push(InputDependency {
        unique_index: unique_input_dependency_index(
            output,
            &from_request_mask,
            unique_indices,
        ),
        output,
        mask: from_request_mask,
        compute_or_keep_task_id: to_task_index(first_task),
        compute_task_num: u32::try_from(last_task - first_task + 1)
            .expect("task range"),
    });
}

fn insert_input_dependencies(
    network: &Network,
    schedule: &mut Schedule,
    node_dependencies: &[NodeDependencies],
) -> usize {
    let _span = tracing::trace_span!("insert_input_dependencies").entered();

    let mut input_deps: Vec<InputDependency> = Vec::with_capacity(
        schedule.compute_tasks.len() + schedule.inputs_tasks.len(),
    );
    let mut unique_indices: UniqueIndexMap = UniqueIndexMap::new();

    for node_index in 0..schedule.nodes.len() {
        let deps = &node_dependencies[node_index];

        let tasks = schedule.compute_tasks_of(node_index);
        if tasks.is_empty() {
            continue;
        }
        let range = tasks.range();

        let mut start_hint = 0usize;
        let mut inputs_task_index = INVALID_TASK;

        // Read/writes first: during evaluation those buffers are read
        // from memory first.
        for task_id in range.clone() {
            let task_inputs_index = schedule.compute_tasks[task_id].inputs_task_index;
            if !is_invalid_task(task_inputs_index) {
                // All invocations that have an inputs task share it.
                debug_assert!(
                    is_invalid_task(inputs_task_index)
                        || inputs_task_index == task_inputs_index
                );
                inputs_task_index = task_inputs_index;
            }

            let invocation_index = schedule.compute_tasks[task_id].invocation_index;
            let first_dep = input_deps.len();

            for &dep_pos in &deps.read_writes {
                let si = schedule.nodes[node_index].inputs[dep_pos].clone();
                let associated = network
                    .input(si.input)
                    .associated_output
                    .expect("read/write dependency without associated output");
                let associated_id = schedule.output_id(associated);

                let from = schedule.from_buffer_output(associated_id);
                let source = from.unwrap_or(si.source);
                let source_id = schedule.output_id(source);

                let is_pass_to = from.is_some()
                    || schedule.pass_to_output(source_id) == Some(associated);

                // With an invocation, the invocation's request mask
                // restricts the dependency to the compute tasks that
                // produce values inside this partition. This is where
                // the strip-mining takes effect.
                let request_mask = if !is_invalid_task(invocation_index) {
                    schedule.node_invocations[invocation_index as usize]
                        .request_mask
                        .clone()
                } else {
                    schedule.request_mask(associated_id).clone()
                };

                establish_task_dependency(
                    network,
                    schedule,
                    source_id,
                    is_pass_to,
                    &request_mask,
                    &mut input_deps,
                    &mut unique_indices,
                    &mut start_hint,
                );
            }

            // Read/writes are always required.
            let task = &mut schedule.compute_tasks[task_id];
            task.requireds_index = to_task_index(first_dep);
            task.requireds_num =
                u32::try_from(input_deps.len() - first_dep).expect("dep count");
        }

        // Multiple invocations without an inputs task need nothing more
        // than their read/writes.
        if is_invalid_task(inputs_task_index) && range.len() > 1 {
            continue;
        }

        let establish_reads = |positions: &[usize],
                               schedule: &Schedule,
                               input_deps: &mut Vec<InputDependency>,
                               unique_indices: &mut UniqueIndexMap|
         -> (usize, usize) {
            let first = input_deps.len();
            for &dep_pos in positions {
                let si = &schedule.nodes[node_index].inputs[dep_pos];
                let source_id = schedule.output_id(si.source);
                let mut read_hint = 0usize;
                establish_task_dependency(
                    network,
                    schedule,
                    source_id,
                    false,
                    &si.mask.clone(),
                    input_deps,
                    unique_indices,
                    &mut read_hint,
                );
            }
            (first, input_deps.len() - first)
        };

        let (prereqs_first, prereqs_num) =
            establish_reads(&deps.prereqs, schedule, &mut input_deps, &mut unique_indices);
        let (_, reads_num) =
            establish_reads(&deps.reads, schedule, &mut input_deps, &mut unique_indices);

        if !is_invalid_task(inputs_task_index) {
            // The inputs task synchronizes on the prereqs, with the
            // reads as optionals: prereq outcomes decide at evaluation
            // time whether the reads become required.
            let inputs_task = &mut schedule.inputs_tasks[inputs_task_index as usize];
            inputs_task.input_dep_index = to_task_index(prereqs_first);
            inputs_task.prereqs_num = u32::try_from(prereqs_num).expect("dep count");
            inputs_task.optionals_num = u32::try_from(reads_num).expect("dep count");
        } else {
            // Without an inputs task the prereqs and reads fold into the
            // compute task's required count; only inputs tasks know how
            // to run optionals concurrently.
            debug_assert_eq!(range.len(), 1);
            let task = &mut schedule.compute_tasks[range.start];
            task.requireds_num +=
                u32::try_from(prereqs_num + reads_num).expect("dep count");
        }
    }

    // Passing outputs consult their unique index at runtime; assign it.
    // Outputs in the request, and outputs skipped by from-buffer
    // passing, are never pulled in as dependencies and keep no index.
    for node in &mut schedule.nodes {
        for so in &mut node.outputs {
            if so.pass_to_output.is_none() {
                continue;
            }
            if let Some(&unique) =
                unique_indices.get(&(so.output, so.request_mask.clone()))
            {
                so.unique_index = unique;
            }
        }
    }

    schedule.input_deps = input_deps;
    unique_indices.len()
}

fn schedule_task_graph(
    network: &Network,
    schedule: &mut Schedule,
    pool_outputs: &PoolPriority,
) {
    let _span = tracing::trace_span!("schedule_task_graph").entered();

    generate_tasks(network, schedule, pool_outputs);

    // Dependency gathering is independent per node; split it across
    // threads.
    let mut node_dependencies: Vec<NodeDependencies> =
        (0..schedule.nodes.len()).map(|_| NodeDependencies::default()).collect();
    {
        let schedule = &*schedule;
        parallel_for_chunks(&mut node_dependencies, |offset, chunk| {
            for (i, slot) in chunk.iter_mut().enumerate() {
                *slot = gather_node_dependencies(network, schedule, offset + i);
            }
        });
    }

    let num_unique = insert_input_dependencies(network, schedule, &node_dependencies);
    schedule.num_unique_input_deps = num_unique;
}

// -----------------------------------------------------------------------------
// Phase 7: lock masks

/// Locks the elements of `output`'s affects mask that stop being
/// affective at the next affective output downstream, by OR-ing them
/// into the keep mask. Returns whether anything was locked.
fn assign_lock_mask_for_output(
    network: &Network,
    schedule: &mut Schedule,
    output: OutputIndex,
) -> bool {
    let id = schedule.output_id(output);
    if !id.is_valid() || !schedule.is_affective(id) {
        return false;
    }

    // The scheduled affects mask is already a subset of the request
    // mask.
    let affects_mask = schedule.affects_mask(id).clone();

    // Collect what is still affected at the next affective output this
    // output passes its data towards. Without one, everything stays
    // locked at this output, which keeps the data at requested outputs
    // readable.
    let mut affected_at_next = Mask::new(affects_mask.size());
    let mut next_id = id;
    loop {
        let Some(pass_to) = schedule.pass_to_output(next_id) else {
            break;
        };
        next_id = schedule.output_id(pass_to);
        debug_assert!(next_id.is_valid());
        if schedule.is_affective(next_id) {
            affected_at_next = schedule.affects_mask(next_id).clone();

            // A next output on a node with more than one output would
            // demand locking everything: its non-pool outputs may
            // depend on any incoming element. Current movers only ever
            // have one output.
            let next_node = network.output(pass_to).node;
            if network.node(next_node).outputs.len() != 1 {
                tracing::error!("pool mover with more than one output");
                affected_at_next = Mask::new(affects_mask.size());
            }
            break;
        }
    }

    let lock_mask = &affects_mask - &affected_at_next;
    if lock_mask.is_any_set() {
        let mut keep_mask = schedule.keep_mask(id).clone();
        keep_mask.set_or_append(&lock_mask);
        schedule.set_keep_mask(id, keep_mask);
        return true;
    }
    false
}

fn compute_lock_masks(
    network: &Network,
    schedule: &mut Schedule,
    pool_outputs: &PoolPriority,
) {
    let _span = tracing::trace_span!("compute_lock_masks").entered();

    let mut locked_any = false;
    for &(_, output) in pool_outputs {
        locked_any |= assign_lock_mask_for_output(network, schedule, output);
    }
    schedule.has_buffer_locks = locked_any;
}

// -----------------------------------------------------------------------------
// Topological pre-sort

fn sort_topologically(network: &Network, request: &Request, schedule: &mut Schedule) {
    let mut stack: Vec<(OutputIndex, bool)> =
        request.iter().map(|mo| (mo.output, false)).collect();

    while let Some(&(output, add_self)) = stack.last() {
        let node_index = network.output(output).node;
        let node = network.node(node_index);

        // Once all dependencies are processed (or the node is already
        // scheduled), the output itself joins the schedule.
        if add_self || schedule.is_scheduled(node_index) {
            schedule.get_or_create_output_id(network, output);
            stack.pop();
            continue;
        }

        stack.last_mut().expect("stack is non-empty").1 = true;

        if node.is_speculation {
            continue;
        }

        for &input_index in &node.inputs {
            for &connection in &network.input(input_index).connections {
                stack.push((network.connection(connection).source_output, false));
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Incremental update

fn update_affects_mask_for_invocation(schedule: &mut Schedule, node_index: usize) {
    let tasks = schedule.compute_tasks_of(node_index);
    if tasks.is_empty() {
        return;
    }
    let range = tasks.range();

    // The inputs task is shared; find it with a linear scan over the
    // node's compute tasks.
    let inputs_task_index = range
        .clone()
        .map(|id| schedule.compute_tasks[id].inputs_task_index)
        .find(|&i| !is_invalid_task(i))
        .unwrap_or(INVALID_TASK);

    // Nodes with invocations have a single output.
    let new_affects_mask = schedule.nodes[node_index].outputs[0].affects_mask.clone();

    for task_id in range {
        let invocation_index = schedule.compute_tasks[task_id].invocation_index;
        if is_invalid_task(invocation_index) {
            continue;
        }

        let invocation = &mut schedule.node_invocations[invocation_index as usize];
        let new_invocation_affects = &invocation.request_mask & &new_affects_mask;
        let task = &mut schedule.compute_tasks[task_id];
        if new_invocation_affects.is_all_zeros() {
            schedule.node_invocations[invocation_index as usize].affects_mask =
                Mask::default();
            task.flags.remove(ComputeTaskFlags::AFFECTIVE);
            task.inputs_task_index = INVALID_TASK;
        } else {
            schedule.node_invocations[invocation_index as usize].affects_mask =
                new_invocation_affects;
            task.flags.insert(ComputeTaskFlags::AFFECTIVE);
            task.inputs_task_index = inputs_task_index;
        }
    }
}

fn update_lock_mask_for_node(network: &Network, schedule: &mut Schedule, node_index: usize) {
    for output_pos in 0..schedule.nodes[node_index].outputs.len() {
        let so = &schedule.nodes[node_index].outputs[output_pos];
        let output = so.output;
        let from_buffer = so.from_buffer_output;
        if !network.is_pool_output(output) {
            continue;
        }

        assign_lock_mask_for_output(network, schedule, output);

        // The lock mask of the output passing its buffer here depends on
        // this output's affects mask, which just changed.
        if let Some(from) = from_buffer {
            assign_lock_mask_for_output(network, schedule, from);
        }
    }
}

/// Revises the schedule in place after the affects mask of `output`
/// changed.
///
/// Returns `true` when the schedule remains usable (updated or
/// unaffected); `false` reports it stale and in need of a rebuild.
pub fn update_affects_mask_for_output(
    network: &Network,
    schedule: &mut Schedule,
    output: OutputIndex,
) -> bool {
    let out = network.output(output);
    if out.associated_input.is_none() || out.affects_mask.is_none() {
        tracing::error!("affects-mask update on an output without one");
        return true;
    }

    let id = schedule.output_id(output);
    if !id.is_valid() {
        return true;
    }

    // An affects mask that does not overlap the scheduled request
    // changes nothing.
    let request_mask = schedule.request_mask(id).clone();
    let affects = out.affects_mask.as_ref().expect("checked above");
    if !affects.overlaps(&request_mask) {
        return true;
    }

    // The dependency set follows the affects mask; the schedule can only
    // be updated in place if everything needed is already scheduled with
    // a sufficient request mask.
    let dependencies =
        find_inputs(network, &MaskedOutput::new(output, request_mask));
    for (connection, mask) in &dependencies {
        let source = network.connection(*connection).source_output;
        let dependency_id = schedule.output_id(source);
        if !dependency_id.is_valid() {
            return false;
        }
        if !schedule.request_mask(dependency_id).contains(mask) {
            return false;
        }
    }

    let Some(node_index) = schedule.schedule_node_index(out.node) else {
        // Trivial nodes are not in the schedule; their affectiveness
        // definitely changed.
        return false;
    };

    if !apply_affects_masks_for_node(network, schedule, node_index) {
        return false;
    }

    update_affects_mask_for_invocation(schedule, node_index);

    if schedule.has_buffer_locks() {
        update_lock_mask_for_node(network, schedule, node_index);
    }

    true
}

fn to_task_index(value: usize) -> TaskIndex {
    u32::try_from(value).expect("task index exceeds u32")
}
