// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The sealed execution plan produced by the scheduler.
//!
//! A schedule is flat arrays all the way down: scheduled nodes with their
//! outputs and inputs, node invocations, compute and inputs tasks, input
//! dependencies, and two inversions (node to compute tasks, node to keep
//! task) accelerating the common lookups. Schedules of at most
//! [`SMALL_SCHEDULE_SIZE`] nodes drop their lookup maps entirely and
//! scan linearly.

use hashbrown::HashMap;
use mask::Mask;

use crate::graph::{Network, NodeIndex, OutputIndex, Request};
use crate::tasks::{
    ComputeTask, INVALID_TASK, InputDependency, InputsTask, NodeInvocation,
    NodeTasks, ScheduleInput, TaskIndex, TaskNum, UniqueIndex,
};

/// Schedules with at most this many nodes go without lookup maps.
pub(crate) const SMALL_SCHEDULE_SIZE: usize = 32;

/// Scheduling information for one output of a scheduled node.
#[derive(Clone, Debug)]
pub struct ScheduleOutput {
    pub output: OutputIndex,
    /// The elements some downstream consumer needs from this output.
    pub request_mask: Mask,
    /// The request mask intersected with the output's affects mask.
    pub affects_mask: Mask,
    /// The downstream output this output donates its write buffer to.
    pub pass_to_output: Option<OutputIndex>,
    /// The upstream output this output sources its buffer from, skipping
    /// pass-through chains.
    pub from_buffer_output: Option<OutputIndex>,
    /// What must remain readable here after the buffer is donated.
    pub keep_mask: Mask,
    /// The unique input-dependency index of (output, request mask);
    /// assigned only to outputs that pass their buffer.
    pub unique_index: UniqueIndex,
}

impl ScheduleOutput {
    fn new(output: OutputIndex, request_mask: Mask) -> Self {
        Self {
            output,
            request_mask,
            affects_mask: Mask::default(),
            pass_to_output: None,
            from_buffer_output: None,
            keep_mask: Mask::default(),
            unique_index: INVALID_TASK,
        }
    }
}

/// Scheduling information for one node.
#[derive(Debug)]
pub struct ScheduleNode {
    pub node: NodeIndex,
    /// An output whose temporary buffer can be released as soon as this
    /// node finished executing.
    pub output_to_clear: Option<OutputIndex>,
    /// Whether the node, as scheduled, cannot be bypassed while a buffer
    /// passes from an input to its associated output.
    pub affective: bool,
    pub outputs: Vec<ScheduleOutput>,
    pub inputs: Vec<ScheduleInput>,
}

/// Addresses a scheduled output as (node position, output position).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct OutputId {
    node: u32,
    output: u32,
}

impl OutputId {
    const INVALID: OutputId = OutputId {
        node: u32::MAX,
        output: u32::MAX,
    };

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub(crate) fn node_index(&self) -> usize {
        self.node as usize
    }

    pub(crate) fn output_index(&self) -> usize {
        self.output as usize
    }
}

/// A sealed, read-only execution plan.
#[derive(Default)]
pub struct Schedule {
    pub(crate) nodes: Vec<ScheduleNode>,

    // Lookup maps; dropped for small schedules.
    node_map: HashMap<NodeIndex, u32>,
    output_map: HashMap<OutputIndex, OutputId>,
    is_small: bool,

    // The task graph.
    pub(crate) node_invocations: Vec<NodeInvocation>,
    pub(crate) compute_tasks: Vec<ComputeTask>,
    pub(crate) inputs_tasks: Vec<InputsTask>,
    pub(crate) input_deps: Vec<InputDependency>,
    pub(crate) nodes_to_compute_tasks: Vec<NodeTasks>,
    pub(crate) nodes_to_keep_tasks: Vec<TaskIndex>,
    pub(crate) num_keep_tasks: TaskNum,
    pub(crate) num_prep_tasks: TaskNum,
    pub(crate) num_unique_input_deps: usize,

    // Whether any output locks no-longer-affective elements into its
    // keep mask.
    pub(crate) has_buffer_locks: bool,

    request: Option<Request>,
    is_valid: bool,
}

// === impl Schedule ===

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all scheduling data.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.is_valid = valid;
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub(crate) fn set_request(&mut self, request: Request) {
        self.request = Some(request);
    }

    pub fn num_scheduled_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn scheduled_nodes(&self) -> &[ScheduleNode] {
        &self.nodes
    }

    pub fn is_small(&self) -> bool {
        self.is_small
    }

    /// The position of `node` among the scheduled nodes, if scheduled.
    pub fn schedule_node_index(&self, node: NodeIndex) -> Option<usize> {
        if self.is_small || self.node_map.is_empty() {
            self.nodes.iter().position(|sn| sn.node == node)
        } else {
            self.node_map.get(&node).map(|&i| i as usize)
        }
    }

    pub fn is_scheduled(&self, node: NodeIndex) -> bool {
        self.schedule_node_index(node).is_some()
    }

    /// The id of `output` within the schedule; invalid if the output is
    /// not scheduled.
    pub fn output_id(&self, output: OutputIndex) -> OutputId {
        if self.is_small || self.output_map.is_empty() {
            for (ni, sn) in self.nodes.iter().enumerate() {
                if let Some(oi) =
                    sn.outputs.iter().position(|so| so.output == output)
                {
                    return OutputId {
                        node: u32::try_from(ni).expect("node index exceeds u32"),
                        output: u32::try_from(oi).expect("output index exceeds u32"),
                    };
                }
            }
            OutputId::INVALID
        } else {
            self.output_map
                .get(&output)
                .copied()
                .unwrap_or(OutputId::INVALID)
        }
    }

    /// The id of `output`, scheduling its node and output on first use.
    pub(crate) fn get_or_create_output_id(
        &mut self,
        network: &Network,
        output: OutputIndex,
    ) -> OutputId {
        let existing = self.output_id(output);
        if existing.is_valid() {
            return existing;
        }

        let node = network.output(output).node;
        let node_pos = match self.schedule_node_index(node) {
            Some(pos) => pos,
            None => {
                let pos = self.nodes.len();
                self.nodes.push(ScheduleNode {
                    node,
                    output_to_clear: None,
                    affective: false,
                    outputs: Vec::new(),
                    inputs: Vec::new(),
                });
                self.node_map
                    .insert(node, u32::try_from(pos).expect("node count exceeds u32"));
                pos
            }
        };

        let output_pos = self.nodes[node_pos].outputs.len();
        self.nodes[node_pos]
            .outputs
            .push(ScheduleOutput::new(output, Mask::default()));

        let id = OutputId {
            node: u32::try_from(node_pos).expect("node count exceeds u32"),
            output: u32::try_from(output_pos).expect("output count exceeds u32"),
        };
        self.output_map.insert(output, id);
        id
    }

    pub(crate) fn scheduled_output(&self, id: OutputId) -> &ScheduleOutput {
        &self.nodes[id.node_index()].outputs[id.output_index()]
    }

    pub(crate) fn scheduled_output_mut(&mut self, id: OutputId) -> &mut ScheduleOutput {
        &mut self.nodes[id.node_index()].outputs[id.output_index()]
    }

    pub fn output_of(&self, id: OutputId) -> OutputIndex {
        self.scheduled_output(id).output
    }

    pub fn request_mask(&self, id: OutputId) -> &Mask {
        &self.scheduled_output(id).request_mask
    }

    pub(crate) fn set_request_mask(&mut self, id: OutputId, mask: Mask) {
        self.scheduled_output_mut(id).request_mask = mask;
    }

    pub fn affects_mask(&self, id: OutputId) -> &Mask {
        &self.scheduled_output(id).affects_mask
    }

    pub fn keep_mask(&self, id: OutputId) -> &Mask {
        &self.scheduled_output(id).keep_mask
    }

    pub(crate) fn set_keep_mask(&mut self, id: OutputId, mask: Mask) {
        self.scheduled_output_mut(id).keep_mask = mask;
    }

    pub fn pass_to_output(&self, id: OutputId) -> Option<OutputIndex> {
        self.scheduled_output(id).pass_to_output
    }

    pub(crate) fn set_pass_to_output(&mut self, id: OutputId, output: Option<OutputIndex>) {
        self.scheduled_output_mut(id).pass_to_output = output;
    }

    pub fn from_buffer_output(&self, id: OutputId) -> Option<OutputIndex> {
        self.scheduled_output(id).from_buffer_output
    }

    pub(crate) fn set_from_buffer_output(
        &mut self,
        id: OutputId,
        output: Option<OutputIndex>,
    ) {
        self.scheduled_output_mut(id).from_buffer_output = output;
    }

    /// Whether the node owning this output is affective.
    pub fn is_affective(&self, id: OutputId) -> bool {
        self.nodes[id.node_index()].affective
    }

    /// Records a scheduled input for the connection's target node.
    ///
    /// Inputs are appended without duplicate checking; traversal calls
    /// [`Schedule::deduplicate_inputs`] once at the end, which is an
    /// overall gain for sharing-style nodes with thousands of inputs.
    pub(crate) fn add_input(
        &mut self,
        network: &Network,
        connection: crate::graph::ConnectionIndex,
        mask: Mask,
    ) {
        let connection = network.connection(connection);
        let target_node = network.input(connection.target_input).node;

        let node_pos = match self.schedule_node_index(target_node) {
            Some(pos) => pos,
            None => {
                let pos = self.nodes.len();
                self.nodes.push(ScheduleNode {
                    node: target_node,
                    output_to_clear: None,
                    affective: false,
                    outputs: Vec::new(),
                    inputs: Vec::new(),
                });
                self.node_map.insert(
                    target_node,
                    u32::try_from(pos).expect("node count exceeds u32"),
                );
                pos
            }
        };

        self.nodes[node_pos].inputs.push(ScheduleInput {
            source: connection.source_output,
            mask,
            input: connection.target_input,
        });
    }

    /// Merges duplicate scheduled inputs, OR-ing their masks.
    pub(crate) fn deduplicate_inputs(&mut self) {
        for node in &mut self.nodes {
            if node.inputs.len() < 2 {
                continue;
            }
            node.inputs
                .sort_by_key(|si| (si.input, si.source));
            let mut merged: Vec<ScheduleInput> = Vec::with_capacity(node.inputs.len());
            for si in node.inputs.drain(..) {
                match merged.last_mut() {
                    Some(last) if last.input == si.input && last.source == si.source => {
                        last.mask.set_or_append(&si.mask);
                    }
                    _ => merged.push(si),
                }
            }
            node.inputs = merged;
        }
    }

    /// The scheduled inputs of the node at schedule position
    /// `node_index`.
    pub fn inputs_of(&self, node_index: usize) -> &[ScheduleInput] {
        &self.nodes[node_index].inputs
    }

    /// The compute-task range of the node at schedule position
    /// `node_index`.
    pub fn compute_tasks_of(&self, node_index: usize) -> NodeTasks {
        self.nodes_to_compute_tasks
            .get(node_index)
            .copied()
            .unwrap_or_default()
    }

    /// The keep task of the node at schedule position `node_index`, or
    /// an invalid index.
    pub fn keep_task_of(&self, node_index: usize) -> TaskIndex {
        self.nodes_to_keep_tasks
            .get(node_index)
            .copied()
            .unwrap_or(INVALID_TASK)
    }

    pub fn compute_task(&self, task_id: TaskIndex) -> &ComputeTask {
        &self.compute_tasks[task_id as usize]
    }

    pub fn num_compute_tasks(&self) -> usize {
        self.compute_tasks.len()
    }

    pub fn inputs_task(&self, index: TaskIndex) -> &InputsTask {
        &self.inputs_tasks[index as usize]
    }

    pub fn num_inputs_tasks(&self) -> usize {
        self.inputs_tasks.len()
    }

    pub fn invocation(&self, index: TaskIndex) -> &NodeInvocation {
        &self.node_invocations[index as usize]
    }

    pub fn num_invocations(&self) -> usize {
        self.node_invocations.len()
    }

    pub fn input_dependencies(&self) -> &[InputDependency] {
        &self.input_deps
    }

    pub fn num_keep_tasks(&self) -> TaskNum {
        self.num_keep_tasks
    }

    pub fn num_prep_tasks(&self) -> TaskNum {
        self.num_prep_tasks
    }

    pub fn num_unique_input_deps(&self) -> usize {
        self.num_unique_input_deps
    }

    pub fn has_buffer_locks(&self) -> bool {
        self.has_buffer_locks
    }

    /// Switches a small schedule to map-less linear lookup.
    pub(crate) fn mark_small_schedule(&mut self) {
        if self.nodes.len() <= SMALL_SCHEDULE_SIZE {
            self.is_small = true;
            self.node_map = HashMap::new();
            self.output_map = HashMap::new();
        }
    }
}
