// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task-graph entries of a schedule.
//!
//! Tasks are addressed by dense indices into flat arrays; there is no
//! pointer graph. An executor drives compute tasks, synchronizing on
//! their input dependencies; inputs tasks fetch prerequisite and read
//! inputs concurrently; keep tasks retain data at outputs that donated
//! their buffers; prep tasks serialize the once-per-node setup shared by
//! all invocations of a strip-mined node.

use bitflags::bitflags;
use mask::Mask;

use crate::graph::{InputIndex, OutputIndex};

/// Identifies a task within one of the schedule's task arrays.
pub type TaskIndex = u32;

/// A count of tasks or dependencies.
pub type TaskNum = u32;

/// Sentinel for "no task".
pub const INVALID_TASK: TaskIndex = TaskIndex::MAX;

#[inline]
pub fn is_invalid_task(task: TaskIndex) -> bool {
    task == INVALID_TASK
}

/// A contiguous range of task ids, `task_id .. task_id + task_num`.
#[derive(Clone, Copy, Default, Debug)]
pub struct NodeTasks {
    pub task_id: TaskIndex,
    pub task_num: TaskNum,
}

impl NodeTasks {
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.task_id as usize;
        start..start + self.task_num as usize
    }

    pub fn is_empty(&self) -> bool {
        self.task_num == 0
    }
}

bitflags! {
    /// Additional facts about a compute task.
    #[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
    pub struct ComputeTaskFlags: u8 {
        /// The task's invocation affects at least one requested element.
        const AFFECTIVE = 1 << 0;
        /// The task keeps data at one of its outputs.
        const HAS_KEEP = 1 << 1;
    }
}

/// One unit of computation. Every scheduled node has at least one; nodes
/// strip-mined into invocations have one per occupied partition.
#[derive(Clone, Copy, Debug)]
pub struct ComputeTask {
    /// Index into the node-invocations array, or invalid for a node with
    /// a single compute task.
    pub invocation_index: TaskIndex,
    /// The corresponding inputs task. Invalid when prereqs and reads
    /// need not run concurrently with the read/writes.
    pub inputs_task_index: TaskIndex,
    /// The node-preparation task shared by all invocations of the node.
    /// Invalid when preparation needs no synchronization.
    pub prep_task_index: TaskIndex,
    /// First required input dependency (read/writes, plus folded-in
    /// prereqs and reads when no inputs task exists).
    pub requireds_index: TaskIndex,
    pub requireds_num: TaskNum,
    pub flags: ComputeTaskFlags,
}

impl Default for ComputeTask {
    fn default() -> Self {
        Self {
            invocation_index: INVALID_TASK,
            inputs_task_index: INVALID_TASK,
            prep_task_index: INVALID_TASK,
            requireds_index: 0,
            requireds_num: 0,
            flags: ComputeTaskFlags::empty(),
        }
    }
}

/// One strip-mined partition of a pool node's work. Nodes with
/// invocations always have exactly one output; the masks pertain to it.
#[derive(Clone, Default, Debug)]
pub struct NodeInvocation {
    pub request_mask: Mask,
    /// Empty when the invocation affects nothing.
    pub affects_mask: Mask,
    /// Empty when the invocation keeps nothing.
    pub keep_mask: Mask,
}

/// Coordinates fetching prerequisite and read inputs concurrently with a
/// compute task's required inputs.
#[derive(Clone, Copy, Default, Debug)]
pub struct InputsTask {
    /// First prereq dependency in the input-dependencies array; the
    /// optionals follow the prereqs.
    pub input_dep_index: TaskIndex,
    pub prereqs_num: TaskNum,
    /// Reads are optional at evaluation time: prereq outcomes decide
    /// whether they become required.
    pub optionals_num: TaskNum,
}

/// A dense id shared by all input dependencies referring to the same
/// (output, mask) pair, deduplicating runtime cache lookups.
pub type UniqueIndex = u32;

/// One edge of the task dependency graph: the output and mask to check
/// for a cache hit, and the task(s) to invoke on a miss.
#[derive(Clone, Debug)]
pub struct InputDependency {
    pub unique_index: UniqueIndex,
    /// The requested output at the source end.
    pub output: OutputIndex,
    /// The requested mask at the source end.
    pub mask: Mask,
    /// First compute task fulfilling this dependency, or a keep-task
    /// index when `compute_task_num` is zero.
    pub compute_or_keep_task_id: TaskIndex,
    pub compute_task_num: TaskNum,
}

/// A scheduled input: which elements of which upstream output the input
/// consumes.
#[derive(Clone, Debug)]
pub struct ScheduleInput {
    pub source: OutputIndex,
    pub mask: Mask,
    pub input: InputIndex,
}
