// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scheduling and evaluation surface of the vectorized dataflow runtime.
//!
//! A client builds a [`Network`], submits a [`Request`] (masked outputs)
//! to [`schedule`], and receives a sealed [`Schedule`]: per-output
//! request, affects and keep masks, buffer-passing links, and a dense
//! task graph of compute, inputs, keep and prep tasks with deduplicated
//! input-dependency edges. An executor consumes the schedule and drives
//! the node callbacks, which read and write values through the iterator
//! suite bound to a [`Context`].

mod context;
mod dispatch;
mod graph;
mod iterator;
mod schedule;
mod scheduler;
mod tasks;
mod weights;

pub use context::{Context, Executor};
pub use graph::{
    AllDependencies, Connection, ConnectionIndex, ElementwiseDependencies,
    Input, InputIndex, MaskedOutput, Network, NetworkBuilder, Node,
    NodeBehavior, NodeIndex, Output, OutputIndex, PoolChainIndex, Request,
};
pub use iterator::{
    ElementIterator, ReadIterator, ReadWriteIterator, ReadWriteView,
    WeightedIterator,
};
pub use schedule::{OutputId, Schedule, ScheduleNode, ScheduleOutput};
pub use scheduler::{schedule, update_affects_mask_for_output};
pub use tasks::{
    ComputeTask, ComputeTaskFlags, INVALID_TASK, InputDependency, InputsTask,
    NodeInvocation, NodeTasks, ScheduleInput, TaskIndex, TaskNum, UniqueIndex,
    is_invalid_task,
};
pub use weights::{
    IndexedData, IndexedWeights, IndexedWeightsOperand, SetOperation,
};

/// Registers the value types this crate contributes with the process-wide
/// type registry. Idempotent; evaluation setups call this once.
pub fn register_execution_types() {
    typereg::TypeRegistry::define(IndexedWeights::new());
}
