// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The evaluation context handed to node callbacks.
//!
//! A [`Context`] bundles the executor, the schedule, the network and the
//! node currently being run, so that the iterator suite can query task
//! metadata without a back channel. Node callbacks never see the
//! executor directly; all data access goes through iterators and
//! accessors bound to the context.

use core::ptr::NonNull;

use mask::Mask;
use vector::Vector;

use crate::graph::{ConnectionIndex, Network, NodeIndex, OutputIndex};
use crate::schedule::Schedule;

/// The evaluation-time data source driving node callbacks.
pub trait Executor {
    /// The value flowing across `connection`, or `None` if no value is
    /// available for the elements in `mask`.
    fn input_value(&self, connection: ConnectionIndex, mask: &Mask) -> Option<&Vector>;

    /// The write buffer of `output`, or `None` if no data entry was
    /// created for it (an unscheduled output, for example).
    ///
    /// Exclusivity contract: the executor must guarantee that only the
    /// task currently computing the owning node obtains the buffer, and
    /// only once per invocation; callers turn the pointer into a mutable
    /// borrow on that basis.
    fn output_value_for_writing(&self, output: OutputIndex) -> Option<NonNull<Vector>>;

    /// Whether the connection's value is scheduled and required; special
    /// iterators use this to skip outputs that are not necessary.
    fn is_required_input(&self, _connection: ConnectionIndex) -> bool {
        true
    }
}

/// Everything a node callback may consult while running.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    network: &'a Network,
    schedule: &'a Schedule,
    executor: &'a dyn Executor,
    node: NodeIndex,
}

// === impl Context ===

impl<'a> Context<'a> {
    pub fn new(
        network: &'a Network,
        schedule: &'a Schedule,
        executor: &'a dyn Executor,
        node: NodeIndex,
    ) -> Self {
        Self {
            network,
            schedule,
            executor,
            node,
        }
    }

    /// The node currently being run.
    pub fn node(&self) -> NodeIndex {
        self.node
    }

    pub fn network(&self) -> &'a Network {
        self.network
    }

    pub fn schedule(&self) -> &'a Schedule {
        self.schedule
    }

    pub(crate) fn executor(&self) -> &'a dyn Executor {
        self.executor
    }

    /// The request mask of `output`, if it is scheduled.
    pub fn request_mask(&self, output: OutputIndex) -> Option<&'a Mask> {
        let id = self.schedule.output_id(output);
        id.is_valid().then(|| self.schedule.request_mask(id))
    }

    /// The request and affects masks of `output`, which must be an
    /// output of the current node; `None` if unscheduled.
    pub(crate) fn output_masks(&self, output: OutputIndex) -> Option<(&'a Mask, &'a Mask)> {
        debug_assert_eq!(self.network.output(output).node, self.node);
        let id = self.schedule.output_id(output);
        id.is_valid()
            .then(|| (self.schedule.request_mask(id), self.schedule.affects_mask(id)))
    }

    /// The output to write to for `name`: the associated output of the
    /// input so named if it exists, otherwise the output so named, or
    /// the node's single output for an empty name. Missing outputs are
    /// reported.
    pub(crate) fn required_output_for_writing(&self, name: &str) -> Option<OutputIndex> {
        let node = self.network.node(self.node);

        if name.is_empty() {
            return match node.outputs.as_slice() {
                [single] => Some(*single),
                _ => {
                    tracing::error!(
                        "node '{}' needs an output name to disambiguate writing",
                        node.name
                    );
                    None
                }
            };
        }

        if let Some(input) = self.network.find_input(self.node, name) {
            if let Some(output) = self.network.input(input).associated_output {
                return Some(output);
            }
        }
        if let Some(output) = self.network.find_output(self.node, name) {
            return Some(output);
        }

        tracing::error!(
            "'{name}' names neither an input nor an output on node '{}'",
            node.name
        );
        None
    }

    pub(crate) fn input_value(
        &self,
        connection: ConnectionIndex,
        mask: &Mask,
    ) -> Option<&'a Vector> {
        self.executor.input_value(connection, mask)
    }

    /// An input value that must be available; its absence is reported.
    pub(crate) fn required_input_value(
        &self,
        connection: ConnectionIndex,
        mask: &Mask,
    ) -> Option<&'a Vector> {
        let value = self.executor.input_value(connection, mask);
        if value.is_none() {
            let c = self.network.connection(connection);
            tracing::error!(
                "no cached value for connection into '{}'",
                self.network.input(c.target_input).name
            );
        }
        value
    }
}
