// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The dataflow network the scheduler consumes.
//!
//! Nodes, inputs, outputs and connections live in flat arrays inside
//! [`Network`] and reference each other by dense `u32` indices; there is
//! no pointer graph. An output may carry an affects mask and an
//! associated input (the buffer-passing pairing); an input carries its
//! incoming connections, each with a mask over the source output's
//! elements.
//!
//! Pool outputs participate in the strip-mined pool chains. The builder
//! assigns every pool output its chain index: a total order in which
//! index 0 is the most downstream output, so ascending order walks the
//! pool bottom-up.

use std::sync::Arc;

use bits::Bits;
use mask::Mask;

use crate::context::Context;

macro_rules! entity_index {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        pub struct $name(u32);

        impl $name {
            pub fn new(index: usize) -> Self {
                Self(u32::try_from(index).expect("entity index exceeds u32"))
            }

            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

entity_index!(
    /// Identifies a node in a [`Network`].
    NodeIndex
);
entity_index!(
    /// Identifies an output in a [`Network`].
    OutputIndex
);
entity_index!(
    /// Identifies an input in a [`Network`].
    InputIndex
);
entity_index!(
    /// Identifies a connection in a [`Network`].
    ConnectionIndex
);
entity_index!(
    /// Position of a pool output in the downstream-first pool order:
    /// index 0 is the most downstream pool output.
    PoolChainIndex
);

/// An output paired with the mask of its requested elements.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MaskedOutput {
    pub output: OutputIndex,
    pub mask: Mask,
}

impl MaskedOutput {
    pub fn new(output: OutputIndex, mask: Mask) -> Self {
        Self { output, mask }
    }
}

/// An ordered list of masked outputs to evaluate; all outputs must
/// belong to the same network.
#[derive(Clone, Default, Debug)]
pub struct Request {
    outputs: Vec<MaskedOutput>,
}

// === impl Request ===

impl Request {
    pub fn new(outputs: Vec<MaskedOutput>) -> Self {
        Self { outputs }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MaskedOutput> {
        self.outputs.iter()
    }
}

/// The per-node behavior the scheduler and the evaluation iterators
/// consult.
pub trait NodeBehavior: Send + Sync {
    /// The node's callback, run by an executor during evaluation.
    fn compute(&self, _ctx: &Context<'_>) {}

    /// Which elements of the value flowing across `connection` the
    /// output depends on, given the elements requested of it.
    ///
    /// The default is total dependency: the whole connection mask.
    fn compute_input_dependency_mask(
        &self,
        network: &Network,
        _masked_output: &MaskedOutput,
        connection: ConnectionIndex,
    ) -> Bits {
        network.connection(connection).mask.bits().clone()
    }

    /// Vectorized form used for nodes with very many outputs; computes
    /// the dependencies of all `masked_outputs` (which belong to one
    /// node) in a single call.
    ///
    /// The default loops the scalar form over every read connection and
    /// unions per-connection masks.
    fn compute_input_dependency_request(
        &self,
        network: &Network,
        masked_outputs: &[MaskedOutput],
    ) -> Vec<(ConnectionIndex, Mask)> {
        let Some(first) = masked_outputs.first() else {
            return Vec::new();
        };
        let node = network.node(network.output(first.output).node);

        let mut dependencies: Vec<(ConnectionIndex, Mask)> = Vec::new();
        for masked in masked_outputs {
            for &input_index in &node.inputs {
                let input = network.input(input_index);
                if input.associated_output.is_some() {
                    continue;
                }
                for &connection in &input.connections {
                    let bits = self.compute_input_dependency_mask(
                        network, masked, connection,
                    );
                    if !bits.is_any_set() {
                        continue;
                    }
                    let mask = Mask::from_bits_owned(bits);
                    match dependencies.iter_mut().find(|(c, _)| *c == connection) {
                        Some((_, existing)) => existing.set_or_append(&mask),
                        None => dependencies.push((connection, mask)),
                    }
                }
            }
        }
        dependencies
    }
}

/// Total dependency on every input element; the behavior of ordinary
/// computation nodes.
#[derive(Default)]
pub struct AllDependencies;

impl NodeBehavior for AllDependencies {}

/// Elementwise dependency: an output element depends on the same element
/// of the input. The behavior of pool movers.
#[derive(Default)]
pub struct ElementwiseDependencies;

impl NodeBehavior for ElementwiseDependencies {
    fn compute_input_dependency_mask(
        &self,
        network: &Network,
        masked_output: &MaskedOutput,
        connection: ConnectionIndex,
    ) -> Bits {
        masked_output.mask.bits() & network.connection(connection).mask.bits()
    }
}

pub struct Node {
    pub name: String,
    pub inputs: Vec<InputIndex>,
    pub outputs: Vec<OutputIndex>,
    /// Speculation nodes induce self-cycles and schedule themselves; the
    /// scheduler never traverses through them.
    pub is_speculation: bool,
    /// Root-value nodes manage their own buffers; they are scheduled but
    /// never run and never pass buffers.
    pub owns_buffers: bool,
    pub behavior: Arc<dyn NodeBehavior>,
}

pub struct Output {
    pub node: NodeIndex,
    pub name: String,
    pub affects_mask: Option<Mask>,
    pub associated_input: Option<InputIndex>,
    /// Outgoing connections, in connection order.
    pub connections: Vec<ConnectionIndex>,
    pub is_pool: bool,
}

pub struct Input {
    pub node: NodeIndex,
    pub name: String,
    /// Incoming connections, in connection order.
    pub connections: Vec<ConnectionIndex>,
    pub associated_output: Option<OutputIndex>,
    pub is_prerequisite: bool,
}

pub struct Connection {
    pub source_output: OutputIndex,
    pub target_input: InputIndex,
    pub mask: Mask,
}

/// An immutable dataflow network.
pub struct Network {
    nodes: Vec<Node>,
    outputs: Vec<Output>,
    inputs: Vec<Input>,
    connections: Vec<Connection>,
    // Downstream-first order over the pool outputs, indexed by output.
    pool_chain_indices: Vec<Option<PoolChainIndex>>,
}

// === impl Network ===

impl Network {
    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index.index()]
    }

    pub fn output(&self, index: OutputIndex) -> &Output {
        &self.outputs[index.index()]
    }

    pub fn input(&self, index: InputIndex) -> &Input {
        &self.inputs[index.index()]
    }

    pub fn connection(&self, index: ConnectionIndex) -> &Connection {
        &self.connections[index.index()]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// The pool-chain index of `output`, if it is a pool output.
    pub fn pool_chain_index(&self, output: OutputIndex) -> Option<PoolChainIndex> {
        self.pool_chain_indices[output.index()]
    }

    pub fn is_pool_output(&self, output: OutputIndex) -> bool {
        self.output(output).is_pool
    }

    /// The source output feeding the associated input of `output`, if
    /// the output has an associated input with exactly one connection.
    pub fn associated_source_output(&self, output: OutputIndex) -> Option<OutputIndex> {
        let input = self.output(output).associated_input?;
        match self.input(input).connections.as_slice() {
            [connection] => Some(self.connection(*connection).source_output),
            _ => None,
        }
    }

    /// Finds the input named `name` on `node`.
    pub fn find_input(&self, node: NodeIndex, name: &str) -> Option<InputIndex> {
        self.node(node)
            .inputs
            .iter()
            .copied()
            .find(|&i| self.input(i).name == name)
    }

    /// Finds the output named `name` on `node`.
    pub fn find_output(&self, node: NodeIndex, name: &str) -> Option<OutputIndex> {
        self.node(node)
            .outputs
            .iter()
            .copied()
            .find(|&o| self.output(o).name == name)
    }

    /// A short rendering of a node and its connectivity for fatal
    /// scheduler diagnostics.
    pub fn describe_node(&self, index: NodeIndex) -> String {
        use std::fmt::Write;

        let node = self.node(index);
        let mut out = format!("node '{}'", node.name);
        for &input in &node.inputs {
            let i = self.input(input);
            let _ = write!(out, "\n  input '{}' <-", i.name);
            for &c in &i.connections {
                let source = self.connection(c).source_output;
                let _ = write!(
                    out,
                    " {}.{}",
                    self.node(self.output(source).node).name,
                    self.output(source).name
                );
            }
        }
        for &output in &node.outputs {
            let o = self.output(output);
            let _ = write!(out, "\n  output '{}' ->", o.name);
            for &c in &o.connections {
                let target = self.connection(c).target_input;
                let _ = write!(
                    out,
                    " {}.{}",
                    self.node(self.input(target).node).name,
                    self.input(target).name
                );
            }
        }
        out
    }
}

/// Assembles a [`Network`].
#[derive(Default)]
pub struct NetworkBuilder {
    nodes: Vec<Node>,
    outputs: Vec<Output>,
    inputs: Vec<Input>,
    connections: Vec<Connection>,
}

// === impl NetworkBuilder ===

impl NetworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>) -> NodeIndex {
        let index = NodeIndex::new(self.nodes.len());
        self.nodes.push(Node {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            is_speculation: false,
            owns_buffers: false,
            behavior: Arc::new(AllDependencies),
        });
        index
    }

    pub fn set_behavior(&mut self, node: NodeIndex, behavior: Arc<dyn NodeBehavior>) {
        self.nodes[node.index()].behavior = behavior;
    }

    pub fn mark_speculation(&mut self, node: NodeIndex) {
        self.nodes[node.index()].is_speculation = true;
    }

    pub fn mark_owns_buffers(&mut self, node: NodeIndex) {
        self.nodes[node.index()].owns_buffers = true;
    }

    pub fn add_output(&mut self, node: NodeIndex, name: impl Into<String>) -> OutputIndex {
        let index = OutputIndex::new(self.outputs.len());
        self.outputs.push(Output {
            node,
            name: name.into(),
            affects_mask: None,
            associated_input: None,
            connections: Vec::new(),
            is_pool: false,
        });
        self.nodes[node.index()].outputs.push(index);
        index
    }

    pub fn set_affects_mask(&mut self, output: OutputIndex, mask: Mask) {
        self.outputs[output.index()].affects_mask = Some(mask);
    }

    pub fn mark_pool(&mut self, output: OutputIndex) {
        self.outputs[output.index()].is_pool = true;
    }

    pub fn add_input(&mut self, node: NodeIndex, name: impl Into<String>) -> InputIndex {
        let index = InputIndex::new(self.inputs.len());
        self.inputs.push(Input {
            node,
            name: name.into(),
            connections: Vec::new(),
            associated_output: None,
            is_prerequisite: false,
        });
        self.nodes[node.index()].inputs.push(index);
        index
    }

    pub fn mark_prerequisite(&mut self, input: InputIndex) {
        self.inputs[input.index()].is_prerequisite = true;
    }

    /// Pairs a read/write input with the output its buffer passes to.
    pub fn associate(&mut self, input: InputIndex, output: OutputIndex) {
        assert_eq!(
            self.inputs[input.index()].node,
            self.outputs[output.index()].node,
            "associated input and output must live on the same node"
        );
        self.inputs[input.index()].associated_output = Some(output);
        self.outputs[output.index()].associated_input = Some(input);
    }

    pub fn connect(
        &mut self,
        source_output: OutputIndex,
        target_input: InputIndex,
        mask: Mask,
    ) -> ConnectionIndex {
        let index = ConnectionIndex::new(self.connections.len());
        self.connections.push(Connection {
            source_output,
            target_input,
            mask,
        });
        self.outputs[source_output.index()].connections.push(index);
        self.inputs[target_input.index()].connections.push(index);
        index
    }

    /// Finalizes the network, computing the pool-chain order.
    pub fn build(self) -> Network {
        let mut network = Network {
            nodes: self.nodes,
            outputs: self.outputs,
            inputs: self.inputs,
            connections: self.connections,
            pool_chain_indices: Vec::new(),
        };
        network.pool_chain_indices = compute_pool_chain_indices(&network);
        network
    }
}

/// Orders the pool outputs downstream-first.
///
/// The successor of a pool output is the pool output fed through one of
/// its outgoing connections' associated inputs. A reverse depth-first
/// walk from the chain terminals numbers every output after all outputs
/// downstream of it, so index 0 lands on the most downstream output.
fn compute_pool_chain_indices(network: &Network) -> Vec<Option<PoolChainIndex>> {
    let mut indices = vec![None; network.num_outputs()];
    let mut next = 0usize;

    // Downstream pool successors per pool output.
    let successor = |output: OutputIndex| -> Vec<OutputIndex> {
        network
            .output(output)
            .connections
            .iter()
            .filter_map(|&c| {
                let target = network.connection(c).target_input;
                let associated = network.input(target).associated_output?;
                network.is_pool_output(associated).then_some(associated)
            })
            .collect()
    };

    // Iterative post-order: successors (downstream) first.
    let mut stack: Vec<(OutputIndex, bool)> = (0..network.num_outputs())
        .map(OutputIndex::new)
        .filter(|&o| network.is_pool_output(o))
        .map(|o| (o, false))
        .collect();

    let mut visited = vec![false; network.num_outputs()];
    while let Some((output, expanded)) = stack.pop() {
        if expanded {
            if indices[output.index()].is_none() {
                indices[output.index()] = Some(PoolChainIndex::new(next));
                next += 1;
            }
            continue;
        }
        if visited[output.index()] {
            continue;
        }
        visited[output.index()] = true;

        stack.push((output, true));
        for succ in successor(output) {
            if !visited[succ.index()] {
                stack.push((succ, false));
            }
        }
    }

    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_chain_order_is_downstream_first() {
        // a -> b -> c, all pool outputs chained through associated
        // inputs.
        let mut b = NetworkBuilder::new();
        let mut prev: Option<OutputIndex> = None;
        let mut outs = Vec::new();
        for name in ["a", "b", "c"] {
            let n = b.add_node(name);
            let input = b.add_input(n, ".pool-in");
            let output = b.add_output(n, ".pool");
            b.mark_pool(output);
            b.associate(input, output);
            if let Some(p) = prev {
                b.connect(p, input, Mask::all_ones(10));
            }
            prev = Some(output);
            outs.push(output);
        }
        let net = b.build();

        let idx: Vec<_> = outs
            .iter()
            .map(|&o| net.pool_chain_index(o).unwrap().index())
            .collect();
        // c is the most downstream output.
        assert!(idx[2] < idx[1] && idx[1] < idx[0]);
        assert_eq!(idx[2], 0);
        assert_eq!(net.associated_source_output(outs[1]), Some(outs[0]));
    }
}
