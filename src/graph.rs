use crate::{
    config::Config,
    error::EngineError,
    op::Op,
    types::{DeviceId, NodeId},
};
use derive_more::Debug;
use parking_lot::Mutex;

/// Directed link from a node to a successor that consumes one of its outputs
/// at a given input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// The consuming node.
    pub target: NodeId,
    /// Input slot of `target` the output lands in.
    pub slot: usize,
}

#[derive(Debug)]
pub(crate) struct NodeSlot<C: Config> {
    /// The computation. Released (set to `None`) after its single use when
    /// the invocation runs with `keep_graph = false`.
    pub(crate) op: Mutex<Option<C::Op>>,
    pub(crate) device: DeviceId,
    /// Number of accumulator slots this node expects.
    pub(crate) num_inputs: usize,
    /// Cached from `Op::is_nondeterministic` at insertion; the op may be
    /// released before the flag is needed again.
    pub(crate) nondeterministic: bool,
    /// Ordered outgoing edges; `Op::apply` must return one output per edge.
    pub(crate) edges: Vec<Edge>,
}

/// Arena of computation nodes with explicit acyclic edge lists.
///
/// The graph is the reversed forward computation: an edge points from a node
/// to the node that consumes its output during the backward pass. Topology
/// is immutable during execution and safely shared across worker threads;
/// only the releasable op slot of each node is behind a lock, and that lock
/// is contended by at most the one task executing the node.
#[must_use]
#[derive(Debug)]
pub struct Graph<C: Config> {
    nodes: Vec<NodeSlot<C>>,
}

impl<C: Config> Default for Graph<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Config> Graph<C> {
    /// Empty graph.
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Insert a node with its computation, device affinity and declared
    /// input slot count, returning its identifier.
    pub fn add_node(&mut self, op: C::Op, device: DeviceId, num_inputs: usize) -> NodeId {
        let nondeterministic = op.is_nondeterministic();
        let id = NodeId(self.nodes.len().try_into().expect("Graph::add_node: [1]"));
        self.nodes.push(NodeSlot {
            op: Mutex::new(Some(op)),
            device,
            num_inputs,
            nondeterministic,
            edges: Vec::new(),
        });
        id
    }

    /// Wire the next output of `source` into input `slot` of `target`.
    ///
    /// Edge order on `source` is the order of `connect` calls and defines the
    /// output order its op must produce.
    ///
    /// # Errors
    /// [`EngineError::InvalidGraph`] if either node is unknown or `slot` is
    /// outside `target`'s declared inputs.
    pub fn connect(&mut self, source: NodeId, target: NodeId, slot: usize) -> Result<(), EngineError> {
        if target.index() >= self.nodes.len() {
            return Err(EngineError::InvalidGraph(format!(
                "edge target {target} does not exist"
            )));
        }
        if slot >= self.nodes[target.index()].num_inputs {
            return Err(EngineError::InvalidGraph(format!(
                "input slot {slot} out of range for {target} ({} inputs)",
                self.nodes[target.index()].num_inputs
            )));
        }
        let Some(source_slot) = self.nodes.get_mut(source.index()) else {
            return Err(EngineError::InvalidGraph(format!(
                "edge source {source} does not exist"
            )));
        };
        source_slot.edges.push(Edge { target, slot });
        Ok(())
    }

    /// Number of nodes in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `node` exists in this arena.
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.nodes.len()
    }

    /// Outgoing edges of `node`.
    ///
    /// # Panics
    /// If `node` was not issued by this graph.
    #[must_use]
    pub fn edges(&self, node: NodeId) -> &[Edge] {
        &self.slot(node).edges
    }

    /// Device affinity of `node`.
    ///
    /// # Panics
    /// If `node` was not issued by this graph.
    #[must_use]
    pub fn device(&self, node: NodeId) -> DeviceId {
        self.slot(node).device
    }

    /// Whether `node`'s op has been released by a `keep_graph = false`
    /// invocation.
    ///
    /// # Panics
    /// If `node` was not issued by this graph.
    #[must_use]
    pub fn is_released(&self, node: NodeId) -> bool {
        self.slot(node).op.lock().is_none()
    }

    pub(crate) fn slot(&self, node: NodeId) -> &NodeSlot<C> {
        self.nodes.get(node.index()).expect("Graph::slot: [1]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        op::{Gradient, OpApi, OpError},
        types::Value,
    };
    use std::fmt::Debug;

    #[derive(Debug, Clone, PartialEq)]
    struct Grad(f64);

    impl Gradient for Grad {
        fn accumulate(self, other: Self) -> Self {
            Grad(self.0 + other.0)
        }
    }

    #[derive(Debug)]
    struct Identity;

    struct Cfg;

    impl Config for Cfg {
        type Value = Grad;
        type Op = Identity;
    }

    impl Op<Cfg> for Identity {
        fn apply(
            &self,
            _api: &impl OpApi<Cfg>,
            inputs: &[Option<Value<Cfg>>],
        ) -> Result<Vec<Value<Cfg>>, OpError> {
            Ok(inputs.iter().flatten().cloned().collect())
        }
    }

    #[test]
    fn connect_rejects_unknown_target() {
        let mut graph = Graph::<Cfg>::new();
        let a = graph.add_node(Identity, 0, 1);
        let err = graph.connect(a, NodeId(7), 0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidGraph(_)));
    }

    #[test]
    fn connect_rejects_out_of_range_slot() {
        let mut graph = Graph::<Cfg>::new();
        let a = graph.add_node(Identity, 0, 1);
        let b = graph.add_node(Identity, 0, 2);
        assert!(graph.connect(a, b, 1).is_ok());
        let err = graph.connect(a, b, 2).unwrap_err();
        assert!(matches!(err, EngineError::InvalidGraph(_)));
    }

    #[test]
    fn edge_order_follows_connect_order() {
        let mut graph = Graph::<Cfg>::new();
        let a = graph.add_node(Identity, 0, 1);
        let b = graph.add_node(Identity, 1, 1);
        let c = graph.add_node(Identity, 0, 2);
        graph.connect(a, c, 1).unwrap();
        graph.connect(a, b, 0).unwrap();
        assert_eq!(
            graph.edges(a),
            [Edge { target: c, slot: 1 }, Edge { target: b, slot: 0 }]
        );
        assert_eq!(graph.device(b), 1);
        assert!(!graph.is_released(a));
    }
}
