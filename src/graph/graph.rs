use std::cell::RefCell;

use crate::{
    dtype::DType,
    graph::{
        node::{NodeData, NodeId},
        op::GraphOp,
        view::NodeView,
    },
    shape::Expr,
};

/// Owns all the nodes of a computation graph.
///
/// The `Graph` uses interior mutability (`RefCell`) so nodes can be added
/// through shared references while `NodeView` handles stay alive.
/// Nodes are immutable once constructed; a graph is built once per
/// compilation and never mutated afterwards.
#[derive(Default, Debug)]
pub struct Graph {
    /// A vector holding the data for all nodes in the graph.
    nodes: RefCell<Vec<NodeData>>,
    /// Node IDs that are placeholders (graph inputs).
    inputs: RefCell<Vec<NodeId>>,
}

impl Graph {
    /// Creates a new, empty computation graph.
    pub fn new() -> Self {
        Graph::default()
    }

    /// Adds a new node to the graph. This is an internal method.
    pub(crate) fn add_node(
        &self,
        op: GraphOp,
        src: Vec<NodeId>,
        dtype: DType,
        shape: Vec<Expr>,
        name: impl Into<String>,
    ) -> NodeId {
        let mut nodes = self.nodes.borrow_mut();
        let id = nodes.len();
        nodes.push(NodeData {
            op,
            src,
            dtype,
            shape: shape.into_iter().map(Expr::simplify).collect(),
            name: name.into(),
        });
        NodeId(id)
    }

    /// Adds a named symbolic input tensor.
    ///
    /// Placeholders carry only a shape and a dtype; they have no storage
    /// and no defining computation.
    pub fn placeholder(
        &self,
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<Expr>,
    ) -> NodeView<'_> {
        let id = self.add_node(GraphOp::Placeholder, vec![], dtype, shape, name);
        self.inputs.borrow_mut().push(id);
        self.view(id)
    }

    /// Adds a node whose values are produced by a named packed routine.
    ///
    /// The call receives the `inputs` buffers followed by the output buffer,
    /// so `num_buffer_args` is always `inputs.len() + 1`.
    pub(crate) fn call_extern(
        &self,
        symbol: impl Into<String>,
        inputs: &[NodeId],
        dtype: DType,
        shape: Vec<Expr>,
        name: impl Into<String>,
    ) -> NodeView<'_> {
        let op = GraphOp::Extern {
            symbol: symbol.into(),
            num_buffer_args: inputs.len() + 1,
        };
        let id = self.add_node(op, inputs.to_vec(), dtype, shape, name);
        self.view(id)
    }

    /// Gets a `NodeView` for a given `NodeId`.
    pub fn view(&self, id: NodeId) -> NodeView<'_> {
        NodeView { id, graph: self }
    }

    /// Returns a clone of the data stored for `id`.
    pub fn data(&self, id: NodeId) -> NodeData {
        self.nodes.borrow()[id.0].clone()
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    /// The placeholder nodes, in creation order.
    pub fn inputs(&self) -> Vec<NodeId> {
        self.inputs.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_roundtrip() {
        let g = Graph::new();
        let a = g.placeholder("data", DType::F32, vec![Expr::var("n"), 3.into(), 3.into()]);
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(a.shape().len(), 3);
        assert_eq!(a.name(), "data");
        assert_eq!(g.inputs(), vec![a.id]);
    }

    #[test]
    fn test_extern_node_records_arity() {
        let g = Graph::new();
        let a = g.placeholder("a", DType::F32, vec![3.into(), 3.into()]);
        let b = g.placeholder("b", DType::F32, vec![3.into(), 3.into()]);
        let out = g.call_extern("some.symbol", &[a.id, b.id], DType::F32, vec![3.into()], "out");
        match out.op() {
            GraphOp::Extern {
                symbol,
                num_buffer_args,
            } => {
                assert_eq!(symbol, "some.symbol");
                assert_eq!(num_buffer_args, 3);
            }
            other => panic!("expected extern op, got {other:?}"),
        }
        assert_eq!(out.srcs(), vec![a.id, b.id]);
    }
}
