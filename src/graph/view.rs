use crate::{
    dtype::DType,
    graph::{graph::Graph, node::NodeId, op::GraphOp},
    shape::Expr,
};

/// A lightweight handle to a node inside a `Graph`.
///
/// Views are cheap to copy and borrow the graph, so graph construction
/// reads like a chain of method calls on tensors.
#[derive(Clone, Copy)]
pub struct NodeView<'g> {
    pub id: NodeId,
    pub graph: &'g Graph,
}

impl<'g> NodeView<'g> {
    pub fn shape(&self) -> Vec<Expr> {
        self.graph.data(self.id).shape
    }

    pub fn dtype(&self) -> DType {
        self.graph.data(self.id).dtype
    }

    pub fn name(&self) -> String {
        self.graph.data(self.id).name
    }

    pub fn op(&self) -> GraphOp {
        self.graph.data(self.id).op
    }

    pub fn srcs(&self) -> Vec<NodeId> {
        self.graph.data(self.id).src
    }

    /// Rank of the tensor this view refers to.
    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    /// Wraps this tensor in an element-wise identity compute node.
    ///
    /// The result has the same shape and dtype; it exists so a downstream
    /// stage owns an iteration axis that a schedule can bind.
    pub fn copy(&self, name: impl Into<String>) -> NodeView<'g> {
        let data = self.graph.data(self.id);
        let id = self
            .graph
            .add_node(GraphOp::Copy, vec![self.id], data.dtype, data.shape, name);
        self.graph.view(id)
    }
}

impl std::fmt::Debug for NodeView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.graph.data(self.id);
        f.debug_struct("NodeView")
            .field("id", &self.id)
            .field("name", &data.name)
            .field("op", &data.op)
            .field("shape", &data.shape)
            .field("dtype", &data.dtype)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_preserves_shape_and_dtype() {
        let g = Graph::new();
        let a = g.placeholder("a", DType::F32, vec![Expr::var("n")]);
        let e = a.copy("e");
        assert_eq!(e.shape(), a.shape());
        assert_eq!(e.dtype(), DType::F32);
        assert_eq!(e.srcs(), vec![a.id]);
        assert!(matches!(e.op(), GraphOp::Copy));
    }
}
