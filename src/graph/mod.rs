//! The computation graph.
//!
//! A `Graph` is an arena of immutable nodes: placeholders (symbolic
//! inputs), extern nodes (realized by a named packed routine), and the
//! trivial compute nodes a schedule can bind to execution resources.

mod graph;
mod node;
mod op;
mod view;

pub use graph::Graph;
pub use node::{NodeData, NodeId};
pub use op::GraphOp;
pub use view::NodeView;
