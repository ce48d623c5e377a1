//! Execution schedules.
//!
//! A `Schedule` describes how the compute nodes of a graph map onto
//! execution resources: which iteration axes are bound to GPU grid axes
//! and how output storage is aligned. It is built once, mutated in place
//! by the caller, and then consumed exactly once by the build step.

use crate::graph::{Graph, NodeId};
use rustc_hash::FxHashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A GPU grid axis an iteration axis can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadAxis {
    BlockX,
    BlockY,
    BlockZ,
    ThreadX,
    ThreadY,
    ThreadZ,
}

impl ThreadAxis {
    /// `true` for the block-level (grid) axes.
    pub fn is_block(&self) -> bool {
        matches!(
            self,
            ThreadAxis::BlockX | ThreadAxis::BlockY | ThreadAxis::BlockZ
        )
    }
}

impl fmt::Display for ThreadAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadAxis::BlockX => "blockIdx.x",
            ThreadAxis::BlockY => "blockIdx.y",
            ThreadAxis::BlockZ => "blockIdx.z",
            ThreadAxis::ThreadX => "threadIdx.x",
            ThreadAxis::ThreadY => "threadIdx.y",
            ThreadAxis::ThreadZ => "threadIdx.z",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ThreadAxis {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blockIdx.x" => Ok(ThreadAxis::BlockX),
            "blockIdx.y" => Ok(ThreadAxis::BlockY),
            "blockIdx.z" => Ok(ThreadAxis::BlockZ),
            "threadIdx.x" => Ok(ThreadAxis::ThreadX),
            "threadIdx.y" => Ok(ThreadAxis::ThreadY),
            "threadIdx.z" => Ok(ThreadAxis::ThreadZ),
            _ => Err(ScheduleError::UnknownThreadAxis {
                name: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("unknown thread axis '{name}'")]
    UnknownThreadAxis { name: String },

    #[error("axis {axis} is out of range for '{stage}' (rank {rank})")]
    AxisOutOfRange {
        stage: String,
        axis: usize,
        rank: usize,
    },

    #[error("axis {axis} of '{stage}' is already bound to {bound}")]
    AxisAlreadyBound {
        stage: String,
        axis: usize,
        bound: ThreadAxis,
    },

    #[error("storage alignment factor {factor} is not a nonzero power of two")]
    BadAlignFactor { factor: usize },
}

/// Binding of one iteration axis to a GPU grid axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisBinding {
    pub axis: usize,
    pub thread: ThreadAxis,
}

/// Storage layout hint for a stage's output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageAlign {
    pub axis: usize,
    pub factor_bytes: usize,
    pub offset: usize,
}

/// Per-node scheduling state.
#[derive(Debug)]
pub struct Stage {
    node: NodeId,
    name: String,
    rank: usize,
    bindings: Vec<AxisBinding>,
    aligns: Vec<StorageAlign>,
}

impl Stage {
    /// Binds iteration axis `axis` to a GPU grid axis.
    pub fn bind(&mut self, axis: usize, thread: ThreadAxis) -> Result<&mut Self, ScheduleError> {
        if axis >= self.rank {
            return Err(ScheduleError::AxisOutOfRange {
                stage: self.name.clone(),
                axis,
                rank: self.rank,
            });
        }
        if let Some(existing) = self.bindings.iter().find(|b| b.axis == axis) {
            return Err(ScheduleError::AxisAlreadyBound {
                stage: self.name.clone(),
                axis,
                bound: existing.thread,
            });
        }
        self.bindings.push(AxisBinding { axis, thread });
        Ok(self)
    }

    /// Requests that the stage's output storage start at a
    /// `factor_bytes`-aligned boundary (plus `offset` bytes).
    pub fn storage_align(
        &mut self,
        axis: usize,
        factor_bytes: usize,
        offset: usize,
    ) -> Result<&mut Self, ScheduleError> {
        if factor_bytes == 0 || !factor_bytes.is_power_of_two() {
            return Err(ScheduleError::BadAlignFactor {
                factor: factor_bytes,
            });
        }
        if axis >= self.rank {
            return Err(ScheduleError::AxisOutOfRange {
                stage: self.name.clone(),
                axis,
                rank: self.rank,
            });
        }
        self.aligns.push(StorageAlign {
            axis,
            factor_bytes,
            offset,
        });
        Ok(self)
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bindings(&self) -> &[AxisBinding] {
        &self.bindings
    }

    /// The binding for `axis`, if any.
    pub fn binding_for(&self, axis: usize) -> Option<ThreadAxis> {
        self.bindings
            .iter()
            .find(|b| b.axis == axis)
            .map(|b| b.thread)
    }

    pub fn aligns(&self) -> &[StorageAlign] {
        &self.aligns
    }

    /// The strongest alignment requested for the stage's storage.
    pub fn max_align(&self) -> Option<usize> {
        self.aligns.iter().map(|a| a.factor_bytes).max()
    }
}

/// The schedule for one computation graph.
pub struct Schedule<'g> {
    graph: &'g Graph,
    outputs: Vec<NodeId>,
    stages: Vec<Stage>,
    by_node: FxHashMap<NodeId, usize>,
}

impl<'g> Schedule<'g> {
    /// Creates a schedule covering every non-placeholder node reachable
    /// from `outputs`, one stage per node.
    pub fn create(graph: &'g Graph, outputs: &[NodeId]) -> Self {
        let mut order = Vec::new();
        let mut seen = FxHashMap::default();
        for &output in outputs {
            visit(graph, output, &mut seen, &mut order);
        }

        let mut stages = Vec::new();
        let mut by_node = FxHashMap::default();
        for id in order {
            let data = graph.data(id);
            if data.op.is_placeholder() {
                continue;
            }
            by_node.insert(id, stages.len());
            stages.push(Stage {
                node: id,
                name: data.name,
                rank: data.shape.len(),
                bindings: Vec::new(),
                aligns: Vec::new(),
            });
        }
        Schedule {
            graph,
            outputs: outputs.to_vec(),
            stages,
            by_node,
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// The scheduled output nodes, in the order given to `create`.
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Stages in topological order (every stage after its producers).
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Mutable access to the stage computing `node`.
    pub fn stage_mut(&mut self, node: NodeId) -> Option<&mut Stage> {
        self.by_node.get(&node).copied().map(|i| &mut self.stages[i])
    }

    pub fn stage(&self, node: NodeId) -> Option<&Stage> {
        self.by_node.get(&node).copied().map(|i| &self.stages[i])
    }
}

fn visit(
    graph: &Graph,
    id: NodeId,
    seen: &mut FxHashMap<NodeId, bool>,
    order: &mut Vec<NodeId>,
) {
    if seen.contains_key(&id) {
        return;
    }
    seen.insert(id, true);
    for src in graph.data(id).src {
        visit(graph, src, seen, order);
    }
    order.push(id);
}

impl fmt::Debug for Schedule<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("outputs", &self.outputs)
            .field("stages", &self.stages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contrib::lnsconv::conv3x3;
    use crate::dtype::DType;
    use crate::shape::Expr;

    fn demo_graph(graph: &Graph) -> (NodeId, NodeId) {
        let n = Expr::var("n");
        let a = graph.placeholder("data", DType::F32, vec![n.clone(), 3.into(), 3.into()]);
        let b = graph.placeholder("weights", DType::F32, vec![n, 3.into(), 3.into()]);
        let d = conv3x3(a, b).unwrap();
        let e = d.copy("e");
        (d.id, e.id)
    }

    #[test]
    fn test_create_orders_stages_topologically() {
        let graph = Graph::new();
        let (d, e) = demo_graph(&graph);
        let schedule = Schedule::create(&graph, &[e]);
        let order: Vec<NodeId> = schedule.stages().iter().map(|s| s.node()).collect();
        assert_eq!(order, vec![d, e]);
    }

    #[test]
    fn test_bind_and_align() {
        let graph = Graph::new();
        let (d, e) = demo_graph(&graph);
        let mut schedule = Schedule::create(&graph, &[e]);
        let stage = schedule.stage_mut(e).unwrap();
        stage.bind(0, ThreadAxis::BlockY).unwrap();
        stage.storage_align(0, 64, 0).unwrap();
        assert_eq!(stage.binding_for(0), Some(ThreadAxis::BlockY));
        assert_eq!(stage.max_align(), Some(64));
        assert!(schedule.stage(d).unwrap().bindings().is_empty());
    }

    #[test]
    fn test_bind_out_of_range_axis() {
        let graph = Graph::new();
        let (_, e) = demo_graph(&graph);
        let mut schedule = Schedule::create(&graph, &[e]);
        let stage = schedule.stage_mut(e).unwrap();
        assert!(matches!(
            stage.bind(4, ThreadAxis::BlockX),
            Err(ScheduleError::AxisOutOfRange { axis: 4, rank: 1, .. })
        ));
    }

    #[test]
    fn test_double_bind_is_rejected() {
        let graph = Graph::new();
        let (_, e) = demo_graph(&graph);
        let mut schedule = Schedule::create(&graph, &[e]);
        let stage = schedule.stage_mut(e).unwrap();
        stage.bind(0, ThreadAxis::BlockY).unwrap();
        assert!(matches!(
            stage.bind(0, ThreadAxis::ThreadX),
            Err(ScheduleError::AxisAlreadyBound { .. })
        ));
    }

    #[test]
    fn test_bad_align_factor() {
        let graph = Graph::new();
        let (_, e) = demo_graph(&graph);
        let mut schedule = Schedule::create(&graph, &[e]);
        let stage = schedule.stage_mut(e).unwrap();
        assert!(matches!(
            stage.storage_align(0, 48, 0),
            Err(ScheduleError::BadAlignFactor { factor: 48 })
        ));
    }

    #[test]
    fn test_thread_axis_parse_and_display() {
        let axis: ThreadAxis = "blockIdx.y".parse().unwrap();
        assert_eq!(axis, ThreadAxis::BlockY);
        assert_eq!(axis.to_string(), "blockIdx.y");
        assert!("warpIdx.q".parse::<ThreadAxis>().is_err());
    }
}
