//! Lowering: graph + schedule -> lowered program.
//!
//! Each scheduled node becomes either a host-side packed call (extern
//! nodes) or a device kernel plus a host-side launch (compute nodes).
//! Placeholders and scheduled outputs become parameters of the host entry.

use crate::graph::{GraphOp, NodeId, NodeView};
use crate::ir::{Function, FunctionKind, IrExpr, Param, ParamKind, Program, Stmt};
use crate::schedule::Schedule;
use crate::shape::Expr as ShapeExpr;
use log::{debug, trace};
use rustc_hash::FxHashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LowerError {
    #[error("'{name}' is used by the scheduled graph but missing from the argument list")]
    MissingArgument { name: String },

    #[error("argument '{name}' appears more than once")]
    DuplicateArgument { name: String },

    #[error("extern node '{symbol}' records {recorded} buffer args but has {actual} buffers")]
    ExternArityMismatch {
        symbol: String,
        recorded: usize,
        actual: usize,
    },
}

/// Lowers the scheduled graph to a `Program` named `name`.
///
/// `args` lists the caller-provided buffers in parameter order: every
/// reachable placeholder and every scheduled output must appear. Buffers
/// not in `args` become host-side allocations.
pub fn lower(
    schedule: &Schedule<'_>,
    args: &[NodeView<'_>],
    name: &str,
) -> Result<Program, LowerError> {
    let graph = schedule.graph();

    let mut arg_ids: FxHashSet<NodeId> = FxHashSet::default();
    let mut seen_names: FxHashSet<String> = FxHashSet::default();
    for arg in args {
        if !seen_names.insert(arg.name()) {
            return Err(LowerError::DuplicateArgument { name: arg.name() });
        }
        arg_ids.insert(arg.id);
    }

    // Every placeholder feeding a stage must be caller-provided.
    for stage in schedule.stages() {
        for src in graph.data(stage.node()).src {
            let src_data = graph.data(src);
            if src_data.op.is_placeholder() && !arg_ids.contains(&src) {
                return Err(LowerError::MissingArgument {
                    name: src_data.name,
                });
            }
        }
    }
    // So must the scheduled outputs.
    for &output in schedule.outputs() {
        if !arg_ids.contains(&output) {
            return Err(LowerError::MissingArgument {
                name: graph.data(output).name,
            });
        }
    }

    let mut host_params = Vec::new();
    let mut shape_vars = Vec::new();
    for arg in args {
        let data = graph.data(arg.id);
        let kind = if data.op.is_placeholder() {
            ParamKind::BufferIn
        } else {
            ParamKind::BufferOut
        };
        for dim in &data.shape {
            dim.collect_vars(&mut shape_vars);
        }
        host_params.push(Param {
            name: data.name,
            dtype: data.dtype,
            kind,
            shape: data.shape,
        });
    }
    shape_vars.sort();
    for var in &shape_vars {
        host_params.push(Param::shape_var(var.clone()));
    }

    let mut host_body = Vec::new();
    let mut kernels = Vec::new();

    for stage in schedule.stages() {
        let node = graph.data(stage.node());
        let is_param = arg_ids.contains(&stage.node());
        trace!("lowering stage '{}' ({:?})", node.name, node.op);

        if !is_param {
            host_body.push(Stmt::Alloc {
                buffer: node.name.clone(),
                dtype: node.dtype,
                extent: flat_extent(&node.shape),
                align: stage.max_align(),
            });
        } else if stage.max_align().is_some() {
            debug!(
                "storage alignment on '{}' is a hint only: the buffer is caller-provided",
                node.name
            );
        }

        match &node.op {
            GraphOp::Extern {
                symbol,
                num_buffer_args,
            } => {
                let actual = node.src.len() + 1;
                if *num_buffer_args != actual {
                    return Err(LowerError::ExternArityMismatch {
                        symbol: symbol.clone(),
                        recorded: *num_buffer_args,
                        actual,
                    });
                }
                let mut call_args: Vec<String> = node
                    .src
                    .iter()
                    .map(|&src| graph.data(src).name)
                    .collect();
                call_args.push(node.name.clone());
                debug!("extern stage '{}' dispatches to '{symbol}'", node.name);
                host_body.push(Stmt::CallPacked {
                    symbol: symbol.clone(),
                    args: call_args,
                });
            }
            GraphOp::Copy => {
                let src = graph.data(node.src[0]);
                let kernel_name = format!("{}_kernel", node.name);

                let mut kernel_shape_vars = Vec::new();
                for dim in node.shape.iter().chain(src.shape.iter()) {
                    dim.collect_vars(&mut kernel_shape_vars);
                }
                kernel_shape_vars.sort();

                let mut kernel_params = vec![
                    Param {
                        name: src.name.clone(),
                        dtype: src.dtype,
                        kind: ParamKind::BufferIn,
                        shape: src.shape.clone(),
                    },
                    Param {
                        name: node.name.clone(),
                        dtype: node.dtype,
                        kind: ParamKind::BufferOut,
                        shape: node.shape.clone(),
                    },
                ];
                for var in &kernel_shape_vars {
                    kernel_params.push(Param::shape_var(var.clone()));
                }

                let index = linear_index(&node.shape);
                let mut body = vec![Stmt::Store {
                    buffer: node.name.clone(),
                    index: index.clone(),
                    value: IrExpr::load(src.name.clone(), index),
                }];
                // Wrap axes innermost-first; bound axes become grid axes.
                for axis in (0..node.shape.len()).rev() {
                    let var = axis_var(axis);
                    let extent = node.shape[axis].clone();
                    body = vec![match stage.binding_for(axis) {
                        Some(thread) => Stmt::ThreadBind {
                            var,
                            axis: thread,
                            extent,
                            body,
                        },
                        None => Stmt::For { var, extent, body },
                    }];
                }

                kernels.push(Function {
                    name: kernel_name.clone(),
                    kind: FunctionKind::DeviceKernel,
                    params: kernel_params,
                    body,
                });

                let grid = stage
                    .bindings()
                    .iter()
                    .map(|b| (b.thread, node.shape[b.axis].clone()))
                    .collect();
                host_body.push(Stmt::LaunchKernel {
                    kernel: kernel_name,
                    grid,
                    args: vec![src.name, node.name.clone()],
                });
            }
            GraphOp::Placeholder => {
                // Placeholders are never staged.
            }
        }
    }

    let mut functions = vec![Function {
        name: name.to_string(),
        kind: FunctionKind::Host,
        params: host_params,
        body: host_body,
    }];
    functions.extend(kernels);

    let program = Program {
        entry: name.to_string(),
        functions,
    };
    debug!("lowered '{name}': {} function(s)", program.functions.len());
    Ok(program)
}

/// Loop variable name for an iteration axis.
fn axis_var(axis: usize) -> String {
    format!("ax{axis}")
}

/// Total element count of a shape as a simplified expression.
fn flat_extent(shape: &[ShapeExpr]) -> ShapeExpr {
    shape
        .iter()
        .cloned()
        .fold(ShapeExpr::Const(1), |acc, dim| acc * dim)
        .simplify()
}

fn shape_to_ir(expr: &ShapeExpr) -> IrExpr {
    match expr {
        ShapeExpr::Const(c) => IrExpr::Const(*c),
        ShapeExpr::Var(v) => IrExpr::Var(v.clone()),
        ShapeExpr::Add(l, r) => IrExpr::Add(Box::new(shape_to_ir(l)), Box::new(shape_to_ir(r))),
        ShapeExpr::Mul(l, r) => IrExpr::Mul(Box::new(shape_to_ir(l)), Box::new(shape_to_ir(r))),
    }
}

/// Row-major linear index over the iteration axes of `shape`.
fn linear_index(shape: &[ShapeExpr]) -> IrExpr {
    if shape.is_empty() {
        return IrExpr::Const(0);
    }
    let rank = shape.len();
    let mut index = IrExpr::var(axis_var(rank - 1));
    for axis in (0..rank - 1).rev() {
        let mut stride = shape[axis + 1].clone();
        for inner in shape.iter().skip(axis + 2) {
            stride = stride * inner.clone();
        }
        let term = IrExpr::Mul(
            Box::new(IrExpr::var(axis_var(axis))),
            Box::new(shape_to_ir(&stride.simplify())),
        );
        index = IrExpr::Add(Box::new(term), Box::new(index));
    }
    index
}
