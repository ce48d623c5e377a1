//! Extern interface to the lnsconv convolution library.
//!
//! `conv3x3` declares a graph node whose values are produced by the packed
//! routine registered under [`CONV3X3_SYMBOL`]. The routine receives three
//! buffers, in order: input data, input weights, output. Both the symbol
//! string and that argument order are a binary-compatibility contract with
//! existing callers and must not change.

use crate::dtype::DType;
use crate::graph::NodeView;
use crate::shape::Expr;
use thiserror::Error;

/// Registry symbol of the external 3x3 convolution routine.
pub const CONV3X3_SYMBOL: &str = "tvm.contrib.lnsconv.conv3x3";

/// Buffer argument count of the packed call: data, weights, output.
pub const CONV3X3_NUM_ARGS: usize = 3;

/// Errors raised while declaring the extern convolution node.
#[derive(Debug, Error)]
pub enum ExternError {
    #[error("operand '{name}' has rank 0; the convolution needs a channel dimension")]
    ZeroRank { name: String },

    #[error("rank mismatch: data has rank {data_rank}, weights has rank {weights_rank}")]
    RankMismatch {
        data_rank: usize,
        weights_rank: usize,
    },

    #[error("leading dimension mismatch: data is {data_dim}, weights is {weights_dim}")]
    LeadingDimMismatch { data_dim: Expr, weights_dim: Expr },

    #[error("operand '{name}' has dtype {dtype}, the convolution routine only accepts float")]
    UnsupportedDType { name: String, dtype: DType },

    #[error("data and weights belong to different graphs")]
    GraphMismatch,
}

/// Declares a 3x3 convolution computed by the external lnsconv library.
///
/// Returns a new tensor of shape `[data.shape[0]]` (one value per channel)
/// and dtype `F32`. The node has no body; lowering emits a single packed
/// call to [`CONV3X3_SYMBOL`] with the `(data, weights, output)` buffers.
///
/// Shapes and dtypes are checked here, at declaration time, so a malformed
/// operand pair fails with a shape error at the call site instead of
/// surfacing later inside lowering.
pub fn conv3x3<'g>(
    data: NodeView<'g>,
    weights: NodeView<'g>,
) -> Result<NodeView<'g>, ExternError> {
    if !std::ptr::eq(data.graph, weights.graph) {
        return Err(ExternError::GraphMismatch);
    }
    for operand in [&data, &weights] {
        if operand.dtype() != DType::F32 {
            return Err(ExternError::UnsupportedDType {
                name: operand.name(),
                dtype: operand.dtype(),
            });
        }
        if operand.rank() == 0 {
            return Err(ExternError::ZeroRank {
                name: operand.name(),
            });
        }
    }
    if data.rank() != weights.rank() {
        return Err(ExternError::RankMismatch {
            data_rank: data.rank(),
            weights_rank: weights.rank(),
        });
    }

    let data_dim = data.shape()[0].clone().simplify();
    let weights_dim = weights.shape()[0].clone().simplify();
    if data_dim != weights_dim {
        return Err(ExternError::LeadingDimMismatch {
            data_dim,
            weights_dim,
        });
    }

    let out_name = format!("{}_conv3x3", data.name());
    Ok(data.graph.call_extern(
        CONV3X3_SYMBOL,
        &[data.id, weights.id],
        DType::F32,
        vec![data_dim],
        out_name,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, GraphOp};

    fn f32_placeholder<'g>(g: &'g Graph, name: &str, dims: &[i64]) -> NodeView<'g> {
        g.placeholder(name, DType::F32, dims.iter().map(|&d| Expr::from(d)).collect())
    }

    #[test]
    fn test_output_shape_is_leading_dim() {
        let g = Graph::new();
        let a = f32_placeholder(&g, "data", &[3, 3]);
        let b = f32_placeholder(&g, "weights", &[3, 3]);
        let d = conv3x3(a, b).unwrap();
        assert_eq!(d.shape(), vec![Expr::Const(3)]);
        assert_eq!(d.dtype(), DType::F32);
    }

    #[test]
    fn test_symbolic_channel_count() {
        let g = Graph::new();
        let n = Expr::var("n");
        let a = g.placeholder("data", DType::F32, vec![n.clone(), 3.into(), 3.into()]);
        let b = g.placeholder("weights", DType::F32, vec![n.clone(), 3.into(), 3.into()]);
        let d = conv3x3(a, b).unwrap();
        assert_eq!(d.shape(), vec![n]);
    }

    #[test]
    fn test_records_symbol_and_arity() {
        let g = Graph::new();
        let a = f32_placeholder(&g, "data", &[3, 3]);
        let b = f32_placeholder(&g, "weights", &[3, 3]);
        let d = conv3x3(a, b).unwrap();
        match d.op() {
            GraphOp::Extern {
                symbol,
                num_buffer_args,
            } => {
                assert_eq!(symbol, CONV3X3_SYMBOL);
                assert_eq!(num_buffer_args, CONV3X3_NUM_ARGS);
            }
            other => panic!("expected extern node, got {other:?}"),
        }
    }

    #[test]
    fn test_idempotent_declaration() {
        let g = Graph::new();
        let a = f32_placeholder(&g, "data", &[3, 3]);
        let b = f32_placeholder(&g, "weights", &[3, 3]);
        let d0 = conv3x3(a, b).unwrap();
        let d1 = conv3x3(a, b).unwrap();
        assert_ne!(d0.id, d1.id);
        assert_eq!(d0.shape(), d1.shape());
        assert_eq!(d0.dtype(), d1.dtype());
    }

    #[test]
    fn test_rank_mismatch_is_rejected() {
        let g = Graph::new();
        let a = f32_placeholder(&g, "data", &[3, 3]);
        let b = f32_placeholder(&g, "weights", &[4, 4, 4]);
        match conv3x3(a, b) {
            Err(ExternError::RankMismatch {
                data_rank: 2,
                weights_rank: 3,
            }) => {}
            other => panic!("expected rank mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_leading_dim_mismatch_is_rejected() {
        let g = Graph::new();
        let a = f32_placeholder(&g, "data", &[3, 3]);
        let b = f32_placeholder(&g, "weights", &[4, 3]);
        assert!(matches!(
            conv3x3(a, b),
            Err(ExternError::LeadingDimMismatch { .. })
        ));
    }

    #[test]
    fn test_non_float_operand_is_rejected() {
        let g = Graph::new();
        let a = g.placeholder("data", DType::I32, vec![3.into(), 3.into()]);
        let b = f32_placeholder(&g, "weights", &[3, 3]);
        assert!(matches!(
            conv3x3(a, b),
            Err(ExternError::UnsupportedDType { .. })
        ));
    }

    #[test]
    fn test_cross_graph_operands_are_rejected() {
        let g0 = Graph::new();
        let g1 = Graph::new();
        let a = f32_placeholder(&g0, "data", &[3, 3]);
        let b = f32_placeholder(&g1, "weights", &[3, 3]);
        assert!(matches!(conv3x3(a, b), Err(ExternError::GraphMismatch)));
    }
}
