//! Source renderers for the lowered program.
//!
//! The device side of a program is rendered to CUDA, the host side to C
//! calling a fixed packed-call ABI, so an exported library preserves the
//! symbol-string/arity contract of every extern node.

pub mod c;
pub mod cuda;

use crate::ir::{IrExpr, Program};
use crate::shape::Expr as ShapeExpr;

pub use c::CHostRenderer;
pub use cuda::CudaRenderer;

/// Renders a lowered program to source text for one target.
pub trait SourceRenderer {
    fn render(&mut self, program: &Program) -> String;
}

pub(crate) fn render_shape_expr(expr: &ShapeExpr) -> String {
    match expr {
        ShapeExpr::Const(c) => c.to_string(),
        ShapeExpr::Var(v) => v.clone(),
        ShapeExpr::Add(l, r) => format!("({} + {})", render_shape_expr(l), render_shape_expr(r)),
        ShapeExpr::Mul(l, r) => format!("({} * {})", render_shape_expr(l), render_shape_expr(r)),
    }
}

pub(crate) fn render_ir_expr(expr: &IrExpr) -> String {
    match expr {
        IrExpr::Const(c) => c.to_string(),
        IrExpr::Var(v) => v.clone(),
        IrExpr::Load { buffer, index } => format!("{buffer}[{}]", render_ir_expr(index)),
        IrExpr::Add(l, r) => format!("({} + {})", render_ir_expr(l), render_ir_expr(r)),
        IrExpr::Mul(l, r) => format!("({} * {})", render_ir_expr(l), render_ir_expr(r)),
    }
}
