//! CUDA source generation for device kernels.

use crate::codegen::{render_ir_expr, render_shape_expr, SourceRenderer};
use crate::ir::{Function, Param, ParamKind, Program, Stmt};
use log::debug;
use std::fmt::Write;

#[derive(Debug, Default)]
pub struct CudaRenderer {
    indent_level: usize,
}

impl CudaRenderer {
    pub fn new() -> Self {
        CudaRenderer::default()
    }

    fn pad(&self) -> String {
        "\t".repeat(self.indent_level)
    }

    fn render_param(&self, param: &Param) -> String {
        match param.kind {
            ParamKind::BufferIn => format!("const {}* __restrict__ {}", param.dtype, param.name),
            ParamKind::BufferOut => format!("{}* __restrict__ {}", param.dtype, param.name),
            ParamKind::ShapeVar => format!("long long {}", param.name),
        }
    }

    fn render_stmt(&mut self, buffer: &mut String, stmt: &Stmt) {
        match stmt {
            Stmt::ThreadBind {
                var,
                axis,
                extent,
                body,
            } => {
                // The grid may overshoot the extent, so every bound axis
                // gets a bounds guard.
                let pad = self.pad();
                writeln!(buffer, "{pad}long long {var} = (long long){axis};").unwrap();
                writeln!(buffer, "{pad}if ({var} < {}) {{", render_shape_expr(extent)).unwrap();
                self.indent_level += 1;
                for stmt in body {
                    self.render_stmt(buffer, stmt);
                }
                self.indent_level -= 1;
                writeln!(buffer, "{pad}}}").unwrap();
            }
            Stmt::For { var, extent, body } => {
                let pad = self.pad();
                writeln!(
                    buffer,
                    "{pad}for (long long {var} = 0; {var} < {}; ++{var}) {{",
                    render_shape_expr(extent)
                )
                .unwrap();
                self.indent_level += 1;
                for stmt in body {
                    self.render_stmt(buffer, stmt);
                }
                self.indent_level -= 1;
                writeln!(buffer, "{pad}}}").unwrap();
            }
            Stmt::Store {
                buffer: target,
                index,
                value,
            } => {
                writeln!(
                    buffer,
                    "{}{target}[{}] = {};",
                    self.pad(),
                    render_ir_expr(index),
                    render_ir_expr(value)
                )
                .unwrap();
            }
            // Host-only statements never reach a device kernel body.
            Stmt::Alloc { .. } | Stmt::CallPacked { .. } | Stmt::LaunchKernel { .. } => {
                unreachable!("host statement in device kernel: {stmt:?}")
            }
        }
    }

    fn render_kernel(&mut self, buffer: &mut String, function: &Function) {
        let params = function
            .params
            .iter()
            .map(|p| self.render_param(p))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            buffer,
            "extern \"C\" __global__ void {}({params})",
            function.name
        )
        .unwrap();
        buffer.push_str("{\n");
        self.indent_level = 1;
        for stmt in &function.body {
            self.render_stmt(buffer, stmt);
        }
        self.indent_level = 0;
        buffer.push_str("}\n");
    }
}

impl SourceRenderer for CudaRenderer {
    fn render(&mut self, program: &Program) -> String {
        let mut buffer = String::new();
        for (i, kernel) in program.device_kernels().enumerate() {
            if i > 0 {
                buffer.push('\n');
            }
            self.render_kernel(&mut buffer, kernel);
        }
        debug!("\n--- Rendered CUDA code ---\n{buffer}\n--------------------------");
        buffer
    }
}
