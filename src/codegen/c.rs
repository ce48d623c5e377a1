//! Host-side C source generation.
//!
//! The host wrapper keeps the packed-call contract visible in the
//! generated code: every extern node becomes a call through
//! `lnsconv_call_packed` with the exact symbol string and buffer count,
//! and kernel launches go through `lnsconv_launch_kernel`. Both shims are
//! resolved when the exported library is loaded.

use crate::codegen::{render_shape_expr, SourceRenderer};
use crate::dtype::DType;
use crate::ir::{Function, Param, ParamKind, Program, Stmt};
use crate::schedule::ThreadAxis;
use crate::shape::Expr as ShapeExpr;
use log::debug;
use rustc_hash::FxHashMap;
use std::fmt::Write;

#[derive(Debug, Default)]
pub struct CHostRenderer {}

/// Shape and dtype of every buffer visible to the host function.
struct BufferInfo {
    dtype: DType,
    dims: Vec<ShapeExpr>,
}

impl CHostRenderer {
    pub fn new() -> Self {
        CHostRenderer::default()
    }

    fn render_includes(&self) -> String {
        let mut buffer = String::new();
        buffer.push_str("#include <stdint.h>\n");
        buffer.push_str("#include <stdlib.h>\n");
        buffer.push('\n');
        buffer
    }

    fn render_abi(&self) -> String {
        let mut buffer = String::new();
        buffer.push_str("typedef struct {\n");
        buffer.push_str("\tvoid* data;\n");
        buffer.push_str("\tconst int64_t* shape;\n");
        buffer.push_str("\tint32_t ndim;\n");
        buffer.push_str("\tint32_t dtype_code;\n");
        buffer.push_str("\tint32_t dtype_bits;\n");
        buffer.push_str("} lnsconv_tensor_t;\n\n");
        buffer.push_str(
            "int32_t lnsconv_call_packed(const char* symbol, lnsconv_tensor_t* args, int32_t num_args);\n",
        );
        buffer.push_str(
            "int32_t lnsconv_launch_kernel(const char* kernel, const int64_t* grid, lnsconv_tensor_t* args, int32_t num_args);\n",
        );
        buffer.push('\n');
        buffer
    }

    fn render_param(&self, param: &Param) -> String {
        match param.kind {
            ParamKind::ShapeVar => format!("int64_t {}", param.name),
            _ => format!("{}* {}", param.dtype, param.name),
        }
    }

    /// Emits one `lnsconv_tensor_t` argument pack and the shim call.
    fn render_dispatch(
        &self,
        buffer: &mut String,
        buffers: &FxHashMap<String, BufferInfo>,
        allocated: &[String],
        grid: Option<&[(ThreadAxis, ShapeExpr)]>,
        callee: &str,
        args: &[String],
    ) {
        buffer.push_str("\t{\n");
        if let Some(grid) = grid {
            let mut extents = vec!["1".to_string(); 6];
            for (axis, extent) in grid {
                extents[grid_slot(*axis)] = render_shape_expr(extent);
            }
            writeln!(buffer, "\t\tint64_t grid[6] = {{{}}};", extents.join(", ")).unwrap();
        }
        for (i, name) in args.iter().enumerate() {
            let info = &buffers[name];
            let dims = info
                .dims
                .iter()
                .map(render_shape_expr)
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                buffer,
                "\t\tint64_t shape_{i}[{}] = {{{dims}}};",
                info.dims.len()
            )
            .unwrap();
        }
        writeln!(buffer, "\t\tlnsconv_tensor_t args[{}] = {{", args.len()).unwrap();
        for (i, name) in args.iter().enumerate() {
            let info = &buffers[name];
            let (code, bits) = info.dtype.packed_type_codes();
            writeln!(
                buffer,
                "\t\t\t{{{name}, shape_{i}, {}, {code}, {bits}}},",
                info.dims.len()
            )
            .unwrap();
        }
        buffer.push_str("\t\t};\n");
        let call = match grid {
            Some(_) => format!(
                "lnsconv_launch_kernel(\"{callee}\", grid, args, {})",
                args.len()
            ),
            None => format!("lnsconv_call_packed(\"{callee}\", args, {})", args.len()),
        };
        writeln!(buffer, "\t\tint32_t status = {call};").unwrap();
        write!(buffer, "\t\tif (status != 0) {{ ").unwrap();
        for name in allocated {
            write!(buffer, "free({name}); ").unwrap();
        }
        buffer.push_str("return status; }\n");
        buffer.push_str("\t}\n");
    }

    fn render_host(&self, buffer: &mut String, function: &Function) {
        let params = function
            .params
            .iter()
            .map(|p| self.render_param(p))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(buffer, "int32_t {}({params})", function.name).unwrap();
        buffer.push_str("{\n");

        let mut buffers: FxHashMap<String, BufferInfo> = FxHashMap::default();
        for param in &function.params {
            if param.kind != ParamKind::ShapeVar {
                buffers.insert(
                    param.name.clone(),
                    BufferInfo {
                        dtype: param.dtype,
                        dims: param.shape.clone(),
                    },
                );
            }
        }

        let mut allocated: Vec<String> = Vec::new();
        for stmt in &function.body {
            match stmt {
                Stmt::Alloc {
                    buffer: name,
                    dtype,
                    extent,
                    align,
                } => {
                    let bytes = format!("sizeof({dtype}) * ({})", render_shape_expr(extent));
                    match align {
                        Some(align) => {
                            // aligned_alloc needs a size that is a
                            // multiple of the alignment.
                            writeln!(
                                buffer,
                                "\t{dtype}* {name} = ({dtype}*)aligned_alloc({align}, (({bytes}) + {align} - 1) / {align} * {align});",
                            )
                            .unwrap()
                        }
                        None => {
                            writeln!(buffer, "\t{dtype}* {name} = ({dtype}*)malloc({bytes});")
                                .unwrap()
                        }
                    }
                    write!(buffer, "\tif (!{name}) {{ ").unwrap();
                    for prior in &allocated {
                        write!(buffer, "free({prior}); ").unwrap();
                    }
                    buffer.push_str("return -1; }\n");
                    allocated.push(name.clone());
                    buffers.insert(
                        name.clone(),
                        BufferInfo {
                            dtype: *dtype,
                            dims: vec![extent.clone()],
                        },
                    );
                }
                Stmt::CallPacked { symbol, args } => {
                    self.render_dispatch(buffer, &buffers, &allocated, None, symbol, args);
                }
                Stmt::LaunchKernel { kernel, grid, args } => {
                    self.render_dispatch(buffer, &buffers, &allocated, Some(grid), kernel, args);
                }
                // Loops and stores live in device kernels, never in the
                // host entry produced by lowering.
                Stmt::For { .. } | Stmt::ThreadBind { .. } | Stmt::Store { .. } => {
                    unreachable!("device statement in host function: {stmt:?}")
                }
            }
        }

        for name in &allocated {
            writeln!(buffer, "\tfree({name});").unwrap();
        }
        buffer.push_str("\treturn 0;\n");
        buffer.push_str("}\n");
    }
}

fn grid_slot(axis: ThreadAxis) -> usize {
    match axis {
        ThreadAxis::BlockX => 0,
        ThreadAxis::BlockY => 1,
        ThreadAxis::BlockZ => 2,
        ThreadAxis::ThreadX => 3,
        ThreadAxis::ThreadY => 4,
        ThreadAxis::ThreadZ => 5,
    }
}

impl SourceRenderer for CHostRenderer {
    fn render(&mut self, program: &Program) -> String {
        let mut buffer = String::new();
        buffer.push_str(&self.render_includes());
        buffer.push_str(&self.render_abi());
        if let Some(host) = program.host() {
            self.render_host(&mut buffer, host);
        }
        debug!("\n--- Rendered host C code ---\n{buffer}\n----------------------------");
        buffer
    }
}
