//! The lowered intermediate representation.
//!
//! Lowering turns a graph plus its schedule into a `Program`: one host
//! function that allocates intermediates, dispatches packed calls, and
//! launches kernels, plus one device kernel per scheduled compute node.
//! `Display` renders the listing the drivers print before building.

use crate::dtype::DType;
use crate::schedule::ThreadAxis;
use crate::shape::Expr as ShapeExpr;
use std::fmt;

/// Scalar expressions inside statements.
#[derive(Debug, Clone, PartialEq)]
pub enum IrExpr {
    Const(i64),
    Var(String),
    Load {
        buffer: String,
        index: Box<IrExpr>,
    },
    Add(Box<IrExpr>, Box<IrExpr>),
    Mul(Box<IrExpr>, Box<IrExpr>),
}

impl IrExpr {
    pub fn var(name: impl Into<String>) -> Self {
        IrExpr::Var(name.into())
    }

    pub fn load(buffer: impl Into<String>, index: IrExpr) -> Self {
        IrExpr::Load {
            buffer: buffer.into(),
            index: Box::new(index),
        }
    }
}

impl fmt::Display for IrExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrExpr::Const(c) => write!(f, "{c}"),
            IrExpr::Var(v) => write!(f, "{v}"),
            IrExpr::Load { buffer, index } => write!(f, "{buffer}[{index}]"),
            IrExpr::Add(l, r) => write!(f, "({l} + {r})"),
            IrExpr::Mul(l, r) => write!(f, "({l} * {r})"),
        }
    }
}

/// Statements of the lowered program.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Host-side allocation of an intermediate buffer.
    Alloc {
        buffer: String,
        dtype: DType,
        extent: ShapeExpr,
        align: Option<usize>,
    },
    /// A sequential loop.
    For {
        var: String,
        extent: ShapeExpr,
        body: Vec<Stmt>,
    },
    /// An iteration axis realized by a GPU grid axis instead of a loop.
    ThreadBind {
        var: String,
        axis: ThreadAxis,
        extent: ShapeExpr,
        body: Vec<Stmt>,
    },
    Store {
        buffer: String,
        index: IrExpr,
        value: IrExpr,
    },
    /// Opaque dispatch to a registered packed function.
    CallPacked { symbol: String, args: Vec<String> },
    /// Host-side launch of a device kernel.
    LaunchKernel {
        kernel: String,
        grid: Vec<(ThreadAxis, ShapeExpr)>,
        args: Vec<String>,
    },
}

/// Role of a function parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    BufferIn,
    BufferOut,
    /// A scalar dimension variable (always a signed integer).
    ShapeVar,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub dtype: DType,
    pub kind: ParamKind,
    /// Symbolic shape for buffer parameters; empty for shape variables.
    pub shape: Vec<ShapeExpr>,
}

impl Param {
    pub fn shape_var(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            dtype: DType::I64,
            kind: ParamKind::ShapeVar,
            shape: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Host,
    DeviceKernel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

/// A lowered program: the host entry plus its device kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub entry: String,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn host(&self) -> Option<&Function> {
        self.functions
            .iter()
            .find(|f| f.kind == FunctionKind::Host && f.name == self.entry)
    }

    pub fn device_kernels(&self) -> impl Iterator<Item = &Function> {
        self.functions
            .iter()
            .filter(|f| f.kind == FunctionKind::DeviceKernel)
    }

    pub fn find_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Every packed call in the program as `(symbol, arg count)`.
    pub fn packed_calls(&self) -> Vec<(&str, usize)> {
        let mut calls = Vec::new();
        for function in &self.functions {
            collect_packed_calls(&function.body, &mut calls);
        }
        calls
    }
}

fn collect_packed_calls<'a>(body: &'a [Stmt], out: &mut Vec<(&'a str, usize)>) {
    for stmt in body {
        match stmt {
            Stmt::CallPacked { symbol, args } => out.push((symbol.as_str(), args.len())),
            Stmt::For { body, .. } | Stmt::ThreadBind { body, .. } => {
                collect_packed_calls(body, out)
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

fn write_param(f: &mut fmt::Formatter<'_>, param: &Param) -> fmt::Result {
    match param.kind {
        ParamKind::ShapeVar => write!(f, "{}: int", param.name),
        _ => {
            let dims = param
                .shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "{}: {}[{}]", param.name, param.dtype, dims)
        }
    }
}

fn write_stmt(f: &mut fmt::Formatter<'_>, stmt: &Stmt, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    match stmt {
        Stmt::Alloc {
            buffer,
            dtype,
            extent,
            align,
        } => {
            write!(f, "{pad}alloc {buffer}: {dtype}[{extent}]")?;
            if let Some(align) = align {
                write!(f, " align={align}")?;
            }
            writeln!(f)
        }
        Stmt::For { var, extent, body } => {
            writeln!(f, "{pad}for {var} in 0..{extent} {{")?;
            for stmt in body {
                write_stmt(f, stmt, indent + 1)?;
            }
            writeln!(f, "{pad}}}")
        }
        Stmt::ThreadBind {
            var,
            axis,
            extent,
            body,
        } => {
            writeln!(f, "{pad}bind {var} = {axis}  // extent {extent}")?;
            for stmt in body {
                write_stmt(f, stmt, indent + 1)?;
            }
            Ok(())
        }
        Stmt::Store {
            buffer,
            index,
            value,
        } => writeln!(f, "{pad}{buffer}[{index}] = {value}"),
        Stmt::CallPacked { symbol, args } => {
            writeln!(f, "{pad}call_packed(\"{symbol}\", {})", args.join(", "))
        }
        Stmt::LaunchKernel { kernel, grid, args } => {
            let grid = grid
                .iter()
                .map(|(axis, extent)| format!("{axis}: {extent}"))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "{pad}launch {kernel} grid[{grid}] ({})", args.join(", "))
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FunctionKind::Host => "host fn",
            FunctionKind::DeviceKernel => "device kernel",
        };
        write!(f, "{kind} {}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write_param(f, param)?;
        }
        writeln!(f, ") {{")?;
        for stmt in &self.body {
            write_stmt(f, stmt, 1)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "// lowered: {}", self.entry)?;
        for (i, function) in self.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{function}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_calls_are_collected_recursively() {
        let program = Program {
            entry: "main".to_string(),
            functions: vec![Function {
                name: "main".to_string(),
                kind: FunctionKind::Host,
                params: vec![],
                body: vec![Stmt::For {
                    var: "i".to_string(),
                    extent: 4.into(),
                    body: vec![Stmt::CallPacked {
                        symbol: "a.b".to_string(),
                        args: vec!["x".to_string(), "y".to_string()],
                    }],
                }],
            }],
        };
        assert_eq!(program.packed_calls(), vec![("a.b", 2)]);
    }

    #[test]
    fn test_listing_shows_call_and_binding() {
        let program = Program {
            entry: "f".to_string(),
            functions: vec![Function {
                name: "f".to_string(),
                kind: FunctionKind::Host,
                params: vec![Param::shape_var("n")],
                body: vec![
                    Stmt::Alloc {
                        buffer: "tmp".to_string(),
                        dtype: DType::F32,
                        extent: ShapeExpr::var("n"),
                        align: Some(64),
                    },
                    Stmt::CallPacked {
                        symbol: "ext.sym".to_string(),
                        args: vec!["a".to_string(), "tmp".to_string()],
                    },
                ],
            }],
        };
        let listing = program.to_string();
        assert!(listing.contains("alloc tmp: float[n] align=64"));
        assert!(listing.contains("call_packed(\"ext.sym\", a, tmp)"));
    }
}
