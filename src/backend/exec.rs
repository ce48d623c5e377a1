//! In-process execution of a built host module.
//!
//! The host program is evaluated against the packed-function registry and
//! device kernels are interpreted on the CPU, grid axes included, so the
//! whole pipeline can be smoke-run on a machine with no GPU. Buffers are
//! staged by value: caller tensors are copied in, the program runs on the
//! staged pool, and every caller buffer is copied back at the end.

use crate::backend::module::Module;
use crate::dtype::DType;
use crate::ir::{Function, IrExpr, ParamKind, Program, Stmt};
use crate::runtime::buffer::{BufferError, Tensor};
use crate::runtime::registry::{self, PackedError};
use crate::shape::Expr as ShapeExpr;
use log::{debug, trace};
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("module '{name}' has no host program to run")]
    NotExecutable { name: String },

    #[error("expected {expected} buffer arguments, got {actual}")]
    ArgCount { expected: usize, actual: usize },

    #[error("no value provided for shape variable '{name}'")]
    MissingShapeVar { name: String },

    #[error("buffer '{name}' should have shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        actual: Vec<usize>,
    },

    #[error("buffer '{name}' should have dtype {expected}, got {actual}")]
    DTypeMismatch {
        name: String,
        expected: DType,
        actual: DType,
    },

    #[error("unknown or aliased buffer '{name}'")]
    UnknownBuffer { name: String },

    #[error("unknown kernel '{name}'")]
    UnknownKernel { name: String },

    #[error("extent '{extent}' does not evaluate to a nonnegative size")]
    BadExtent { extent: String },

    #[error("index {index} is out of bounds for '{buffer}' ({len} elements)")]
    OutOfBounds {
        buffer: String,
        index: i64,
        len: usize,
    },

    #[error("the interpreter only runs {expected} kernels, '{buffer}' is {actual}")]
    UnsupportedDType {
        buffer: String,
        expected: DType,
        actual: DType,
    },

    #[error(transparent)]
    Packed(#[from] PackedError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl Module {
    /// Runs the host program in-process.
    ///
    /// `args` are the caller's buffers in host-parameter order;
    /// `shape_vars` binds every symbolic dimension (e.g. `("n", 3)`).
    pub fn run(
        &self,
        args: &mut [&mut Tensor],
        shape_vars: &[(&str, i64)],
    ) -> Result<(), ExecError> {
        let program = self.program().ok_or_else(|| ExecError::NotExecutable {
            name: self.name().to_string(),
        })?;
        let host = program.host().ok_or_else(|| ExecError::NotExecutable {
            name: self.name().to_string(),
        })?;

        let mut bindings: FxHashMap<String, i64> = FxHashMap::default();
        for (name, value) in shape_vars {
            bindings.insert(name.to_string(), *value);
        }
        for param in &host.params {
            if param.kind == ParamKind::ShapeVar && !bindings.contains_key(&param.name) {
                return Err(ExecError::MissingShapeVar {
                    name: param.name.clone(),
                });
            }
        }

        let buffer_params: Vec<_> = host
            .params
            .iter()
            .filter(|p| p.kind != ParamKind::ShapeVar)
            .collect();
        if buffer_params.len() != args.len() {
            return Err(ExecError::ArgCount {
                expected: buffer_params.len(),
                actual: args.len(),
            });
        }

        // Validate the caller buffers against the symbolic signature, then
        // stage them by value.
        let mut pool: FxHashMap<String, Tensor> = FxHashMap::default();
        for (param, tensor) in buffer_params.iter().zip(args.iter()) {
            if param.dtype != tensor.dtype() {
                return Err(ExecError::DTypeMismatch {
                    name: param.name.clone(),
                    expected: param.dtype,
                    actual: tensor.dtype(),
                });
            }
            let expected: Vec<i64> = param
                .shape
                .iter()
                .map(|dim| eval_extent(dim, &bindings))
                .collect::<Result<_, _>>()?;
            let actual = tensor.shape();
            if expected.len() != actual.len()
                || expected
                    .iter()
                    .zip(actual)
                    .any(|(e, &a)| *e < 0 || *e as usize != a)
            {
                return Err(ExecError::ShapeMismatch {
                    name: param.name.clone(),
                    expected,
                    actual: actual.to_vec(),
                });
            }
            pool.insert(param.name.clone(), (*tensor).clone());
        }

        debug!("running module '{}' in-process", self.name());
        for stmt in &host.body {
            self.run_host_stmt(program, stmt, &bindings, &mut pool)?;
        }

        // Copy staged results back into the caller's buffers.
        for (param, tensor) in buffer_params.iter().zip(args.iter_mut()) {
            let staged = pool
                .get(&param.name)
                .ok_or_else(|| ExecError::UnknownBuffer {
                    name: param.name.clone(),
                })?;
            tensor.as_bytes_mut().copy_from_slice(staged.as_bytes());
        }
        Ok(())
    }

    fn run_host_stmt(
        &self,
        program: &Program,
        stmt: &Stmt,
        bindings: &FxHashMap<String, i64>,
        pool: &mut FxHashMap<String, Tensor>,
    ) -> Result<(), ExecError> {
        match stmt {
            Stmt::Alloc {
                buffer,
                dtype,
                extent,
                align,
            } => {
                let len = eval_extent(extent, bindings)?;
                if len < 0 {
                    return Err(ExecError::BadExtent {
                        extent: extent.to_string(),
                    });
                }
                trace!("alloc '{buffer}' ({len} x {dtype})");
                let tensor = Tensor::alloc_aligned(
                    *dtype,
                    vec![len as usize],
                    align.unwrap_or_else(|| dtype.size_in_bytes()),
                )?;
                pool.insert(buffer.clone(), tensor);
                Ok(())
            }
            Stmt::CallPacked { symbol, args } => {
                trace!("dispatch packed '{symbol}'");
                let mut taken = take_buffers(pool, args)?;
                let mut views: Vec<_> = taken.iter_mut().map(|(_, t)| t.arg()).collect();
                let result = registry::call(symbol, &mut views);
                drop(views);
                put_back(pool, taken);
                result.map_err(ExecError::from)
            }
            Stmt::LaunchKernel { kernel, args, .. } => {
                let function = program
                    .device_kernels()
                    .find(|f| &f.name == kernel)
                    .ok_or_else(|| ExecError::UnknownKernel {
                        name: kernel.clone(),
                    })?;
                trace!("interpret kernel '{kernel}' on the CPU");
                let mut taken = take_buffers(pool, args)?;
                let result = interpret_kernel(function, &mut taken, bindings);
                put_back(pool, taken);
                result
            }
            Stmt::For { .. } | Stmt::ThreadBind { .. } | Stmt::Store { .. } => {
                unreachable!("device statement in host body: {stmt:?}")
            }
        }
    }
}

fn take_buffers(
    pool: &mut FxHashMap<String, Tensor>,
    names: &[String],
) -> Result<Vec<(String, Tensor)>, ExecError> {
    let mut taken = Vec::with_capacity(names.len());
    for name in names {
        match pool.remove(name) {
            Some(tensor) => taken.push((name.clone(), tensor)),
            None => {
                // Put everything back before failing so the pool stays
                // consistent for the error path.
                put_back(pool, taken);
                return Err(ExecError::UnknownBuffer { name: name.clone() });
            }
        }
    }
    Ok(taken)
}

fn put_back(pool: &mut FxHashMap<String, Tensor>, taken: Vec<(String, Tensor)>) {
    for (name, tensor) in taken {
        pool.insert(name, tensor);
    }
}

fn eval_extent(expr: &ShapeExpr, env: &FxHashMap<String, i64>) -> Result<i64, ExecError> {
    match expr {
        ShapeExpr::Var(name) if !env.contains_key(name) => Err(ExecError::MissingShapeVar {
            name: name.clone(),
        }),
        _ => expr.eval(env).ok_or_else(|| ExecError::BadExtent {
            extent: expr.to_string(),
        }),
    }
}

/// Interprets a device kernel sequentially; bound grid axes run as loops.
fn interpret_kernel(
    function: &Function,
    buffers: &mut [(String, Tensor)],
    bindings: &FxHashMap<String, i64>,
) -> Result<(), ExecError> {
    // Kernel buffer parameters are positional; rename the staged buffers
    // to the kernel's local names.
    let mut local: FxHashMap<String, usize> = FxHashMap::default();
    let buffer_params = function
        .params
        .iter()
        .filter(|p| p.kind != ParamKind::ShapeVar);
    for (i, param) in buffer_params.enumerate() {
        if i >= buffers.len() {
            return Err(ExecError::ArgCount {
                expected: function.params.len(),
                actual: buffers.len(),
            });
        }
        local.insert(param.name.clone(), i);
    }

    let mut env = bindings.clone();
    run_stmts(&function.body, &mut env, &local, buffers)
}

fn run_stmts(
    stmts: &[Stmt],
    env: &mut FxHashMap<String, i64>,
    local: &FxHashMap<String, usize>,
    buffers: &mut [(String, Tensor)],
) -> Result<(), ExecError> {
    for stmt in stmts {
        match stmt {
            Stmt::For { var, extent, body }
            | Stmt::ThreadBind {
                var, extent, body, ..
            } => {
                let extent = eval_extent(extent, env)?;
                for value in 0..extent.max(0) {
                    env.insert(var.clone(), value);
                    run_stmts(body, env, local, buffers)?;
                }
                env.remove(var);
            }
            Stmt::Store {
                buffer,
                index,
                value,
            } => {
                let index = eval_index(index, env)?;
                let value = eval_value(value, env, local, buffers)? as f32;
                let slot = *local
                    .get(buffer)
                    .ok_or_else(|| ExecError::UnknownBuffer {
                        name: buffer.clone(),
                    })?;
                let tensor = &mut buffers[slot].1;
                check_f32(buffer, tensor.dtype())?;
                let slice = tensor.as_mut_slice::<f32>()?;
                if index < 0 || index as usize >= slice.len() {
                    return Err(ExecError::OutOfBounds {
                        buffer: buffer.clone(),
                        index,
                        len: slice.len(),
                    });
                }
                slice[index as usize] = value;
            }
            Stmt::Alloc { .. } | Stmt::CallPacked { .. } | Stmt::LaunchKernel { .. } => {
                unreachable!("host statement in device kernel: {stmt:?}")
            }
        }
    }
    Ok(())
}

fn check_f32(buffer: &str, dtype: DType) -> Result<(), ExecError> {
    if dtype != DType::F32 {
        return Err(ExecError::UnsupportedDType {
            buffer: buffer.to_string(),
            expected: DType::F32,
            actual: dtype,
        });
    }
    Ok(())
}

fn eval_index(expr: &IrExpr, env: &FxHashMap<String, i64>) -> Result<i64, ExecError> {
    match expr {
        IrExpr::Const(c) => Ok(*c),
        IrExpr::Var(name) => env
            .get(name)
            .copied()
            .ok_or_else(|| ExecError::MissingShapeVar { name: name.clone() }),
        IrExpr::Add(l, r) => Ok(eval_index(l, env)? + eval_index(r, env)?),
        IrExpr::Mul(l, r) => Ok(eval_index(l, env)? * eval_index(r, env)?),
        IrExpr::Load { buffer, .. } => Err(ExecError::UnknownBuffer {
            name: format!("{buffer} (loads cannot appear in index expressions)"),
        }),
    }
}

fn eval_value(
    expr: &IrExpr,
    env: &FxHashMap<String, i64>,
    local: &FxHashMap<String, usize>,
    buffers: &[(String, Tensor)],
) -> Result<f64, ExecError> {
    match expr {
        IrExpr::Const(c) => Ok(*c as f64),
        IrExpr::Var(name) => env
            .get(name)
            .map(|&v| v as f64)
            .ok_or_else(|| ExecError::MissingShapeVar { name: name.clone() }),
        IrExpr::Load { buffer, index } => {
            let index = eval_index(index, env)?;
            let slot = *local
                .get(buffer)
                .ok_or_else(|| ExecError::UnknownBuffer {
                    name: buffer.clone(),
                })?;
            let tensor = &buffers[slot].1;
            check_f32(buffer, tensor.dtype())?;
            let slice = tensor.as_slice::<f32>()?;
            if index < 0 || index as usize >= slice.len() {
                return Err(ExecError::OutOfBounds {
                    buffer: buffer.clone(),
                    index,
                    len: slice.len(),
                });
            }
            Ok(slice[index as usize] as f64)
        }
        IrExpr::Add(l, r) => {
            Ok(eval_value(l, env, local, buffers)? + eval_value(r, env, local, buffers)?)
        }
        IrExpr::Mul(l, r) => {
            Ok(eval_value(l, env, local, buffers)? * eval_value(r, env, local, buffers)?)
        }
    }
}
