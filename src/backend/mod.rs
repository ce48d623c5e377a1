//! Targets and the build step.
//!
//! `build` consumes a schedule exactly once: it lowers the scheduled
//! graph, renders device source for the device target and host source for
//! the host target, and assembles the result into a `Module`. No
//! toolchain is touched until the module is exported.

mod exec;
mod module;

pub use exec::ExecError;
pub use module::{cc_available, Module, ModuleError};

use crate::codegen::{CHostRenderer, CudaRenderer, SourceRenderer};
use crate::graph::NodeView;
use crate::lowerer::{lower, LowerError};
use crate::schedule::Schedule;
use log::debug;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// NVIDIA GPU device code.
    Cuda,
    /// Host code through the system toolchain.
    Llvm,
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("unknown target '{name}'. Valid options: cuda, llvm")]
    Unknown { name: String },
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cuda" => Ok(Target::Cuda),
            "llvm" => Ok(Target::Llvm),
            _ => Err(TargetError::Unknown {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Cuda => write!(f, "cuda"),
            Target::Llvm => write!(f, "llvm"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Lower(#[from] LowerError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("'{target}' cannot be used as the device target (only cuda is supported)")]
    UnsupportedDeviceTarget { target: Target },

    #[error("'{target}' cannot be used as the host target (only llvm is supported)")]
    UnsupportedHostTarget { target: Target },
}

/// Builds the scheduled graph into a host module with one imported device
/// module.
///
/// The schedule is taken by value: a schedule is consumed by exactly one
/// build. `args` is the host entry's parameter list, placeholders and
/// outputs in call order.
pub fn build(
    schedule: Schedule<'_>,
    args: &[NodeView<'_>],
    target: Target,
    target_host: Target,
    name: &str,
) -> Result<Module, BuildError> {
    if target != Target::Cuda {
        return Err(BuildError::UnsupportedDeviceTarget { target });
    }
    if target_host != Target::Llvm {
        return Err(BuildError::UnsupportedHostTarget {
            target: target_host,
        });
    }

    let program = lower(&schedule, args, name)?;
    let device_source = CudaRenderer::new().render(&program);
    let host_source = CHostRenderer::new().render(&program);
    debug!(
        "built module '{name}' for {target} (host {target_host}), {} kernel(s)",
        program.device_kernels().count()
    );

    let device = Module::device(name, Target::Cuda, device_source);
    Ok(Module::host(
        name,
        target_host,
        host_source,
        program,
        vec![device],
    ))
}

/// `build` with the targets given as strings, the way the drivers pass
/// them through.
pub fn build_str(
    schedule: Schedule<'_>,
    args: &[NodeView<'_>],
    target: &str,
    target_host: &str,
    name: &str,
) -> Result<Module, BuildError> {
    let target = Target::from_str(target)?;
    let target_host = Target::from_str(target_host)?;
    build(schedule, args, target, target_host, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contrib::lnsconv::conv3x3;
    use crate::dtype::DType;
    use crate::graph::Graph;
    use crate::schedule::ThreadAxis;
    use crate::shape::Expr;

    #[test]
    fn test_target_parse() {
        assert_eq!("cuda".parse::<Target>().unwrap(), Target::Cuda);
        assert_eq!("LLVM".parse::<Target>().unwrap(), Target::Llvm);
        assert!("opencl".parse::<Target>().is_err());
    }

    #[test]
    fn test_build_produces_device_module() {
        let graph = Graph::new();
        let a = graph.placeholder("data", DType::F32, vec![3.into(), 3.into()]);
        let b = graph.placeholder("weights", DType::F32, vec![3.into(), 3.into()]);
        let d = conv3x3(a, b).unwrap();
        let e = d.copy("e");
        let mut schedule = Schedule::create(&graph, &[e.id]);
        schedule
            .stage_mut(e.id)
            .unwrap()
            .bind(0, ThreadAxis::BlockY)
            .unwrap();

        let module = build_str(schedule, &[a, b, e], "cuda", "llvm", "function_wrapper").unwrap();
        assert_eq!(module.imported_modules().len(), 1);
        assert!(module.imported_modules()[0]
            .get_source()
            .contains("__global__"));
        assert!(module.get_source().contains("lnsconv_call_packed"));
    }

    #[test]
    fn test_swapped_targets_are_rejected() {
        let graph = Graph::new();
        let a = graph.placeholder("data", DType::F32, vec![Expr::from(3i64)]);
        let e = a.copy("e");
        let schedule = Schedule::create(&graph, &[e.id]);
        assert!(matches!(
            build_str(schedule, &[a, e], "llvm", "llvm", "f"),
            Err(BuildError::UnsupportedDeviceTarget { .. })
        ));
    }
}
