//! lnsconv: packed extern convolution glue.
//!
//! This crate declares an external 3x3 convolution as an opaque node in a
//! small computation graph and carries it through the full pipeline:
//! schedule (GPU axis binding, storage alignment), lowering to an
//! intermediate representation, CUDA/host source generation, and module
//! export. The convolution itself lives behind the packed-function
//! registry; the compiler side never sees its body.
//!
//! # Architecture
//!
//! - **graph**: placeholder, extern, and compute nodes
//! - **contrib**: extern operator registrations (`contrib::lnsconv`)
//! - **schedule**: thread-axis bindings and storage alignment
//! - **lowerer**: graph + schedule -> lowered program
//! - **codegen**: CUDA and host C renderers
//! - **backend**: targets, `build`, module export, in-process run
//! - **runtime**: host tensors and the packed-function registry
//!
//! # Example
//!
//! ```
//! use lnsconv::prelude::*;
//!
//! let graph = Graph::new();
//! let n = Expr::var("n");
//! let data = graph.placeholder("data", DType::F32, vec![n.clone(), 3.into(), 3.into()]);
//! let weights = graph.placeholder("weights", DType::F32, vec![n, 3.into(), 3.into()]);
//! let conv = lnsconv::contrib::lnsconv::conv3x3(data, weights)?;
//! let out = conv.copy("out");
//!
//! let mut schedule = Schedule::create(&graph, &[out.id]);
//! schedule.stage_mut(out.id).unwrap().bind(0, ThreadAxis::BlockY)?;
//!
//! let module = build(schedule, &[data, weights, out], Target::Cuda, Target::Llvm, "conv")?;
//! assert!(module.imported_modules()[0].get_source().contains("__global__"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// ============================================================================
// Core Modules
// ============================================================================

pub mod backend;
pub mod codegen;
pub mod contrib;
pub mod dtype;
pub mod graph;
pub mod ir;
pub mod lowerer;
pub mod runtime;
pub mod schedule;
pub mod shape;

// ============================================================================
// Re-exports
// ============================================================================

pub use backend::{build, build_str, cc_available, Module, Target};
pub use dtype::DType;
pub use graph::{Graph, NodeView};
pub use lowerer::lower;
pub use schedule::{Schedule, ThreadAxis};
pub use shape::Expr;

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types and traits.
pub mod prelude {
    pub use crate::backend::{build, build_str, cc_available, Module, Target};
    pub use crate::codegen::SourceRenderer;
    pub use crate::contrib::lnsconv::conv3x3;
    pub use crate::dtype::DType;
    pub use crate::graph::{Graph, GraphOp, NodeView};
    pub use crate::lowerer::lower;
    pub use crate::runtime::{Element, Tensor};
    pub use crate::schedule::{Schedule, ThreadAxis};
    pub use crate::shape::Expr;
}

// ============================================================================
// Tests
// ============================================================================
