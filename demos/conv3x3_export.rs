//! Artifact-export driver for the extern 3x3 convolution.
//!
//! Same pipeline as `conv3x3_cuda`, but finishes by writing the build
//! artifacts: a shared library `foo.so` and an object file `foo.o` in the
//! working directory.

use lnsconv::contrib::lnsconv::conv3x3;
use lnsconv::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let graph = Graph::new();
    let n = Expr::var("n");
    let data = graph.placeholder("data", DType::F32, vec![n.clone(), 3.into(), 3.into()]);
    let weights = graph.placeholder("weights", DType::F32, vec![n, 3.into(), 3.into()]);

    let conv = conv3x3(data, weights)?;
    let out = conv.copy("out");

    let mut schedule = Schedule::create(&graph, &[out.id]);
    schedule
        .stage_mut(out.id)
        .expect("out is scheduled")
        .bind(0, ThreadAxis::BlockY)?;

    let module = build(
        schedule,
        &[data, weights, out],
        Target::Cuda,
        Target::Llvm,
        "function_wrapper",
    )?;

    if !cc_available() {
        eprintln!("no C compiler available, skipping artifact export");
        return Ok(());
    }

    module.export_library("foo.so")?;
    module.save("foo.o")?;
    println!("wrote foo.so and foo.o");

    Ok(())
}
