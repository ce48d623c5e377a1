//! End-to-end driver for the extern 3x3 convolution.
//!
//! Builds a graph over a symbolic channel count, schedules the copy stage
//! onto `blockIdx.y` with 64-byte storage alignment, prints the lowered
//! listing and the generated CUDA source, then smoke-runs the module
//! in-process against the reference convolution.

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
    {
        let stage = schedule.stage_mut(out.id).expect("out is scheduled");
        stage.bind(0, ThreadAxis::BlockY)?;
        stage.storage_align(0, 64, 0)?;
    }

    println!("-------------------- IR -----------------------");
    let program = lower(&schedule, &[data, weights, out], "function_wrapper")?;
    println!("{program}");

    let module = build(
        schedule,
        &[data, weights, out],
        Target::Cuda,
        Target::Llvm,
        "function_wrapper",
    )?;

    println!("-------------------- CUDA ---------------------");
    println!("{}", module.imported_modules()[0].get_source());

    // Smoke-run through the packed-function registry.
    let channels = 4usize;
    let mut data_buf = Tensor::from_slice(&vec![0.5f32; channels * 9], &[channels, 3, 3])?;
    let mut weights_buf = Tensor::from_slice(&vec![2.0f32; channels * 9], &[channels, 3, 3])?;
    let mut out_buf = Tensor::alloc(DType::F32, vec![channels]);
    module.run(
        &mut [&mut data_buf, &mut weights_buf, &mut out_buf],
        &[("n", channels as i64)],
    )?;
    println!("-------------------- RUN ----------------------");
    println!("out = {:?}", out_buf.to_vec::<f32>()?);

    Ok(())
}
