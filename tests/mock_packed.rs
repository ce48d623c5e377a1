//! In-process run with a mocked packed function.
//!
//! Overrides the convolution symbol with a mock so the test observes
//! exactly what the module passes across the packed-call boundary and
//! what flows back through the copy kernel.
//!
//! This file overrides a process-global registration, so it lives in its
//! own test binary.

use lnsconv::contrib::lnsconv::{conv3x3, CONV3X3_SYMBOL};
use lnsconv::prelude::*;
use lnsconv::runtime::{register_override, PackedError, TensorArg};

#[test]
fn mock_output_flows_through_the_copy_kernel() {
    let _ = env_logger::builder().is_test(true).try_init();

    // The mock checks the three-buffer order and writes a marker value
    // per channel.
    register_override(CONV3X3_SYMBOL, 3, |args: &mut [TensorArg]| {
        if args[0].shape != [2, 3, 3] || args[1].shape != [2, 3, 3] {
            return Err(PackedError::BadBuffer {
                symbol: CONV3X3_SYMBOL.to_string(),
                index: 0,
                reason: format!("unexpected input shapes {:?} / {:?}", args[0].shape, args[1].shape),
            });
        }
        let out = args[2].as_mut_slice::<f32>().map_err(|e| PackedError::BadBuffer {
            symbol: CONV3X3_SYMBOL.to_string(),
            index: 2,
            reason: e.to_string(),
        })?;
        for (c, slot) in out.iter_mut().enumerate() {
            *slot = 100.0 + c as f32;
        }
        Ok(())
    });

    let graph = Graph::new();
    let n = Expr::var("n");
    let data = graph.placeholder("data", DType::F32, vec![n.clone(), 3.into(), 3.into()]);
    let weights = graph.placeholder("weights", DType::F32, vec![n, 3.into(), 3.into()]);
    let conv = conv3x3(data, weights).unwrap();
    let out = conv.copy("out");

    let mut schedule = Schedule::create(&graph, &[out.id]);
    schedule
        .stage_mut(out.id)
        .unwrap()
        .bind(0, ThreadAxis::BlockY)
        .unwrap();

    let module = build(
        schedule,
        &[data, weights, out],
        Target::Cuda,
        Target::Llvm,
        "function_wrapper",
    )
    .unwrap();

    let mut data_buf = Tensor::alloc(DType::F32, vec![2, 3, 3]);
    let mut weights_buf = Tensor::alloc(DType::F32, vec![2, 3, 3]);
    let mut out_buf = Tensor::alloc(DType::F32, vec![2]);
    module
        .run(
            &mut [&mut data_buf, &mut weights_buf, &mut out_buf],
            &[("n", 2)],
        )
        .unwrap();

    // The mock wrote into the intermediate buffer; the copy kernel moved
    // it into the caller's output.
    assert_eq!(out_buf.to_vec::<f32>().unwrap(), vec![100.0, 101.0]);
}
