//! The packed-function registry.
//!
//! A process-global, string-keyed table of opaque routines. Each entry is
//! typed: it records its buffer-argument arity and is dispatched through a
//! checked [`PackedFunc::call`], so a caller passing the wrong number of
//! buffers gets an error instead of undefined behavior.
//!
//! The reference 3x3 convolution registers itself here under
//! [`crate::contrib::lnsconv::CONV3X3_SYMBOL`] when the registry is first
//! touched, the same way the native library registers its global on load.

use crate::contrib::lnsconv::{CONV3X3_NUM_ARGS, CONV3X3_SYMBOL};
use crate::dtype::DType;
use crate::runtime::buffer::TensorArg;
use log::debug;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors raised while mutating the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a packed function is already registered under '{symbol}'")]
    Duplicate { symbol: String },
}

/// Errors raised while dispatching a packed call.
#[derive(Debug, Error)]
pub enum PackedError {
    #[error("no packed function is registered under '{symbol}'")]
    MissingSymbol { symbol: String },

    #[error("'{symbol}' takes {expected} buffer arguments, got {actual}")]
    ArityMismatch {
        symbol: String,
        expected: usize,
        actual: usize,
    },

    #[error("'{symbol}' rejected buffer {index}: {reason}")]
    BadBuffer {
        symbol: String,
        index: usize,
        reason: String,
    },

    #[error("'{symbol}' failed: {reason}")]
    CallFailed { symbol: String, reason: String },
}

type Handler = dyn Fn(&mut [TensorArg]) -> Result<(), PackedError> + Send + Sync;

/// A named external routine with a fixed buffer-argument arity.
pub struct PackedFunc {
    symbol: String,
    arity: usize,
    handler: Box<Handler>,
}

impl PackedFunc {
    pub fn new(
        symbol: impl Into<String>,
        arity: usize,
        handler: impl Fn(&mut [TensorArg]) -> Result<(), PackedError> + Send + Sync + 'static,
    ) -> Self {
        PackedFunc {
            symbol: symbol.into(),
            arity,
            handler: Box::new(handler),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Dispatches the routine after checking the argument count.
    pub fn call(&self, args: &mut [TensorArg]) -> Result<(), PackedError> {
        if args.len() != self.arity {
            return Err(PackedError::ArityMismatch {
                symbol: self.symbol.clone(),
                expected: self.arity,
                actual: args.len(),
            });
        }
        (self.handler)(args)
    }
}

impl std::fmt::Debug for PackedFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedFunc")
            .field("symbol", &self.symbol)
            .field("arity", &self.arity)
            .finish()
    }
}

static REGISTRY: Lazy<RwLock<FxHashMap<String, Arc<PackedFunc>>>> = Lazy::new(|| {
    let mut table = FxHashMap::default();
    table.insert(
        CONV3X3_SYMBOL.to_string(),
        Arc::new(PackedFunc::new(
            CONV3X3_SYMBOL,
            CONV3X3_NUM_ARGS,
            reference_conv3x3,
        )),
    );
    RwLock::new(table)
});

/// Registers a packed function. Fails if the symbol is already taken.
pub fn register(
    symbol: impl Into<String>,
    arity: usize,
    handler: impl Fn(&mut [TensorArg]) -> Result<(), PackedError> + Send + Sync + 'static,
) -> Result<(), RegistryError> {
    let symbol = symbol.into();
    let mut table = REGISTRY.write().expect("registry lock poisoned");
    if table.contains_key(&symbol) {
        return Err(RegistryError::Duplicate { symbol });
    }
    debug!("registering packed function '{symbol}' with arity {arity}");
    let func = PackedFunc::new(symbol.clone(), arity, handler);
    table.insert(symbol, Arc::new(func));
    Ok(())
}

/// Replaces any existing registration for the symbol.
pub fn register_override(
    symbol: impl Into<String>,
    arity: usize,
    handler: impl Fn(&mut [TensorArg]) -> Result<(), PackedError> + Send + Sync + 'static,
) {
    let symbol = symbol.into();
    debug!("overriding packed function '{symbol}' with arity {arity}");
    let func = PackedFunc::new(symbol.clone(), arity, handler);
    REGISTRY
        .write()
        .expect("registry lock poisoned")
        .insert(symbol, Arc::new(func));
}

/// Looks up a packed function by symbol.
pub fn lookup(symbol: &str) -> Option<Arc<PackedFunc>> {
    REGISTRY
        .read()
        .expect("registry lock poisoned")
        .get(symbol)
        .cloned()
}

pub fn is_registered(symbol: &str) -> bool {
    REGISTRY
        .read()
        .expect("registry lock poisoned")
        .contains_key(symbol)
}

/// Looks up and dispatches in one step.
pub fn call(symbol: &str, args: &mut [TensorArg]) -> Result<(), PackedError> {
    let func = lookup(symbol).ok_or_else(|| PackedError::MissingSymbol {
        symbol: symbol.to_string(),
    })?;
    func.call(args)
}

fn expect_dtype(
    arg: &TensorArg,
    index: usize,
    dtype: DType,
) -> Result<(), PackedError> {
    if arg.dtype != dtype {
        return Err(PackedError::BadBuffer {
            symbol: CONV3X3_SYMBOL.to_string(),
            index,
            reason: format!("expected dtype {dtype}, got {}", arg.dtype),
        });
    }
    Ok(())
}

/// CPU reference implementation of the external 3x3 convolution.
///
/// Buffer contract (data, weights, output):
/// - `data` and `weights` share one shape with leading channel dimension;
/// - `output` is 1-D with one element per channel;
/// - all three are `F32`.
///
/// Each output element is the full contraction of one channel slice of
/// `data` against the matching slice of `weights`, the single value a
/// valid 3x3-by-3x3 convolution produces per channel.
fn reference_conv3x3(args: &mut [TensorArg]) -> Result<(), PackedError> {
    let symbol = || CONV3X3_SYMBOL.to_string();

    for (index, arg) in args.iter().enumerate() {
        expect_dtype(arg, index, DType::F32)?;
        if arg.rank() == 0 {
            return Err(PackedError::BadBuffer {
                symbol: symbol(),
                index,
                reason: "rank 0 buffer".to_string(),
            });
        }
    }
    if args[0].shape != args[1].shape {
        return Err(PackedError::BadBuffer {
            symbol: symbol(),
            index: 1,
            reason: format!(
                "weights shape {:?} does not match data shape {:?}",
                args[1].shape, args[0].shape
            ),
        });
    }
    let channels = args[0].shape[0];
    if args[2].rank() != 1 || args[2].shape[0] != channels {
        return Err(PackedError::BadBuffer {
            symbol: symbol(),
            index: 2,
            reason: format!(
                "output must be 1-D with {channels} elements, got {:?}",
                args[2].shape
            ),
        });
    }

    let per_channel = args[0].shape[1..].iter().product::<usize>();
    let data = args[0].as_slice::<f32>().map_err(|e| PackedError::BadBuffer {
        symbol: symbol(),
        index: 0,
        reason: e.to_string(),
    })?;
    let weights = args[1]
        .as_slice::<f32>()
        .map_err(|e| PackedError::BadBuffer {
            symbol: symbol(),
            index: 1,
            reason: e.to_string(),
        })?;
    // Contract each channel against its weights before touching the output
    // view so the input borrows end first.
    let mut acc = vec![0.0f32; channels];
    for (c, slot) in acc.iter_mut().enumerate() {
        let base = c * per_channel;
        *slot = data[base..base + per_channel]
            .iter()
            .zip(&weights[base..base + per_channel])
            .map(|(d, w)| d * w)
            .sum();
    }
    let out = args[2]
        .as_mut_slice::<f32>()
        .map_err(|e| PackedError::BadBuffer {
            symbol: symbol(),
            index: 2,
            reason: e.to_string(),
        })?;
    out.copy_from_slice(&acc);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::Tensor;

    #[test]
    fn test_reference_conv_is_registered_by_default() {
        assert!(is_registered(CONV3X3_SYMBOL));
        let func = lookup(CONV3X3_SYMBOL).unwrap();
        assert_eq!(func.arity(), CONV3X3_NUM_ARGS);
    }

    #[test]
    fn test_reference_conv_single_channel() {
        let mut data = Tensor::from_slice(&[1.0f32; 9], &[1, 3, 3]).unwrap();
        let mut weights = Tensor::from_slice(&[2.0f32; 9], &[1, 3, 3]).unwrap();
        let mut out = Tensor::alloc(DType::F32, vec![1]);
        let mut args = vec![data.arg(), weights.arg(), out.arg()];
        call(CONV3X3_SYMBOL, &mut args).unwrap();
        drop(args);
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![18.0]);
    }

    #[test]
    fn test_reference_conv_multi_channel() {
        let data: Vec<f32> = (0..18).map(|v| v as f32).collect();
        let weights = vec![1.0f32; 18];
        let mut data = Tensor::from_slice(&data, &[2, 3, 3]).unwrap();
        let mut weights = Tensor::from_slice(&weights, &[2, 3, 3]).unwrap();
        let mut out = Tensor::alloc(DType::F32, vec![2]);
        let mut args = vec![data.arg(), weights.arg(), out.arg()];
        call(CONV3X3_SYMBOL, &mut args).unwrap();
        drop(args);
        // channel sums of 0..9 and 9..18
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![36.0, 117.0]);
    }

    #[test]
    fn test_arity_mismatch_is_typed() {
        let mut data = Tensor::alloc(DType::F32, vec![1, 3, 3]);
        let mut weights = Tensor::alloc(DType::F32, vec![1, 3, 3]);
        let mut args = vec![data.arg(), weights.arg()];
        match call(CONV3X3_SYMBOL, &mut args) {
            Err(PackedError::ArityMismatch {
                expected: 3,
                actual: 2,
                ..
            }) => {}
            other => panic!("expected arity mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_symbol_is_typed() {
        let mut out = Tensor::alloc(DType::F32, vec![1]);
        let mut args = vec![out.arg()];
        assert!(matches!(
            call("no.such.symbol", &mut args),
            Err(PackedError::MissingSymbol { .. })
        ));
    }

    #[test]
    fn test_reference_conv_rejects_wrong_dtype() {
        let mut data = Tensor::alloc(DType::I32, vec![1, 3, 3]);
        let mut weights = Tensor::alloc(DType::F32, vec![1, 3, 3]);
        let mut out = Tensor::alloc(DType::F32, vec![1]);
        let mut args = vec![data.arg(), weights.arg(), out.arg()];
        assert!(matches!(
            call(CONV3X3_SYMBOL, &mut args),
            Err(PackedError::BadBuffer { index: 0, .. })
        ));
    }

    #[test]
    fn test_reference_conv_rejects_bad_output_shape() {
        let mut data = Tensor::alloc(DType::F32, vec![2, 3, 3]);
        let mut weights = Tensor::alloc(DType::F32, vec![2, 3, 3]);
        let mut out = Tensor::alloc(DType::F32, vec![3]);
        let mut args = vec![data.arg(), weights.arg(), out.arg()];
        assert!(matches!(
            call(CONV3X3_SYMBOL, &mut args),
            Err(PackedError::BadBuffer { index: 2, .. })
        ));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        register("tests.registry.dup", 1, |_: &mut [TensorArg]| Ok(())).unwrap();
        assert!(matches!(
            register("tests.registry.dup", 1, |_: &mut [TensorArg]| Ok(())),
            Err(RegistryError::Duplicate { .. })
        ));
    }
}
