//! Loading packed functions from native shared libraries.
//!
//! The exported routine must follow the packed C ABI below. Resolution
//! happens at load time: a library without the requested export is
//! rejected immediately, long before any call is dispatched.

use crate::runtime::buffer::TensorArg;
use crate::runtime::registry::{self, PackedError, RegistryError};
use libloading::Library;
use log::debug;
use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// The C-ABI view of one buffer argument.
#[repr(C)]
pub struct RawTensor {
    pub data: *mut c_void,
    pub shape: *const i64,
    pub ndim: i32,
    /// 0 = signed int, 1 = unsigned int, 2 = float.
    pub dtype_code: i32,
    pub dtype_bits: i32,
}

/// Exported packed routine: receives the buffer arguments and their count,
/// returns 0 on success.
pub type RawPackedFn = unsafe extern "C" fn(args: *mut RawTensor, num_args: i32) -> i32;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("failed to open '{path}': {source}")]
    Open {
        path: String,
        source: libloading::Error,
    },

    #[error("library has no export '{export}': {source}")]
    MissingExport {
        export: String,
        source: libloading::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}


/// Loads `export` from the shared library at `path` and registers it as
/// the packed function `symbol` with the given buffer arity.
///
/// The export is resolved immediately; the library stays loaded for as
/// long as the registration lives.
pub fn load_packed(
    path: impl AsRef<Path>,
    export: &str,
    symbol: &str,
    arity: usize,
) -> Result<(), LibraryError> {
    let path = path.as_ref();
    let library = unsafe { Library::new(path) }.map_err(|source| LibraryError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let library = Arc::new(library);

    let raw_fn: RawPackedFn = unsafe {
        *library
            .get::<RawPackedFn>(export.as_bytes())
            .map_err(|source| LibraryError::MissingExport {
                export: export.to_string(),
                source,
            })?
    };
    debug!(
        "loaded packed function '{symbol}' from {} (export '{export}')",
        path.display()
    );

    let owned_symbol = symbol.to_string();
    let keep_alive = Arc::clone(&library);
    registry::register(symbol, arity, move |args: &mut [TensorArg]| {
        let _library = &keep_alive;
        // Shapes are staged as i64 so the raw views stay valid for the
        // duration of the call.
        let shapes: Vec<Vec<i64>> = args
            .iter()
            .map(|arg| arg.shape.iter().map(|&d| d as i64).collect())
            .collect();
        let mut raw: Vec<RawTensor> = args
            .iter_mut()
            .zip(&shapes)
            .map(|(arg, shape)| {
                let (dtype_code, dtype_bits) = arg.dtype.packed_type_codes();
                RawTensor {
                    data: arg.data_ptr() as *mut c_void,
                    shape: shape.as_ptr(),
                    ndim: shape.len() as i32,
                    dtype_code,
                    dtype_bits,
                }
            })
            .collect();
        let status = unsafe { raw_fn(raw.as_mut_ptr(), raw.len() as i32) };
        if status != 0 {
            return Err(PackedError::CallFailed {
                symbol: owned_symbol.clone(),
                reason: format!("native routine returned status {status}"),
            });
        }
        Ok(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn test_missing_library_is_rejected() {
        let result = load_packed("/nonexistent/lib.so", "conv3x3", "tests.library.missing", 3);
        assert!(matches!(result, Err(LibraryError::Open { .. })));
    }

    #[test]
    fn test_packed_type_codes() {
        assert_eq!(DType::F32.packed_type_codes(), (2, 32));
        assert_eq!(DType::I64.packed_type_codes(), (0, 64));
        assert_eq!(DType::U8.packed_type_codes(), (1, 8));
    }
}
