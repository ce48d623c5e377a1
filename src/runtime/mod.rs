//! Host-side runtime: tensors, the packed-function registry, and loading
//! of packed routines from native shared libraries.

pub mod buffer;
pub mod library;
pub mod registry;

pub use buffer::{BufferError, Element, Tensor, TensorArg};
pub use library::{load_packed, LibraryError};
pub use registry::{
    call, is_registered, lookup, register, register_override, PackedError, PackedFunc,
    RegistryError,
};
