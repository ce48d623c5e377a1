//! Host tensor buffers.
//!
//! `Tensor` owns a dense, alignment-controlled allocation; `TensorArg` is
//! the borrowed view handed to packed functions. Packed routines receive
//! every operand as a mutable view, mirroring the opaque buffer handles of
//! the native calling convention.

use crate::dtype::DType;
use ndarray::{ArrayD, IxDyn};
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("dtype mismatch: buffer holds {actual}, requested {expected}")]
    DTypeMismatch { expected: DType, actual: DType },

    #[error("element count mismatch: buffer holds {actual} elements, got {expected}")]
    LenMismatch { expected: usize, actual: usize },

    #[error("alignment {align} is not a nonzero power of two")]
    BadAlignment { align: usize },

    #[error("shape {shape:?} does not describe the buffer contents")]
    ShapeMismatch { shape: Vec<usize> },
}

/// Marker for element types a `Tensor` can hold.
pub trait Element: Copy + 'static {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: DType = DType::$variant;
        })*
    };
}

impl_element!(
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
);

/// A dense host tensor with explicit allocation alignment.
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    layout: Layout,
    ptr: NonNull<u8>,
}

// The allocation is uniquely owned and only reachable through &/&mut self.
unsafe impl Send for Tensor {}
unsafe impl Sync for Tensor {}

impl Tensor {
    /// Allocates a zero-initialized tensor with the element's natural
    /// alignment.
    pub fn alloc(dtype: DType, shape: Vec<usize>) -> Self {
        Self::alloc_aligned(dtype, shape, dtype.size_in_bytes())
            .unwrap_or_else(|e| unreachable!("natural alignment is always valid: {e}"))
    }

    /// Allocates a zero-initialized tensor whose storage starts at an
    /// `align`-byte boundary.
    ///
    /// `align` must be a nonzero power of two; schedule storage-alignment
    /// hints end up here.
    pub fn alloc_aligned(
        dtype: DType,
        shape: Vec<usize>,
        align: usize,
    ) -> Result<Self, BufferError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(BufferError::BadAlignment { align });
        }
        let align = align.max(dtype.size_in_bytes());
        let byte_len = shape.iter().product::<usize>() * dtype.size_in_bytes();
        let layout = Layout::from_size_align(byte_len.max(1), align)
            .map_err(|_| BufferError::BadAlignment { align })?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Ok(Tensor {
            dtype,
            shape,
            layout,
            ptr,
        })
    }

    /// Builds a tensor from a typed slice.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize]) -> Result<Self, BufferError> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(BufferError::LenMismatch {
                expected,
                actual: data.len(),
            });
        }
        let mut tensor = Self::alloc(T::DTYPE, shape.to_vec());
        tensor.as_mut_slice::<T>()?.copy_from_slice(data);
        Ok(tensor)
    }

    /// Builds a tensor from an ndarray, preserving its shape.
    pub fn from_ndarray<T: Element>(array: &ArrayD<T>) -> Result<Self, BufferError> {
        let data: Vec<T> = array.iter().copied().collect();
        Self::from_slice(&data, array.shape())
    }

    /// Copies the contents out as an ndarray of the tensor's shape.
    pub fn to_ndarray<T: Element>(&self) -> Result<ArrayD<T>, BufferError> {
        let data = self.to_vec::<T>()?;
        ArrayD::from_shape_vec(IxDyn(&self.shape), data).map_err(|_| BufferError::ShapeMismatch {
            shape: self.shape.clone(),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.num_elements() * self.dtype.size_in_bytes()
    }

    /// Alignment of the underlying allocation in bytes.
    pub fn align(&self) -> usize {
        self.layout.align()
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.byte_len()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.byte_len()) }
    }

    pub fn as_slice<T: Element>(&self) -> Result<&[T], BufferError> {
        self.check_dtype::<T>()?;
        let len = self.num_elements();
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const T, len) })
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T], BufferError> {
        self.check_dtype::<T>()?;
        let len = self.num_elements();
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut T, len) })
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, BufferError> {
        Ok(self.as_slice::<T>()?.to_vec())
    }

    /// Borrows the tensor as a packed-call argument.
    pub fn arg(&mut self) -> TensorArg<'_> {
        let byte_len = self.byte_len();
        TensorArg {
            dtype: self.dtype,
            shape: &self.shape,
            data: unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), byte_len) },
        }
    }

    fn check_dtype<T: Element>(&self) -> Result<(), BufferError> {
        if self.dtype != T::DTYPE {
            return Err(BufferError::DTypeMismatch {
                expected: T::DTYPE,
                actual: self.dtype,
            });
        }
        Ok(())
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        let mut copy = Self::alloc_aligned(self.dtype, self.shape.clone(), self.align())
            .unwrap_or_else(|e| unreachable!("existing layout is always valid: {e}"));
        copy.as_bytes_mut().copy_from_slice(self.as_bytes());
        copy
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("align", &self.align())
            .finish()
    }
}

/// A borrowed, mutable view of a tensor passed to a packed function.
pub struct TensorArg<'a> {
    pub dtype: DType,
    pub shape: &'a [usize],
    data: &'a mut [u8],
}

impl TensorArg<'_> {
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn as_slice<T: Element>(&self) -> Result<&[T], BufferError> {
        self.check_dtype::<T>()?;
        Ok(unsafe {
            std::slice::from_raw_parts(self.data.as_ptr() as *const T, self.num_elements())
        })
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T], BufferError> {
        self.check_dtype::<T>()?;
        let len = self.num_elements();
        Ok(unsafe { std::slice::from_raw_parts_mut(self.data.as_mut_ptr() as *mut T, len) })
    }

    /// Raw byte pointer, for handing the buffer across a C ABI.
    pub fn data_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    fn check_dtype<T: Element>(&self) -> Result<(), BufferError> {
        if self.dtype != T::DTYPE {
            return Err(BufferError::DTypeMismatch {
                expected: T::DTYPE,
                actual: self.dtype,
            });
        }
        Ok(())
    }
}
