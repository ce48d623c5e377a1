use std::fmt;

/// Element types that can flow through the graph and its buffers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Width of a single element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// `(type code, bits)` pair used across the packed-call ABI:
    /// 0 = signed int, 1 = unsigned int, 2 = float.
    pub fn packed_type_codes(&self) -> (i32, i32) {
        let bits = (self.size_in_bytes() * 8) as i32;
        let code = match self {
            DType::F32 | DType::F64 => 2,
            DType::U8 | DType::U16 | DType::U32 | DType::U64 => 1,
            DType::I8 | DType::I16 | DType::I32 | DType::I64 => 0,
        };
        (code, bits)
    }
}

/// Renders the C-level spelling; both the CUDA and the host C renderer
/// emit these names verbatim.
impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DType::U8 => write!(f, "unsigned char"),
            DType::U16 => write!(f, "unsigned short"),
            DType::U32 => write!(f, "unsigned int"),
            DType::U64 => write!(f, "unsigned long"),
            DType::I8 => write!(f, "char"),
            DType::I16 => write!(f, "short"),
            DType::I32 => write!(f, "int"),
            DType::I64 => write!(f, "long"),
            DType::F32 => write!(f, "float"),
            DType::F64 => write!(f, "double"),
        }
    }
}
