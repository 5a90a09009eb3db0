use std::fmt;

// DType: element types a backend storage may hold
//
// Gradients are only meaningful for floating-point data, so the engine
// restricts itself to the two IEEE widths every backend can offer:
//
//   F32   32-bit float, the default
//   F64   64-bit float, for high-precision work and exact tests

/// Enum of the supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    #[default]
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}
