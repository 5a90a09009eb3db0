use crate::shape::Shape;

/// All errors that can occur within Marten.
///
/// Shape problems, seed ambiguity, replay of a released graph and operators
/// without a gradient rule all surface through this one enum, so `?` works
/// uniformly from backend kernels up to `backward()`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two shapes that had to agree did not (upstream gradient vs value,
    /// reshape element counts, in-place results).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// `backward()` without an upstream gradient on a non-scalar value.
    #[error("ambiguous seed: backward() without an upstream gradient needs a single element, value has shape {shape}")]
    AmbiguousSeed { shape: Shape },

    /// A pass reached a node whose graph was released by an earlier pass.
    #[error("graph of '{op}' was already consumed by a backward pass; use keep_graph to replay it")]
    GraphConsumed { op: String },

    /// The operator has no backward rule.
    #[error("gradient of '{op}' is not supported")]
    UnsupportedGradient { op: String },

    /// A lazily evaluated value produced data of a different shape than declared.
    #[error("invalid shape: declared {declared}, data has {actual}")]
    InvalidShape { declared: Shape, actual: Shape },

    /// DType mismatch between values in a binary operation.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Dimension index out of range for the value's rank.
    #[error("dimension out of range: dim {dim} for value with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Element count mismatch when creating from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication operands whose contracted dims differ.
    #[error("matmul shape mismatch: {lhs} @ {rhs}, contracted dims must match")]
    MatmulShapeMismatch { lhs: Shape, rhs: Shape },

    /// Broadcast of two shapes yields a shape neither operand has.
    #[error("incompatible broadcast: {lhs} and {rhs} broadcast to {target}, which matches neither operand")]
    BroadcastIncompatible {
        lhs: Shape,
        rhs: Shape,
        target: Shape,
    },

    /// Gradient tracking can only be toggled on leaf values.
    #[error("requires_grad can only be changed on leaf values, '{label}' is derived")]
    NotALeaf { label: String },

    /// Another backward pass is currently propagating through this node.
    #[error("graph of '{op}' is being propagated by another backward pass")]
    GraphInUse { op: String },

    /// A graph node was built with a different number of operands and backward rules.
    #[error("graph node '{op}' has {operands} operands but {rules} backward rules")]
    ArityMismatch {
        op: String,
        operands: usize,
        rules: usize,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Marten.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
