use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

// Backend: the tensor substrate the engine differentiates over
//
// Marten never looks inside a buffer. Everything numeric (allocation,
// elementwise kernels, reductions, matrix products, sampling) is delegated
// to a Backend implementation, and the engine only composes those calls
// into forward closures and backward rules.
//
// Each backend brings its own associated types:
//   Device   an explicit context object passed into constructors
//            (no process-wide statics; RNG and handles live here)
//   Storage  an owned, immutable-by-default buffer that knows its shape
//
// Value<B> is generic over the backend, so the compiler monomorphizes the
// whole engine per substrate.

/// Identifies a compute device and carries its resources.
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device (e.g., "cpu").
    fn name(&self) -> String;
}

/// A storage buffer holding one value's data on a specific device.
pub trait BackendStorage: Clone + fmt::Debug + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// The shape the data is laid out in (contiguous, row-major).
    fn shape(&self) -> &Shape;

    /// Total number of elements.
    fn len(&self) -> usize {
        self.shape().elem_count()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations on equally shaped storages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Relu,
    Sigmoid,
}

/// Full reductions to a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    /// Euclidean (L2) norm over all elements.
    Norm,
}

/// A backend's own gradient for a leaf, read on demand.
///
/// Returns `Ok(None)` while the backend has nothing to report.
pub type NativeGradientFn<B> =
    Arc<dyn Fn() -> Result<Option<<B as Backend>::Storage>> + Send + Sync>;

/// The main Backend trait. Implementing this for a struct (e.g., CpuBackend)
/// makes that struct a complete substrate for Marten.
///
/// All operations take storage and return new storage. Shapes travel with
/// the storage, so no separate layout argument is needed.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// The storage type for this backend.
    type Storage: BackendStorage;

    //  Creation

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        Self::full(shape, 0.0, dtype, device)
    }

    /// Allocate storage filled with ones.
    fn ones(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// Create storage from a flat row-major f64 slice, converting to the target dtype.
    fn from_f64_slice(
        data: &[f64],
        shape: &Shape,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage>;

    /// Create storage with normally distributed values.
    fn rand_normal(
        shape: &Shape,
        mean: f64,
        std: f64,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage>;

    /// Sample 1.0 with probability `probs[i]`, 0.0 otherwise.
    fn bernoulli(probs: &Self::Storage, device: &Self::Device) -> Result<Self::Storage>;

    //  Element-wise ops

    /// Apply a binary op element-wise: result[i] = op(lhs[i], rhs[i]).
    /// Both storages have the same shape; broadcasting happens above this layer.
    fn binary_op(op: BinaryOp, lhs: &Self::Storage, rhs: &Self::Storage)
        -> Result<Self::Storage>;

    /// Apply a unary op element-wise: result[i] = op(input[i]).
    fn unary_op(op: UnaryOp, input: &Self::Storage) -> Result<Self::Storage>;

    /// 1.0 where `input[i] > rhs`, 0.0 elsewhere.
    fn gt_scalar(input: &Self::Storage, rhs: f64) -> Result<Self::Storage>;

    /// Affine transform: result = input * mul + add.
    fn affine(input: &Self::Storage, mul: f64, add: f64) -> Result<Self::Storage>;

    //  Reductions

    /// Reduce all elements to a scalar-shaped storage.
    fn reduce_op(op: ReduceOp, input: &Self::Storage) -> Result<Self::Storage>;

    //  Linear algebra and data movement

    /// Matrix multiply of two 2-D storages: [m, k] @ [k, n] → [m, n].
    fn matmul(lhs: &Self::Storage, rhs: &Self::Storage) -> Result<Self::Storage>;

    /// Reverse the order of all axes.
    fn transpose(input: &Self::Storage) -> Result<Self::Storage>;

    /// Reinterpret the data under a new shape with the same element count.
    fn reshape(input: &Self::Storage, shape: &Shape) -> Result<Self::Storage>;

    /// Copy data to a Vec<f64> on the host (for inspection).
    fn to_f64_vec(input: &Self::Storage) -> Result<Vec<f64>>;

    /// Repeat `input` along broadcast axes until it has shape `target`.
    ///
    /// The default implementation round-trips through the host.
    fn broadcast_to(
        input: &Self::Storage,
        target: &Shape,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let src = input.shape();
        if !src.broadcasts_to(target) {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: src.clone(),
            });
        }
        let data = Self::to_f64_vec(input)?;
        let strides = src.broadcast_strides(target);
        let out: Vec<f64> = (0..target.elem_count())
            .map(|i| data[broadcast_offset(i, target.dims(), &strides)])
            .collect();
        Self::from_f64_slice(&out, target, input.dtype(), device)
    }

    /// Sum `input` over its broadcast axes down to `target`.
    /// The inverse of `broadcast_to` for gradients.
    ///
    /// The default implementation round-trips through the host.
    fn sum_to(input: &Self::Storage, target: &Shape, device: &Self::Device) -> Result<Self::Storage> {
        let src = input.shape();
        if !target.broadcasts_to(src) {
            return Err(Error::ShapeMismatch {
                expected: src.clone(),
                got: target.clone(),
            });
        }
        let data = Self::to_f64_vec(input)?;
        let strides = target.broadcast_strides(src);
        let mut out = vec![0.0f64; target.elem_count()];
        for (i, v) in data.iter().enumerate() {
            out[broadcast_offset(i, src.dims(), &strides)] += v;
        }
        Self::from_f64_slice(&out, target, input.dtype(), device)
    }

    //  Native gradients

    /// Whether this backend tracks gradients of its own that leaves can expose.
    fn supports_native_gradient() -> bool {
        false
    }

    /// The backend's own gradient attached to `storage`, if any.
    fn native_gradient(_storage: &Self::Storage) -> Result<Option<Self::Storage>> {
        Ok(None)
    }
}

/// Map a flat index in a shape with `dims` to an offset through `strides`
/// (typically broadcast strides, where repeated axes have stride 0).
pub fn broadcast_offset(flat: usize, dims: &[usize], strides: &[usize]) -> usize {
    let mut rem = flat;
    let mut offset = 0;
    for (d, s) in dims.iter().zip(strides).rev() {
        offset += (rem % d) * s;
        rem /= d;
    }
    offset
}
