//! # Marten
//!
//! Reverse-mode automatic differentiation on top of any tensor backend.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use marten::prelude::*;
//!
//! # fn main() -> marten::Result<()> {
//! let dev = CpuDevice::new();
//! let x = CpuValue::scalar(0.5, DType::F64, &dev)?.requires_grad_(true)?;
//! let y = CpuValue::scalar(0.6, DType::F64, &dev)?.requires_grad_(true)?;
//! let z = x.mul(&x)?.add(&y.mul(&x)?)?;
//! z.backward()?;
//! assert!((x.grad().unwrap().to_scalar_f64()? - 1.6).abs() < 1e-12);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `marten-core` | Value, Shape, DType, Backend trait, graph nodes, backward engine |
//! | `marten-cpu` | Reference CPU backend on dense host buffers |

/// Re-export core types.
pub use marten_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp},
    backprop::backward,
    is_grad_enabled, no_grad, with_grad_mode, BackwardConfig, BackwardFn, BroadcastPlan, DType,
    Error, GradNode, GraphNode, MatmulShapes, NativeGradientFn, Result, Shape, Value, ValueId,
};

/// Re-export CPU backend.
pub use marten_cpu::{CpuBackend, CpuData, CpuDevice, CpuStorage, CpuValue};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::{
        no_grad, Backend, BackwardConfig, CpuBackend, CpuDevice, CpuValue, DType, Shape, Value,
    };
}
