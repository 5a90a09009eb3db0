//! # marten-core
//!
//! Reverse-mode automatic differentiation over any tensor backend.
//!
//! This crate provides:
//! - [`Value`]: a lazily evaluated, differentiable handle on backend data
//! - [`Shape`]: shapes, broadcasting and the matmul shape law
//! - [`Backend`] trait: the numeric substrate the engine is generic over
//! - [`GraphNode`] / [`GradNode`]: recorded VJPs and gradient accumulators
//! - [`backward`](backprop::backward) with [`BackwardConfig`] for retained
//!   graphs and higher-order gradients
//!
//! Concrete numeric backends live in their own crates (see `marten-cpu`).

pub mod backend;
pub mod backprop;
pub mod broadcast;
pub mod dtype;
pub mod error;
pub mod grad_node;
pub mod graph;
pub mod ops;
pub mod shape;
pub mod value;

pub use backend::{Backend, BackendDevice, BackendStorage, NativeGradientFn};
pub use backprop::{is_grad_enabled, no_grad, with_grad_mode, BackwardConfig};
pub use broadcast::BroadcastPlan;
pub use dtype::DType;
pub use error::{Error, Result};
pub use grad_node::GradNode;
pub use graph::{BackwardFn, GraphNode, ValueId};
pub use shape::{MatmulShapes, Shape};
pub use value::{DataSupplier, ForwardBinaryFn, ForwardUnaryFn, Value};
