use crate::backend::{Backend, NativeGradientFn};
use crate::error::Result;
use crate::value::Value;

/// Gradient accumulator attached to every value.
///
/// Contributions are summed across edges and across backward passes until
/// [`GradNode::reset`]. A backend that tracks gradients itself may install a
/// native supplier; unless disabled, readers prefer that over the
/// propagated value.
pub struct GradNode<B: Backend> {
    grad: Option<Value<B>>,
    disable_native_gradient: bool,
    native_gradient: Option<NativeGradientFn<B>>,
}

impl<B: Backend> Default for GradNode<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradNode<B> {
    pub fn new() -> Self {
        GradNode {
            grad: None,
            disable_native_gradient: false,
            native_gradient: None,
        }
    }

    /// Store `contribution`, or `current + contribution` if a gradient exists.
    ///
    /// The sum is an ordinary operator application, so it is recorded in the
    /// graph whenever grad mode is on.
    pub fn accumulate(&mut self, contribution: Value<B>) -> Result<()> {
        let next = match &self.grad {
            Some(current) => current.add(&contribution)?,
            None => contribution,
        };
        self.grad = Some(next);
        Ok(())
    }

    /// The propagated gradient, ignoring any native supplier.
    pub fn grad(&self) -> Option<Value<B>> {
        self.grad.clone()
    }

    /// The native supplier, if one is installed and not disabled.
    pub fn native_gradient(&self) -> Option<NativeGradientFn<B>> {
        if self.disable_native_gradient {
            return None;
        }
        self.native_gradient.clone()
    }

    pub fn set_native_gradient(&mut self, supplier: Option<NativeGradientFn<B>>) {
        self.native_gradient = supplier;
    }

    pub fn set_disable_native_gradient(&mut self, disable: bool) {
        self.disable_native_gradient = disable;
    }

    /// Forget the accumulated gradient.
    pub fn reset(&mut self) {
        self.grad = None;
    }

    pub(crate) fn take_grad(&mut self) -> Option<Value<B>> {
        self.grad.take()
    }
}
