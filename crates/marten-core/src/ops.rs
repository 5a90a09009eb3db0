// Operator rule table
//
// Every differentiable operator is a forward kernel call, a shape map and
// one backward rule per operand, handed to Value::apply_unary /
// apply_binary. The rules are written with Value operators themselves, so
// when a backward pass records its work (retained graphs) the gradients
// are differentiable too.
//
// GRADIENT RULES (g = upstream gradient of the result):
//
//   add(a, b):      g,              g
//   sub(a, b):      g,              -g
//   mul(a, b):      g * b,          g * a
//   div(a, b):      g / b,          -g * a / b²
//   matmul(a, b):   g @ bᵀ,         aᵀ @ g          (on the 2-D views)
//   relu(x):        g * (x > 0)
//   sigmoid(x):     g * σ(x) * (1 - σ(x))
//   t(x):           t(g)
//   sum(x):         g expanded to x.shape
//   mean(x):        g expanded to x.shape / numel(x)
//   view(x, s):     g viewed as x.shape
//   expand(x, s):   g summed back to x.shape
//   sum_to(x, s):   g expanded to x.shape
//   bernoulli(p):   g                               (straight-through)
//   norm(x):        unsupported
//
// Elementwise binary operators go through the broadcast wrapper, which
// sums each contribution back to its operand's shape.

use crate::backend::{Backend, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
use crate::backprop::no_grad;
use crate::error::{Error, Result};
use crate::shape::{MatmulShapes, Shape};
use crate::value::Value;

fn same_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
    if lhs == rhs {
        Ok(lhs.clone())
    } else {
        Err(Error::ShapeMismatch {
            expected: lhs.clone(),
            got: rhs.clone(),
        })
    }
}

fn keep_shape(s: &Shape) -> Result<Shape> {
    Ok(s.clone())
}

fn scalar_shape(_: &Shape) -> Result<Shape> {
    Ok(Shape::scalar())
}

impl<B: Backend> Value<B> {
    fn elementwise(
        &self,
        rhs: &Value<B>,
        op: BinaryOp,
        name: &str,
        backward_this: impl Fn(&Value<B>, &[Value<B>]) -> Result<Value<B>> + Send + Sync + 'static,
        backward_other: impl Fn(&Value<B>, &[Value<B>]) -> Result<Value<B>> + Send + Sync + 'static,
    ) -> Result<Self> {
        self.apply_binary(
            rhs,
            move |l, r| B::binary_op(op, l, r),
            backward_this,
            backward_other,
            name,
            same_shape,
        )
    }

    //  Elementwise arithmetic

    pub fn add(&self, rhs: &Value<B>) -> Result<Self> {
        self.elementwise(rhs, BinaryOp::Add, "add", |g, _| Ok(g.clone()), |g, _| Ok(g.clone()))
    }

    pub fn sub(&self, rhs: &Value<B>) -> Result<Self> {
        self.elementwise(rhs, BinaryOp::Sub, "sub", |g, _| Ok(g.clone()), |g, _| g.neg())
    }

    pub fn mul(&self, rhs: &Value<B>) -> Result<Self> {
        self.elementwise(
            rhs,
            BinaryOp::Mul,
            "mul",
            |g, p| g.mul(&p[1]),
            |g, p| g.mul(&p[0]),
        )
    }

    pub fn div(&self, rhs: &Value<B>) -> Result<Self> {
        self.elementwise(
            rhs,
            BinaryOp::Div,
            "div",
            |g, p| g.div(&p[1]),
            |g, p| g.mul(&p[0])?.div(&p[1].mul(&p[1])?)?.neg(),
        )
    }

    pub fn neg(&self) -> Result<Self> {
        self.apply_unary(
            |s| B::unary_op(UnaryOp::Neg, s),
            |g, _| g.neg(),
            "neg",
            keep_shape,
        )
    }

    //  Scalar arithmetic

    pub fn add_scalar(&self, k: f64) -> Result<Self> {
        self.apply_unary(
            move |s| B::affine(s, 1.0, k),
            |g, _| Ok(g.clone()),
            "add_scalar",
            keep_shape,
        )
    }

    pub fn sub_scalar(&self, k: f64) -> Result<Self> {
        self.add_scalar(-k)
    }

    pub fn mul_scalar(&self, k: f64) -> Result<Self> {
        self.apply_unary(
            move |s| B::affine(s, k, 0.0),
            move |g, _| g.mul_scalar(k),
            "mul_scalar",
            keep_shape,
        )
    }

    pub fn div_scalar(&self, k: f64) -> Result<Self> {
        self.mul_scalar(1.0 / k)
    }

    //  Activations

    pub fn relu(&self) -> Result<Self> {
        self.apply_unary(
            |s| B::unary_op(UnaryOp::Relu, s),
            |g, p| g.mul(&p[0].gt_scalar(0.0)?),
            "relu",
            keep_shape,
        )
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.apply_unary(
            |s| B::unary_op(UnaryOp::Sigmoid, s),
            |g, p| {
                let s = p[0].sigmoid()?;
                g.mul(&s.mul(&s.neg()?.add_scalar(1.0)?)?)
            },
            "sigmoid",
            keep_shape,
        )
    }

    /// 1.0 where the element is greater than `k`, 0.0 elsewhere.
    ///
    /// Masks are not differentiable: the result never requires grad.
    pub fn gt_scalar(&self, k: f64) -> Result<Self> {
        no_grad(|| {
            self.apply_unary(
                move |s| B::gt_scalar(s, k),
                |_, _| {
                    Err(Error::UnsupportedGradient {
                        op: "gt_scalar".to_string(),
                    })
                },
                "gt_scalar",
                keep_shape,
            )
        })
    }

    //  Linear algebra

    /// Matrix product on the 2-D views described by [`MatmulShapes`].
    pub fn matmul(&self, rhs: &Value<B>) -> Result<Self> {
        let shapes = MatmulShapes::new(self.shape(), rhs.shape())?;
        let fwd = shapes.clone();
        let (this, other) = (shapes.clone(), shapes.clone());
        self.apply_binary_exact(
            rhs,
            move |a, b| {
                let a = B::reshape(a, &fwd.lhs_2d)?;
                let b = B::reshape(b, &fwd.rhs_2d)?;
                let out = B::matmul(&a, &b)?;
                B::reshape(&out, &fwd.out)
            },
            move |g, p| {
                let g = g.reshape(&this.out_2d)?;
                let b_t = p[1].reshape(&this.rhs_2d)?.t()?;
                g.matmul(&b_t)?.reshape(p[0].shape())
            },
            move |g, p| {
                let g = g.reshape(&other.out_2d)?;
                let a_t = p[0].reshape(&other.lhs_2d)?.t()?;
                a_t.matmul(&g)?.reshape(p[1].shape())
            },
            "matmul",
            |_, _| Ok(shapes.out.clone()),
        )
    }

    /// Reverse the order of all axes (the matrix transpose for 2-D values).
    pub fn t(&self) -> Result<Self> {
        self.apply_unary(
            B::transpose,
            |g, _| g.t(),
            "transpose",
            |s| Ok(s.transposed()),
        )
    }

    pub fn transpose(&self) -> Result<Self> {
        self.t()
    }

    //  Reductions

    /// Sum of all elements, as a scalar.
    pub fn sum(&self) -> Result<Self> {
        self.apply_unary(
            |s| B::reduce_op(ReduceOp::Sum, s),
            |g, p| g.expand(p[0].shape()),
            "sum",
            scalar_shape,
        )
    }

    /// Mean of all elements, as a scalar.
    pub fn mean(&self) -> Result<Self> {
        self.apply_unary(
            |s| B::reduce_op(ReduceOp::Mean, s),
            |g, p| g.expand(p[0].shape())?.div_scalar(p[0].elem_count() as f64),
            "mean",
            scalar_shape,
        )
    }

    /// Euclidean norm of all elements. Has no backward rule.
    pub fn norm(&self) -> Result<Self> {
        self.apply_unary(
            |s| B::reduce_op(ReduceOp::Norm, s),
            |_, _| {
                Err(Error::UnsupportedGradient {
                    op: "norm".to_string(),
                })
            },
            "norm",
            scalar_shape,
        )
    }

    //  Shape manipulation

    /// Reinterpret the elements under a new shape with the same element count.
    pub fn view(&self, shape: impl Into<Shape>) -> Result<Self> {
        let target = shape.into();
        if target.elem_count() != self.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: target,
            });
        }
        let fwd = target.clone();
        self.apply_unary(
            move |s| B::reshape(s, &fwd),
            |g, p| g.view(p[0].shape()),
            "view",
            |_| Ok(target),
        )
    }

    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        self.view(shape)
    }

    /// View as a 1-D value of `elem_count()` elements.
    pub fn flatten(&self) -> Result<Self> {
        self.view(self.elem_count())
    }

    /// Repeat along broadcast axes up to `shape`.
    pub fn expand(&self, shape: impl Into<Shape>) -> Result<Self> {
        let target = shape.into();
        if !self.shape().broadcasts_to(&target) {
            return Err(Error::ShapeMismatch {
                expected: target,
                got: self.shape().clone(),
            });
        }
        let (fwd, device) = (target.clone(), self.device().clone());
        self.apply_unary(
            move |s| B::broadcast_to(s, &fwd, &device),
            |g, p| g.sum_to(p[0].shape()),
            "expand",
            |_| Ok(target),
        )
    }

    /// Sum over broadcast axes down to `shape`, the adjoint of [`Value::expand`].
    pub fn sum_to(&self, shape: impl Into<Shape>) -> Result<Self> {
        let target = shape.into();
        if !target.broadcasts_to(self.shape()) {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: target,
            });
        }
        let (fwd, device) = (target.clone(), self.device().clone());
        self.apply_unary(
            move |s| B::sum_to(s, &fwd, &device),
            |g, p| g.expand(p[0].shape()),
            "sum_to",
            |_| Ok(target),
        )
    }

    //  Sampling

    /// Sample 1.0 with probability given by each element, 0.0 otherwise.
    /// Gradients pass straight through.
    pub fn bernoulli(&self) -> Result<Self> {
        let device = self.device().clone();
        self.apply_unary(
            move |s| B::bernoulli(s, &device),
            |g, _| Ok(g.clone()),
            "bernoulli",
            keep_shape,
        )
    }

    //  In-place updates

    /// `self *= rhs`, broadcasting `rhs` to this value's shape.
    pub fn mul_(&self, rhs: &Value<B>) -> Result<Self> {
        let device = self.device();
        let target = self.shape();
        self.apply_inline_binary(rhs, |l, r| {
            if r.shape() == target {
                B::binary_op(BinaryOp::Mul, l, r)
            } else {
                B::binary_op(BinaryOp::Mul, l, &B::broadcast_to(r, target, device)?)
            }
        })
    }

    /// Overwrite every element with `val`.
    pub fn fill_(&self, val: f64) -> Result<Self> {
        let device = self.device();
        self.apply_inline_unary(|s| B::full(s.shape(), val, s.dtype(), device))
    }

    pub fn zero_(&self) -> Result<Self> {
        self.fill_(0.0)
    }

    /// Overwrite with samples from N(mean, std²).
    pub fn normal_(&self, mean: f64, std: f64) -> Result<Self> {
        let device = self.device();
        self.apply_inline_unary(|s| B::rand_normal(s.shape(), mean, std, s.dtype(), device))
    }
}
