use std::fmt;

use crate::error::{Error, Result};

// Shape: N-dimensional shape of a value
//
// A Shape is the ordered list of dimension sizes:
//   - Scalar: Shape([])          0 dimensions, 1 element
//   - Vector: Shape([5])         1 dimension, 5 elements
//   - Matrix: Shape([3, 4])      2 dimensions, 12 elements
//
// Gradients must always come back in the exact shape of the value they
// belong to, so most of the engine's invariants are statements about
// shapes: broadcast resolution on the way forward, reduction back to the
// operand shape on the way backward, and the 2-D views matmul works on.

/// N-dimensional shape of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The scalar shape `[]`.
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, 2 for matrix, etc.).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Compute the contiguous (row-major) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// The shape with its axes in reverse order.
    pub fn transposed(&self) -> Shape {
        Shape(self.0.iter().rev().copied().collect())
    }

    // Broadcasting

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// Shapes are aligned from the trailing dimension; each pair must be
    /// equal or contain a 1, and missing leading dimensions count as 1.
    ///
    ///   [3, 4] and [4]       → [3, 4]
    ///   [2, 1] and [1, 3]    → [2, 3]
    ///   [3] and [4]          → Error
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else if rd == 1 {
                result.push(ld);
            } else {
                return Err(Error::msg(format!(
                    "shapes {} and {} are not broadcast-compatible (dim {} from right: {} vs {})",
                    lhs, rhs, i, ld, rd
                )));
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Whether `self` can be broadcast up to `target` without changing `target`.
    pub fn broadcasts_to(&self, target: &Shape) -> bool {
        matches!(Shape::broadcast_shape(self, target), Ok(s) if &s == target)
    }

    /// Return the broadcast strides for this shape to match a target broadcast shape.
    ///
    /// For each dimension where self.dim[i] == 1 and target.dim[i] > 1,
    /// the stride is set to 0 (repeating the single element).
    /// Missing leading dimensions also get stride 0.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let self_dims = self.dims();
        let target_dims = target.dims();
        let self_strides = self.stride_contiguous();

        let mut result = vec![0usize; target_dims.len()];
        let offset = target_dims.len().saturating_sub(self_dims.len());

        for i in 0..self_dims.len().min(target_dims.len()) {
            if self_dims[i] == target_dims[i + offset] {
                result[i + offset] = self_strides[i];
            }
        }
        result
    }
}

// Matmul shape law
//
// Matrix products are computed on 2-D views:
//   lhs [..., k]  is viewed as [rows, k]  with rows = product of leading dims
//   rhs [k, ...]  is viewed as [k, cols]  with cols = product of trailing dims
// and the 2-D result [rows, cols] is reshaped to lhs[..-1] ++ rhs[1..].
// So (m,k)·(k,n) → (m,n), a 1-D rhs acts as a column and 1-D · 1-D is a dot
// product with scalar shape. The backward rules reuse the same views.

/// The 2-D views and result shapes of one matrix product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatmulShapes {
    pub lhs_2d: Shape,
    pub rhs_2d: Shape,
    pub out_2d: Shape,
    pub out: Shape,
}

impl MatmulShapes {
    pub fn new(lhs: &Shape, rhs: &Shape) -> Result<Self> {
        let mismatch = || Error::MatmulShapeMismatch {
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        };
        let (l, r) = (lhs.dims(), rhs.dims());
        let (Some(&k), Some(&k2)) = (l.last(), r.first()) else {
            return Err(mismatch());
        };
        if k != k2 {
            return Err(mismatch());
        }
        let rows: usize = l[..l.len() - 1].iter().product();
        let cols: usize = r[1..].iter().product();
        let out: Vec<usize> = l[..l.len() - 1].iter().chain(&r[1..]).copied().collect();
        Ok(MatmulShapes {
            lhs_2d: Shape::from((rows, k)),
            rhs_2d: Shape::from((k, cols)),
            out_2d: Shape::from((rows, cols)),
            out: Shape::new(out),
        })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
