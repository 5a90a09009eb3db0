// CPU Backend: dense host buffers for exercising the engine
//
// A straightforward implementation of the Backend trait on contiguous,
// row-major Vec<f32> / Vec<f64> buffers. It exists so that the autodiff
// engine can be run and tested without any accelerator; it favours being
// obviously correct over being fast.
//
// ARCHITECTURE:
// - CpuDevice carries the random number generator used by sampling ops.
//   Devices are cheap to clone and clones share one generator, so a
//   seeded device gives reproducible bernoulli / normal draws.
// - CpuStorage is a shape plus an enum over the two float widths.
// - Elementwise kernels run through rayon's parallel iterators; matmul
//   parallelises over output rows.
// - Arithmetic on F32 storage is carried out in f64 and rounded back.
//
// USAGE:
//   let dev = CpuDevice::seeded(7);
//   let x = CpuValue::from_f64_slice(&[1.0, 2.0], 2, DType::F32, &dev)?;

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use marten_core::backend::{
    broadcast_offset, Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp,
};
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::shape::Shape;

// CpuDevice

/// The host, plus the generator sampling ops draw from.
#[derive(Clone)]
pub struct CpuDevice {
    rng: Arc<Mutex<StdRng>>,
    seed: Option<u64>,
}

impl CpuDevice {
    /// A device whose generator is seeded from system entropy.
    pub fn new() -> Self {
        CpuDevice {
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            seed: None,
        }
    }

    /// A device with a deterministic generator.
    pub fn seeded(seed: u64) -> Self {
        CpuDevice {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
            seed: Some(seed),
        }
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> Result<T> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| Error::msg("cpu rng lock poisoned"))?;
        Ok(f(&mut *rng))
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.seed {
            Some(seed) => write!(f, "CpuDevice(seed={})", seed),
            None => write!(f, "CpuDevice"),
        }
    }
}

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

// CpuStorage

/// The element buffer, one variant per dtype.
#[derive(Clone, Debug, PartialEq)]
pub enum CpuData {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl CpuData {
    fn len(&self) -> usize {
        match self {
            CpuData::F32(v) => v.len(),
            CpuData::F64(v) => v.len(),
        }
    }
}

/// Contiguous row-major data with its shape.
#[derive(Clone, Debug, PartialEq)]
pub struct CpuStorage {
    shape: Shape,
    data: CpuData,
}

impl CpuStorage {
    /// Wrap a buffer; its length must match the shape.
    pub fn new(data: CpuData, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(CpuStorage { shape, data })
    }

    fn from_f64(values: Vec<f64>, shape: Shape, dtype: DType) -> Self {
        let data = match dtype {
            DType::F32 => CpuData::F32(values.into_iter().map(|v| v as f32).collect()),
            DType::F64 => CpuData::F64(values),
        };
        CpuStorage { shape, data }
    }

    pub fn data(&self) -> &CpuData {
        &self.data
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.data {
            CpuData::F32(v) => v.iter().map(|&x| x as f64).collect(),
            CpuData::F64(v) => v.clone(),
        }
    }

    fn map(&self, f: impl Fn(f64) -> f64 + Send + Sync) -> Self {
        let data = match &self.data {
            CpuData::F32(v) => CpuData::F32(v.par_iter().map(|&x| f(x as f64) as f32).collect()),
            CpuData::F64(v) => CpuData::F64(v.par_iter().map(|&x| f(x)).collect()),
        };
        CpuStorage {
            shape: self.shape.clone(),
            data,
        }
    }

    fn zip_map(&self, rhs: &CpuStorage, f: impl Fn(f64, f64) -> f64 + Send + Sync) -> Result<Self> {
        if self.shape != rhs.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: rhs.shape.clone(),
            });
        }
        let data = match (&self.data, &rhs.data) {
            (CpuData::F32(a), CpuData::F32(b)) => CpuData::F32(
                a.par_iter()
                    .zip(b.par_iter())
                    .map(|(&x, &y)| f(x as f64, y as f64) as f32)
                    .collect(),
            ),
            (CpuData::F64(a), CpuData::F64(b)) => CpuData::F64(
                a.par_iter()
                    .zip(b.par_iter())
                    .map(|(&x, &y)| f(x, y))
                    .collect(),
            ),
            _ => {
                return Err(Error::DTypeMismatch {
                    expected: self.dtype(),
                    got: rhs.dtype(),
                })
            }
        };
        Ok(CpuStorage {
            shape: self.shape.clone(),
            data,
        })
    }

    fn scalar(&self, val: f64) -> Self {
        CpuStorage::from_f64(vec![val], Shape::scalar(), self.dtype())
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self.data {
            CpuData::F32(_) => DType::F32,
            CpuData::F64(_) => DType::F64,
        }
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }
}

// CpuBackend

/// The CPU backend.
#[derive(Clone, Debug)]
pub struct CpuBackend;

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    // ---- Creation ----

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(
            vec![val; shape.elem_count()],
            shape.clone(),
            dtype,
        ))
    }

    fn from_f64_slice(
        data: &[f64],
        shape: &Shape,
        dtype: DType,
        _device: &CpuDevice,
    ) -> Result<CpuStorage> {
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        Ok(CpuStorage::from_f64(data.to_vec(), shape.clone(), dtype))
    }

    fn rand_normal(
        shape: &Shape,
        mean: f64,
        std: f64,
        dtype: DType,
        device: &CpuDevice,
    ) -> Result<CpuStorage> {
        let normal = Normal::new(mean, std)
            .map_err(|e| Error::msg(format!("invalid normal distribution: {e}")))?;
        let n = shape.elem_count();
        let values: Vec<f64> = device.with_rng(|rng| (0..n).map(|_| normal.sample(rng)).collect())?;
        Ok(CpuStorage::from_f64(values, shape.clone(), dtype))
    }

    fn bernoulli(probs: &CpuStorage, device: &CpuDevice) -> Result<CpuStorage> {
        let p = probs.to_f64_vec();
        if let Some(bad) = p.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(Error::msg(format!(
                "bernoulli probabilities must lie in [0, 1], got {bad}"
            )));
        }
        let values: Vec<f64> = device.with_rng(|rng| {
            p.iter()
                .map(|&pi| if rng.gen::<f64>() < pi { 1.0 } else { 0.0 })
                .collect()
        })?;
        Ok(CpuStorage::from_f64(values, probs.shape.clone(), probs.dtype()))
    }

    // ---- Element-wise ----

    fn binary_op(op: BinaryOp, lhs: &CpuStorage, rhs: &CpuStorage) -> Result<CpuStorage> {
        match op {
            BinaryOp::Add => lhs.zip_map(rhs, |a, b| a + b),
            BinaryOp::Sub => lhs.zip_map(rhs, |a, b| a - b),
            BinaryOp::Mul => lhs.zip_map(rhs, |a, b| a * b),
            BinaryOp::Div => lhs.zip_map(rhs, |a, b| a / b),
        }
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage) -> Result<CpuStorage> {
        Ok(match op {
            UnaryOp::Neg => input.map(|x| -x),
            UnaryOp::Relu => input.map(|x| x.max(0.0)),
            UnaryOp::Sigmoid => input.map(sigmoid),
        })
    }

    fn gt_scalar(input: &CpuStorage, rhs: f64) -> Result<CpuStorage> {
        Ok(input.map(|x| if x > rhs { 1.0 } else { 0.0 }))
    }

    fn affine(input: &CpuStorage, mul: f64, add: f64) -> Result<CpuStorage> {
        Ok(input.map(|x| x * mul + add))
    }

    // ---- Reductions ----

    fn reduce_op(op: ReduceOp, input: &CpuStorage) -> Result<CpuStorage> {
        let values = input.to_f64_vec();
        let n = values.len();
        let result = match op {
            ReduceOp::Sum => values.par_iter().sum::<f64>(),
            ReduceOp::Mean => {
                if n == 0 {
                    return Err(Error::msg("mean of an empty value"));
                }
                values.par_iter().sum::<f64>() / n as f64
            }
            ReduceOp::Norm => values.par_iter().map(|x| x * x).sum::<f64>().sqrt(),
        };
        Ok(input.scalar(result))
    }

    // ---- Linear algebra / data movement ----

    fn matmul(lhs: &CpuStorage, rhs: &CpuStorage) -> Result<CpuStorage> {
        let (&[m, k], &[k2, n]) = (lhs.shape.dims(), rhs.shape.dims()) else {
            return Err(Error::msg(format!(
                "cpu matmul expects 2-D operands, got {} and {}",
                lhs.shape, rhs.shape
            )));
        };
        if k != k2 {
            return Err(Error::MatmulShapeMismatch {
                lhs: lhs.shape.clone(),
                rhs: rhs.shape.clone(),
            });
        }
        if lhs.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: lhs.dtype(),
                got: rhs.dtype(),
            });
        }
        let a = lhs.to_f64_vec();
        let b = rhs.to_f64_vec();
        let mut out = vec![0.0f64; m * n];
        if n > 0 {
            out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
                for p in 0..k {
                    let av = a[i * k + p];
                    let b_row = &b[p * n..(p + 1) * n];
                    for (o, &bv) in row.iter_mut().zip(b_row) {
                        *o += av * bv;
                    }
                }
            });
        }
        Ok(CpuStorage::from_f64(out, Shape::from((m, n)), lhs.dtype()))
    }

    fn transpose(input: &CpuStorage) -> Result<CpuStorage> {
        let out_shape = input.shape.transposed();
        // Output axis j walks source axis (rank - 1 - j).
        let strides: Vec<usize> = input.shape.stride_contiguous().into_iter().rev().collect();
        let values = input.to_f64_vec();
        let out = (0..values.len())
            .map(|i| values[broadcast_offset(i, out_shape.dims(), &strides)])
            .collect();
        Ok(CpuStorage::from_f64(out, out_shape, input.dtype()))
    }

    fn reshape(input: &CpuStorage, shape: &Shape) -> Result<CpuStorage> {
        if shape.elem_count() != input.shape.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: input.shape.clone(),
                got: shape.clone(),
            });
        }
        Ok(CpuStorage {
            shape: shape.clone(),
            data: input.data.clone(),
        })
    }

    fn to_f64_vec(input: &CpuStorage) -> Result<Vec<f64>> {
        Ok(input.to_f64_vec())
    }
}

/// Convenience type alias for values on the CPU backend.
pub type CpuValue = marten_core::Value<CpuBackend>;

#[cfg(test)]
mod tests;
