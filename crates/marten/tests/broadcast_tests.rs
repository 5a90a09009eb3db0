// Integration tests for broadcasting elementwise operators
//
// The gradient of an operand that was broadcast up to the result shape is
// the upstream gradient summed back down to that operand's shape.

use marten::prelude::*;
use marten::Error;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {}",
            i,
            g,
            e
        );
    }
}

fn param(data: &[f64], shape: impl Into<Shape>, dev: &CpuDevice) -> marten::Result<CpuValue> {
    CpuValue::from_f64_slice(data, shape, DType::F64, dev)?.requires_grad_(true)
}

#[test]
fn test_scalar_broadcast_forward() -> marten::Result<()> {
    let dev = CpuDevice::new();
    let a = param(&[1.0, 2.0, 3.0, 4.0], (2, 2), &dev)?;
    let b = param(&[10.0], (), &dev)?;
    assert_eq!(a.add(&b)?.to_f64_vec()?, vec![11.0, 12.0, 13.0, 14.0]);
    assert_eq!(b.sub(&a)?.to_f64_vec()?, vec![9.0, 8.0, 7.0, 6.0]);
    Ok(())
}

#[test]
fn test_unit_matrix_operand_keeps_its_shape() -> marten::Result<()> {
    let dev = CpuDevice::new();
    let a = CpuValue::randn((2, 2), DType::F64, &dev)?.requires_grad_(true)?;
    let b = param(&[2.0], (1, 1), &dev)?;
    let c = a.add(&b)?;
    assert_eq!(c.dims(), &[2, 2]);

    c.backward_with(&CpuValue::full((2, 2), 2.0, DType::F64, &dev)?)?;

    let gb = b.grad().unwrap();
    assert_eq!(gb.dims(), &[1, 1]);
    assert!(approx_eq(gb.to_f64_vec()?[0], 8.0, 1e-12));
    Ok(())
}

#[test]
fn test_row_vector_grad_sums_over_rows() -> marten::Result<()> {
    let dev = CpuDevice::new();
    let a = param(&[0.0; 6], (2, 3), &dev)?;
    let b = param(&[1.0, 2.0, 3.0], 3, &dev)?;
    let c = a.add(&b)?;

    let g = CpuValue::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &dev)?;
    c.backward_with(&g)?;

    assert_eq!(b.grad().unwrap().dims(), &[3]);
    assert_vec_approx(&b.grad().unwrap().to_f64_vec()?, &[5.0, 7.0, 9.0], 1e-12);
    assert_vec_approx(
        &a.grad().unwrap().to_f64_vec()?,
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        1e-12,
    );
    Ok(())
}

#[test]
fn test_column_vector_grad_sums_over_columns() -> marten::Result<()> {
    let dev = CpuDevice::new();
    let a = param(&[0.0; 6], (2, 3), &dev)?;
    let b = param(&[1.0, 2.0], (2, 1), &dev)?;
    let c = a.add(&b)?;
    assert_eq!(c.to_f64_vec()?, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);

    let g = CpuValue::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &dev)?;
    c.backward_with(&g)?;

    assert_eq!(b.grad().unwrap().dims(), &[2, 1]);
    assert_vec_approx(&b.grad().unwrap().to_f64_vec()?, &[6.0, 15.0], 1e-12);
    Ok(())
}

#[test]
fn test_mul_by_scalar_operand() -> marten::Result<()> {
    let dev = CpuDevice::new();
    let a = param(&[1.0, 2.0, 3.0, 4.0], (2, 2), &dev)?;
    let s = param(&[3.0], (), &dev)?;
    a.mul(&s)?.sum()?.backward()?;
    assert!(approx_eq(s.grad().unwrap().to_scalar_f64()?, 10.0, 1e-12));
    assert_vec_approx(&a.grad().unwrap().to_f64_vec()?, &[3.0; 4], 1e-12);
    Ok(())
}

#[test]
fn test_scalar_minus_tensor() -> marten::Result<()> {
    let dev = CpuDevice::new();
    let s = param(&[1.0], (), &dev)?;
    let a = param(&[1.0, 2.0, 3.0, 4.0], (2, 2), &dev)?;
    s.sub(&a)?.sum()?.backward()?;
    assert!(approx_eq(s.grad().unwrap().to_scalar_f64()?, 4.0, 1e-12));
    assert_vec_approx(&a.grad().unwrap().to_f64_vec()?, &[-1.0; 4], 1e-12);
    Ok(())
}

#[test]
fn test_div_by_broadcast_vector() -> marten::Result<()> {
    let dev = CpuDevice::new();
    let a = param(&[1.0, 2.0, 3.0, 4.0], (2, 2), &dev)?;
    let s = param(&[2.0, 2.0], 2, &dev)?;
    a.div(&s)?.sum()?.backward()?;
    assert_vec_approx(&a.grad().unwrap().to_f64_vec()?, &[0.5; 4], 1e-12);
    // -Σ a / s² per column: -(1 + 3) / 4, -(2 + 4) / 4
    assert_vec_approx(&s.grad().unwrap().to_f64_vec()?, &[-1.0, -1.5], 1e-12);
    Ok(())
}

#[test]
fn test_mutually_broadcast_operands_are_rejected() -> marten::Result<()> {
    let dev = CpuDevice::new();
    let a = CpuValue::ones((2, 1), DType::F64, &dev)?;
    let b = CpuValue::ones((1, 3), DType::F64, &dev)?;
    assert!(matches!(
        a.add(&b),
        Err(Error::BroadcastIncompatible { .. })
    ));
    Ok(())
}

#[test]
fn test_incompatible_shapes_fail_shape_check() -> marten::Result<()> {
    let dev = CpuDevice::new();
    let a = CpuValue::ones(3, DType::F64, &dev)?;
    let b = CpuValue::ones(4, DType::F64, &dev)?;
    assert!(matches!(a.mul(&b), Err(Error::ShapeMismatch { .. })));
    Ok(())
}
