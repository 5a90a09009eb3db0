use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use marten_core::{no_grad, BackwardConfig, Error, Result, Shape};

use super::*;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!(approx_eq(*g, *e, tol), "index {}: got {} expected {}", i, g, e);
    }
}

fn storage(data: &[f64], shape: impl Into<Shape>) -> CpuStorage {
    CpuStorage::from_f64(data.to_vec(), shape.into(), DType::F64)
}

// Kernels

#[test]
fn test_binary_requires_equal_shapes() {
    let a = storage(&[1.0, 2.0], 2);
    let b = storage(&[1.0, 2.0, 3.0], 3);
    assert!(matches!(
        CpuBackend::binary_op(BinaryOp::Add, &a, &b),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_f32_storage_round_trips_through_kernels() -> Result<()> {
    let dev = CpuDevice::new();
    let a = CpuBackend::from_f64_slice(&[1.5, -2.0], &Shape::from(2), DType::F32, &dev)?;
    assert_eq!(a.dtype(), DType::F32);
    let r = CpuBackend::unary_op(UnaryOp::Relu, &a)?;
    assert_eq!(r.data(), &CpuData::F32(vec![1.5, 0.0]));
    Ok(())
}

#[test]
fn test_matmul_2x3_3x2() -> Result<()> {
    let a = storage(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
    let b = storage(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], (3, 2));
    let c = CpuBackend::matmul(&a, &b)?;
    assert_eq!(c.shape(), &Shape::from((2, 2)));
    assert_vec_approx(&c.to_f64_vec(), &[58.0, 64.0, 139.0, 154.0], 1e-12);
    Ok(())
}

#[test]
fn test_matmul_inner_mismatch() {
    let a = storage(&[1.0; 6], (2, 3));
    let err = CpuBackend::matmul(&a, &a).unwrap_err();
    assert!(matches!(err, Error::MatmulShapeMismatch { .. }));
}

#[test]
fn test_transpose_reverses_axes() -> Result<()> {
    let a = storage(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
    let t = CpuBackend::transpose(&a)?;
    assert_eq!(t.shape(), &Shape::from((3, 2)));
    assert_eq!(t.to_f64_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

    let cube = storage(&(0..8).map(|i| i as f64).collect::<Vec<_>>(), (2, 2, 2));
    let back = CpuBackend::transpose(&CpuBackend::transpose(&cube)?)?;
    assert_eq!(back, cube);
    Ok(())
}

#[test]
fn test_reductions() -> Result<()> {
    let a = storage(&[3.0, 4.0], 2);
    let sum = CpuBackend::reduce_op(ReduceOp::Sum, &a)?;
    assert_eq!(sum.shape(), &Shape::scalar());
    assert_eq!(sum.to_f64_vec(), vec![7.0]);
    assert_eq!(CpuBackend::reduce_op(ReduceOp::Mean, &a)?.to_f64_vec(), vec![3.5]);
    assert_eq!(CpuBackend::reduce_op(ReduceOp::Norm, &a)?.to_f64_vec(), vec![5.0]);
    Ok(())
}

#[test]
fn test_broadcast_to_and_sum_to_are_adjoint() -> Result<()> {
    let dev = CpuDevice::new();
    let row = storage(&[1.0, 2.0, 3.0], (1, 3));
    let grown = CpuBackend::broadcast_to(&row, &Shape::from((2, 3)), &dev)?;
    assert_eq!(grown.to_f64_vec(), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);

    let summed = CpuBackend::sum_to(&grown, &Shape::from((1, 3)), &dev)?;
    assert_eq!(summed.to_f64_vec(), vec![2.0, 4.0, 6.0]);

    let total = CpuBackend::sum_to(&grown, &Shape::scalar(), &dev)?;
    assert_eq!(total.to_f64_vec(), vec![12.0]);
    Ok(())
}

#[test]
fn test_seeded_devices_sample_identically() -> Result<()> {
    let shape = Shape::from(16);
    let a = CpuBackend::rand_normal(&shape, 0.0, 1.0, DType::F64, &CpuDevice::seeded(3))?;
    let b = CpuBackend::rand_normal(&shape, 0.0, 1.0, DType::F64, &CpuDevice::seeded(3))?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_bernoulli_extremes_and_range() -> Result<()> {
    let dev = CpuDevice::seeded(11);
    let p = storage(&[0.0, 1.0, 0.0, 1.0], 4);
    let s = CpuBackend::bernoulli(&p, &dev)?;
    assert_eq!(s.to_f64_vec(), vec![0.0, 1.0, 0.0, 1.0]);

    let bad = storage(&[1.5], 1);
    assert!(CpuBackend::bernoulli(&bad, &dev).is_err());
    Ok(())
}

// Values on the CPU backend

#[test]
fn test_leaf_is_evaluated_once() -> Result<()> {
    let dev = CpuDevice::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let x = CpuValue::create_leaf(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(storage(&[1.0, 2.0], 2))
        },
        2,
        DType::F64,
        &dev,
        false,
        false,
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let y = x.mul_scalar(3.0)?;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(y.to_f64_vec()?, vec![3.0, 6.0]);
    assert_eq!(x.to_f64_vec()?, vec![1.0, 2.0]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_leaf_with_wrong_shape_fails_on_access() {
    let dev = CpuDevice::new();
    let x = CpuValue::create_leaf(
        || Ok(storage(&[1.0, 2.0, 3.0], 3)),
        (2, 2),
        DType::F64,
        &dev,
        true,
        false,
    );
    assert_eq!(x.dims(), &[2, 2]);
    assert!(matches!(x.to_f64_vec(), Err(Error::InvalidShape { .. })));
}

#[test]
fn test_requires_grad_only_on_leaves() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::ones(2, DType::F64, &dev)?.requires_grad_(true)?;
    let y = x.add_scalar(1.0)?;
    assert!(y.requires_grad());
    assert!(matches!(y.requires_grad_(false), Err(Error::NotALeaf { .. })));
    x.requires_grad_(false)?;
    assert!(!x.requires_grad());
    Ok(())
}

#[test]
fn test_no_grad_results_are_detached() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::ones(2, DType::F64, &dev)?.requires_grad_(true)?;
    let y = no_grad(|| x.mul_scalar(2.0))?;
    assert!(!y.requires_grad());
    assert!(y.is_leaf());
    Ok(())
}

#[test]
fn test_backward_without_grad_is_a_no_op() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::ones(2, DType::F64, &dev)?.requires_grad_(true)?;
    let y = no_grad(|| x.mul_scalar(2.0))?;
    let s = y.sum()?;
    assert!(!s.requires_grad());
    s.backward()?;
    assert!(x.grad().is_none());
    assert!(s.grad().is_none());
    Ok(())
}

#[test]
fn test_second_pass_on_released_graph_fails() -> Result<()> {
    init_logger();
    let dev = CpuDevice::new();
    let x = CpuValue::scalar(2.0, DType::F64, &dev)?.requires_grad_(true)?;
    let y = x.mul(&x)?;
    y.backward()?;
    assert_eq!(x.grad().unwrap().to_scalar_f64()?, 4.0);
    match y.backward() {
        Err(Error::GraphConsumed { op }) => assert_eq!(op, "mul"),
        other => panic!("expected GraphConsumed, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_failed_pass_keeps_partial_state() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::from_f64_slice(&[3.0, 4.0], 2, DType::F64, &dev)?.requires_grad_(true)?;
    let y = x.norm()?.add(&x.sum()?)?;
    assert!(matches!(y.backward(), Err(Error::UnsupportedGradient { .. })));
    // The pass stopped at norm, before x was reached.
    assert!(x.grad().is_none());
    // add was already propagated and released; it is not rolled back.
    assert!(matches!(y.backward(), Err(Error::GraphConsumed { .. })));
    Ok(())
}

#[test]
fn test_failed_retained_pass_can_be_replayed() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::from_f64_slice(&[3.0, 4.0], 2, DType::F64, &dev)?.requires_grad_(true)?;
    let y = x.norm()?;
    let config = BackwardConfig::new().with_keep_graph(true);
    for _ in 0..2 {
        match y.backward_config(&config) {
            Err(Error::UnsupportedGradient { op }) => assert_eq!(op, "norm"),
            other => panic!("expected UnsupportedGradient, got {:?}", other),
        }
    }
    Ok(())
}

#[test]
fn test_native_gradient_preferred_unless_disabled() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::from_f64_slice(&[1.0, 2.0], 2, DType::F64, &dev)?.requires_grad_(true)?;
    x.sum()?.backward()?;
    assert!(!x.grad().unwrap().is_native_gradient());

    x.set_native_gradient_supplier(|| Ok(Some(storage(&[9.0, 9.0], 2))))?;
    let g = x.grad().unwrap();
    assert!(g.is_native_gradient());
    assert_eq!(g.to_f64_vec()?, vec![9.0, 9.0]);

    x.set_disable_native_gradient(true)?;
    let g = x.grad().unwrap();
    assert!(!g.is_native_gradient());
    assert_eq!(g.to_f64_vec()?, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn test_failing_native_supplier_falls_back() -> Result<()> {
    init_logger();
    let dev = CpuDevice::new();
    let x = CpuValue::scalar(1.0, DType::F64, &dev)?.requires_grad_(true)?;
    x.mul_scalar(5.0)?.backward()?;
    x.set_native_gradient_supplier(|| Err(Error::msg("device lost")))?;
    assert_eq!(x.grad().unwrap().to_scalar_f64()?, 5.0);
    Ok(())
}

#[test]
fn test_reset_grad() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::scalar(1.0, DType::F64, &dev)?.requires_grad_(true)?;
    let y = x.mul_scalar(3.0)?;
    let config = BackwardConfig::new().with_keep_graph(true);
    y.backward_config(&config)?;
    y.backward_config(&config)?;
    assert_eq!(x.grad().unwrap().to_scalar_f64()?, 6.0);
    x.reset_grad()?;
    assert!(x.grad().is_none());
    y.backward_config(&config)?;
    assert_eq!(x.grad().unwrap().to_scalar_f64()?, 3.0);
    Ok(())
}

#[test]
fn test_inline_ops() -> Result<()> {
    let dev = CpuDevice::seeded(5);
    let x = CpuValue::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, &dev)?;
    let two = CpuValue::scalar(2.0, DType::F64, &dev)?;
    x.mul_(&two)?;
    assert_eq!(x.to_f64_vec()?, vec![2.0, 4.0, 6.0, 8.0]);
    x.mul_(&x)?;
    assert_eq!(x.to_f64_vec()?, vec![4.0, 16.0, 36.0, 64.0]);
    x.fill_(7.0)?;
    assert_eq!(x.to_f64_vec()?, vec![7.0; 4]);
    x.zero_()?;
    assert_eq!(x.to_f64_vec()?, vec![0.0; 4]);
    x.normal_(10.0, 0.0)?;
    assert_eq!(x.to_f64_vec()?, vec![10.0; 4]);
    assert_eq!(x.dims(), &[2, 2]);
    Ok(())
}

#[test]
fn test_detach_copies_data_without_graph() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::scalar(2.0, DType::F64, &dev)?.requires_grad_(true)?;
    let y = x.mul_scalar(3.0)?;
    let d = y.detach()?;
    assert!(d.is_leaf());
    assert!(!d.requires_grad());
    assert_eq!(d.to_scalar_f64()?, 6.0);
    Ok(())
}

#[test]
fn test_dtype_mismatch_in_binary_op() -> Result<()> {
    let dev = CpuDevice::new();
    let a = CpuValue::ones(2, DType::F32, &dev)?;
    let b = CpuValue::ones(2, DType::F64, &dev)?;
    assert!(matches!(a.add(&b), Err(Error::DTypeMismatch { .. })));
    Ok(())
}

#[test]
fn test_upstream_shape_must_match() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::ones((2, 2), DType::F64, &dev)?.requires_grad_(true)?;
    let y = x.mul_scalar(2.0)?;
    let g = CpuValue::ones(4, DType::F64, &dev)?;
    assert!(matches!(y.backward_with(&g), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(y.backward(), Err(Error::AmbiguousSeed { .. })));
    Ok(())
}

#[test]
fn test_graph_node_checks_arity() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::ones(2, DType::F64, &dev)?;
    let rule: marten_core::BackwardFn<CpuBackend> = Arc::new(|g: &CpuValue, _: &[CpuValue]| Ok(g.clone()));
    let err = marten_core::GraphNode::new("pair", vec![x.clone(), x], vec![rule]);
    assert!(matches!(err, Err(Error::ArityMismatch { .. })));
    Ok(())
}

#[test]
fn test_graph_node_rejects_misshapen_contribution() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::ones((2, 2), DType::F64, &dev)?;
    let rule: marten_core::BackwardFn<CpuBackend> = Arc::new(|g: &CpuValue, _: &[CpuValue]| g.sum());
    let node = marten_core::GraphNode::new("bad", vec![x], vec![rule])?;
    assert_eq!(node.op(), "bad");
    assert_eq!(node.arity(), 1);

    let g = CpuValue::ones((2, 2), DType::F64, &dev)?;
    assert!(matches!(node.vjp(0, &g), Err(Error::ShapeMismatch { .. })));
    Ok(())
}

// Deep graphs and teardown

#[test]
fn test_long_chain_evaluates_iteratively() -> Result<()> {
    let dev = CpuDevice::new();
    let mut y = CpuValue::scalar(0.0, DType::F64, &dev)?;
    for _ in 0..20_000 {
        y = y.add_scalar(1.0)?;
    }
    assert_eq!(y.to_scalar_f64()?, 20_000.0);
    Ok(())
}

#[test]
fn test_long_chain_backward() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::scalar(1.0, DType::F64, &dev)?.requires_grad_(true)?;
    let mut y = x.clone();
    for _ in 0..10_000 {
        y = y.mul_scalar(1.0)?.add_scalar(0.5)?;
    }
    y.backward()?;
    assert_eq!(y.to_scalar_f64()?, 5_001.0);
    assert_eq!(x.grad().unwrap().to_scalar_f64()?, 1.0);
    Ok(())
}

#[test]
fn test_unevaluated_long_chain_drops() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::scalar(1.0, DType::F64, &dev)?.requires_grad_(true)?;
    let mut y = x.clone();
    for _ in 0..50_000 {
        y = y.add_scalar(1.0)?;
    }
    drop(y);
    assert!(x.grad().is_none());
    Ok(())
}

fn leaf_holding(sentinel: &Arc<()>, dev: &CpuDevice) -> Result<CpuValue> {
    let x = CpuValue::scalar(3.0, DType::F64, dev)?.requires_grad_(true)?;
    let held = Arc::clone(sentinel);
    x.set_native_gradient_supplier(move || {
        let _ = Arc::strong_count(&held);
        Ok(None)
    })?;
    Ok(x)
}

#[test]
fn test_released_pass_frees_leaves() -> Result<()> {
    let dev = CpuDevice::new();
    let sentinel = Arc::new(());
    let x = leaf_holding(&sentinel, &dev)?;
    x.mul(&x)?.backward()?;
    assert_eq!(Arc::strong_count(&sentinel), 2);
    drop(x);
    assert_eq!(Arc::strong_count(&sentinel), 1);
    Ok(())
}

#[test]
fn test_retained_gradient_released_by_reset() -> Result<()> {
    let dev = CpuDevice::new();
    let sentinel = Arc::new(());
    let x = leaf_holding(&sentinel, &dev)?;
    x.mul(&x)?
        .backward_config(&BackwardConfig::new().with_keep_graph(true))?;
    assert!(x.grad().unwrap().requires_grad());
    x.reset_grad()?;
    drop(x);
    assert_eq!(Arc::strong_count(&sentinel), 1);
    Ok(())
}

#[test]
fn test_retained_long_chain_drops() -> Result<()> {
    let dev = CpuDevice::new();
    let sentinel = Arc::new(());
    let x = leaf_holding(&sentinel, &dev)?;
    let mut y = x.clone();
    for _ in 0..20_000 {
        y = y.add_scalar(1.0)?;
    }
    y.backward_config(&BackwardConfig::new().with_keep_graph(true))?;
    drop(y);
    drop(x);
    assert_eq!(Arc::strong_count(&sentinel), 1);
    Ok(())
}

#[test]
fn test_nested_pass_over_propagating_node_fails() -> Result<()> {
    let dev = CpuDevice::new();
    let x = CpuValue::scalar(1.0, DType::F64, &dev)?.requires_grad_(true)?;
    let y = x.mul_scalar(2.0)?;
    // The backward rule of z starts a second pass while y is Propagating.
    let z = y.apply_unary(
        |s| Ok(s.clone()),
        |g, p| {
            p[0].backward()?;
            Ok(g.clone())
        },
        "nested",
        |s| Ok(s.clone()),
    )?;
    match z.backward() {
        Err(Error::GraphInUse { op }) => assert_eq!(op, "mul_scalar"),
        other => panic!("expected GraphInUse, got {:?}", other),
    }
    // Nothing was released: the inner graph is replayable on its own.
    y.backward()?;
    assert_eq!(x.grad().unwrap().to_scalar_f64()?, 2.0);
    Ok(())
}
