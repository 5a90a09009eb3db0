// Demo: linear regression trained with Marten's backward engine
//
// We fit y = 2*x + 1 with a [1, 1] weight and a scalar bias. The bias is
// broadcast over the batch, so its gradient arrives already summed back to
// shape []. Parameters are leaves updated in place between passes:
//
//   1. forward:   pred = x @ w + b,  loss = mean((pred - y)²)
//   2. backward:  loss.backward() fills w.grad() and b.grad()
//   3. update:    p -= lr * p.grad(), then reset the gradient
//
// The second half differentiates twice: a retained pass leaves gradients
// that are themselves part of the graph, giving a Hessian-vector product.
//
// Run with RUST_LOG=debug to see the engine's per-pass log lines.

use marten::prelude::*;
use marten::BinaryOp;

fn sgd_step(param: &CpuValue, lr: f64) -> marten::Result<()> {
    let Some(grad) = param.grad() else {
        return Ok(());
    };
    param.apply_inline_binary(&grad, |p, g| {
        CpuBackend::binary_op(BinaryOp::Sub, p, &CpuBackend::affine(g, lr, 0.0)?)
    })?;
    param.reset_grad()
}

fn main() -> marten::Result<()> {
    env_logger::init();
    let dev = CpuDevice::seeded(7);

    println!(" Marten Linear Regression \n");

    //  Synthetic data
    let x_data: Vec<f64> = (0..10).map(|i| i as f64).collect();
    let y_data: Vec<f64> = x_data.iter().map(|&x| 2.0 * x + 1.0).collect();
    let x = CpuValue::from_f64_slice(&x_data, (10, 1), DType::F64, &dev)?;
    let y_true = CpuValue::from_f64_slice(&y_data, (10, 1), DType::F64, &dev)?;

    //  Parameters
    let w = CpuValue::randn((1, 1), DType::F64, &dev)?.requires_grad_(true)?;
    let b = CpuValue::zeros((), DType::F64, &dev)?.requires_grad_(true)?;
    let lr = 0.02;

    for epoch in 0..1000 {
        let pred = x.matmul(&w)?.add(&b)?;
        let diff = pred.sub(&y_true)?;
        let loss = diff.mul(&diff)?.mean()?;
        loss.backward()?;

        if epoch % 100 == 0 {
            log::info!("epoch {} loss {:.6}", epoch, loss.to_scalar_f64()?);
            println!(
                "Epoch {:4}: loss = {:.6}, w = {:.4}, b = {:.4}",
                epoch,
                loss.to_scalar_f64()?,
                w.to_f64_vec()?[0],
                b.to_scalar_f64()?,
            );
        }

        sgd_step(&w, lr)?;
        sgd_step(&b, lr)?;
    }

    println!(
        "\nFinal: w = {:.4} (expected 2.0), b = {:.4} (expected 1.0)",
        w.to_f64_vec()?[0],
        b.to_scalar_f64()?,
    );

    //  Hessian-vector product
    println!("\n Second-order demo ");

    let a = CpuValue::scalar(0.5, DType::F64, &dev)?.requires_grad_(true)?;
    let c = CpuValue::scalar(0.6, DType::F64, &dev)?.requires_grad_(true)?;

    // f(a, c) = a² + c·a + c²
    let f = a.mul(&a)?.add(&c.mul(&a)?)?.add(&c.mul(&c)?)?;
    f.backward_config(&BackwardConfig::new().with_keep_graph(true))?;

    let (ga, gc) = match (a.grad(), c.grad()) {
        (Some(ga), Some(gc)) => (ga, gc),
        _ => return Err(marten::Error::msg("missing first-order gradients")),
    };
    println!(
        "  ∂f/∂a = {:.1} (expected 1.6), ∂f/∂c = {:.1} (expected 1.7)",
        ga.to_scalar_f64()?,
        gc.to_scalar_f64()?,
    );

    // Differentiating 2·∂f/∂a + ∂f/∂c adds H·[2, 1] = [5, 4].
    ga.mul_scalar(2.0)?.add(&gc)?.backward()?;
    let total = |v: &CpuValue| -> marten::Result<f64> {
        v.grad()
            .ok_or_else(|| marten::Error::msg("missing gradient"))?
            .to_scalar_f64()
    };
    println!(
        "  after HVP: a.grad = {:.1} (expected 6.6), c.grad = {:.1} (expected 5.7)",
        total(&a)?,
        total(&c)?,
    );

    Ok(())
}
