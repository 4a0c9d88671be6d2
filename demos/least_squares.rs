//! Fits a linear layer `y = W x + b` to a random teacher layer with Scion.
//!
//! Run with `RUST_LOG=info cargo run --example least_squares`.

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;

use scion::optim::{linear_decay, LambdaLr, LrScheduler};
use scion::{GroupConfig, Optimizer, OptimizerConfig, Scion, Tensor};

const CONFIG: &str = r#"{
    "steps": 300,
    "batch": 64,
    "optimizer": { "lr": 0.05, "momentum": 0.1 },
    "weight": { "norm": "Spectral", "scale": 8.0 },
    "bias": { "norm": "BiasRMS", "scale": 1.0, "lr_multiplier": 0.5 }
}"#;

#[derive(Deserialize)]
struct TrainConfig {
    steps: u64,
    batch: usize,
    optimizer: OptimizerConfig,
    weight: GroupConfig,
    bias: GroupConfig,
}

const D_IN: usize = 16;
const D_OUT: usize = 8;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let config: TrainConfig = serde_json::from_str(CONFIG)?;
    config.optimizer.validate()?;
    let mut rng = StdRng::seed_from_u64(0);

    let target_w: Array2<f32> = Array2::random_using((D_OUT, D_IN), StandardNormal, &mut rng) * 0.5;
    let target_b: Array1<f32> = Array1::random_using(D_OUT, StandardNormal, &mut rng) * 0.1;

    let w = Tensor::new(Array2::<f32>::zeros((D_OUT, D_IN)).into_dyn(), true);
    let b = Tensor::new(Array1::<f32>::zeros(D_OUT).into_dyn(), true);
    let mut opt = Scion::new(
        vec![
            config.weight.with_params(vec![w.clone()]),
            config.bias.with_params(vec![b.clone()]),
        ],
        config.optimizer,
    )?;
    opt.init()?;
    let mut schedule = LambdaLr::new(&mut opt, linear_decay(config.steps))?;

    for step in 0..config.steps {
        let x: Array2<f32> = Array2::random_using((config.batch, D_IN), StandardNormal, &mut rng);
        let y = x.dot(&target_w.t()) + &target_b;

        let (loss, grad_w, grad_b) = {
            let wv = w.data().clone().into_dimensionality::<ndarray::Ix2>()?;
            let bv = b.data().clone().into_dimensionality::<ndarray::Ix1>()?;
            let residual = x.dot(&wv.t()) + &bv - &y;
            let n = config.batch as f32;
            let loss = residual.mapv(|r| r * r).sum() / n;
            let grad_w = residual.t().dot(&x) * (2.0 / n);
            let grad_b = residual.sum_axis(Axis(0)) * (2.0 / n);
            (loss, grad_w, grad_b)
        };

        w.set_grad(&grad_w.into_dyn())?;
        b.set_grad(&grad_b.into_dyn())?;
        opt.step()?;
        opt.zero_grad();
        schedule.step(&mut opt)?;

        if step % 50 == 0 || step + 1 == config.steps {
            log::info!(
                "step {step:>4}  loss {loss:.5}  lr factor {:.3}",
                schedule.last_factor()
            );
        }
    }

    let fitted = w.data().clone().into_dimensionality::<ndarray::Ix2>()?;
    let err = (&fitted - &target_w).mapv(f32::abs).fold(0.0f32, |a, &x| a.max(x));
    println!("max |W - W*| after {} steps: {err:.4}", opt.steps());
    Ok(())
}
