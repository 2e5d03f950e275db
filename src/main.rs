use std::env;

use anyhow::Context;
use engine::{Dataset, Tensor};
use estimator::{
    Configuration, EstimatorBuilder, EvaluateOptions,
    hooks::{NanTensorHook, SharedHook, StopCriteria},
    metrics::{MeanAbsoluteError, MeanSquaredError},
    model::LinearRegression,
};
use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng};

const BATCH_SIZE: usize = 16;
const SLOPE: f32 = 2.0;
const INTERCEPT: f32 = 1.0;

/// Noisy samples of `y = 2x + 1`, one batch per element.
fn synthetic(batches: usize, seed: u64) -> Dataset {
    Dataset::from_fn(move |i| {
        if i as usize >= batches {
            return None;
        }

        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i));
        let x: Vec<f32> = (0..BATCH_SIZE).map(|_| rng.random_range(-1.0..1.0)).collect();
        let y = x
            .iter()
            .map(|x| SLOPE * x + INTERCEPT + rng.random_range(-0.05..0.05))
            .collect();

        Some(vec![Tensor::vector(x), Tensor::vector(y)])
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => Configuration::from_file(&path)
            .with_context(|| format!("failed to read config from {path}"))?,
        None => Configuration::new().with_random_seed(7).with_log_loss_steps(50),
    };
    let config = config.with_env_overrides()?;

    let mut estimator = EstimatorBuilder::new(LinearRegression::new(1, 1, 0.1))
        .with_config(config)
        .with_metric(MeanSquaredError::new())
        .with_metric(MeanAbsoluteError::new())
        .with_train_hook(SharedHook::new(NanTensorHook::new(true)))
        .build()?;

    for epoch in 0..3 {
        let steps = estimator.train(|| synthetic(100, epoch), None)?;
        info!("epoch {epoch}: {steps} steps, global step {}", estimator.global_step());
    }

    estimator.train(|| synthetic(100, 3).repeat(), Some(StopCriteria::steps(200)))?;

    let evaluation = estimator.evaluate(
        || synthetic(10, 1_000),
        EvaluateOptions::new().with_name("holdout"),
    )?;
    for (name, value) in &evaluation.values {
        info!("{name} = {value:.5}");
    }

    let probe = Dataset::from_tensors(vec![Tensor::vector(vec![-1.0, 0.0, 1.0])]);
    for prediction in estimator.infer(move || probe)? {
        let (x, y) = prediction?;
        info!("f({:?}) = {:?}", x.data(), y.data());
    }

    estimator.close()?;
    Ok(())
}
