use std::sync::Arc;

use ndarray::{arr1, Array1};
use training_loop_orchestration::{
    logs::{LOSSES, PER_SAMPLE_OUTPUTS},
    step, tensor::scalar, train_step, Batch, Extras, Jit, Logs, ManagedState, ManagedTrainStep,
    Optimizer, Params, StepContext, StepOutput, Strategy, StrategyRef, Tensor, TensorMap,
};

const SAMPLES: usize = 8;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn linear(params: &Params, x: &Tensor) -> training_loop_orchestration::Result<Tensor> {
    Ok(&(x * params.require("w")?) + params.require("b")?)
}

/// Points on y = 2x + 1 spread evenly over [-1, 1].
fn line() -> Batch {
    let x = Array1::linspace(-1.0f32, 1.0, SAMPLES);
    let y = x.mapv(|v| 2.0 * v + 1.0);
    Batch::new().with("x", x.into_dyn()).with("y", y.into_dyn())
}

fn state_on(strategy: impl Into<StrategyRef<ManagedState>>) -> ManagedState {
    let params = Params::new().with("w", scalar(0.0)).with("b", scalar(0.0));
    ManagedState::create(
        Arc::new(linear),
        params,
        Optimizer::gradient_descent(0.1),
        strategy,
        Extras::new(),
    )
    .unwrap()
}

fn mse_step() -> ManagedTrainStep<ManagedState> {
    train_step(
        |ctx: &StepContext<ManagedState>| {
            let batch = ctx.batch()?;
            let pred = ctx.state.apply(batch.require("x")?)?;
            let loss = (&pred - batch.require("y")?).mapv(|d| d * d).mean().unwrap_or(0.0);
            Ok(StepOutput::Logs(Logs::new().with(LOSSES, "mse", loss)))
        },
        "eager",
    )
    .unwrap()
}

fn train(mut state: ManagedState, steps: usize) -> ManagedState {
    let mut dispatcher = mse_step();
    for _ in 0..steps {
        let (logs, next) = dispatcher.call(state, Some(line()), None, None).unwrap();
        assert!(logs.scalar(LOSSES, "mse").is_some_and(f32::is_finite));
        state = next;
    }
    state
}

fn host_param(state: &ManagedState, name: &str) -> f32 {
    let host = state.clone().with_strategy("eager").unwrap();
    host.params().require(name).unwrap().sum()
}

fn assert_fits_line(state: &ManagedState) {
    let w = host_param(state, "w");
    let b = host_param(state, "b");
    assert!((w - 2.0).abs() < 0.05, "w = {w}");
    assert!((b - 1.0).abs() < 0.05, "b = {b}");
}

#[test]
fn linear_regression_converges_eagerly() {
    init_logger();
    let state = train(state_on("eager"), 200);
    assert_eq!(state.step(), 200);
    assert_fits_line(&state);
}

#[test]
fn linear_regression_converges_under_jit() {
    init_logger();
    let jit = Jit::new();
    let state = train(state_on(Strategy::new(jit.clone())), 200);
    assert_fits_line(&state);
    assert_eq!(jit.traces(), 1);
}

#[test]
fn linear_regression_converges_on_two_devices() {
    init_logger();
    let state = train(state_on("data_parallel:2"), 200);

    assert_eq!(state.params().require("w").unwrap().shape(), &[2]);
    assert_fits_line(&state);
}

#[test]
fn data_parallel_follows_the_eager_trajectory() {
    init_logger();
    let eager = train(state_on("eager"), 20);
    let parallel = train(state_on("data_parallel:2"), 20);

    for name in ["w", "b"] {
        let a = host_param(&eager, name);
        let b = host_param(&parallel, name);
        assert!((a - b).abs() < 1e-2, "{name}: eager {a}, data parallel {b}");
    }
}

#[test]
fn per_sample_outputs_are_tiled_back() {
    init_logger();
    let mut dispatcher = step(
        |ctx: &StepContext<ManagedState>| {
            let batch = ctx.batch()?;
            let pred = ctx.state.apply(batch.require("x")?)?;
            let loss = pred.mean().unwrap_or(0.0);
            let logs = Logs::new()
                .with(PER_SAMPLE_OUTPUTS, "pred", pred)
                .with(LOSSES, "mean_pred", loss);
            Ok(StepOutput::Logs(logs))
        },
        "eager",
    )
    .unwrap();

    let trained = train(state_on("eager"), 50);
    let (eager_logs, _) = dispatcher
        .call(trained.clone(), Some(line()), None, None)
        .unwrap();
    let parallel = trained.with_strategy("data_parallel:2").unwrap();
    let (parallel_logs, _) = dispatcher.call(parallel, Some(line()), None, None).unwrap();

    let expected = eager_logs.get(PER_SAMPLE_OUTPUTS, "pred").unwrap().as_tensor().unwrap();
    let tiled = parallel_logs.get(PER_SAMPLE_OUTPUTS, "pred").unwrap().as_tensor().unwrap();
    assert_eq!(tiled.shape(), &[SAMPLES]);
    assert!(tiled.iter().zip(expected).all(|(a, b)| (a - b).abs() < 1e-5));

    let mean = parallel_logs.get(LOSSES, "mean_pred").unwrap().as_tensor().unwrap();
    assert_eq!(mean.ndim(), 0);
    assert!((mean.sum() - expected.mean().unwrap()).abs() < 1e-5);
}

#[test]
fn batch_stats_are_averaged_across_devices() {
    init_logger();
    let mut dispatcher = train_step(
        |ctx: &StepContext<ManagedState>| {
            let batch = ctx.batch()?;
            let x = batch.require("x")?;
            let pred = ctx.state.apply(x)?;
            let loss = (&pred - batch.require("y")?).mapv(|d| d * d).mean().unwrap_or(0.0);
            let stats = TensorMap::new().with("mean", scalar(x.mean().unwrap_or(0.0)));
            Ok(StepOutput::Both(
                Logs::new().with(LOSSES, "mse", loss),
                ctx.state.with_batch_stats(stats),
            ))
        },
        "eager",
    )
    .unwrap();

    let x = arr1(&[1.0f32, 2.0, 3.0, 10.0]);
    let y = x.mapv(|v| 2.0 * v + 1.0);
    let batch = Batch::new().with("x", x.into_dyn()).with("y", y.into_dyn());

    let mut trained = Vec::new();
    for strategy in ["eager", "data_parallel:2"] {
        let params = Params::new().with("w", scalar(0.0)).with("b", scalar(0.0));
        let stats = TensorMap::new().with("mean", scalar(0.0));
        let state = ManagedState::create(
            Arc::new(linear),
            params,
            Optimizer::gradient_descent(0.1),
            strategy,
            Extras::new().with_batch_stats(stats),
        )
        .unwrap();

        let (_, state) = dispatcher.call(state, Some(batch.clone()), None, None).unwrap();
        let host = state.with_strategy("eager").unwrap();
        let mean = host.batch_stats().unwrap().require("mean").unwrap();
        assert_eq!(mean.ndim(), 0, "{strategy}");
        assert!((mean.sum() - 4.0).abs() < 1e-5, "{strategy}: mean = {}", mean.sum());
        trained.push(host);
    }

    for name in ["w", "b"] {
        let a = host_param(&trained[0], name);
        let b = host_param(&trained[1], name);
        assert!((a - b).abs() < 1e-2, "{name}: eager {a}, data parallel {b}");
    }
}
