use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use ndarray::arr1;
use serde_json::json;
use training_loop_orchestration::{
    logs::{LOSSES, METRICS, STATEFUL_METRICS},
    step, tensor::scalar, train_step, Average, Eager, ExecutionStrategy, Extras, Logs,
    ManagedState, MetricCollection, MlError, Optimizer, Params, StatefulMetric, StepArg,
    StepContext, StepFn, StepOutput, Strategy, StrategyKey, StrategySpec, Tensor, TensorMap,
};

/// Eager execution that counts how many step callables it specialized.
struct CountingWraps {
    wraps: Arc<AtomicUsize>,
}

impl<S> ExecutionStrategy<S> for CountingWraps {
    fn key(&self) -> StrategyKey {
        StrategyKey::Custom("counting".into())
    }

    fn wrap(&self, step: StepFn<S>) -> StepFn<S> {
        self.wraps.fetch_add(1, Ordering::SeqCst);
        step
    }
}

fn identity(_: &StepContext<TensorMap>) -> training_loop_orchestration::Result<StepOutput<TensorMap>> {
    Ok(StepOutput::Unchanged)
}

fn scale(params: &Params, x: &Tensor) -> training_loop_orchestration::Result<Tensor> {
    Ok(x * params.require("w")?)
}

fn scalar_state(metrics: Extras) -> ManagedState {
    scalar_state_on("eager", metrics)
}

fn scalar_state_on(strategy: &str, metrics: Extras) -> ManagedState {
    let params = Params::new().with("w", scalar(1.0));
    ManagedState::create(
        Arc::new(scale),
        params,
        Optimizer::gradient_descent(0.1),
        strategy,
        metrics,
    )
    .unwrap()
}

#[test]
fn too_many_arguments_count_the_state() {
    let mut dispatcher = step(identity, "eager").unwrap();
    let err = dispatcher
        .call_with(TensorMap::new(), vec![StepArg::Empty; 5])
        .unwrap_err();
    assert!(matches!(err, MlError::ArgumentCount { max: 4, got: 6 }));
}

#[test]
fn misplaced_argument_is_an_injection_error() {
    let mut dispatcher = step(identity, "eager").unwrap();
    let err = dispatcher
        .call_with(TensorMap::new(), vec![StepArg::Statics(json!(1))])
        .unwrap_err();
    assert!(matches!(err, MlError::Injection { param: "batch" }));
}

#[test]
fn missing_batch_is_an_injection_error() {
    let mut dispatcher = step(
        |ctx: &StepContext<TensorMap>| {
            ctx.batch()?;
            Ok(StepOutput::Unchanged)
        },
        "eager",
    )
    .unwrap();

    let err = dispatcher.call(TensorMap::new(), None, None, None).unwrap_err();
    assert!(matches!(err, MlError::Injection { param: "batch" }));
}

#[test]
fn unknown_default_strategy_is_rejected() {
    let err = step(identity, "tpu").err().unwrap();
    assert!(matches!(err, MlError::UnknownStrategy { name } if name == "tpu"));
}

#[test]
fn default_spec_dispatches_under_jit() {
    let mut dispatcher = step(identity, StrategySpec::default()).unwrap();
    dispatcher.call(TensorMap::new(), None, None, None).unwrap();
    assert_eq!(dispatcher.cached_strategies(), vec![StrategyKey::Jit]);
}

#[test]
fn callable_is_built_once_per_strategy() {
    let wraps = Arc::new(AtomicUsize::new(0));
    let strategy = Strategy::new(CountingWraps {
        wraps: Arc::clone(&wraps),
    });
    let mut dispatcher = step(identity, strategy).unwrap();

    let mut state = TensorMap::new().with("x", arr1(&[1.0f32, 2.0]).into_dyn());
    for _ in 0..3 {
        let (logs, next) = dispatcher.call(state, None, None, None).unwrap();
        assert!(logs.is_empty());
        state = next;
    }

    assert_eq!(wraps.load(Ordering::SeqCst), 1);
    assert_eq!(
        dispatcher.cached_strategies(),
        vec![StrategyKey::Custom("counting".into())]
    );
}

#[test]
fn each_strategy_keeps_its_own_callable() {
    let mut dispatcher = step(
        |_: &StepContext<ManagedState>| Ok(StepOutput::Unchanged),
        "eager",
    )
    .unwrap();

    let state = scalar_state(Extras::new());
    let (_, state) = dispatcher.call(state, None, None, None).unwrap();
    let state = state.with_strategy("data_parallel:2").unwrap();
    let (_, state) = dispatcher.call(state, None, None, None).unwrap();
    let state = state.with_strategy("eager").unwrap();
    let (_, state) = dispatcher.call(state, None, None, None).unwrap();

    let cached = dispatcher.cached_strategies();
    assert_eq!(cached.len(), 2);
    assert!(cached.contains(&StrategyKey::Eager));
    assert!(cached.contains(&StrategyKey::DataParallel {
        devices: NonZeroUsize::new(2).unwrap()
    }));
    assert_eq!(state.strategy().key(), StrategyKey::Eager);
}

#[test]
fn bare_state_runs_on_the_default_strategy() {
    let mut dispatcher = step(
        |ctx: &StepContext<TensorMap>| {
            let x = ctx.state.require("x")?;
            Ok(StepOutput::State(TensorMap::new().with("x", x * 2.0)))
        },
        Strategy::new(Eager),
    )
    .unwrap();

    let state = TensorMap::new().with("x", arr1(&[1.0f32, 2.0]).into_dyn());
    let (_, state) = dispatcher.call(state, None, None, None).unwrap();

    assert_eq!(state.get("x").unwrap(), &arr1(&[2.0f32, 4.0]).into_dyn());
    assert_eq!(dispatcher.cached_strategies(), vec![StrategyKey::Eager]);
}

#[test]
fn train_step_requires_losses() {
    let mut dispatcher = train_step(
        |_: &StepContext<ManagedState>| Ok(StepOutput::Logs(Logs::new().with(METRICS, "m", 1.0f32))),
        "eager",
    )
    .unwrap();

    let err = dispatcher
        .call(scalar_state(Extras::new()), None, None, None)
        .unwrap_err();
    assert!(matches!(err, MlError::MissingOutput { key: LOSSES, .. }));
}

#[test]
fn train_step_rejects_empty_losses() {
    let mut dispatcher = train_step(
        |_: &StepContext<ManagedState>| Ok(StepOutput::Logs(Logs::new().with_category(LOSSES))),
        "eager",
    )
    .unwrap();

    let err = dispatcher
        .call(scalar_state(Extras::new()), None, None, None)
        .unwrap_err();
    assert!(matches!(err, MlError::EmptyOutput { key: LOSSES }));
}

#[test]
fn train_step_rejects_non_scalar_losses() {
    let mut dispatcher = train_step(
        |_: &StepContext<ManagedState>| {
            let logs = Logs::new().with(LOSSES, "mse", arr1(&[1.0f32, 2.0]).into_dyn());
            Ok(StepOutput::Logs(logs))
        },
        "eager",
    )
    .unwrap();

    let err = dispatcher
        .call(scalar_state(Extras::new()), None, None, None)
        .unwrap_err();
    match err {
        MlError::NonScalarLoss { name, shape } => {
            assert_eq!(name, "mse");
            assert_eq!(shape, vec![2]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn stateful_metrics_accumulate_into_state() {
    let mut dispatcher = step(
        |ctx: &StepContext<ManagedState>| {
            let value = ctx.statics()?.as_f64().unwrap_or_default() as f32;
            let update = StatefulMetric::from(Average::from_value("loss", value));
            Ok(StepOutput::Logs(Logs::new().with(STATEFUL_METRICS, "loss", update)))
        },
        "eager",
    )
    .unwrap();
    let state = scalar_state(Extras::new().with_metric("loss", Average::from_output("loss")));

    let (logs, state) = dispatcher.call(state, None, None, Some(json!(2.0))).unwrap();
    assert_eq!(logs.scalar(STATEFUL_METRICS, "loss"), Some(2.0));

    let (logs, state) = dispatcher.call(state, None, None, Some(json!(4.0))).unwrap();
    assert_eq!(logs.scalar(STATEFUL_METRICS, "loss"), Some(3.0));

    match state.metric("loss").unwrap() {
        StatefulMetric::Average(avg) => assert_eq!(avg.count(), 2.0),
        other => panic!("unexpected metric: {other:?}"),
    }

    let reset = state.reset_metrics();
    let (logs, _) = dispatcher.call(reset, None, None, Some(json!(5.0))).unwrap();
    assert_eq!(logs.scalar(STATEFUL_METRICS, "loss"), Some(5.0));
}

#[test]
fn stateful_metrics_merge_across_devices() {
    let mut dispatcher = step(
        |ctx: &StepContext<ManagedState>| {
            let update = ctx
                .state
                .metric("x")
                .ok_or_else(|| MlError::MissingField { field: "x".into() })?
                .single_from_outputs(ctx.batch()?)?;
            Ok(StepOutput::Logs(Logs::new().with(STATEFUL_METRICS, "x", update)))
        },
        "eager",
    )
    .unwrap();

    for strategy in ["eager", "data_parallel:2"] {
        let mut state =
            scalar_state_on(strategy, Extras::new().with_metric("x", Average::from_output("x")));
        let mut averages = Vec::new();
        for values in [[1.0f32, 2.0, 3.0, 10.0], [0.0; 4]] {
            let batch = TensorMap::new().with("x", arr1(&values).into_dyn());
            let (logs, next) = dispatcher.call(state, Some(batch), None, None).unwrap();
            averages.push(logs.scalar(STATEFUL_METRICS, "x").unwrap());
            state = next;
        }
        assert_eq!(averages, vec![4.0, 2.0], "{strategy}");
    }
}

#[test]
fn metric_collections_log_each_entry() {
    let collection = MetricCollection::new()
        .with("a", Average::from_output("a"))
        .with("b", Average::from_output("b"));

    let mut dispatcher = step(
        |ctx: &StepContext<ManagedState>| {
            let outputs = TensorMap::new().with("a", scalar(1.0)).with("b", scalar(3.0));
            let update = ctx
                .state
                .metric("stats")
                .ok_or_else(|| MlError::MissingField {
                    field: "stats".into(),
                })?
                .single_from_outputs(&outputs)?;
            Ok(StepOutput::Logs(Logs::new().with(STATEFUL_METRICS, "stats", update)))
        },
        "eager",
    )
    .unwrap();

    let state = scalar_state(Extras::new().with_metric("stats", collection));
    let (logs, _) = dispatcher.call(state, None, None, None).unwrap();

    assert_eq!(logs.scalar(STATEFUL_METRICS, "a"), Some(1.0));
    assert_eq!(logs.scalar(STATEFUL_METRICS, "b"), Some(3.0));
    assert!(logs.get(STATEFUL_METRICS, "stats").is_none());
}

#[test]
fn metric_without_a_state_field_fails() {
    let mut dispatcher = step(
        |_: &StepContext<ManagedState>| {
            let update = StatefulMetric::from(Average::from_value("loss", 1.0));
            Ok(StepOutput::Logs(Logs::new().with(STATEFUL_METRICS, "nope", update)))
        },
        "eager",
    )
    .unwrap();

    let err = dispatcher
        .call(scalar_state(Extras::new()), None, None, None)
        .unwrap_err();
    assert!(matches!(err, MlError::MissingField { field } if field == "nope"));
}
