use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use ndarray::arr1;
use training_loop_orchestration::{
    tensor::scalar, Accuracy, Average, ExecutionStrategy, Extras, ManagedState,
    MetricCollection, MlError, Optimizer, Params, Result, Strategy, StrategyKey, Tensor,
};

/// Eager execution that counts how many states it took in from host form.
struct CountingHost {
    lifts: Arc<AtomicUsize>,
}

impl ExecutionStrategy<ManagedState> for CountingHost {
    fn key(&self) -> StrategyKey {
        StrategyKey::Custom("counting_host".into())
    }

    fn from_host(&self, state: ManagedState) -> Result<ManagedState> {
        self.lifts.fetch_add(1, Ordering::SeqCst);
        Ok(state)
    }
}

fn dot(params: &Params, x: &Tensor) -> Result<Tensor> {
    Ok(x * params.require("w")?)
}

fn params() -> Params {
    Params::new()
        .with("w", arr1(&[0.5, -1.0, 2.0]).into_dyn())
        .with("b", scalar(0.25))
}

fn extras() -> Extras {
    Extras::new().with_metric(
        "metrics",
        MetricCollection::new()
            .with("loss", Average::from_output("loss"))
            .with("accuracy", Accuracy::new()),
    )
}

fn create(strategy: &str) -> ManagedState {
    ManagedState::create(
        Arc::new(dot),
        params(),
        Optimizer::adam(1e-2),
        strategy,
        extras(),
    )
    .unwrap()
}

#[test]
fn moving_to_the_current_strategy_is_a_no_op() {
    let lifts = Arc::new(AtomicUsize::new(0));
    let strategy = Strategy::new(CountingHost {
        lifts: Arc::clone(&lifts),
    });

    let state = ManagedState::create(
        Arc::new(dot),
        params(),
        Optimizer::adam(1e-2),
        &strategy,
        extras(),
    )
    .unwrap();
    assert_eq!(lifts.load(Ordering::SeqCst), 1);

    let state = state.with_strategy(&strategy).unwrap();
    let state = state.with_strategy(strategy.clone()).unwrap();
    assert_eq!(lifts.load(Ordering::SeqCst), 1);

    let state = state.with_strategy("eager").unwrap();
    let state = state.with_strategy(&strategy).unwrap();
    assert_eq!(lifts.load(Ordering::SeqCst), 2);
    assert_eq!(state.strategy(), &strategy);
}

#[test]
fn state_survives_a_round_trip_through_devices() {
    let state = create("data_parallel:2");
    assert_eq!(
        state.strategy().key(),
        StrategyKey::DataParallel {
            devices: NonZeroUsize::new(2).unwrap()
        }
    );
    assert_eq!(state.params().require("w").unwrap().shape(), &[2, 3]);
    assert_eq!(state.params().require("b").unwrap().shape(), &[2]);

    let host = state.with_strategy("eager").unwrap();
    assert_eq!(host.params(), &params());
    assert_eq!(host.metrics(), &extras().metrics);

    let back = host.with_strategy("data_parallel:2").unwrap();
    let again = back.with_strategy("eager").unwrap();
    assert!(again.params().approx_eq(&params(), 0.0));
    assert_eq!(again.step(), 0);
}

#[test]
fn optimizer_buffers_follow_the_state() {
    let state = create("data_parallel:3");
    for (name, buffer) in state.opt_state().iter() {
        assert_eq!(buffer.shape()[0], 3, "{name} has no device axis");
    }

    let reset = state.reset_metrics();
    let host = reset.with_strategy("jit").unwrap();
    assert_eq!(host.opt_state(), create("eager").opt_state());
}

#[test]
fn unknown_strategy_leaves_no_state_behind() {
    let err = create("eager").with_strategy("quantum").unwrap_err();
    assert!(matches!(err, MlError::UnknownStrategy { name } if name == "quantum"));
}
