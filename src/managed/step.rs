use std::collections::HashMap;

use log::{debug, trace};
use ml_core::{
    logs::{LOSSES, METRICS, PER_SAMPLE_OUTPUTS, STATEFUL_METRICS},
    step_fn, Batch, Broadcasts, FiniteDifference, LogGroup, LogValue, Logs, Metric, MetricValue,
    MlError, Params, Result, Statics, StepFn,
};
use ml_strategies::{Strategy, StrategyKey, StrategyRef};

use super::{
    callback::{ManagedFunctionCallback, StepContext, StepOutput},
    capabilities::{StepState, TrainState},
};
use crate::loops::LoopState;

/// Turns a user step function into the callable a strategy wraps.
pub trait StepMode<S: StepState>: Send + Sync + 'static {
    fn get_step_callback(
        &self,
        callback: &ManagedFunctionCallback<S>,
        strategy: &Strategy<S>,
    ) -> StepFn<S>;
}

/// Runs the user step function as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plain;

impl<S: StepState> StepMode<S> for Plain {
    fn get_step_callback(
        &self,
        callback: &ManagedFunctionCallback<S>,
        _strategy: &Strategy<S>,
    ) -> StepFn<S> {
        let callback = callback.clone();
        step_fn(move |state: S, batch, broadcasts, statics| {
            callback.call(state, batch, broadcasts, statics)
        })
    }
}

/// Differentiates the user step function's losses and applies the update.
#[derive(Debug, Clone, Copy, Default)]
pub struct Train {
    pub grad: FiniteDifference,
}

fn total_loss(logs: &Logs) -> Result<f32> {
    let losses = logs.category(LOSSES).ok_or_else(|| MlError::MissingOutput {
        key: LOSSES,
        got: logs.categories().map(String::from).collect(),
    })?;
    if losses.is_empty() {
        return Err(MlError::EmptyOutput { key: LOSSES });
    }

    losses.iter().try_fold(0.0, |total, (name, value)| {
        let loss = value.as_tensor().ok_or_else(|| MlError::UnexpectedMetric {
            category: LOSSES,
            name: name.clone(),
        })?;
        if loss.ndim() != 0 {
            return Err(MlError::NonScalarLoss {
                name: name.clone(),
                shape: loss.shape().to_vec(),
            });
        }
        Ok(total + loss.sum())
    })
}

impl<S: TrainState> StepMode<S> for Train {
    fn get_step_callback(
        &self,
        callback: &ManagedFunctionCallback<S>,
        strategy: &Strategy<S>,
    ) -> StepFn<S> {
        let callback = callback.clone();
        let strategy = strategy.clone();
        let grad = self.grad;

        step_fn(move |state: S, batch: Option<Batch>, broadcasts, statics: Option<Statics>| {
            let loss_fn = |params: &Params| -> Result<(f32, (Logs, S))> {
                let candidate = state.with_params(params.clone());
                let (logs, next) =
                    callback.call(candidate, batch.clone(), broadcasts, statics.clone())?;
                Ok((total_loss(&logs)?, (logs, next)))
            };

            let ((loss, (logs, next)), grads) = grad.value_and_grad(loss_fn, state.params())?;
            trace!(loss = loss; "computed loss and gradients");

            let grads = strategy.handle_grads(grads)?;
            let mut next = next.apply_gradients(&grads)?;
            if let Some(stats) = next.batch_stats().cloned() {
                next = next.with_batch_stats(strategy.handle_batch_stats(stats)?);
            }

            Ok((logs, next))
        })
    }
}

impl<S: TrainState> ManagedStep<S, Train> {
    /// Replaces the differentiation settings, dropping every specialized callable.
    pub fn with_grad(mut self, grad: FiniteDifference) -> Self {
        self.mode.grad = grad;
        self.strategy_callbacks.clear();
        self
    }
}

/// A positional argument after the state, for [`ManagedStep::call_with`].
#[derive(Debug, Clone)]
pub enum StepArg {
    Batch(Batch),
    Broadcasts(Broadcasts),
    Statics(Statics),
    /// Leaves the slot unset.
    Empty,
}

/// Dispatches a step function to the strategy of the state it is called with.
///
/// The strategy-specialized callable is built on the first call with each strategy and
/// kept for the dispatcher's lifetime. The cache is not synchronized: share a
/// dispatcher between threads only behind a lock.
pub struct ManagedStep<S: StepState, M = Plain> {
    strategy_callbacks: HashMap<Strategy<S>, StepFn<S>>,
    default_strategy: Strategy<S>,
    managed_step_fn: ManagedFunctionCallback<S>,
    mode: M,
}

/// A dispatcher that trains: see [`Train`].
pub type ManagedTrainStep<S> = ManagedStep<S, Train>;

impl<S: StepState, M: StepMode<S>> ManagedStep<S, M> {
    pub fn new(
        managed_step_fn: ManagedFunctionCallback<S>,
        default_strategy: Strategy<S>,
        mode: M,
    ) -> Self {
        Self {
            strategy_callbacks: HashMap::new(),
            default_strategy,
            managed_step_fn,
            mode,
        }
    }

    pub fn default_strategy(&self) -> &Strategy<S> {
        &self.default_strategy
    }

    /// Strategies a specialized callable has been built for.
    pub fn cached_strategies(&self) -> Vec<StrategyKey> {
        self.strategy_callbacks.keys().map(|s| s.key()).collect()
    }

    /// Runs one step.
    ///
    /// # Arguments
    /// * `state` - Resident state. Its own strategy is used when it reports one,
    ///   the default strategy otherwise.
    /// * `batch` - Host-form batch; it is lifted onto the strategy before the call.
    /// * `broadcasts` - Loop progress.
    /// * `statics` - Step configuration.
    ///
    /// # Returns
    /// The step's logs, lowered to host form per category, and the new state.
    ///
    /// # Errors
    /// Returns any error raised by the strategy or by the step function.
    pub fn call(
        &mut self,
        state: S,
        batch: Option<Batch>,
        broadcasts: Option<Broadcasts>,
        statics: Option<Statics>,
    ) -> Result<(Logs, S)> {
        let strategy = state
            .strategy()
            .cloned()
            .unwrap_or_else(|| self.default_strategy.clone());

        let callback = match self.strategy_callbacks.get(&strategy).cloned() {
            Some(callback) => callback,
            None => {
                debug!(strategy = strategy.to_string().as_str(); "building step callback");
                let callback = strategy.wrap(self.get_final_callback(&strategy));
                self.strategy_callbacks
                    .insert(strategy.clone(), callback.clone());
                callback
            }
        };

        trace!(strategy = strategy.to_string().as_str(); "dispatching step");

        let batch = batch.map(|b| strategy.lift_batch(b)).transpose()?;
        let (logs, state) = callback(state, batch, broadcasts, statics)?;
        Ok((lower_logs(&strategy, logs)?, state))
    }

    /// Positional form of [`ManagedStep::call`].
    ///
    /// `args` fill batch, broadcasts and statics in that order.
    ///
    /// # Errors
    /// Returns `MlError::ArgumentCount` for more than three `args`, counting the state
    /// in the reported total, and `MlError::Injection` when an argument sits in the
    /// wrong slot.
    pub fn call_with(&mut self, state: S, args: Vec<StepArg>) -> Result<(Logs, S)> {
        if args.len() > 3 {
            return Err(MlError::ArgumentCount {
                max: 4,
                got: args.len() + 1,
            });
        }

        let mut batch = None;
        let mut broadcasts = None;
        let mut statics = None;
        for (slot, arg) in args.into_iter().enumerate() {
            match (slot, arg) {
                (_, StepArg::Empty) => {}
                (0, StepArg::Batch(b)) => batch = Some(b),
                (1, StepArg::Broadcasts(b)) => broadcasts = Some(b),
                (2, StepArg::Statics(s)) => statics = Some(s),
                (0, _) => return Err(MlError::Injection { param: "batch" }),
                (1, _) => return Err(MlError::Injection { param: "broadcasts" }),
                _ => return Err(MlError::Injection { param: "statics" }),
            }
        }

        self.call(state, batch, broadcasts, statics)
    }

    /// Runs the step as a loop callback with the loop's batch and progress.
    pub fn loop_callback(&mut self, state: S, loop_state: &LoopState) -> Result<(Logs, S)> {
        self.call(
            state,
            Some(loop_state.batch.clone()),
            Some(loop_state.elapsed),
            None,
        )
    }

    /// Builds the callable the strategy wraps: the mode's step callback followed by
    /// the merge of stateful metric logs into the matching state fields.
    fn get_final_callback(&self, strategy: &Strategy<S>) -> StepFn<S> {
        let step = self.mode.get_step_callback(&self.managed_step_fn, strategy);
        let strategy = strategy.clone();

        step_fn(move |state: S, batch, broadcasts, statics| {
            let (mut logs, mut state) = step(state, batch, broadcasts, statics)?;

            let Some(group) = logs.remove_category(STATEFUL_METRICS) else {
                return Ok((logs, state));
            };

            let mut computed = LogGroup::new();
            for (name, value) in group {
                let update = match value {
                    LogValue::Metric(update) => update,
                    value => {
                        computed.insert(name, value);
                        continue;
                    }
                };

                let current = state.metric(&name).ok_or_else(|| MlError::MissingField {
                    field: name.clone(),
                })?;
                let merged = current.merge(&strategy.handle_metric(update)?)?;
                let value = merged.compute();
                state = state.with_metric(&name, merged)?;

                match value {
                    MetricValue::Scalar(v) => {
                        computed.insert(name, LogValue::from(v));
                    }
                    MetricValue::Map(values) => {
                        computed.extend(values.into_iter().map(|(k, v)| (k, LogValue::from(v))));
                    }
                }
            }
            logs.insert_category(STATEFUL_METRICS, computed);

            Ok((logs, state))
        })
    }
}

fn lower_logs<S>(strategy: &Strategy<S>, logs: Logs) -> Result<Logs> {
    logs.into_iter()
        .map(|(category, group)| {
            let lowered = match category.as_str() {
                STATEFUL_METRICS => strategy.lower_replicated(group)?,
                LOSSES | METRICS => strategy.lower_averageable(group)?,
                PER_SAMPLE_OUTPUTS => strategy.lower_tileable(group)?,
                _ => strategy.lower_sharded(group)?,
            };
            Ok((category, lowered))
        })
        .collect()
}

/// Builds a dispatcher around `f`.
///
/// # Errors
/// Returns `MlError::UnknownStrategy` if `default_strategy` names no registered strategy.
pub fn step<S, F>(f: F, default_strategy: impl Into<StrategyRef<S>>) -> Result<ManagedStep<S>>
where
    S: StepState,
    F: Fn(&StepContext<S>) -> Result<StepOutput<S>> + Send + Sync + 'static,
{
    Ok(ManagedStep::new(
        ManagedFunctionCallback::new(f),
        default_strategy.into().resolve()?,
        Plain,
    ))
}

/// Builds a training dispatcher around `f`, which must log scalar `losses`.
///
/// # Errors
/// Returns `MlError::UnknownStrategy` if `default_strategy` names no registered strategy.
pub fn train_step<S, F>(
    f: F,
    default_strategy: impl Into<StrategyRef<S>>,
) -> Result<ManagedTrainStep<S>>
where
    S: TrainState,
    F: Fn(&StepContext<S>) -> Result<StepOutput<S>> + Send + Sync + 'static,
{
    Ok(ManagedStep::new(
        ManagedFunctionCallback::new(f),
        default_strategy.into().resolve()?,
        Train::default(),
    ))
}
