use std::{collections::BTreeMap, fmt, sync::Arc};

use log::info;
use ml_core::{
    pytree::Pytree,
    Metric, MlError, OptState, Optimizer, Params, Result, StatefulMetric, Tensor, TensorMap,
};
use ml_strategies::{Eager, Strategy, StrategyRef};

use super::capabilities::{StepState, TrainState};

/// The model's forward pass: parameters and inputs to outputs.
pub type ApplyFn = Arc<dyn Fn(&Params, &Tensor) -> Result<Tensor> + Send + Sync>;

/// Optional fields of a [`ManagedState`].
#[derive(Debug, Clone, Default)]
pub struct Extras {
    pub metrics: BTreeMap<String, StatefulMetric>,
    pub batch_stats: Option<TensorMap>,
}

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, name: impl Into<String>, metric: impl Into<StatefulMetric>) -> Self {
        self.metrics.insert(name.into(), metric.into());
        self
    }

    pub fn with_batch_stats(mut self, stats: TensorMap) -> Self {
        self.batch_stats = Some(stats);
        self
    }
}

/// Training state that remembers the strategy it lives on.
///
/// Bundles the forward pass, parameters, optimizer and its buffers, a step counter,
/// named metric accumulators and optional batch statistics. Values are never mutated
/// in place: every change returns a new state.
///
/// Leaves, in flatten order: params, optimizer buffers, metric accumulators, batch
/// statistics. The step counter, forward pass, optimizer and strategy are carried
/// along unchanged by leaf transforms.
#[derive(Clone)]
pub struct ManagedState {
    apply_fn: ApplyFn,
    params: Params,
    tx: Optimizer,
    opt_state: OptState,
    step: u64,
    strategy: Strategy<ManagedState>,
    metrics: BTreeMap<String, StatefulMetric>,
    batch_stats: Option<TensorMap>,
}

impl ManagedState {
    /// Creates a state and moves it onto `strategy`.
    ///
    /// # Arguments
    /// * `apply_fn` - The model's forward pass.
    /// * `params` - Initial parameters, in host form.
    /// * `tx` - The optimizer; its buffers are initialized from `params`.
    /// * `strategy` - A registry name, spec or strategy instance.
    /// * `extras` - Metric accumulators and batch statistics to carry.
    ///
    /// # Errors
    /// Returns `MlError::UnknownStrategy` if `strategy` names no registered strategy,
    /// or any error raised while converting the state to its resident form.
    pub fn create(
        apply_fn: ApplyFn,
        params: Params,
        tx: Optimizer,
        strategy: impl Into<StrategyRef<ManagedState>>,
        extras: Extras,
    ) -> Result<Self> {
        let opt_state = tx.init(&params);
        let state = Self {
            apply_fn,
            params,
            tx,
            opt_state,
            step: 0,
            strategy: Strategy::new(Eager),
            metrics: extras.metrics,
            batch_stats: extras.batch_stats,
        };

        state.with_strategy(strategy)
    }

    /// Moves the state onto `strategy`.
    ///
    /// Returns the state untouched when `strategy` equals the current one. Otherwise
    /// the state goes through host form: the current strategy lowers it, the new one
    /// lifts it.
    ///
    /// # Errors
    /// Returns `MlError::UnknownStrategy` for an unregistered name, or the error of
    /// either conversion.
    pub fn with_strategy(self, strategy: impl Into<StrategyRef<ManagedState>>) -> Result<Self> {
        let strategy = strategy.into().resolve()?;
        if strategy == self.strategy {
            return Ok(self);
        }

        info!(
            from = self.strategy.to_string().as_str(),
            to = strategy.to_string().as_str();
            "migrating state"
        );

        let current = self.strategy.clone();
        let host = current.to_host(self)?;
        let mut resident = strategy.from_host(host)?;
        resident.strategy = strategy;
        Ok(resident)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn opt_state(&self) -> &OptState {
        &self.opt_state
    }

    pub fn tx(&self) -> &Optimizer {
        &self.tx
    }

    /// Number of optimizer updates applied so far.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn strategy(&self) -> &Strategy<ManagedState> {
        &self.strategy
    }

    pub fn metrics(&self) -> &BTreeMap<String, StatefulMetric> {
        &self.metrics
    }

    pub fn metric(&self, name: &str) -> Option<&StatefulMetric> {
        self.metrics.get(name)
    }

    pub fn batch_stats(&self) -> Option<&TensorMap> {
        self.batch_stats.as_ref()
    }

    /// Runs the forward pass with the state's parameters.
    pub fn apply(&self, inputs: &Tensor) -> Result<Tensor> {
        (self.apply_fn)(&self.params, inputs)
    }

    /// Runs the forward pass with `params` in place of the state's parameters.
    pub fn apply_with(&self, params: &Params, inputs: &Tensor) -> Result<Tensor> {
        (self.apply_fn)(params, inputs)
    }

    pub fn with_params(&self, params: Params) -> Self {
        Self {
            params,
            ..self.clone()
        }
    }

    /// Replaces metric field `name`, adding it if absent.
    pub fn with_metric(&self, name: impl Into<String>, metric: StatefulMetric) -> Self {
        let mut next = self.clone();
        next.metrics.insert(name.into(), metric);
        next
    }

    pub fn with_batch_stats(&self, stats: TensorMap) -> Self {
        Self {
            batch_stats: Some(stats),
            ..self.clone()
        }
    }

    /// Returns a copy with every metric accumulator emptied.
    pub fn reset_metrics(&self) -> Self {
        Self {
            metrics: self
                .metrics
                .iter()
                .map(|(name, metric)| (name.clone(), metric.empty()))
                .collect(),
            ..self.clone()
        }
    }

    /// Applies `grads` with the optimizer and advances the step counter.
    ///
    /// # Errors
    /// Returns the optimizer's error if `grads` does not match the parameters.
    pub fn apply_gradients(&self, grads: &Params) -> Result<Self> {
        let (params, opt_state) = self.tx.update(grads, &self.opt_state, &self.params)?;
        Ok(Self {
            params,
            opt_state,
            step: self.step + 1,
            ..self.clone()
        })
    }
}

impl fmt::Debug for ManagedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedState")
            .field("params", &self.params)
            .field("tx", &self.tx)
            .field("opt_state", &self.opt_state)
            .field("step", &self.step)
            .field("strategy", &self.strategy)
            .field("metrics", &self.metrics)
            .field("batch_stats", &self.batch_stats)
            .finish_non_exhaustive()
    }
}

impl Pytree for ManagedState {
    fn flatten(&self) -> Vec<Tensor> {
        let mut leaves = self.params.flatten();
        leaves.extend(self.opt_state.flatten());
        leaves.extend(self.metrics.flatten());
        leaves.extend(self.batch_stats.flatten());
        leaves
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        let params = self.params.unflatten(leaves)?;
        let opt_state = self.opt_state.unflatten(leaves)?;
        let metrics = self.metrics.unflatten(leaves)?;
        let batch_stats = self.batch_stats.unflatten(leaves)?;
        Ok(Self {
            params,
            opt_state,
            metrics,
            batch_stats,
            ..self.clone()
        })
    }
}

impl StepState for ManagedState {
    fn strategy(&self) -> Option<&Strategy<Self>> {
        Some(&self.strategy)
    }

    fn metric(&self, name: &str) -> Option<&StatefulMetric> {
        self.metrics.get(name)
    }

    fn with_metric(&self, name: &str, metric: StatefulMetric) -> Result<Self> {
        if !self.metrics.contains_key(name) {
            return Err(MlError::MissingField {
                field: name.to_string(),
            });
        }
        Ok(ManagedState::with_metric(self, name, metric))
    }
}

impl TrainState for ManagedState {
    fn params(&self) -> &Params {
        &self.params
    }

    fn with_params(&self, params: Params) -> Self {
        ManagedState::with_params(self, params)
    }

    fn apply_gradients(&self, grads: &Params) -> Result<Self> {
        ManagedState::apply_gradients(self, grads)
    }

    fn batch_stats(&self) -> Option<&TensorMap> {
        self.batch_stats.as_ref()
    }

    fn with_batch_stats(&self, stats: TensorMap) -> Self {
        ManagedState::with_batch_stats(self, stats)
    }
}

