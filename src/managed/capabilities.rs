use ml_core::{MlError, Params, Pytree, Result, StatefulMetric, Tensor, TensorMap};
use ml_strategies::Strategy;

/// A value that can be threaded through a managed step.
///
/// Every capability is optional. A state that does not report a strategy runs on the
/// dispatcher's default one; a state without metric fields rejects stateful metric
/// logs.
pub trait StepState: Pytree + Clone + Send + Sync + 'static {
    /// The strategy the state currently lives on.
    fn strategy(&self) -> Option<&Strategy<Self>> {
        None
    }

    /// The metric accumulator stored in field `name`.
    fn metric(&self, _name: &str) -> Option<&StatefulMetric> {
        None
    }

    /// Returns a copy of the state with field `name` replaced by `metric`.
    ///
    /// # Errors
    /// Returns `MlError::MissingField` if the state has no such field.
    fn with_metric(&self, name: &str, _metric: StatefulMetric) -> Result<Self> {
        Err(MlError::MissingField {
            field: name.to_string(),
        })
    }
}

/// A state that carries trainable parameters and an optimizer.
pub trait TrainState: StepState {
    fn params(&self) -> &Params;

    fn with_params(&self, params: Params) -> Self;

    /// Runs one optimizer update with `grads`.
    fn apply_gradients(&self, grads: &Params) -> Result<Self>;

    /// Batch-normalization style statistics, if the state keeps any.
    fn batch_stats(&self) -> Option<&TensorMap> {
        None
    }

    fn with_batch_stats(&self, _stats: TensorMap) -> Self {
        self.clone()
    }
}

impl StepState for Tensor {}

impl StepState for TensorMap {}
