use std::{
    fmt,
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    ops::Deref,
    sync::Arc,
};

use ml_core::{Batch, LogGroup, Params, Result, StatefulMetric, StepFn, TensorMap};

/// The semantic identity of a strategy.
///
/// Two strategies with the same key are interchangeable: dispatch caches and state
/// migration compare keys, never instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StrategyKey {
    Eager,
    Jit,
    DataParallel { devices: NonZeroUsize },
    Custom(String),
}

impl fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKey::Eager => write!(f, "eager"),
            StrategyKey::Jit => write!(f, "jit"),
            StrategyKey::DataParallel { devices } => write!(f, "data_parallel:{devices}"),
            StrategyKey::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// An execution mode for step functions over states of type `S`.
///
/// A strategy decides where a state lives (its resident form), how a batch is laid
/// out for it, how a step callable runs, and how each category of step output is
/// brought back to host form. Every operation except [`ExecutionStrategy::key`] has
/// an identity default, which is the behavior of a single-device strategy.
pub trait ExecutionStrategy<S>: Send + Sync {
    /// The identity of this strategy.
    fn key(&self) -> StrategyKey;

    /// Lays `batch` out for this strategy's devices.
    ///
    /// # Errors
    /// Returns an error if the batch cannot be distributed, e.g. an uneven split.
    fn lift_batch(&self, batch: Batch) -> Result<Batch> {
        Ok(batch)
    }

    /// Converts a resident state into the canonical host form.
    fn to_host(&self, state: S) -> Result<S> {
        Ok(state)
    }

    /// Converts a host-form state into this strategy's resident form.
    fn from_host(&self, state: S) -> Result<S> {
        Ok(state)
    }

    /// Specializes a step callable for this strategy.
    ///
    /// The returned callable takes and returns resident states and lifted batches.
    fn wrap(&self, step: StepFn<S>) -> StepFn<S> {
        step
    }

    /// Reduces raw gradients, e.g. across devices.
    fn handle_grads(&self, grads: Params) -> Result<Params> {
        Ok(grads)
    }

    /// Reduces batch statistics, e.g. across devices.
    fn handle_batch_stats(&self, stats: TensorMap) -> Result<TensorMap> {
        Ok(stats)
    }

    /// Normalizes a single-step metric accumulator before it is merged into state.
    fn handle_metric(&self, metric: StatefulMetric) -> Result<StatefulMetric> {
        Ok(metric)
    }

    /// Lowers values that are identical on every device.
    fn lower_replicated(&self, group: LogGroup) -> Result<LogGroup> {
        Ok(group)
    }

    /// Lowers values whose host form is the mean over devices.
    fn lower_averageable(&self, group: LogGroup) -> Result<LogGroup> {
        Ok(group)
    }

    /// Lowers per-sample values whose device axis joins the sample axis.
    fn lower_tileable(&self, group: LogGroup) -> Result<LogGroup> {
        Ok(group)
    }

    /// Lowers values of any other category.
    fn lower_sharded(&self, group: LogGroup) -> Result<LogGroup> {
        Ok(group)
    }
}

/// A shared handle to an [`ExecutionStrategy`].
///
/// Cloning is cheap. Equality and hashing follow [`StrategyKey`], so a strategy built
/// twice from the same name compares equal.
pub struct Strategy<S>(Arc<dyn ExecutionStrategy<S>>);

impl<S> Strategy<S> {
    pub fn new(strategy: impl ExecutionStrategy<S> + 'static) -> Self {
        Self(Arc::new(strategy))
    }

    pub fn from_arc(strategy: Arc<dyn ExecutionStrategy<S>>) -> Self {
        Self(strategy)
    }
}

impl<S> Deref for Strategy<S> {
    type Target = dyn ExecutionStrategy<S>;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl<S> Clone for Strategy<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S> PartialEq for Strategy<S> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<S> Eq for Strategy<S> {}

impl<S> Hash for Strategy<S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl<S> fmt::Debug for Strategy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Strategy").field(&self.key()).finish()
    }
}

impl<S> fmt::Display for Strategy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key().fmt(f)
    }
}
