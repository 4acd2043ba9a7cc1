use std::sync::Arc;

use crate::{logs::Logs, progress::Elapsed, tensor::Batch, Result};

/// Values shared with every step call of a loop, such as its progress.
pub type Broadcasts = Elapsed;

/// Compile-time configuration of a step call. Part of the cache signature of compiling
/// strategies, so changing it forces a retrace.
pub type Statics = serde_json::Value;

/// The standard calling convention every step is adapted to.
///
/// Takes the state, the optional batch, broadcasts and statics, and returns the step's
/// logs alongside the new state.
pub type StepFn<S> =
    Arc<dyn Fn(S, Option<Batch>, Option<Broadcasts>, Option<Statics>) -> Result<(Logs, S)> + Send + Sync>;

/// Wraps a closure into a [`StepFn`].
pub fn step_fn<S, F>(f: F) -> StepFn<S>
where
    F: Fn(S, Option<Batch>, Option<Broadcasts>, Option<Statics>) -> Result<(Logs, S)>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}
