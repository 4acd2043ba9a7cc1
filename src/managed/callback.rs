use std::sync::Arc;

use ml_core::{Batch, Broadcasts, Logs, MlError, Result, Statics};

use super::capabilities::StepState;

/// Everything a step function may read at one call.
///
/// Only `state` is always present. The accessors fail with an injection error when
/// the caller did not supply the value, which is how a step function declares that it
/// requires it.
#[derive(Debug, Clone)]
pub struct StepContext<S> {
    pub state: S,
    batch: Option<Batch>,
    broadcasts: Option<Broadcasts>,
    statics: Option<Statics>,
}

impl<S> StepContext<S> {
    pub fn new(
        state: S,
        batch: Option<Batch>,
        broadcasts: Option<Broadcasts>,
        statics: Option<Statics>,
    ) -> Self {
        Self {
            state,
            batch,
            broadcasts,
            statics,
        }
    }

    /// The batch, required.
    ///
    /// # Errors
    /// Returns `MlError::Injection` if the caller passed no batch.
    pub fn batch(&self) -> Result<&Batch> {
        self.batch
            .as_ref()
            .ok_or(MlError::Injection { param: "batch" })
    }

    /// The broadcasts, required.
    pub fn broadcasts(&self) -> Result<Broadcasts> {
        self.broadcasts
            .ok_or(MlError::Injection { param: "broadcasts" })
    }

    /// The statics, required.
    pub fn statics(&self) -> Result<&Statics> {
        self.statics
            .as_ref()
            .ok_or(MlError::Injection { param: "statics" })
    }

    pub fn batch_opt(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    pub fn broadcasts_opt(&self) -> Option<Broadcasts> {
        self.broadcasts
    }

    pub fn statics_opt(&self) -> Option<&Statics> {
        self.statics.as_ref()
    }
}

/// What a step function hands back.
#[derive(Debug, Clone)]
pub enum StepOutput<S> {
    /// No logs, state unchanged.
    Unchanged,
    /// A new state and no logs.
    State(S),
    /// Logs, state unchanged.
    Logs(Logs),
    Both(Logs, S),
}

impl<S> StepOutput<S> {
    /// Normalizes to `(logs, state)`, falling back to `state` when none was returned.
    pub fn into_standard(self, state: S) -> (Logs, S) {
        match self {
            StepOutput::Unchanged => (Logs::new(), state),
            StepOutput::State(next) => (Logs::new(), next),
            StepOutput::Logs(logs) => (logs, state),
            StepOutput::Both(logs, next) => (logs, next),
        }
    }
}

impl<S> From<(Logs, S)> for StepOutput<S> {
    fn from((logs, state): (Logs, S)) -> Self {
        Self::Both(logs, state)
    }
}

impl<S> From<Logs> for StepOutput<S> {
    fn from(logs: Logs) -> Self {
        Self::Logs(logs)
    }
}

type UserStepFn<S> = Arc<dyn Fn(&StepContext<S>) -> Result<StepOutput<S>> + Send + Sync>;

/// A user step function adapted to the standard calling convention.
pub struct ManagedFunctionCallback<S>(UserStepFn<S>);

impl<S: StepState> ManagedFunctionCallback<S> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&StepContext<S>) -> Result<StepOutput<S>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Calls the step function and normalizes its output to `(logs, state)`.
    pub fn call(
        &self,
        state: S,
        batch: Option<Batch>,
        broadcasts: Option<Broadcasts>,
        statics: Option<Statics>,
    ) -> Result<(Logs, S)> {
        let ctx = StepContext::new(state, batch, broadcasts, statics);
        let output = (self.0)(&ctx)?;
        Ok(output.into_standard(ctx.state))
    }
}

impl<S> Clone for ManagedFunctionCallback<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}
