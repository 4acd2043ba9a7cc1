use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use log::debug;
use ml_core::{
    pytree::{leaf_shapes, Pytree},
    step_fn, MlError, StepFn,
};
use parking_lot::Mutex;

use crate::strategy::{ExecutionStrategy, StrategyKey};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Signature {
    state: Vec<Vec<usize>>,
    batch: Option<Vec<Vec<usize>>>,
    statics: Option<String>,
}

/// Specializes steps per input signature.
///
/// A signature is the leaf shapes of the state and batch plus the statics. The first
/// call with a new signature is traced; later calls reuse the specialization. A
/// specialized step must hand back a state with the leaf shapes it received.
#[derive(Debug, Clone, Default)]
pub struct Jit {
    traces: Arc<AtomicUsize>,
}

impl Jit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of signatures traced by every step wrapped by this instance.
    pub fn traces(&self) -> usize {
        self.traces.load(Ordering::Relaxed)
    }
}

impl<S> ExecutionStrategy<S> for Jit
where
    S: Pytree + Send + Sync + 'static,
{
    fn key(&self) -> StrategyKey {
        StrategyKey::Jit
    }

    fn wrap(&self, step: StepFn<S>) -> StepFn<S> {
        let traces = Arc::clone(&self.traces);
        let seen = Mutex::new(HashSet::new());

        step_fn(move |state: S, batch, broadcasts, statics| {
            let signature = Signature {
                state: leaf_shapes(&state),
                batch: batch.as_ref().map(leaf_shapes),
                statics: statics.as_ref().map(ToString::to_string),
            };
            let expected = signature.state.clone();

            if seen.lock().insert(signature) {
                let n = traces.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(traces = n, leaves = expected.len(); "tracing step for new signature");
            }

            let (logs, new_state) = step(state, batch, broadcasts, statics)?;

            let got = leaf_shapes(&new_state);
            if got != expected {
                let (got, expected) = got
                    .iter()
                    .zip(&expected)
                    .find(|(g, e)| g != e)
                    .map(|(g, e)| (g.clone(), e.clone()))
                    .unwrap_or_else(|| (vec![got.len()], vec![expected.len()]));
                return Err(MlError::ShapeMismatch {
                    what: "state returned by a compiled step".to_string(),
                    got,
                    expected,
                });
            }

            Ok((logs, new_state))
        })
    }
}
