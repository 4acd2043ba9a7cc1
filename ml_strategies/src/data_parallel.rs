use std::{num::NonZeroUsize, sync::Arc, thread};

use log::{trace, warn};
use ml_core::{
    pytree::{map_leaves, rebuild, stack_trees, Pytree},
    step_fn,
    tensor::{self, Tensor},
    Batch, LogGroup, Logs, MlError, Params, Result, StatefulMetric, StepFn, TensorMap,
};

use crate::{
    collective::{all_reduce_current, Collective, DeviceGuard, Reduce},
    strategy::{ExecutionStrategy, StrategyKey},
};

/// Replicates the state over `devices` workers and splits every batch between them.
///
/// Resident states carry a leading device axis on every leaf. Each device runs the
/// step on its own replica and shard in a dedicated thread; gradients, batch
/// statistics and metrics are combined with all-reduce collectives so replicas stay
/// identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataParallel {
    devices: NonZeroUsize,
}

impl DataParallel {
    pub fn new(devices: NonZeroUsize) -> Self {
        Self { devices }
    }

    /// One device per available hardware thread.
    pub fn available() -> Self {
        let devices = thread::available_parallelism().unwrap_or(NonZeroUsize::MIN);
        Self::new(devices)
    }

    pub fn devices(&self) -> usize {
        self.devices.get()
    }

    fn replica<T: Pytree>(tree: &T, device: usize) -> Result<T> {
        map_leaves(tree, |t| tensor::take_leading(t, device))
    }
}

fn reduce_leaves<T: Pytree>(tree: T, op: Reduce) -> Result<T> {
    match all_reduce_current(tree.flatten(), op) {
        Some(reduced) => rebuild(&tree, reduced?),
        None => Ok(tree),
    }
}

fn lower_group<F>(group: LogGroup, f: F) -> Result<LogGroup>
where
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    map_leaves(&group, f)
}

impl<S> ExecutionStrategy<S> for DataParallel
where
    S: Pytree + Send + Sync + 'static,
{
    fn key(&self) -> StrategyKey {
        StrategyKey::DataParallel {
            devices: self.devices,
        }
    }

    fn lift_batch(&self, batch: Batch) -> Result<Batch> {
        let devices = self.devices();
        batch.map(|t| tensor::split_leading(t, devices))
    }

    fn to_host(&self, state: S) -> Result<S> {
        Self::replica(&state, 0)
    }

    fn from_host(&self, state: S) -> Result<S> {
        let devices = self.devices();
        map_leaves(&state, |t| tensor::replicate(t, devices))
    }

    fn wrap(&self, step: StepFn<S>) -> StepFn<S> {
        let devices = self.devices();

        step_fn(move |state: S, batch: Option<Batch>, broadcasts, statics| {
            let replicas = (0..devices)
                .map(|i| Self::replica(&state, i))
                .collect::<Result<Vec<_>>>()?;
            let shards = (0..devices)
                .map(|i| batch.as_ref().map(|b| Self::replica(b, i)).transpose())
                .collect::<Result<Vec<_>>>()?;

            trace!(devices = devices; "running step on every device");

            let collective = Arc::new(Collective::new(devices));
            let results: Vec<Result<(Logs, S)>> = thread::scope(|scope| {
                let handles: Vec<_> = replicas
                    .into_iter()
                    .zip(shards)
                    .enumerate()
                    .map(|(device, (replica, shard))| {
                        let step = Arc::clone(&step);
                        let collective = Arc::clone(&collective);
                        let statics = statics.clone();
                        scope.spawn(move || {
                            let _guard = DeviceGuard::enter(device, collective);
                            step(replica, shard, broadcasts, statics)
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .enumerate()
                    .map(|(device, handle)| {
                        handle.join().unwrap_or_else(|_| {
                            warn!(device = device; "device thread panicked");
                            Err(MlError::DevicePanicked { device })
                        })
                    })
                    .collect()
            });

            // an abort is only a symptom; report the failure that caused it
            let mut outputs = Vec::with_capacity(devices);
            let mut aborted = false;
            for result in results {
                match result {
                    Ok(output) => outputs.push(output),
                    Err(MlError::CollectiveAborted) => aborted = true,
                    Err(e) => return Err(e),
                }
            }
            if aborted {
                return Err(MlError::CollectiveAborted);
            }

            let (logs, states): (Vec<Logs>, Vec<S>) = outputs.into_iter().unzip();
            Ok((stack_trees(&logs)?, stack_trees(&states)?))
        })
    }

    fn handle_grads(&self, grads: Params) -> Result<Params> {
        reduce_leaves(grads, Reduce::Mean)
    }

    fn handle_batch_stats(&self, stats: TensorMap) -> Result<TensorMap> {
        reduce_leaves(stats, Reduce::Mean)
    }

    fn handle_metric(&self, metric: StatefulMetric) -> Result<StatefulMetric> {
        reduce_leaves(metric, Reduce::Sum)
    }

    fn lower_replicated(&self, group: LogGroup) -> Result<LogGroup> {
        lower_group(group, |t| tensor::take_leading(t, 0))
    }

    fn lower_averageable(&self, group: LogGroup) -> Result<LogGroup> {
        lower_group(group, tensor::mean_leading)
    }

    fn lower_tileable(&self, group: LogGroup) -> Result<LogGroup> {
        lower_group(group, tensor::merge_leading)
    }
}
