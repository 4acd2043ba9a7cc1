use std::{env, sync::Arc};

use anyhow::Context;
use log::info;
use ndarray::{Array1, Array2, Axis, Ix1, Ix2};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use training_loop_orchestration::{
    at, elapse, every,
    config::RunConfig,
    logs::{LOSSES, STATEFUL_METRICS},
    step, tensor, train_step, Accuracy, Average, Batch, Extras, History, LogGroup, LoopState,
    Logs, ManagedState, MetricCollection, MlError, Params, StatefulMetric, StepContext, StepOutput,
    Tensor, TensorMap,
};

const DEFAULT_CONFIG: &str = "run.json";
const TRAIN_SAMPLES: usize = 1024;
const VALID_BATCHES: usize = 4;

/// Two gaussian-ish blobs, one per class, around (-1.5, -1.5) and (1.5, 1.5).
struct Dataset {
    x: Array2<f32>,
    labels: Array1<f32>,
}

impl Dataset {
    fn blobs(n: usize, rng: &mut StdRng) -> Self {
        let mut x = Array2::zeros((n, 2));
        let mut labels = Array1::zeros(n);

        for i in 0..n {
            let class = i % 2;
            let center: f32 = if class == 0 { -1.5 } else { 1.5 };
            x[[i, 0]] = center + rng.random_range(-1.0f32..1.0);
            x[[i, 1]] = center + rng.random_range(-1.0f32..1.0);
            labels[i] = class as f32;
        }

        Self { x, labels }
    }

    fn batch(&self, indices: &[usize]) -> Batch {
        Batch::new()
            .with("x", self.x.select(Axis(0), indices).into_dyn())
            .with("label", self.labels.select(Axis(0), indices).into_dyn())
    }

    /// Endless shuffled batches, reshuffling every epoch.
    fn batches(self, batch_size: usize, mut rng: StdRng) -> impl Iterator<Item = Batch> {
        let mut order: Vec<usize> = (0..self.labels.len()).collect();
        let mut cursor = order.len();

        std::iter::from_fn(move || {
            if cursor + batch_size > order.len() {
                order.shuffle(&mut rng);
                cursor = 0;
            }
            let batch = self.batch(&order[cursor..cursor + batch_size]);
            cursor += batch_size;
            Some(batch)
        })
    }
}

fn linear(params: &Params, x: &Tensor) -> training_loop_orchestration::Result<Tensor> {
    let w = params.require("w")?.view().into_dimensionality::<Ix2>()?;
    let b = params.require("b")?.view().into_dimensionality::<Ix1>()?;
    let x = x.view().into_dimensionality::<Ix2>()?;
    Ok((x.dot(&w) + &b).into_dyn())
}

/// Mean softmax cross-entropy against integer labels.
fn cross_entropy(logits: &Tensor, labels: &Tensor) -> training_loop_orchestration::Result<f32> {
    let logits = logits.view().into_dimensionality::<Ix2>()?;

    let total = logits
        .outer_iter()
        .zip(labels.iter())
        .map(|(row, &label)| -> training_loop_orchestration::Result<f32> {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let log_sum = row.mapv(|v| (v - max).exp()).sum().ln() + max;
            let target = row
                .get(label as usize)
                .copied()
                .ok_or_else(|| MlError::InvalidInput(format!("label {label} out of range")))?;
            Ok(log_sum - target)
        })
        .sum::<training_loop_orchestration::Result<f32>>()?;

    Ok(total / labels.len().max(1) as f32)
}

/// Forward pass plus the single-batch update of the `metrics` field.
fn forward(ctx: &StepContext<ManagedState>) -> training_loop_orchestration::Result<(f32, StatefulMetric)> {
    let batch = ctx.batch()?;
    let labels = batch.require("label")?;
    let logits = ctx.state.apply(batch.require("x")?)?;
    let loss = cross_entropy(&logits, labels)?;

    let outputs = TensorMap::new()
        .with("loss", tensor::scalar(loss))
        .with("logits", logits)
        .with("labels", labels.clone());
    let update = ctx
        .state
        .metric("metrics")
        .ok_or_else(|| MlError::MissingField {
            field: "metrics".into(),
        })?
        .single_from_outputs(&outputs)?;

    Ok((loss, update))
}

fn with_suffix(logs: &Logs, category: &str, suffix: &str) -> Logs {
    let group: LogGroup = logs
        .category(category)
        .into_iter()
        .flatten()
        .map(|(name, value)| (format!("{name}{suffix}"), value.clone()))
        .collect();

    let mut out = Logs::new();
    out.insert_category(category, group);
    out
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let path = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = RunConfig::load(&path).with_context(|| format!("loading {path}"))?;
    info!(strategy = format!("{:?}", config.strategy).as_str(); "starting run");

    let mut rng = StdRng::seed_from_u64(config.seed);
    let train_data = Dataset::blobs(TRAIN_SAMPLES, &mut rng);
    let valid_data = Dataset::blobs(config.batch_size * VALID_BATCHES, &mut rng);

    let params = Params::new()
        .with(
            "w",
            Array2::from_shape_fn((2, 2), |_| rng.random_range(-0.1f32..0.1)).into_dyn(),
        )
        .with("b", Array1::<f32>::zeros(2).into_dyn());

    let metrics = MetricCollection::new()
        .with("loss", Average::from_output("loss"))
        .with("accuracy", Accuracy::new());

    let mut state = ManagedState::create(
        Arc::new(linear),
        params,
        config.optimizer,
        config.strategy,
        Extras::new().with_metric("metrics", metrics),
    )?;

    let mut train = train_step(
        |ctx: &StepContext<ManagedState>| {
            let (loss, update) = forward(ctx)?;
            let logs = Logs::new()
                .with(LOSSES, "loss", loss)
                .with(STATEFUL_METRICS, "metrics", update);
            Ok(StepOutput::Logs(logs))
        },
        config.strategy,
    )?
    .with_grad(config.grad);

    let mut eval = step(
        |ctx: &StepContext<ManagedState>| {
            let (_, update) = forward(ctx)?;
            Ok(StepOutput::Logs(
                Logs::new().with(STATEFUL_METRICS, "metrics", update),
            ))
        },
        config.strategy,
    )?;

    let mut log_every = every(config.log_every);
    let mut eval_every = every(config.eval_every);
    let end = at(config.total_steps);
    let mut history = History::new();

    let batches = train_data.batches(config.batch_size, StdRng::seed_from_u64(config.seed + 1));
    for (elapsed, batch) in elapse(batches) {
        let mut logs = Logs::new();

        let (train_logs, next) = train.loop_callback(state, &LoopState { elapsed, batch })?;
        state = next;

        if log_every.fire(&elapsed) {
            logs.merge(with_suffix(&train_logs, STATEFUL_METRICS, ""));
            state = state.reset_metrics();
        }

        if eval_every.fire(&elapsed) {
            let mut eval_state = state.reset_metrics();
            let mut eval_logs = Logs::new();
            for chunk in (0..valid_data.labels.len())
                .collect::<Vec<_>>()
                .chunks(config.batch_size)
            {
                let (l, s) = eval.call(
                    eval_state,
                    Some(valid_data.batch(chunk)),
                    Some(elapsed),
                    None,
                )?;
                eval_state = s;
                eval_logs = l;
            }
            logs.merge(with_suffix(&eval_logs, STATEFUL_METRICS, "_valid"));
        }

        if !logs.is_empty() {
            info!(
                step = elapsed.steps,
                loss = logs.scalar(STATEFUL_METRICS, "loss").unwrap_or(f32::NAN) as f64,
                accuracy = logs.scalar(STATEFUL_METRICS, "accuracy").unwrap_or(f32::NAN) as f64;
                "progress"
            );
        }
        history.commit_logs(&elapsed, &logs);

        if elapsed.reached(&end) {
            break;
        }
    }

    let [steps, loss, accuracy]: [Vec<f32>; 3] = history
        .collect(&["steps", "loss", "accuracy"])
        .try_into()
        .map_err(|_| anyhow::anyhow!("history returned the wrong number of series"))?;
    let valid = history.collect(&["steps", "loss_valid", "accuracy_valid"]);

    info!(
        points = steps.len(),
        final_loss = loss.last().copied().unwrap_or(f32::NAN) as f64,
        final_accuracy = accuracy.last().copied().unwrap_or(f32::NAN) as f64,
        valid_points = valid.first().map_or(0, Vec::len);
        "training finished"
    );

    Ok(())
}
