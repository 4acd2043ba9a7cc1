//! Training-loop orchestration: strategy-aware training state, step dispatchers
//! that specialize a step function per execution strategy, and periodic triggers
//! for loop actions.

pub mod config;
mod history;
mod loops;
pub mod managed;
mod schedules;

pub use history::{History, Record};
pub use loops::{elapse, Elapse, LoopState};
pub use managed::{
    step, train_step, ApplyFn, Extras, ManagedFunctionCallback, ManagedState, ManagedStep,
    ManagedTrainStep, StepArg, StepContext, StepOutput, StepState, TrainState,
};
pub use schedules::{every, Every};

pub use ml_core::{
    at, logs, tensor, Accuracy, Average, Batch, Elapsed, FiniteDifference, LogGroup, LogValue, Logs, Metric,
    MetricCollection, MetricValue, MlError, Optimizer, Params, Period, Result, StatefulMetric,
    StepFn, Tensor, TensorMap,
};
pub use ml_strategies::{
    get_strategy, DataParallel, Eager, ExecutionStrategy, Jit, Strategy, StrategyKey,
    StrategyRef, StrategySpec,
};
