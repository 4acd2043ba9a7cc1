mod error;
mod grad;
pub mod logs;
mod metrics;
mod optimizer;
mod progress;
pub mod pytree;
mod step;
pub mod tensor;

pub use error::{MlError, Result};
pub use grad::FiniteDifference;
pub use logs::{LogGroup, LogValue, Logs};
pub use metrics::{Accuracy, Average, Metric, MetricCollection, MetricValue, StatefulMetric};
pub use optimizer::Optimizer;
pub use progress::{at, now, Elapsed, Period};
pub use pytree::Pytree;
pub use step::{step_fn, Broadcasts, Statics, StepFn};
pub use tensor::{Batch, OptState, Params, Tensor, TensorMap};
