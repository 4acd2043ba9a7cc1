mod callback;
mod capabilities;
mod state;
mod step;

pub use callback::{ManagedFunctionCallback, StepContext, StepOutput};
pub use capabilities::{StepState, TrainState};
pub use state::{ApplyFn, Extras, ManagedState};
pub use step::{step, train_step, ManagedStep, ManagedTrainStep, Plain, StepArg, StepMode, Train};
