use std::fmt;

use ndarray::ShapeError;

/// The result type used across the training orchestration crates.
pub type Result<T> = std::result::Result<T, MlError>;

/// Errors produced while dispatching, differentiating or re-homing training state.
///
/// Every variant is raised at the point of detection and aborts the current call.
#[derive(Debug)]
pub enum MlError {
    /// A dispatcher was called with more positional arguments than it accepts.
    ArgumentCount { max: usize, got: usize },

    /// A required log category is absent from a step's output.
    MissingOutput {
        key: &'static str,
        got: Vec<String>,
    },

    /// A required log category is present but holds no entries.
    EmptyOutput { key: &'static str },

    /// A named loss is not a zero-rank tensor.
    NonScalarLoss { name: String, shape: Vec<usize> },

    /// A metric accumulator was found where a tensor is required.
    UnexpectedMetric {
        category: &'static str,
        name: String,
    },

    /// No strategy is registered under the given name.
    UnknownStrategy { name: String },

    /// A step function asked for a context value that was not supplied.
    Injection { param: &'static str },

    /// A state or map does not expose the requested field.
    MissingField { field: String },

    /// Two tensors (or tensor structures) disagree in shape.
    ShapeMismatch {
        what: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    /// A length invariant was violated.
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    /// A leading axis cannot be split evenly.
    Indivisible {
        what: &'static str,
        len: usize,
        parts: usize,
    },

    /// A tensor has fewer axes than an operation needs.
    Rank {
        what: &'static str,
        got: usize,
        min: usize,
    },

    /// Two metric accumulators of different kinds were merged.
    MetricMismatch {
        expected: &'static str,
        got: &'static str,
    },

    /// A device collective was abandoned because another device failed.
    CollectiveAborted,

    /// A device thread panicked while running a step.
    DevicePanicked { device: usize },

    /// An `ndarray` reshape or stack failed.
    Shape(ShapeError),

    /// An input is invalid for domain reasons.
    InvalidInput(String),
}

impl fmt::Display for MlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlError::ArgumentCount { max, got } => {
                write!(f, "expected a maximum of {max} arguments, got {got}")
            }
            MlError::MissingOutput { key, got } => write!(
                f,
                "step function must return logs with a '{key}' category, but got {got:?}"
            ),
            MlError::EmptyOutput { key } => write!(
                f,
                "'{key}' category is empty, at least one entry must be provided in it"
            ),
            MlError::NonScalarLoss { name, shape } => {
                write!(f, "loss '{name}' should be a scalar, but has shape {shape:?}")
            }
            MlError::UnexpectedMetric { category, name } => write!(
                f,
                "entry '{name}' in '{category}' is a metric accumulator, expected a tensor"
            ),
            MlError::UnknownStrategy { name } => write!(f, "unknown strategy '{name}'"),
            MlError::Injection { param } => write!(
                f,
                "step function requires '{param}' but it was not supplied by the caller"
            ),
            MlError::MissingField { field } => write!(f, "state has no field '{field}'"),
            MlError::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {what}: got {got:?}, expected {expected:?}"
            ),
            MlError::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch for {what}: got {got}, expected {expected}"),
            MlError::Indivisible { what, len, parts } => write!(
                f,
                "{what} of length {len} cannot be split evenly into {parts} parts"
            ),
            MlError::Rank { what, got, min } => {
                write!(f, "{what} has rank {got}, expected at least {min}")
            }
            MlError::MetricMismatch { expected, got } => {
                write!(f, "cannot merge a {got} metric into a {expected} metric")
            }
            MlError::CollectiveAborted => {
                write!(f, "device collective aborted because another device failed")
            }
            MlError::DevicePanicked { device } => write!(f, "device {device} panicked"),
            MlError::Shape(e) => write!(f, "shape error: {e}"),
            MlError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for MlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MlError::Shape(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlError {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}
