use std::{fmt, fs, io, num::NonZeroU64, path::Path};

use ml_core::{FiniteDifference, Optimizer};
use ml_strategies::StrategySpec;
use serde::{Deserialize, Serialize};

/// Errors raised while loading a [`RunConfig`].
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    Io(io::Error),
    /// The file is not a valid configuration document.
    Parse(serde_json::Error),
    /// The values parse but cannot drive a run.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Parse(e) => write!(f, "invalid config: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

/// Settings of a training run.
///
/// Every field has a default, so a document only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RunConfig {
    pub strategy: StrategySpec,
    pub optimizer: Optimizer,
    pub total_steps: NonZeroU64,
    pub log_every: NonZeroU64,
    pub eval_every: NonZeroU64,
    pub batch_size: usize,
    pub seed: u64,
    pub grad: FiniteDifference,
}

fn steps(n: u64) -> NonZeroU64 {
    NonZeroU64::new(n).unwrap_or(NonZeroU64::MIN)
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            strategy: StrategySpec::default(),
            optimizer: Optimizer::adam(1e-2),
            total_steps: steps(300),
            log_every: steps(50),
            eval_every: steps(100),
            batch_size: 32,
            seed: 0,
            grad: FiniteDifference::default(),
        }
    }
}

impl RunConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` for malformed JSON and `ConfigError::Invalid` for
    /// values that fail validation.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration at `path`, falling back to the defaults when the file
    /// does not exist.
    ///
    /// # Errors
    /// Returns `ConfigError::Io` if the file cannot be read, or any error of
    /// [`RunConfig::from_json`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_json(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }

        if let StrategySpec::DataParallel {
            devices: Some(devices),
        } = self.strategy
        {
            if self.batch_size % devices.get() != 0 {
                return Err(ConfigError::Invalid(format!(
                    "batch_size {} is not divisible by {devices} devices",
                    self.batch_size
                )));
            }
        }

        if !(self.optimizer.learning_rate() > 0.0) {
            return Err(ConfigError::Invalid("learning_rate must be positive".into()));
        }

        if !(self.grad.epsilon > 0.0) {
            return Err(ConfigError::Invalid("grad.epsilon must be positive".into()));
        }

        Ok(())
    }
}
