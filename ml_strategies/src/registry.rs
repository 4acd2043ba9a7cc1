use std::num::NonZeroUsize;

use ml_core::{MlError, Pytree, Result};
use serde::{Deserialize, Serialize};

use crate::{
    data_parallel::DataParallel, eager::Eager, jit::Jit, strategy::Strategy,
};

/// Serializable description of a strategy, as found in run configurations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StrategySpec {
    Eager,
    #[default]
    Jit,
    DataParallel {
        /// Defaults to one device per available hardware thread.
        #[serde(default)]
        devices: Option<NonZeroUsize>,
    },
}

/// Looks up a built-in strategy by name.
///
/// # Args
/// * `name` - One of `eager`, `jit`, `data_parallel` or `data_parallel:<devices>`.
///
/// # Errors
/// Returns `MlError::UnknownStrategy` for any other name.
pub fn get_strategy<S>(name: &str) -> Result<Strategy<S>>
where
    S: Pytree + Send + Sync + 'static,
{
    let unknown = || MlError::UnknownStrategy {
        name: name.to_string(),
    };

    match name.split_once(':') {
        None => match name {
            "eager" => Ok(Strategy::new(Eager)),
            "jit" => Ok(Strategy::new(Jit::new())),
            "data_parallel" => Ok(Strategy::new(DataParallel::available())),
            _ => Err(unknown()),
        },
        Some(("data_parallel", devices)) => {
            let devices = devices.parse::<NonZeroUsize>().map_err(|_| unknown())?;
            Ok(Strategy::new(DataParallel::new(devices)))
        }
        Some(_) => Err(unknown()),
    }
}

impl<S> Strategy<S>
where
    S: Pytree + Send + Sync + 'static,
{
    /// Builds the strategy described by `spec`.
    pub fn from_spec(spec: &StrategySpec) -> Self {
        match spec {
            StrategySpec::Eager => Strategy::new(Eager),
            StrategySpec::Jit => Strategy::new(Jit::new()),
            StrategySpec::DataParallel { devices: None } => Strategy::new(DataParallel::available()),
            StrategySpec::DataParallel {
                devices: Some(devices),
            } => Strategy::new(DataParallel::new(*devices)),
        }
    }
}

/// A strategy given either by registry name or as a ready instance.
pub enum StrategyRef<S> {
    Name(String),
    Strategy(Strategy<S>),
}

impl<S> StrategyRef<S>
where
    S: Pytree + Send + Sync + 'static,
{
    /// Resolves the reference to a strategy instance.
    ///
    /// # Errors
    /// Returns `MlError::UnknownStrategy` if a name is not registered.
    pub fn resolve(self) -> Result<Strategy<S>> {
        match self {
            StrategyRef::Name(name) => get_strategy(&name),
            StrategyRef::Strategy(strategy) => Ok(strategy),
        }
    }
}

impl<S> From<&str> for StrategyRef<S> {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl<S> From<String> for StrategyRef<S> {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl<S> From<Strategy<S>> for StrategyRef<S> {
    fn from(value: Strategy<S>) -> Self {
        Self::Strategy(value)
    }
}

impl<S> From<&Strategy<S>> for StrategyRef<S> {
    fn from(value: &Strategy<S>) -> Self {
        Self::Strategy(value.clone())
    }
}

impl<S> From<StrategySpec> for StrategyRef<S>
where
    S: Pytree + Send + Sync + 'static,
{
    fn from(value: StrategySpec) -> Self {
        Self::Strategy(Strategy::from_spec(&value))
    }
}
