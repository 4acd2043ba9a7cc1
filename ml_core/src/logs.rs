use std::collections::{btree_map, BTreeMap};

use crate::{
    metrics::StatefulMetric,
    pytree::{next_leaf, Pytree},
    tensor::{self, Tensor, TensorMap},
    MlError, Result,
};

/// Metric accumulators to merge into the state field of the same name.
pub const STATEFUL_METRICS: &str = "stateful_metrics";

/// Scalar losses; summed into the objective of a train step.
pub const LOSSES: &str = "losses";

/// Values identical on every device.
pub const METRICS: &str = "metrics";

/// Per-sample values; their device axis is merged into the sample axis.
pub const PER_SAMPLE_OUTPUTS: &str = "per_sample_outputs";

/// A single logged value.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    Tensor(Tensor),
    Metric(StatefulMetric),
}

impl LogValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            LogValue::Tensor(t) => Some(t),
            LogValue::Metric(_) => None,
        }
    }

    pub fn as_metric(&self) -> Option<&StatefulMetric> {
        match self {
            LogValue::Tensor(_) => None,
            LogValue::Metric(m) => Some(m),
        }
    }
}

impl From<Tensor> for LogValue {
    fn from(value: Tensor) -> Self {
        Self::Tensor(value)
    }
}

impl From<f32> for LogValue {
    fn from(value: f32) -> Self {
        Self::Tensor(tensor::scalar(value))
    }
}

impl From<StatefulMetric> for LogValue {
    fn from(value: StatefulMetric) -> Self {
        Self::Metric(value)
    }
}

impl Pytree for LogValue {
    fn flatten(&self) -> Vec<Tensor> {
        match self {
            LogValue::Tensor(t) => vec![t.clone()],
            LogValue::Metric(m) => m.flatten(),
        }
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        Ok(match self {
            LogValue::Tensor(_) => LogValue::Tensor(next_leaf(leaves)?),
            LogValue::Metric(m) => LogValue::Metric(m.unflatten(leaves)?),
        })
    }
}

/// The entries of one log category, keyed by name.
pub type LogGroup = BTreeMap<String, LogValue>;

/// Step outputs, grouped by category.
///
/// The category decides how a value is reduced when it leaves a multi-device
/// strategy: see [`STATEFUL_METRICS`], [`LOSSES`], [`METRICS`] and
/// [`PER_SAMPLE_OUTPUTS`]. Any other category is left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Logs(BTreeMap<String, LogGroup>);

impl Logs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` as `name` under `category`, creating the category if needed.
    pub fn add(&mut self, category: &str, name: impl Into<String>, value: impl Into<LogValue>) {
        self.0
            .entry(category.to_string())
            .or_default()
            .insert(name.into(), value.into());
    }

    /// Builder form of [`Logs::add`].
    pub fn with(mut self, category: &str, name: impl Into<String>, value: impl Into<LogValue>) -> Self {
        self.add(category, name, value);
        self
    }

    /// Adds `category` with no entries.
    pub fn with_category(mut self, category: &str) -> Self {
        self.0.entry(category.to_string()).or_default();
        self
    }

    pub fn category(&self, category: &str) -> Option<&LogGroup> {
        self.0.get(category)
    }

    pub fn category_mut(&mut self, category: &str) -> Option<&mut LogGroup> {
        self.0.get_mut(category)
    }

    pub fn remove_category(&mut self, category: &str) -> Option<LogGroup> {
        self.0.remove(category)
    }

    pub fn insert_category(&mut self, category: impl Into<String>, group: LogGroup) {
        self.0.insert(category.into(), group);
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn get(&self, category: &str, name: &str) -> Option<&LogValue> {
        self.0.get(category).and_then(|group| group.get(name))
    }

    /// Reads a single-element tensor entry as a float.
    pub fn scalar(&self, category: &str, name: &str) -> Option<f32> {
        self.get(category, name)
            .and_then(LogValue::as_tensor)
            .and_then(tensor::item)
    }

    /// Every tensor entry of `category`.
    ///
    /// # Errors
    /// Returns `MlError::UnexpectedMetric` if the category holds an accumulator.
    pub fn tensors(&self, category: &'static str) -> Result<TensorMap> {
        self.0
            .get(category)
            .into_iter()
            .flatten()
            .map(|(name, value)| match value {
                LogValue::Tensor(t) => Ok((name.clone(), t.clone())),
                LogValue::Metric(_) => Err(MlError::UnexpectedMetric {
                    category,
                    name: name.clone(),
                }),
            })
            .collect()
    }

    /// Adds every entry of `other`, overwriting entries with the same category and name.
    pub fn merge(&mut self, other: Logs) {
        for (category, group) in other.0 {
            self.0.entry(category).or_default().extend(group);
        }
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, LogGroup> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, LogGroup)> for Logs {
    fn from_iter<I: IntoIterator<Item = (String, LogGroup)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Logs {
    type Item = (String, LogGroup);
    type IntoIter = btree_map::IntoIter<String, LogGroup>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Pytree for Logs {
    fn flatten(&self) -> Vec<Tensor> {
        self.0.flatten()
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        Ok(Self(self.0.unflatten(leaves)?))
    }
}
