use std::collections::BTreeMap;

use crate::{
    pytree::{next_leaf, Pytree},
    tensor::{scalar, Tensor, TensorMap},
    MlError, Result,
};

/// The result of computing a metric: a single value or a group of named values.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(f32),
    Map(BTreeMap<String, f32>),
}

/// A mergeable accumulator of running statistics.
///
/// Accumulators are values: merging returns a new accumulator and leaves both
/// inputs untouched.
pub trait Metric: Sized {
    /// Combines the statistics of `self` and `other`.
    ///
    /// # Errors
    /// Returns `MlError::MetricMismatch` or `MlError::ShapeMismatch` when the two
    /// accumulators cannot be combined.
    fn merge(&self, other: &Self) -> Result<Self>;

    /// Computes the metric from the accumulated statistics.
    fn compute(&self) -> MetricValue;

    /// Returns a zero accumulator of the same kind and configuration, with leaves
    /// shaped like those of `self`.
    fn empty(&self) -> Self;
}

// Accumulator leaves may carry a leading device axis while resident on a replicated
// strategy; every replica holds the same value, so the first entry is read.
fn first(tensor: &Tensor) -> f32 {
    tensor.iter().next().copied().unwrap_or(0.0)
}

// keeps any leading device axis, so an emptied accumulator stays resident
fn zeros_like(tensor: &Tensor) -> Tensor {
    Tensor::zeros(tensor.raw_dim())
}

fn add_leaves(what: &str, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.shape() != b.shape() {
        return Err(MlError::ShapeMismatch {
            what: what.to_string(),
            got: b.shape().to_vec(),
            expected: a.shape().to_vec(),
        });
    }
    Ok(a + b)
}

/// Running mean of a named model output.
#[derive(Debug, Clone, PartialEq)]
pub struct Average {
    source: String,
    total: Tensor,
    count: Tensor,
}

impl Average {
    /// An empty accumulator that reads `source` from model outputs.
    pub fn from_output(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            total: scalar(0.0),
            count: scalar(0.0),
        }
    }

    /// An accumulator holding a single observation.
    pub fn from_value(source: impl Into<String>, value: f32) -> Self {
        Self {
            source: source.into(),
            total: scalar(value),
            count: scalar(1.0),
        }
    }

    /// An accumulator holding every element of `values` as an observation.
    pub fn from_values(source: impl Into<String>, values: &Tensor) -> Self {
        Self {
            source: source.into(),
            total: scalar(values.sum()),
            count: scalar(values.len() as f32),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn total(&self) -> f32 {
        first(&self.total)
    }

    pub fn count(&self) -> f32 {
        first(&self.count)
    }

    fn single_from_outputs(&self, outputs: &TensorMap) -> Result<Self> {
        let values = outputs.require(&self.source)?;
        Ok(Self::from_values(self.source.clone(), values))
    }
}

impl Metric for Average {
    fn merge(&self, other: &Self) -> Result<Self> {
        Ok(Self {
            source: self.source.clone(),
            total: add_leaves("average total", &self.total, &other.total)?,
            count: add_leaves("average count", &self.count, &other.count)?,
        })
    }

    fn compute(&self) -> MetricValue {
        let count = self.count();
        let mean = if count > 0.0 {
            self.total() / count
        } else {
            f32::NAN
        };
        MetricValue::Scalar(mean)
    }

    fn empty(&self) -> Self {
        Self {
            source: self.source.clone(),
            total: zeros_like(&self.total),
            count: zeros_like(&self.count),
        }
    }
}

impl Pytree for Average {
    fn flatten(&self) -> Vec<Tensor> {
        vec![self.total.clone(), self.count.clone()]
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        Ok(Self {
            source: self.source.clone(),
            total: next_leaf(leaves)?,
            count: next_leaf(leaves)?,
        })
    }
}

/// Fraction of samples whose highest logit matches the integer label.
///
/// Reads `logits` (`[batch, classes]`) and `labels` (`[batch]`) from model outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Accuracy {
    correct: Tensor,
    count: Tensor,
}

impl Default for Accuracy {
    fn default() -> Self {
        Self {
            correct: scalar(0.0),
            count: scalar(0.0),
        }
    }
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }

    /// An accumulator for a single batch of predictions.
    ///
    /// # Errors
    /// Returns `MlError::Rank` if `logits` is not a matrix, and `MlError::SizeMismatch`
    /// if the number of labels differs from the number of rows.
    pub fn from_logits(logits: &Tensor, labels: &Tensor) -> Result<Self> {
        if logits.ndim() != 2 {
            return Err(MlError::Rank {
                what: "logits",
                got: logits.ndim(),
                min: 2,
            });
        }
        if labels.len() != logits.shape()[0] {
            return Err(MlError::SizeMismatch {
                what: "labels",
                got: labels.len(),
                expected: logits.shape()[0],
            });
        }

        let correct = logits
            .outer_iter()
            .zip(labels.iter())
            .filter(|(row, label)| {
                let predicted = row
                    .iter()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0;
                (predicted as f32 - **label).abs() < 0.5
            })
            .count();

        Ok(Self {
            correct: scalar(correct as f32),
            count: scalar(labels.len() as f32),
        })
    }

    fn single_from_outputs(&self, outputs: &TensorMap) -> Result<Self> {
        Self::from_logits(outputs.require("logits")?, outputs.require("labels")?)
    }
}

impl Metric for Accuracy {
    fn merge(&self, other: &Self) -> Result<Self> {
        Ok(Self {
            correct: add_leaves("accuracy correct", &self.correct, &other.correct)?,
            count: add_leaves("accuracy count", &self.count, &other.count)?,
        })
    }

    fn compute(&self) -> MetricValue {
        let count = first(&self.count);
        let value = if count > 0.0 {
            first(&self.correct) / count
        } else {
            f32::NAN
        };
        MetricValue::Scalar(value)
    }

    fn empty(&self) -> Self {
        Self {
            correct: zeros_like(&self.correct),
            count: zeros_like(&self.count),
        }
    }
}

impl Pytree for Accuracy {
    fn flatten(&self) -> Vec<Tensor> {
        vec![self.correct.clone(), self.count.clone()]
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        Ok(Self {
            correct: next_leaf(leaves)?,
            count: next_leaf(leaves)?,
        })
    }
}

/// A named group of accumulators that is merged, computed and reset as one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricCollection {
    metrics: BTreeMap<String, StatefulMetric>,
}

impl MetricCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, metric: impl Into<StatefulMetric>) -> Self {
        self.metrics.insert(name.into(), metric.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&StatefulMetric> {
        self.metrics.get(name)
    }

    /// Builds a single-batch accumulator for every member from model outputs.
    pub fn single_from_outputs(&self, outputs: &TensorMap) -> Result<Self> {
        let metrics = self
            .metrics
            .iter()
            .map(|(name, metric)| Ok((name.clone(), metric.single_from_outputs(outputs)?)))
            .collect::<Result<_>>()?;
        Ok(Self { metrics })
    }

    /// Merges a single-batch accumulator built from `outputs` into `self`.
    pub fn update(&self, outputs: &TensorMap) -> Result<Self> {
        self.merge(&self.single_from_outputs(outputs)?)
    }
}

impl Metric for MetricCollection {
    fn merge(&self, other: &Self) -> Result<Self> {
        let metrics = self
            .metrics
            .iter()
            .map(|(name, metric)| {
                let update = other.metrics.get(name).ok_or_else(|| MlError::MissingField {
                    field: name.clone(),
                })?;
                Ok((name.clone(), metric.merge(update)?))
            })
            .collect::<Result<_>>()?;
        Ok(Self { metrics })
    }

    fn compute(&self) -> MetricValue {
        let mut values = BTreeMap::new();
        for (name, metric) in &self.metrics {
            match metric.compute() {
                MetricValue::Scalar(v) => {
                    values.insert(name.clone(), v);
                }
                MetricValue::Map(inner) => values.extend(inner),
            }
        }
        MetricValue::Map(values)
    }

    fn empty(&self) -> Self {
        let metrics = self
            .metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.empty()))
            .collect();
        Self { metrics }
    }
}

impl Pytree for MetricCollection {
    fn flatten(&self) -> Vec<Tensor> {
        self.metrics.flatten()
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        Ok(Self {
            metrics: self.metrics.unflatten(leaves)?,
        })
    }
}

/// The accumulators a state field or a log entry can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum StatefulMetric {
    Average(Average),
    Accuracy(Accuracy),
    Collection(MetricCollection),
}

impl StatefulMetric {
    /// A stable identifier for the accumulator kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StatefulMetric::Average(_) => "average",
            StatefulMetric::Accuracy(_) => "accuracy",
            StatefulMetric::Collection(_) => "collection",
        }
    }

    /// Builds a single-batch accumulator of the same kind from model outputs.
    pub fn single_from_outputs(&self, outputs: &TensorMap) -> Result<Self> {
        Ok(match self {
            StatefulMetric::Average(m) => StatefulMetric::Average(m.single_from_outputs(outputs)?),
            StatefulMetric::Accuracy(m) => {
                StatefulMetric::Accuracy(m.single_from_outputs(outputs)?)
            }
            StatefulMetric::Collection(m) => {
                StatefulMetric::Collection(m.single_from_outputs(outputs)?)
            }
        })
    }

    /// Merges a single-batch accumulator built from `outputs` into `self`.
    pub fn update(&self, outputs: &TensorMap) -> Result<Self> {
        self.merge(&self.single_from_outputs(outputs)?)
    }
}

impl Metric for StatefulMetric {
    fn merge(&self, other: &Self) -> Result<Self> {
        match (self, other) {
            (StatefulMetric::Average(a), StatefulMetric::Average(b)) => {
                Ok(StatefulMetric::Average(a.merge(b)?))
            }
            (StatefulMetric::Accuracy(a), StatefulMetric::Accuracy(b)) => {
                Ok(StatefulMetric::Accuracy(a.merge(b)?))
            }
            (StatefulMetric::Collection(a), StatefulMetric::Collection(b)) => {
                Ok(StatefulMetric::Collection(a.merge(b)?))
            }
            _ => Err(MlError::MetricMismatch {
                expected: self.kind(),
                got: other.kind(),
            }),
        }
    }

    fn compute(&self) -> MetricValue {
        match self {
            StatefulMetric::Average(m) => m.compute(),
            StatefulMetric::Accuracy(m) => m.compute(),
            StatefulMetric::Collection(m) => m.compute(),
        }
    }

    fn empty(&self) -> Self {
        match self {
            StatefulMetric::Average(m) => StatefulMetric::Average(m.empty()),
            StatefulMetric::Accuracy(m) => StatefulMetric::Accuracy(m.empty()),
            StatefulMetric::Collection(m) => StatefulMetric::Collection(m.empty()),
        }
    }
}

impl Pytree for StatefulMetric {
    fn flatten(&self) -> Vec<Tensor> {
        match self {
            StatefulMetric::Average(m) => m.flatten(),
            StatefulMetric::Accuracy(m) => m.flatten(),
            StatefulMetric::Collection(m) => m.flatten(),
        }
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        Ok(match self {
            StatefulMetric::Average(m) => StatefulMetric::Average(m.unflatten(leaves)?),
            StatefulMetric::Accuracy(m) => StatefulMetric::Accuracy(m.unflatten(leaves)?),
            StatefulMetric::Collection(m) => StatefulMetric::Collection(m.unflatten(leaves)?),
        })
    }
}

impl From<Average> for StatefulMetric {
    fn from(value: Average) -> Self {
        Self::Average(value)
    }
}

impl From<Accuracy> for StatefulMetric {
    fn from(value: Accuracy) -> Self {
        Self::Accuracy(value)
    }
}

impl From<MetricCollection> for StatefulMetric {
    fn from(value: MetricCollection) -> Self {
        Self::Collection(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn average_merges_and_computes_mean() {
        let a = Average::from_value("loss", 2.0);
        let b = Average::from_value("loss", 4.0);
        assert_eq!(a.merge(&b).unwrap().compute(), MetricValue::Scalar(3.0));
    }

    #[test]
    fn empty_average_computes_nan() {
        let MetricValue::Scalar(v) = Average::from_output("loss").compute() else {
            panic!("expected a scalar");
        };
        assert!(v.is_nan());
    }

    #[test]
    fn accuracy_counts_argmax_hits() {
        let logits = arr2(&[[0.1, 0.9], [0.8, 0.2], [0.3, 0.7]]).into_dyn();
        let labels = arr1(&[1.0, 1.0, 1.0]).into_dyn();
        let acc = Accuracy::from_logits(&logits, &labels).unwrap();
        let MetricValue::Scalar(v) = acc.compute() else {
            panic!("expected a scalar");
        };
        assert!((v - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn collection_update_and_reset() {
        let metrics = MetricCollection::new()
            .with("loss", Average::from_output("loss"))
            .with("accuracy", Accuracy::new());
        let outputs = TensorMap::new()
            .with("loss", scalar(0.5))
            .with("logits", arr2(&[[1.0, 0.0]]).into_dyn())
            .with("labels", arr1(&[0.0]).into_dyn());

        let updated = metrics.update(&outputs).unwrap();
        let MetricValue::Map(values) = updated.compute() else {
            panic!("expected a map");
        };
        assert_eq!(values["loss"], 0.5);
        assert_eq!(values["accuracy"], 1.0);

        let reset = updated.empty();
        assert_eq!(reset, metrics);
    }

    #[test]
    fn merging_different_kinds_fails() {
        let a = StatefulMetric::from(Average::from_output("loss"));
        let b = StatefulMetric::from(Accuracy::new());
        assert!(matches!(
            a.merge(&b),
            Err(MlError::MetricMismatch {
                expected: "average",
                got: "accuracy"
            })
        ));
    }
}
