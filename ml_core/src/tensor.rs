use std::collections::{btree_map, BTreeMap};

use ndarray::{ArrayD, Axis, IxDyn};

use crate::{MlError, Result};

/// Dense `f32` array of any rank. A zero-rank tensor is a scalar.
pub type Tensor = ArrayD<f32>;

/// Model parameters, keyed by name.
pub type Params = TensorMap;

/// A batch of data, keyed by feature name. Every leaf shares its leading (sample) axis.
pub type Batch = TensorMap;

/// Optimizer buffers, keyed by name.
pub type OptState = TensorMap;

/// Builds a zero-rank tensor holding `value`.
pub fn scalar(value: f32) -> Tensor {
    ndarray::arr0(value).into_dyn()
}

/// Returns the value of a single-element tensor, regardless of its rank.
pub fn item(tensor: &Tensor) -> Option<f32> {
    if tensor.len() == 1 {
        tensor.iter().next().copied()
    } else {
        None
    }
}

/// Stacks equally shaped tensors along a new leading axis.
///
/// # Errors
/// Returns `MlError::Shape` if `tensors` is empty or the shapes differ.
pub fn stack(tensors: &[Tensor]) -> Result<Tensor> {
    let views: Vec<_> = tensors.iter().map(|t| t.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

/// Copies `tensor` `n` times along a new leading axis.
pub fn replicate(tensor: &Tensor, n: usize) -> Result<Tensor> {
    let views = vec![tensor.view(); n];
    Ok(ndarray::stack(Axis(0), &views)?)
}

/// Selects entry `index` of the leading axis.
///
/// # Errors
/// Returns `MlError::Rank` for scalars and `MlError::SizeMismatch` if `index` is out of bounds.
pub fn take_leading(tensor: &Tensor, index: usize) -> Result<Tensor> {
    let len = leading_len(tensor, "replicated value")?;
    if index >= len {
        return Err(MlError::SizeMismatch {
            what: "leading axis index",
            got: index,
            expected: len,
        });
    }

    Ok(tensor.index_axis(Axis(0), index).to_owned())
}

/// Splits the leading axis of `tensor` into `[parts, len / parts, ...]`.
///
/// # Errors
/// Returns `MlError::Indivisible` if the leading axis is not a multiple of `parts`.
pub fn split_leading(tensor: &Tensor, parts: usize) -> Result<Tensor> {
    let len = leading_len(tensor, "batch leaf")?;
    if parts == 0 || len % parts != 0 {
        return Err(MlError::Indivisible {
            what: "batch leaf",
            len,
            parts,
        });
    }

    let mut shape = vec![parts, len / parts];
    shape.extend_from_slice(&tensor.shape()[1..]);
    reshape(tensor, &shape)
}

/// Merges the two leading axes of `tensor` into one.
pub fn merge_leading(tensor: &Tensor) -> Result<Tensor> {
    let shape = tensor.shape();
    if shape.len() < 2 {
        return Err(MlError::Rank {
            what: "tileable value",
            got: shape.len(),
            min: 2,
        });
    }

    let mut merged = vec![shape[0] * shape[1]];
    merged.extend_from_slice(&shape[2..]);
    reshape(tensor, &merged)
}

/// Averages `tensor` over its leading axis.
pub fn mean_leading(tensor: &Tensor) -> Result<Tensor> {
    let len = leading_len(tensor, "averageable value")?;
    tensor.mean_axis(Axis(0)).ok_or(MlError::SizeMismatch {
        what: "averageable value",
        got: len,
        expected: 1,
    })
}

fn leading_len(tensor: &Tensor, what: &'static str) -> Result<usize> {
    tensor.shape().first().copied().ok_or(MlError::Rank {
        what,
        got: 0,
        min: 1,
    })
}

fn reshape(tensor: &Tensor, shape: &[usize]) -> Result<Tensor> {
    Ok(tensor.to_shape(IxDyn(shape))?.into_owned())
}

/// An ordered collection of named tensors.
///
/// Iteration follows key order, which is also the leaf order used when the map is
/// flattened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorMap(BTreeMap<String, Tensor>);

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the map with `tensor` inserted under `name`.
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.0.insert(name.into(), tensor);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.0.get_mut(name)
    }

    /// Looks up `name`, failing if it is absent.
    ///
    /// # Errors
    /// Returns `MlError::MissingField` naming the absent entry.
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.0.get(name).ok_or_else(|| MlError::MissingField {
            field: name.to_string(),
        })
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Tensor> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of scalar entries across every tensor.
    pub fn num_elements(&self) -> usize {
        self.0.values().map(|t| t.len()).sum()
    }

    /// The length of the leading axis of the first entry, or 0 for an empty map.
    pub fn batch_size(&self) -> usize {
        self.0
            .values()
            .next()
            .and_then(|t| t.shape().first().copied())
            .unwrap_or(0)
    }

    /// Applies `f` to every tensor, keeping the names.
    pub fn map<F>(&self, mut f: F) -> Result<Self>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        self.0
            .iter()
            .map(|(name, t)| Ok((name.clone(), f(t)?)))
            .collect()
    }

    /// Combines two maps with identical names and shapes entry by entry.
    ///
    /// # Errors
    /// Returns `MlError::MissingField` if `other` lacks a name of `self`, and
    /// `MlError::ShapeMismatch` if a pair of tensors disagrees in shape.
    pub fn zip_map<F>(&self, other: &Self, mut f: F) -> Result<Self>
    where
        F: FnMut(&Tensor, &Tensor) -> Tensor,
    {
        if self.len() != other.len() {
            return Err(MlError::SizeMismatch {
                what: "tensor map entries",
                got: other.len(),
                expected: self.len(),
            });
        }

        self.0
            .iter()
            .map(|(name, a)| {
                let b = other.require(name)?;
                if a.shape() != b.shape() {
                    return Err(MlError::ShapeMismatch {
                        what: name.clone(),
                        got: b.shape().to_vec(),
                        expected: a.shape().to_vec(),
                    });
                }
                Ok((name.clone(), f(a, b)))
            })
            .collect()
    }

    /// True when both maps hold the same names and shapes and every entry is within `tol`.
    pub fn approx_eq(&self, other: &Self, tol: f32) -> bool {
        self.len() == other.len()
            && self.0.iter().all(|(name, a)| {
                other.get(name).is_some_and(|b| {
                    a.shape() == b.shape() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= tol)
                })
            })
    }
}

impl FromIterator<(String, Tensor)> for TensorMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for TensorMap {
    type Item = (String, Tensor);
    type IntoIter = btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TensorMap {
    type Item = (&'a String, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
