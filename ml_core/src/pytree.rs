use std::collections::BTreeMap;

use crate::{
    tensor::{self, Tensor, TensorMap},
    MlError, Result,
};

/// A structured value whose array leaves can be taken apart and put back together.
///
/// Strategies never look inside a state: they move it between placements by
/// transforming its leaves and rebuilding it with the original structure.
pub trait Pytree: Sized {
    /// Returns every leaf, in a deterministic order.
    fn flatten(&self) -> Vec<Tensor>;

    /// Rebuilds a value with the structure of `self`, consuming `leaves` in
    /// [`Pytree::flatten`] order. Non-leaf fields are copied from `self`.
    ///
    /// # Errors
    /// Returns `MlError::InvalidInput` if `leaves` runs out.
    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self>;
}

/// Takes the next leaf out of `leaves`.
pub fn next_leaf(leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Tensor> {
    leaves
        .next()
        .ok_or_else(|| MlError::InvalidInput("pytree ran out of leaves".into()))
}

/// Rebuilds `template`'s structure from exactly `leaves`.
///
/// # Errors
/// Returns `MlError::SizeMismatch` if the leaf count differs from the template's.
pub fn rebuild<T: Pytree>(template: &T, leaves: Vec<Tensor>) -> Result<T> {
    let expected = template.flatten().len();
    if leaves.len() != expected {
        return Err(MlError::SizeMismatch {
            what: "pytree leaves",
            got: leaves.len(),
            expected,
        });
    }

    template.unflatten(&mut leaves.into_iter())
}

/// Applies `f` to every leaf of `tree`.
pub fn map_leaves<T, F>(tree: &T, f: F) -> Result<T>
where
    T: Pytree,
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    let leaves = tree.flatten().iter().map(f).collect::<Result<Vec<_>>>()?;
    rebuild(tree, leaves)
}

/// Stacks structurally identical trees leaf by leaf along a new leading axis.
///
/// The first tree provides the non-leaf fields of the result.
pub fn stack_trees<T: Pytree>(trees: &[T]) -> Result<T> {
    let Some(template) = trees.first() else {
        return Err(MlError::InvalidInput("cannot stack zero trees".into()));
    };

    let flat: Vec<Vec<Tensor>> = trees.iter().map(Pytree::flatten).collect();
    let n = flat[0].len();
    if let Some(bad) = flat.iter().find(|leaves| leaves.len() != n) {
        return Err(MlError::SizeMismatch {
            what: "pytree leaves",
            got: bad.len(),
            expected: n,
        });
    }

    let stacked = (0..n)
        .map(|i| {
            let column: Vec<Tensor> = flat.iter().map(|leaves| leaves[i].clone()).collect();
            tensor::stack(&column)
        })
        .collect::<Result<Vec<_>>>()?;

    rebuild(template, stacked)
}

/// The shape of every leaf, in flatten order.
pub fn leaf_shapes<T: Pytree>(tree: &T) -> Vec<Vec<usize>> {
    tree.flatten().iter().map(|t| t.shape().to_vec()).collect()
}

impl Pytree for Tensor {
    fn flatten(&self) -> Vec<Tensor> {
        vec![self.clone()]
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        next_leaf(leaves)
    }
}

impl Pytree for TensorMap {
    fn flatten(&self) -> Vec<Tensor> {
        self.iter().map(|(_, t)| t.clone()).collect()
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        self.keys()
            .map(|name| Ok((name.to_string(), next_leaf(leaves)?)))
            .collect()
    }
}

impl<T: Pytree> Pytree for Option<T> {
    fn flatten(&self) -> Vec<Tensor> {
        self.as_ref().map(Pytree::flatten).unwrap_or_default()
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        self.as_ref().map(|inner| inner.unflatten(leaves)).transpose()
    }
}

impl<T: Pytree> Pytree for BTreeMap<String, T> {
    fn flatten(&self) -> Vec<Tensor> {
        self.values().flat_map(Pytree::flatten).collect()
    }

    fn unflatten(&self, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        self.iter()
            .map(|(name, value)| Ok((name.clone(), value.unflatten(leaves)?)))
            .collect()
    }
}
