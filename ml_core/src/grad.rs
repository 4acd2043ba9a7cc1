use log::trace;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    tensor::{Params, Tensor},
    Result,
};

/// Differentiates a scalar objective of the parameters by central differences.
///
/// Every coordinate is perturbed independently, so the objective is evaluated
/// `2 * n + 1` times for `n` parameter elements. Evaluations run in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FiniteDifference {
    pub epsilon: f32,
}

impl Default for FiniteDifference {
    fn default() -> Self {
        Self { epsilon: 1e-3 }
    }
}

impl FiniteDifference {
    pub fn new(epsilon: f32) -> Self {
        Self { epsilon }
    }

    /// Evaluates `f` at `params` and estimates its gradient.
    ///
    /// # Arguments
    /// * `f` - The objective. Returns the scalar to differentiate and an auxiliary value.
    /// * `params` - The point at which to differentiate.
    ///
    /// # Returns
    /// The objective's value and auxiliary output at `params`, and the gradient with the
    /// names and shapes of `params`.
    ///
    /// # Errors
    /// Returns the first error produced by `f`.
    pub fn value_and_grad<A, F>(&self, f: F, params: &Params) -> Result<((f32, A), Params)>
    where
        F: Fn(&Params) -> Result<(f32, A)> + Sync,
    {
        let value = f(params)?;

        let coords: Vec<(&str, usize)> = params
            .iter()
            .flat_map(|(name, t)| (0..t.len()).map(move |i| (name.as_str(), i)))
            .collect();

        trace!(coords = coords.len(); "estimating gradient");

        let h = self.epsilon;
        let partials = coords
            .par_iter()
            .map(|&(name, i)| {
                let plus = f(&perturb(params, name, i, h))?.0;
                let minus = f(&perturb(params, name, i, -h))?.0;
                Ok((plus - minus) / (2. * h))
            })
            .collect::<Result<Vec<f32>>>()?;

        let mut partials = partials.into_iter();
        let grads = params.map(|t| {
            let mut g = Tensor::zeros(t.raw_dim());
            g.iter_mut().zip(partials.by_ref()).for_each(|(g, d)| *g = d);
            Ok(g)
        })?;

        Ok((value, grads))
    }
}

fn perturb(params: &Params, name: &str, index: usize, delta: f32) -> Params {
    let mut shifted = params.clone();
    if let Some(t) = shifted.get_mut(name) {
        if let Some(x) = t.iter_mut().nth(index) {
            *x += delta;
        }
    }
    shifted
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn gradient_of_quadratic() {
        let params = Params::new()
            .with("a", arr1(&[1.0, -2.0]).into_dyn())
            .with("b", crate::tensor::scalar(3.0));

        let f = |p: &Params| {
            let a = p.require("a")?;
            let b = p.require("b")?;
            let loss = a.mapv(|x| x * x).sum() + 0.5 * b.sum() * b.sum();
            Ok((loss, "aux"))
        };

        let ((value, aux), grads) = FiniteDifference::default().value_and_grad(f, &params).unwrap();
        assert!((value - 9.5).abs() < 1e-5);
        assert_eq!(aux, "aux");

        let expected = Params::new()
            .with("a", arr1(&[2.0, -4.0]).into_dyn())
            .with("b", crate::tensor::scalar(3.0));
        assert!(grads.approx_eq(&expected, 1e-2));
    }

    #[test]
    fn propagates_objective_errors() {
        let params = Params::new().with("a", arr1(&[1.0]).into_dyn());
        let f = |p: &Params| -> Result<(f32, ())> { p.require("missing").map(|_| (0.0, ())) };
        assert!(FiniteDifference::default().value_and_grad(f, &params).is_err());
    }
}
