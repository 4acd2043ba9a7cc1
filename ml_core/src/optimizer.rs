use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::{
    tensor::{scalar, OptState, Params, Tensor},
    MlError, Result,
};

/// A gradient transformation that produces new parameters and new buffers.
///
/// Optimizers are pure: the buffers live in an [`OptState`] owned by the training
/// state, so they travel with it across strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Optimizer {
    GradientDescent {
        learning_rate: f32,
    },
    GradientDescentWithMomentum {
        learning_rate: f32,
        momentum: f32,
    },
    Adam {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
}

impl Optimizer {
    pub fn gradient_descent(learning_rate: f32) -> Self {
        Self::GradientDescent { learning_rate }
    }

    pub fn gradient_descent_with_momentum(learning_rate: f32, momentum: f32) -> Self {
        Self::GradientDescentWithMomentum {
            learning_rate,
            momentum,
        }
    }

    /// Creates an `Adam` optimizer with the usual defaults for `beta1`, `beta2` and `epsilon`.
    pub fn adam(learning_rate: f32) -> Self {
        Self::Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        match *self {
            Optimizer::GradientDescent { learning_rate }
            | Optimizer::GradientDescentWithMomentum { learning_rate, .. }
            | Optimizer::Adam { learning_rate, .. } => learning_rate,
        }
    }

    /// Creates the initial buffers for `params`.
    ///
    /// # Returns
    /// Zeroed `velocity/<name>` buffers for momentum, zeroed `mu/<name>` and `nu/<name>`
    /// buffers plus the `beta1_t`/`beta2_t` decay products for Adam, nothing otherwise.
    pub fn init(&self, params: &Params) -> OptState {
        match self {
            Optimizer::GradientDescent { .. } => OptState::new(),
            Optimizer::GradientDescentWithMomentum { .. } => zeroed(params, "velocity").collect(),
            Optimizer::Adam { .. } => zeroed(params, "mu")
                .chain(zeroed(params, "nu"))
                .chain([
                    ("beta1_t".to_string(), scalar(1.0)),
                    ("beta2_t".to_string(), scalar(1.0)),
                ])
                .collect(),
        }
    }

    /// Applies one optimization step.
    ///
    /// # Arguments
    /// * `grads` - Gradient of the objective, with the names and shapes of `params`.
    /// * `opt_state` - Buffers created by [`Optimizer::init`] or a previous update.
    /// * `params` - Current parameters.
    ///
    /// # Returns
    /// The updated parameters and buffers.
    ///
    /// # Errors
    /// Returns `MlError::MissingField`, `MlError::SizeMismatch` or `MlError::ShapeMismatch`
    /// if `grads` or `opt_state` do not match `params`.
    pub fn update(
        &self,
        grads: &Params,
        opt_state: &OptState,
        params: &Params,
    ) -> Result<(Params, OptState)> {
        match *self {
            Optimizer::GradientDescent { learning_rate: lr } => {
                let params = params.zip_map(grads, |p, g| p - &(g * lr))?;
                Ok((params, opt_state.clone()))
            }
            Optimizer::GradientDescentWithMomentum {
                learning_rate: lr,
                momentum: mu,
            } => {
                // validates names and shapes before touching any buffer
                params.zip_map(grads, |p, _| p.clone())?;

                let mut new_params = Params::new();
                let mut new_state = OptState::new();
                for (name, p) in params {
                    let g = grads.require(name)?;
                    let key = format!("velocity/{name}");
                    let mut v = buffer(opt_state, &key, p)?.clone();
                    let mut p = p.clone();

                    Zip::from(&mut p).and(&mut v).and(g).for_each(|p, v, &g| {
                        *v = (mu * *v) + g;
                        *p -= lr * *v;
                    });

                    new_params.insert(name.clone(), p);
                    new_state.insert(key, v);
                }
                Ok((new_params, new_state))
            }
            Optimizer::Adam {
                learning_rate: lr,
                beta1: b1,
                beta2: b2,
                epsilon: eps,
            } => {
                params.zip_map(grads, |p, _| p.clone())?;

                let beta1_t = decay(opt_state, "beta1_t")? * b1;
                let beta2_t = decay(opt_state, "beta2_t")? * b2;
                let bc1 = 1. - beta1_t;
                let bc2 = 1. - beta2_t;
                let step_size = lr * (bc2.sqrt() / bc1);

                let mut new_params = Params::new();
                let mut new_state = OptState::new()
                    .with("beta1_t", scalar(beta1_t))
                    .with("beta2_t", scalar(beta2_t));

                for (name, p) in params {
                    let g = grads.require(name)?;
                    let mu_key = format!("mu/{name}");
                    let nu_key = format!("nu/{name}");
                    let mut m = buffer(opt_state, &mu_key, p)?.clone();
                    let mut s = buffer(opt_state, &nu_key, p)?.clone();
                    let mut p = p.clone();

                    Zip::from(&mut p)
                        .and(&mut m)
                        .and(&mut s)
                        .and(g)
                        .for_each(|p, m, s, &g| {
                            *m = b1 * *m + (1. - b1) * g;
                            *s = b2 * *s + (1. - b2) * g.powi(2);
                            *p -= step_size * *m / (s.sqrt() + eps);
                        });

                    new_params.insert(name.clone(), p);
                    new_state.insert(mu_key, m);
                    new_state.insert(nu_key, s);
                }
                Ok((new_params, new_state))
            }
        }
    }
}

/// A zeroed buffer named `<prefix>/<name>` for every parameter.
fn zeroed<'a>(params: &'a Params, prefix: &'a str) -> impl Iterator<Item = (String, Tensor)> + 'a {
    params
        .iter()
        .map(move |(name, p)| (format!("{prefix}/{name}"), Tensor::zeros(p.raw_dim())))
}

fn buffer<'a>(opt_state: &'a OptState, key: &str, like: &Tensor) -> Result<&'a Tensor> {
    let buf = opt_state.require(key)?;
    if buf.shape() != like.shape() {
        return Err(MlError::ShapeMismatch {
            what: key.to_string(),
            got: buf.shape().to_vec(),
            expected: like.shape().to_vec(),
        });
    }
    Ok(buf)
}

fn decay(opt_state: &OptState, key: &str) -> Result<f32> {
    let t = opt_state.require(key)?;
    crate::tensor::item(t).ok_or_else(|| MlError::ShapeMismatch {
        what: key.to_string(),
        got: t.shape().to_vec(),
        expected: vec![],
    })
}
