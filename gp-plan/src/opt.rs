//! First-order update rules over parameter maps.
//!
//! A `GradientTransform` is a closed set of update rules rather than an open
//! trait: the driver serializes the choice from configuration, and the state
//! each rule carries is private to this module. Updates are returned as
//! deltas already scaled and negated, so applying one is a plain add.

use gp_runtime::{RuntimeError, Tensor, TensorMap};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum GradientTransform {
    Sgd { lr: f64 },
    Rmsprop { lr: f64, decay: f64, eps: f64 },
    Adam { lr: f64, beta1: f64, beta2: f64, eps: f64 },
}

impl Default for GradientTransform {
    fn default() -> Self {
        GradientTransform::Rmsprop {
            lr: 0.1,
            decay: 0.9,
            eps: 1e-8,
        }
    }
}

/// Per-rule accumulator state, shaped like the parameters.
#[derive(Debug, Clone)]
pub enum OptimizerState {
    Sgd,
    Rmsprop { nu: TensorMap },
    Adam { mu: TensorMap, nu: TensorMap, t: u64 },
}

fn zeros_like(params: &TensorMap) -> TensorMap {
    params
        .iter()
        .map(|(k, v)| (k.clone(), Tensor::zeros(v.shape())))
        .collect()
}

impl GradientTransform {
    pub fn init(&self, params: &TensorMap) -> OptimizerState {
        match self {
            GradientTransform::Sgd { .. } => OptimizerState::Sgd,
            GradientTransform::Rmsprop { .. } => OptimizerState::Rmsprop {
                nu: zeros_like(params),
            },
            GradientTransform::Adam { .. } => OptimizerState::Adam {
                mu: zeros_like(params),
                nu: zeros_like(params),
                t: 0,
            },
        }
    }

    /// Fold a gradient into the state and return the parameter deltas.
    pub fn update(
        &self,
        grad: &TensorMap,
        state: &mut OptimizerState,
    ) -> Result<TensorMap, RuntimeError> {
        match (self, state) {
            (GradientTransform::Sgd { lr }, OptimizerState::Sgd) => Ok(grad
                .iter()
                .map(|(k, g)| (k.clone(), g.map(|x| -lr * x)))
                .collect()),
            (GradientTransform::Rmsprop { lr, decay, eps }, OptimizerState::Rmsprop { nu }) => {
                let mut out = TensorMap::new();
                for (k, g) in grad {
                    let acc = nu
                        .get(k)
                        .ok_or_else(|| RuntimeError::UnknownVariable { name: k.clone() })?;
                    let acc = acc.zip(g, |n, x| decay * n + (1.0 - decay) * x * x)?;
                    out.insert(k.clone(), g.zip(&acc, |x, n| -lr * x / (n + eps).sqrt())?);
                    nu.insert(k.clone(), acc);
                }
                Ok(out)
            }
            (
                GradientTransform::Adam {
                    lr,
                    beta1,
                    beta2,
                    eps,
                },
                OptimizerState::Adam { mu, nu, t },
            ) => {
                *t += 1;
                let bc1 = 1.0 - beta1.powi(*t as i32);
                let bc2 = 1.0 - beta2.powi(*t as i32);
                let mut out = TensorMap::new();
                for (k, g) in grad {
                    let m = mu
                        .get(k)
                        .ok_or_else(|| RuntimeError::UnknownVariable { name: k.clone() })?;
                    let v = nu
                        .get(k)
                        .ok_or_else(|| RuntimeError::UnknownVariable { name: k.clone() })?;
                    let m = m.zip(g, |m, x| beta1 * m + (1.0 - beta1) * x)?;
                    let v = v.zip(g, |v, x| beta2 * v + (1.0 - beta2) * x * x)?;
                    out.insert(
                        k.clone(),
                        m.zip(&v, |m, v| -lr * (m / bc1) / ((v / bc2).sqrt() + eps))?,
                    );
                    mu.insert(k.clone(), m);
                    nu.insert(k.clone(), v);
                }
                Ok(out)
            }
            _ => Err(RuntimeError::Empty {
                what: "optimizer state does not match the update rule",
            }),
        }
    }
}

/// Scale the whole gradient down when its global L2 norm exceeds `max_norm`.
pub fn clip_by_global_norm(grad: &TensorMap, max_norm: f64) -> TensorMap {
    let sq: f64 = grad
        .values()
        .map(|t| t.data().iter().map(|x| x * x).sum::<f64>())
        .sum();
    let norm = sq.sqrt();
    if norm <= max_norm || norm == 0.0 {
        return grad.clone();
    }
    let scale = max_norm / norm;
    grad.iter()
        .map(|(k, t)| (k.clone(), t.map(|x| scale * x)))
        .collect()
}
