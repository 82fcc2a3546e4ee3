//! Gradient computation interface.
//!
//! The driver only needs "gradient of a scalar loss with respect to a tensor
//! map". The shipped implementation is deterministic central finite
//! differences; callers supply a loss that is pure for a fixed key, so the
//! same perturbation sweep always produces the same estimate.

use rayon::prelude::*;

use crate::tensor::{RuntimeError, Tensor, TensorMap};

/// A pure scalar loss over policy parameters.
pub type LossFn<'a> = dyn Fn(&TensorMap) -> Result<f64, RuntimeError> + Sync + 'a;

pub trait GradientEstimator: Send + Sync {
    fn grad(&self, loss: &LossFn<'_>, params: &TensorMap) -> Result<TensorMap, RuntimeError>;
}

/// Central finite differences, one probe pair per parameter element,
/// parallelized across elements.
#[derive(Debug, Clone, Copy)]
pub struct FiniteDifference {
    pub epsilon: f64,
}

impl Default for FiniteDifference {
    fn default() -> Self {
        Self { epsilon: 1e-4 }
    }
}

impl GradientEstimator for FiniteDifference {
    fn grad(&self, loss: &LossFn<'_>, params: &TensorMap) -> Result<TensorMap, RuntimeError> {
        let eps = self.epsilon;
        let slots: Vec<(&String, usize)> = params
            .iter()
            .flat_map(|(name, t)| (0..t.len()).map(move |i| (name, i)))
            .collect();

        let partials: Result<Vec<f64>, RuntimeError> = slots
            .par_iter()
            .map(|&(name, i)| {
                let f_plus = loss(&perturbed(params, name, i, eps)?)?;
                let f_minus = loss(&perturbed(params, name, i, -eps)?)?;
                Ok((f_plus - f_minus) / (2.0 * eps))
            })
            .collect();
        let partials = partials?;

        let mut out = TensorMap::new();
        let mut off = 0usize;
        for (name, t) in params {
            let n = t.len();
            out.insert(
                name.clone(),
                Tensor::from_vec(t.shape().to_vec(), partials[off..off + n].to_vec())?,
            );
            off += n;
        }
        Ok(out)
    }
}

fn perturbed(
    params: &TensorMap,
    name: &str,
    i: usize,
    delta: f64,
) -> Result<TensorMap, RuntimeError> {
    let mut p = params.clone();
    let t = p
        .get_mut(name)
        .ok_or_else(|| RuntimeError::UnknownVariable {
            name: name.to_string(),
        })?;
    t.data_mut()[i] += delta;
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadratic_gradient_matches_analytic() {
        let mut params = TensorMap::new();
        params.insert(
            "x".to_string(),
            Tensor::from_vec(vec![3], vec![1.0, -2.0, 0.5]).unwrap(),
        );
        params.insert("y".to_string(), Tensor::scalar(3.0));

        // loss = sum(x^2) + 4*y
        let loss = |p: &TensorMap| -> Result<f64, RuntimeError> {
            let x = p.get("x").ok_or_else(|| RuntimeError::UnknownVariable {
                name: "x".into(),
            })?;
            let y = p.get("y").ok_or_else(|| RuntimeError::UnknownVariable {
                name: "y".into(),
            })?;
            Ok(x.data().iter().map(|v| v * v).sum::<f64>() + 4.0 * y.item()?)
        };

        let fd = FiniteDifference::default();
        let g = fd.grad(&loss, &params).unwrap();
        let gx = g.get("x").unwrap();
        for (got, want) in gx.data().iter().zip([2.0, -4.0, 1.0]) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
        assert!((g.get("y").unwrap().item().unwrap() - 4.0).abs() < 1e-6);
    }
}
