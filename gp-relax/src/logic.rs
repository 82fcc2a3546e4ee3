//! Pluggable logic strategies.
//!
//! `ExactLogic` evaluates every primitive exactly (used for unbiased test
//! evaluation); `SoftLogic` substitutes a continuous surrogate for each
//! discrete primitive (used inside the differentiable rollout). Both keep
//! every value real-valued, booleans as 0.0/1.0.

use gp_model::{AggOp, CmpOp, ConnectiveOp, UnaryOp};
use gp_runtime::{PrngKey, RuntimeError, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Smoothing parameters threaded through every rollout evaluation.
///
/// `sharpness` is the temperature of every sigmoid/softmax surrogate; exact
/// evaluation ignores it.
#[derive(Debug, Clone, Copy)]
pub struct ModelParams {
    pub sharpness: f64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self { sharpness: 10.0 }
    }
}

/// Result of evaluating one compiled operation.
///
/// `out_of_bounds` is a side channel, not an error: a sampling operator sets
/// it when its weights are not a valid distribution, and the rollout log
/// surfaces the union to the caller.
#[derive(Debug, Clone)]
pub struct Sample {
    pub value: Tensor,
    pub out_of_bounds: bool,
}

impl Sample {
    pub fn exact(value: Tensor) -> Self {
        Self {
            value,
            out_of_bounds: false,
        }
    }
}

pub trait Logic: Send + Sync {
    fn compare(
        &self,
        op: CmpOp,
        a: &Tensor,
        b: &Tensor,
        mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError>;

    fn not(&self, a: &Tensor, mp: &ModelParams) -> Tensor;

    fn connective(
        &self,
        op: ConnectiveOp,
        a: &Tensor,
        b: &Tensor,
        mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError>;

    /// Reduce the trailing axis.
    fn aggregate(&self, op: AggOp, a: &Tensor, mp: &ModelParams) -> Result<Tensor, RuntimeError>;

    fn branch(
        &self,
        cond: &Tensor,
        then: &Tensor,
        orelse: &Tensor,
        mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError>;

    fn switch(
        &self,
        selector: &Tensor,
        cases: &[Tensor],
        mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError>;

    /// Sgn/Floor/Ceil/Round. Surrogates keep the exact forward value; the
    /// smoothing, where any, lives in the operators feeding them.
    fn rounding(&self, op: UnaryOp, a: &Tensor) -> Tensor;

    fn bernoulli(
        &self,
        key: PrngKey,
        prob: &Tensor,
        mp: &ModelParams,
    ) -> Result<Sample, RuntimeError>;

    /// Categorical draw over weights stacked on the trailing axis; the value
    /// is the sampled category index (soft-blended under relaxation).
    fn discrete(
        &self,
        key: PrngKey,
        weights: &Tensor,
        mp: &ModelParams,
    ) -> Result<Sample, RuntimeError>;
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn truthy(x: f64) -> bool {
    x != 0.0
}

fn as_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn uniform_like(key: PrngKey, n: usize) -> Vec<f64> {
    let mut rng = key.into_rng();
    (0..n).map(|_| rng.gen::<f64>()).collect()
}

/// Weights on the trailing axis form a valid distribution for every leading
/// slot: non-negative, unit sum (within tolerance).
fn weights_out_of_bounds(weights: &Tensor) -> bool {
    let Some(k) = weights.last_dim() else {
        return true;
    };
    if k == 0 {
        return true;
    }
    for chunk in weights.data().chunks(k) {
        let sum: f64 = chunk.iter().sum();
        if chunk.iter().any(|&w| w < 0.0) || (sum - 1.0).abs() > 1e-5 {
            return true;
        }
    }
    false
}

fn exact_rounding(op: UnaryOp, a: &Tensor) -> Tensor {
    match op {
        UnaryOp::Sgn => a.map(f64::signum),
        UnaryOp::Floor => a.map(f64::floor),
        UnaryOp::Ceil => a.map(f64::ceil),
        UnaryOp::Round => a.map(f64::round),
        _ => a.clone(),
    }
}

/// Exact semantics for unbiased evaluation of the non-relaxed model.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactLogic;

impl Logic for ExactLogic {
    fn compare(
        &self,
        op: CmpOp,
        a: &Tensor,
        b: &Tensor,
        _mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError> {
        a.zip(b, |x, y| {
            as_f64(match op {
                CmpOp::Ge => x >= y,
                CmpOp::Le => x <= y,
                CmpOp::Lt => x < y,
                CmpOp::Gt => x > y,
                CmpOp::Eq => x == y,
                CmpOp::Ne => x != y,
            })
        })
    }

    fn not(&self, a: &Tensor, _mp: &ModelParams) -> Tensor {
        a.map(|x| as_f64(!truthy(x)))
    }

    fn connective(
        &self,
        op: ConnectiveOp,
        a: &Tensor,
        b: &Tensor,
        _mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError> {
        a.zip(b, |x, y| {
            let (x, y) = (truthy(x), truthy(y));
            as_f64(match op {
                ConnectiveOp::And => x && y,
                ConnectiveOp::Or => x || y,
                ConnectiveOp::Xor => x != y,
                ConnectiveOp::Implies => !x || y,
                ConnectiveOp::Equiv => x == y,
            })
        })
    }

    fn aggregate(&self, op: AggOp, a: &Tensor, _mp: &ModelParams) -> Result<Tensor, RuntimeError> {
        match op {
            AggOp::Sum => a.reduce_last_axis(0.0, |acc, x| acc + x),
            AggOp::Prod => a.reduce_last_axis(1.0, |acc, x| acc * x),
            AggOp::Min => a.reduce_last_axis(f64::INFINITY, f64::min),
            AggOp::Max => a.reduce_last_axis(f64::NEG_INFINITY, f64::max),
            AggOp::Forall => a.reduce_last_axis(1.0, |acc, x| acc * as_f64(truthy(x))),
            AggOp::Exists => {
                a.reduce_last_axis(0.0, |acc, x| as_f64(truthy(acc) || truthy(x)))
            }
            AggOp::Argmin => arg_reduce(a, |best, x| x < best),
            AggOp::Argmax => arg_reduce(a, |best, x| x > best),
        }
    }

    fn branch(
        &self,
        cond: &Tensor,
        then: &Tensor,
        orelse: &Tensor,
        _mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError> {
        let picked = cond.zip(then, |c, t| if truthy(c) { t } else { 0.0 })?;
        let rest = cond.zip(orelse, |c, e| if truthy(c) { 0.0 } else { e })?;
        picked.add(&rest)
    }

    fn switch(
        &self,
        selector: &Tensor,
        cases: &[Tensor],
        _mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError> {
        let k = cases.len();
        if k == 0 {
            return Err(RuntimeError::Empty { what: "switch" });
        }
        let mut out: Option<Tensor> = None;
        for (j, case) in cases.iter().enumerate() {
            let mask = selector.map(|s| {
                as_f64(s.round().clamp(0.0, (k - 1) as f64) as usize == j)
            });
            let term = mask.mul(case)?;
            out = Some(match out {
                Some(acc) => acc.add(&term)?,
                None => term,
            });
        }
        Ok(out.unwrap_or_else(|| Tensor::scalar(0.0)))
    }

    fn rounding(&self, op: UnaryOp, a: &Tensor) -> Tensor {
        exact_rounding(op, a)
    }

    fn bernoulli(
        &self,
        key: PrngKey,
        prob: &Tensor,
        _mp: &ModelParams,
    ) -> Result<Sample, RuntimeError> {
        let u = uniform_like(key, prob.len());
        let out_of_bounds = prob.data().iter().any(|&p| !(0.0..=1.0).contains(&p));
        let data: Vec<f64> = prob
            .data()
            .iter()
            .zip(&u)
            .map(|(&p, &ui)| as_f64(ui < p))
            .collect();
        Ok(Sample {
            value: Tensor::from_vec(prob.shape().to_vec(), data)?,
            out_of_bounds,
        })
    }

    fn discrete(
        &self,
        key: PrngKey,
        weights: &Tensor,
        _mp: &ModelParams,
    ) -> Result<Sample, RuntimeError> {
        let k = weights.last_dim().ok_or(RuntimeError::NoAxis {
            what: "discrete",
        })?;
        let out_of_bounds = weights_out_of_bounds(weights);
        let lead = weights.len() / k.max(1);
        let u = uniform_like(key, lead);
        let mut data = Vec::with_capacity(lead);
        for (chunk, &ui) in weights.data().chunks(k).zip(&u) {
            let total: f64 = chunk.iter().map(|w| w.max(0.0)).sum();
            let threshold = ui * total.max(f64::MIN_POSITIVE);
            let mut acc = 0.0;
            let mut picked = k - 1;
            for (j, &w) in chunk.iter().enumerate() {
                acc += w.max(0.0);
                if threshold < acc {
                    picked = j;
                    break;
                }
            }
            data.push(picked as f64);
        }
        let shape = weights.shape()[..weights.rank() - 1].to_vec();
        Ok(Sample {
            value: Tensor::from_vec(shape, data)?,
            out_of_bounds,
        })
    }
}

/// Continuous surrogates: sigmoid comparisons, product t-norms, soft
/// aggregations, blended branches, Gumbel-softmax categorical sampling.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftLogic;

impl Logic for SoftLogic {
    fn compare(
        &self,
        op: CmpOp,
        a: &Tensor,
        b: &Tensor,
        mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError> {
        let w = mp.sharpness;
        a.zip(b, |x, y| match op {
            CmpOp::Ge | CmpOp::Gt => sigmoid(w * (x - y)),
            CmpOp::Le | CmpOp::Lt => sigmoid(w * (y - x)),
            CmpOp::Eq => {
                let t = (w * (x - y)).tanh();
                1.0 - t * t
            }
            CmpOp::Ne => {
                let t = (w * (x - y)).tanh();
                t * t
            }
        })
    }

    fn not(&self, a: &Tensor, _mp: &ModelParams) -> Tensor {
        a.map(|x| 1.0 - x)
    }

    fn connective(
        &self,
        op: ConnectiveOp,
        a: &Tensor,
        b: &Tensor,
        _mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError> {
        // Product t-norm family.
        a.zip(b, |x, y| match op {
            ConnectiveOp::And => x * y,
            ConnectiveOp::Or => x + y - x * y,
            ConnectiveOp::Xor => x + y - 2.0 * x * y,
            ConnectiveOp::Implies => 1.0 - x + x * y,
            ConnectiveOp::Equiv => 1.0 - (x + y - 2.0 * x * y),
        })
    }

    fn aggregate(&self, op: AggOp, a: &Tensor, mp: &ModelParams) -> Result<Tensor, RuntimeError> {
        match op {
            AggOp::Sum => a.reduce_last_axis(0.0, |acc, x| acc + x),
            AggOp::Prod | AggOp::Forall => a.reduce_last_axis(1.0, |acc, x| acc * x),
            AggOp::Min => a.reduce_last_axis(f64::INFINITY, f64::min),
            AggOp::Max => a.reduce_last_axis(f64::NEG_INFINITY, f64::max),
            AggOp::Exists => {
                // 1 - prod(1 - x)
                let none = a.map(|x| 1.0 - x).reduce_last_axis(1.0, |acc, x| acc * x)?;
                Ok(none.map(|x| 1.0 - x))
            }
            AggOp::Argmax => soft_arg(a, mp.sharpness),
            AggOp::Argmin => soft_arg(a, -mp.sharpness),
        }
    }

    fn branch(
        &self,
        cond: &Tensor,
        then: &Tensor,
        orelse: &Tensor,
        _mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError> {
        // Weighted blend driven by the relaxed condition.
        let picked = cond.zip(then, |c, t| c * t)?;
        let rest = cond.zip(orelse, |c, e| (1.0 - c) * e)?;
        picked.add(&rest)
    }

    fn switch(
        &self,
        selector: &Tensor,
        cases: &[Tensor],
        mp: &ModelParams,
    ) -> Result<Tensor, RuntimeError> {
        let k = cases.len();
        if k == 0 {
            return Err(RuntimeError::Empty { what: "switch" });
        }
        let w = mp.sharpness;
        // Softmax over squared distance to each case index.
        let mut masks = Vec::with_capacity(k);
        for j in 0..k {
            masks.push(selector.map(|s| (-w * (s - j as f64) * (s - j as f64)).exp()));
        }
        let mut norm = masks[0].clone();
        for m in &masks[1..] {
            norm = norm.add(m)?;
        }
        // Far-off selectors can underflow every mask weight.
        let norm = norm.map(|x| x.max(f64::MIN_POSITIVE));
        let mut out: Option<Tensor> = None;
        for (m, case) in masks.iter().zip(cases) {
            let term = m.div(&norm)?.mul(case)?;
            out = Some(match out {
                Some(acc) => acc.add(&term)?,
                None => term,
            });
        }
        Ok(out.unwrap_or_else(|| Tensor::scalar(0.0)))
    }

    fn rounding(&self, op: UnaryOp, a: &Tensor) -> Tensor {
        exact_rounding(op, a)
    }

    fn bernoulli(
        &self,
        key: PrngKey,
        prob: &Tensor,
        mp: &ModelParams,
    ) -> Result<Sample, RuntimeError> {
        let w = mp.sharpness;
        let u = uniform_like(key, prob.len());
        let out_of_bounds = prob.data().iter().any(|&p| !(0.0..=1.0).contains(&p));
        let data: Vec<f64> = prob
            .data()
            .iter()
            .zip(&u)
            .map(|(&p, &ui)| sigmoid(w * (p - ui)))
            .collect();
        Ok(Sample {
            value: Tensor::from_vec(prob.shape().to_vec(), data)?,
            out_of_bounds,
        })
    }

    fn discrete(
        &self,
        key: PrngKey,
        weights: &Tensor,
        mp: &ModelParams,
    ) -> Result<Sample, RuntimeError> {
        let k = weights.last_dim().ok_or(RuntimeError::NoAxis {
            what: "discrete",
        })?;
        let out_of_bounds = weights_out_of_bounds(weights);
        let w = mp.sharpness;
        let u = uniform_like(key, weights.len());
        let lead = weights.len() / k.max(1);
        let mut data = Vec::with_capacity(lead);
        for (i, chunk) in weights.data().chunks(k).enumerate() {
            let total: f64 = chunk.iter().map(|x| x.max(0.0)).sum();
            let total = total.max(f64::MIN_POSITIVE);
            // Gumbel-softmax over log-weights, blended into a soft index.
            let mut scores = Vec::with_capacity(k);
            for (j, &wt) in chunk.iter().enumerate() {
                let p = (wt.max(0.0) / total).max(1e-12);
                let g = -(-(u[i * k + j].max(f64::MIN_POSITIVE)).ln()).ln();
                scores.push(w * (p.ln() + g));
            }
            data.push(softmax_dot_index(&scores));
        }
        let shape = weights.shape()[..weights.rank() - 1].to_vec();
        Ok(Sample {
            value: Tensor::from_vec(shape, data)?,
            out_of_bounds,
        })
    }
}

/// Reparameterized continuous draws shared by both strategies.
pub(crate) fn normal_sample(key: PrngKey, mean: &Tensor, std: &Tensor) -> Result<Tensor, RuntimeError> {
    let mut rng = key.into_rng();
    let shaped = mean.zip(std, |m, _| m)?;
    let eps: Vec<f64> = (0..shaped.len())
        .map(|_| StandardNormal.sample(&mut rng))
        .collect();
    let noise = Tensor::from_vec(shaped.shape().to_vec(), eps)?;
    mean.add(&std.mul(&noise)?)
}

pub(crate) fn uniform_sample(key: PrngKey, low: &Tensor, high: &Tensor) -> Result<Tensor, RuntimeError> {
    let span = high.sub(low)?;
    let u = Tensor::from_vec(span.shape().to_vec(), uniform_like(key, span.len()))?;
    low.add(&span.mul(&u)?)
}

fn arg_reduce(a: &Tensor, better: impl Fn(f64, f64) -> bool) -> Result<Tensor, RuntimeError> {
    let k = a.last_dim().ok_or(RuntimeError::NoAxis { what: "arg_reduce" })?;
    if k == 0 {
        return Err(RuntimeError::Empty { what: "arg_reduce" });
    }
    let data: Vec<f64> = a
        .data()
        .chunks(k)
        .map(|chunk| {
            let mut best = 0usize;
            for (j, &x) in chunk.iter().enumerate().skip(1) {
                if better(chunk[best], x) {
                    best = j;
                }
            }
            best as f64
        })
        .collect();
    Tensor::from_vec(a.shape()[..a.rank() - 1].to_vec(), data)
}

fn soft_arg(a: &Tensor, w: f64) -> Result<Tensor, RuntimeError> {
    let k = a.last_dim().ok_or(RuntimeError::NoAxis { what: "soft_arg" })?;
    if k == 0 {
        return Err(RuntimeError::Empty { what: "soft_arg" });
    }
    let data: Vec<f64> = a
        .data()
        .chunks(k)
        .map(|chunk| {
            let scores: Vec<f64> = chunk.iter().map(|&x| w * x).collect();
            softmax_dot_index(&scores)
        })
        .collect();
    Tensor::from_vec(a.shape()[..a.rank() - 1].to_vec(), data)
}

/// softmax(scores) · [0, 1, ..).
fn softmax_dot_index(scores: &[f64]) -> f64 {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|&s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter()
        .enumerate()
        .map(|(j, &e)| j as f64 * e / sum)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp(w: f64) -> ModelParams {
        ModelParams { sharpness: w }
    }

    #[test]
    fn soft_compare_brackets_exact_indicator() {
        let soft = SoftLogic;
        let a = Tensor::from_vec(vec![3], vec![0.0, 1.0, 2.0]).unwrap();
        let b = Tensor::full(&[3], 1.0);
        let out = soft.compare(CmpOp::Ge, &a, &b, &mp(50.0)).unwrap();
        assert!(out.data()[0] < 0.01);
        assert!((out.data()[1] - 0.5).abs() < 1e-9);
        assert!(out.data()[2] > 0.99);
    }

    #[test]
    fn soft_connectives_stay_in_unit_interval() {
        let soft = SoftLogic;
        let a = Tensor::from_vec(vec![3], vec![0.1, 0.5, 0.9]).unwrap();
        let b = Tensor::from_vec(vec![3], vec![0.8, 0.5, 0.2]).unwrap();
        for op in [
            ConnectiveOp::And,
            ConnectiveOp::Or,
            ConnectiveOp::Xor,
            ConnectiveOp::Implies,
            ConnectiveOp::Equiv,
        ] {
            let out = soft.connective(op, &a, &b, &mp(10.0)).unwrap();
            for &v in out.data() {
                assert!((0.0..=1.0).contains(&v), "{op:?} produced {v}");
            }
        }
    }

    #[test]
    fn exact_and_soft_connectives_agree_on_crisp_inputs() {
        let exact = ExactLogic;
        let soft = SoftLogic;
        let a = Tensor::from_vec(vec![4], vec![0.0, 0.0, 1.0, 1.0]).unwrap();
        let b = Tensor::from_vec(vec![4], vec![0.0, 1.0, 0.0, 1.0]).unwrap();
        for op in [
            ConnectiveOp::And,
            ConnectiveOp::Or,
            ConnectiveOp::Xor,
            ConnectiveOp::Implies,
            ConnectiveOp::Equiv,
        ] {
            let e = exact.connective(op, &a, &b, &mp(10.0)).unwrap();
            let s = soft.connective(op, &a, &b, &mp(10.0)).unwrap();
            assert!(e.max_abs_diff(&s).unwrap() < 1e-12, "{op:?} disagrees");
        }
    }

    #[test]
    fn branch_blends_by_condition_weight() {
        let soft = SoftLogic;
        let cond = Tensor::from_vec(vec![2], vec![0.25, 1.0]).unwrap();
        let then = Tensor::full(&[2], 8.0);
        let orelse = Tensor::full(&[2], 0.0);
        let out = soft.branch(&cond, &then, &orelse, &mp(10.0)).unwrap();
        assert!((out.data()[0] - 2.0).abs() < 1e-12);
        assert!((out.data()[1] - 8.0).abs() < 1e-12);
    }

    #[test]
    fn exact_argmax_and_soft_argmax_agree_on_separated_input() {
        let a = Tensor::from_vec(vec![1, 3], vec![0.0, 5.0, 1.0]).unwrap();
        let e = ExactLogic.aggregate(AggOp::Argmax, &a, &mp(10.0)).unwrap();
        let s = SoftLogic.aggregate(AggOp::Argmax, &a, &mp(10.0)).unwrap();
        assert_eq!(e.data()[0], 1.0);
        assert!((s.data()[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn discrete_flags_invalid_distribution() {
        let bad = Tensor::from_vec(vec![1, 3], vec![0.5, 0.5, 0.5]).unwrap();
        let good = Tensor::from_vec(vec![1, 3], vec![0.2, 0.3, 0.5]).unwrap();
        let s1 = ExactLogic
            .discrete(PrngKey::new(1), &bad, &mp(10.0))
            .unwrap();
        let s2 = ExactLogic
            .discrete(PrngKey::new(1), &good, &mp(10.0))
            .unwrap();
        assert!(s1.out_of_bounds);
        assert!(!s2.out_of_bounds);
        let s3 = SoftLogic
            .discrete(PrngKey::new(1), &bad, &mp(10.0))
            .unwrap();
        assert!(s3.out_of_bounds);
    }

    #[test]
    fn exact_discrete_samples_within_support() {
        let w = Tensor::from_vec(vec![4, 3], vec![0.2, 0.3, 0.5].repeat(4)).unwrap();
        let s = ExactLogic
            .discrete(PrngKey::new(9), &w, &mp(10.0))
            .unwrap();
        assert_eq!(s.value.shape(), &[4]);
        for &v in s.value.data() {
            assert!((0.0..=2.0).contains(&v));
            assert_eq!(v, v.round());
        }
    }

    #[test]
    fn exact_bernoulli_degenerate_probs() {
        let p = Tensor::from_vec(vec![2], vec![0.0, 1.0]).unwrap();
        let s = ExactLogic
            .bernoulli(PrngKey::new(3), &p, &mp(10.0))
            .unwrap();
        assert_eq!(s.value.data(), &[0.0, 1.0]);
        assert!(!s.out_of_bounds);
    }
}
