//! Straight-line plan: one free parameter tensor per action fluent and
//! decision epoch, plus the projections that keep those parameters feasible.
//!
//! Boolean action parameters are optionally wrapped in a sigmoid so the
//! relaxed rollout sees values in (0, 1); the decision threshold is 0.0 in
//! wrapped parameter space and 0.5 otherwise. Box projection clips every
//! parameter into its feasible interval; concurrency projection additionally
//! enforces the domain's limit on simultaneously active boolean actions.

use std::collections::BTreeMap;
use std::sync::Arc;

use gp_model::{LiftedModel, ModelError, VarKind};
use gp_relax::{ActionProducer, CompileError, Hyperparams};
use gp_runtime::{PrngKey, RuntimeError, Tensor, TensorMap};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid plan configuration: {msg}")]
    InvalidConfig { msg: &'static str },
    #[error("action fluent <{name}> has kind {kind:?}, which has no differentiable surrogate")]
    UnsupportedActionKind { name: String, kind: VarKind },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// How the limit on concurrently active boolean actions is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionKind {
    /// Closed-form: sort slot utilizations, shift everything past rank K back
    /// to the threshold. One pass, always converges.
    Sorting,
    /// Iterative surplus reduction in action space; may hit the iteration cap
    /// without converging.
    Iterative,
    /// Box constraints only. Also what the other two degrade to when the
    /// declared limit does not bind.
    BoxOnly,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanOptions {
    /// Map boolean parameters through a sigmoid rather than clipping raw
    /// probabilities.
    pub wrap_sigmoid: bool,
    /// Floor on boolean action probability; also caps it at one minus this.
    pub min_action_prob: f64,
    /// Iteration cap for the iterative projection.
    pub max_projection_iters: usize,
    pub projection: ProjectionKind,
    /// Standard deviation of the normal initializer.
    pub init_scale: f64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            wrap_sigmoid: true,
            min_action_prob: 0.001,
            max_projection_iters: 999,
            projection: ProjectionKind::Sorting,
            init_scale: 0.01,
        }
    }
}

/// One boolean action slot, flattened across fluents in declaration order.
struct BoolSlot {
    var: String,
    /// Row-major element offset within the fluent's per-step slice.
    offset: usize,
    /// True when the fluent's no-op value is "active", so feasibility counts
    /// departures downward instead of upward.
    noop_active: bool,
}

pub struct StraightLinePlan {
    model: Arc<LiftedModel>,
    horizon: usize,
    wrap_sigmoid: bool,
    min_action_prob: f64,
    max_projection_iters: usize,
    projection: ProjectionKind,
    /// Binding concurrency limit; `None` when box constraints suffice.
    allowed: Option<usize>,
    init_scale: f64,
    /// Per action fluent: full parameter shape `[horizon, ...fluent shape]`.
    shapes: BTreeMap<String, Vec<usize>>,
    kinds: BTreeMap<String, VarKind>,
    /// Declared ranges for int/real action fluents.
    bounds: BTreeMap<String, (f64, f64)>,
    slots: Vec<BoolSlot>,
}

impl StraightLinePlan {
    pub fn new(
        model: Arc<LiftedModel>,
        horizon: Option<usize>,
        opts: PlanOptions,
    ) -> Result<Self, PlanError> {
        let horizon = horizon.unwrap_or(model.horizon);
        if horizon == 0 {
            return Err(PlanError::InvalidConfig {
                msg: "horizon must be >= 1",
            });
        }
        if !(opts.min_action_prob > 0.0 && opts.min_action_prob < 0.5) {
            return Err(PlanError::InvalidConfig {
                msg: "min_action_prob must lie in (0, 0.5)",
            });
        }
        if opts.init_scale < 0.0 {
            return Err(PlanError::InvalidConfig {
                msg: "init_scale must be non-negative",
            });
        }

        let mut shapes = BTreeMap::new();
        let mut kinds = BTreeMap::new();
        let mut bounds = BTreeMap::new();
        let mut slots = Vec::new();
        for decl in model.action_vars() {
            if decl.kind == VarKind::Enumerated {
                return Err(PlanError::UnsupportedActionKind {
                    name: decl.name.clone(),
                    kind: decl.kind,
                });
            }
            let mut shape = vec![horizon];
            shape.extend_from_slice(&decl.shape);
            shapes.insert(decl.name.clone(), shape);
            kinds.insert(decl.name.clone(), decl.kind);
            match decl.kind {
                VarKind::Bool => {
                    let noop_active = model.noop_value(&decl.name)? != 0.0;
                    for offset in 0..decl.size() {
                        slots.push(BoolSlot {
                            var: decl.name.clone(),
                            offset,
                            noop_active,
                        });
                    }
                }
                _ => {
                    let range = model
                        .action_bounds
                        .get(&decl.name)
                        .copied()
                        .unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
                    bounds.insert(decl.name.clone(), range);
                }
            }
        }

        // The limit only binds when fewer actions are allowed than slots
        // exist; otherwise every projection collapses to the box case.
        let allowed = match model.max_concurrent_actions {
            Some(k) if k < slots.len() => Some(k),
            _ => None,
        };
        let projection = match (allowed, opts.projection) {
            (None, _) => ProjectionKind::BoxOnly,
            (Some(_), requested) => requested,
        };
        if allowed.is_some() && projection == ProjectionKind::BoxOnly {
            log::warn!(
                "concurrency limit {:?} declared but projection is box-only; \
                 materialized actions may violate it",
                allowed
            );
        }

        Ok(Self {
            model,
            horizon,
            wrap_sigmoid: opts.wrap_sigmoid,
            min_action_prob: opts.min_action_prob,
            max_projection_iters: opts.max_projection_iters,
            projection,
            allowed,
            init_scale: opts.init_scale,
            shapes,
            kinds,
            bounds,
            slots,
        })
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn model(&self) -> &Arc<LiftedModel> {
        &self.model
    }

    pub fn projection(&self) -> ProjectionKind {
        self.projection
    }

    /// Decision threshold in parameter space for boolean actions.
    pub fn threshold(&self) -> f64 {
        if self.wrap_sigmoid {
            0.0
        } else {
            0.5
        }
    }

    fn weight(&self, var: &str, hyper: &Hyperparams) -> f64 {
        hyper.get(var).copied().unwrap_or(1.0)
    }

    fn to_action(&self, v: f64, w: f64) -> f64 {
        if self.wrap_sigmoid {
            sigmoid(w * v)
        } else {
            v
        }
    }

    fn to_param(&self, a: f64, w: f64) -> f64 {
        if self.wrap_sigmoid {
            -(1.0 / w) * (1.0 / a - 1.0).ln()
        } else {
            a
        }
    }

    /// Feasible parameter interval for one action fluent.
    fn param_bounds(&self, var: &str, hyper: &Hyperparams) -> (f64, f64) {
        match self.kinds.get(var) {
            Some(VarKind::Bool) => {
                let w = self.weight(var, hyper);
                if self.wrap_sigmoid {
                    (
                        self.to_param(self.min_action_prob, w),
                        self.to_param(1.0 - self.min_action_prob, w),
                    )
                } else {
                    (self.min_action_prob, 1.0 - self.min_action_prob)
                }
            }
            _ => self
                .bounds
                .get(var)
                .copied()
                .unwrap_or((f64::NEG_INFINITY, f64::INFINITY)),
        }
    }

    /// Draw fresh parameters and project them into the feasible box.
    ///
    /// Boolean parameters center on the decision threshold so the initial
    /// relaxed actions hover near 0.5.
    pub fn initialize(
        &self,
        key: PrngKey,
        hyper: &Hyperparams,
        _subs: &TensorMap,
    ) -> Result<TensorMap, RuntimeError> {
        let mut key = key;
        let mut params = TensorMap::new();
        for (var, shape) in &self.shapes {
            let (sub, rest) = key.split();
            key = rest;
            let mut rng = sub.into_rng();
            let n: usize = shape.iter().product();
            let center = match self.kinds.get(var) {
                Some(VarKind::Bool) => self.threshold(),
                _ => 0.0,
            };
            let data: Vec<f64> = (0..n)
                .map(|_| {
                    let z: f64 = rng.sample(StandardNormal);
                    center + self.init_scale * z
                })
                .collect();
            params.insert(var.clone(), Tensor::from_vec(shape.clone(), data)?);
        }
        self.box_project(&params, hyper)
    }

    /// Relaxed actions for one decision epoch.
    pub fn train_action(
        &self,
        params: &TensorMap,
        hyper: &Hyperparams,
        step: usize,
    ) -> Result<TensorMap, RuntimeError> {
        let mut out = TensorMap::new();
        for (var, kind) in &self.kinds {
            let slice = self.step_of(params, var, step)?;
            let value = match kind {
                VarKind::Bool => {
                    let w = self.weight(var, hyper);
                    slice.map(|v| self.to_action(v, w))
                }
                _ => slice,
            };
            out.insert(var.clone(), value);
        }
        Ok(out)
    }

    /// Exact actions for one decision epoch: bools thresholded, ints rounded
    /// and clipped to their declared range.
    pub fn test_action(
        &self,
        params: &TensorMap,
        step: usize,
    ) -> Result<TensorMap, RuntimeError> {
        let thr = self.threshold();
        let mut out = TensorMap::new();
        for (var, kind) in &self.kinds {
            let slice = self.step_of(params, var, step)?;
            let value = match kind {
                VarKind::Bool => slice.map(|v| if v > thr { 1.0 } else { 0.0 }),
                VarKind::Int => {
                    let (lo, hi) = self
                        .bounds
                        .get(var)
                        .copied()
                        .unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
                    slice.map(|v| v.round().clamp(lo, hi))
                }
                _ => slice,
            };
            out.insert(var.clone(), value);
        }
        Ok(out)
    }

    /// Clip every parameter into its feasible interval. Idempotent.
    ///
    /// Also the shape gate for everything downstream: every parameter tensor
    /// must match its declared `[horizon, ...fluent shape]` before the slot
    /// projections index into it.
    pub fn box_project(
        &self,
        params: &TensorMap,
        hyper: &Hyperparams,
    ) -> Result<TensorMap, RuntimeError> {
        let mut out = TensorMap::new();
        for var in self.shapes.keys() {
            let t = self.checked(params, var)?;
            let (lo, hi) = self.param_bounds(var, hyper);
            out.insert(var.clone(), t.clamp(lo, hi));
        }
        Ok(out)
    }

    /// Box projection followed by per-timestep enforcement of the concurrency
    /// limit. The returned flags report, per timestep, whether the limit was
    /// actually met (always true for the sorting and box-only projections).
    pub fn concurrency_project(
        &self,
        params: &TensorMap,
        hyper: &Hyperparams,
    ) -> Result<(TensorMap, Vec<bool>), RuntimeError> {
        let mut params = self.box_project(params, hyper)?;
        let converged = match (self.projection, self.allowed) {
            (ProjectionKind::Sorting, Some(k)) => {
                for t in 0..self.horizon {
                    self.sorting_step(&mut params, hyper, t, k)?;
                }
                vec![true; self.horizon]
            }
            (ProjectionKind::Iterative, Some(k)) => (0..self.horizon)
                .map(|t| self.iterative_step(&mut params, hyper, t, k))
                .collect::<Result<_, _>>()?,
            _ => vec![true; self.horizon],
        };
        Ok((params, converged))
    }

    /// Sorting projection for one timestep.
    ///
    /// Utilization of a slot is its parameter oriented so that "more active"
    /// is larger; subtracting the surplus of the (K+1)-th largest utilization
    /// past the threshold pushes every slot beyond rank K to inactive.
    fn sorting_step(
        &self,
        params: &mut TensorMap,
        hyper: &Hyperparams,
        t: usize,
        k: usize,
    ) -> Result<(), RuntimeError> {
        let thr = self.threshold();
        let mut utilization = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let v = self.slot_value(params, slot, t)?;
            let oriented = if slot.noop_active { 2.0 * thr - v } else { v };
            utilization.push(oriented);
        }
        utilization.sort_by(|a, b| b.total_cmp(a));
        let surplus = (utilization[k] - thr).max(0.0);
        if surplus <= 0.0 {
            return Ok(());
        }
        for slot in &self.slots {
            let (lo, hi) = self.param_bounds(&slot.var, hyper);
            let v = self.slot_value(params, slot, t)?;
            let shifted = if slot.noop_active {
                v + surplus
            } else {
                v - surplus
            };
            self.set_slot(params, slot, t, shifted.clamp(lo, hi))?;
        }
        Ok(())
    }

    /// Iterative projection for one timestep; returns whether the total
    /// utilization dropped to the limit within the iteration cap.
    fn iterative_step(
        &self,
        params: &mut TensorMap,
        hyper: &Hyperparams,
        t: usize,
        k: usize,
    ) -> Result<bool, RuntimeError> {
        let amin = self.min_action_prob;
        let amax = 1.0 - amin;
        for _ in 0..=self.max_projection_iters {
            let mut usage = 0.0;
            let mut movable = 0usize;
            for slot in &self.slots {
                let w = self.weight(&slot.var, hyper);
                let a = self.to_action(self.slot_value(params, slot, t)?, w);
                if slot.noop_active {
                    usage += 1.0 - a;
                    movable += usize::from(a < amax);
                } else {
                    usage += a;
                    movable += usize::from(a > amin);
                }
            }
            let surplus = (usage - k as f64).max(0.0);
            if surplus <= 0.0 {
                return Ok(true);
            }
            if movable == 0 {
                break;
            }
            let delta = surplus / movable as f64;
            for slot in &self.slots {
                let w = self.weight(&slot.var, hyper);
                let a = self.to_action(self.slot_value(params, slot, t)?, w);
                let moved = if slot.noop_active { a + delta } else { a - delta };
                self.set_slot(params, slot, t, self.to_param(moved.clamp(amin, amax), w))?;
            }
        }
        Ok(false)
    }

    /// Number of decision-active boolean slots at each timestep.
    pub fn active_counts(
        &self,
        params: &TensorMap,
        _hyper: &Hyperparams,
    ) -> Result<Vec<usize>, RuntimeError> {
        let thr = self.threshold();
        let mut out = Vec::with_capacity(self.horizon);
        for t in 0..self.horizon {
            let mut n = 0usize;
            for slot in &self.slots {
                let v = self.slot_value(params, slot, t)?;
                let active = if slot.noop_active { v < thr } else { v > thr };
                n += usize::from(active);
            }
            out.push(n);
        }
        Ok(out)
    }

    /// Warm start for the next decision epoch: drop the executed first step,
    /// shift the rest forward, and repeat the final step.
    pub fn next_epoch_guess(&self, params: &TensorMap) -> Result<TensorMap, RuntimeError> {
        let mut out = TensorMap::new();
        for var in self.kinds.keys() {
            let t = required(params, var)?;
            let h = t.shape().first().copied().ok_or(RuntimeError::NoAxis {
                what: "next_epoch_guess",
            })?;
            let mut rows = Vec::with_capacity(h);
            for i in 1..h {
                rows.push(t.index_axis0(i)?);
            }
            rows.push(t.index_axis0(h - 1)?);
            out.insert(var.clone(), Tensor::stack(&rows)?);
        }
        Ok(out)
    }

    fn step_of(
        &self,
        params: &TensorMap,
        var: &str,
        step: usize,
    ) -> Result<Tensor, RuntimeError> {
        required(params, var)?.index_axis0(step)
    }

    /// Look up a parameter tensor and verify it matches its declared
    /// `[horizon, ...fluent shape]`, so slot indexing never goes out of range.
    fn checked<'a>(
        &self,
        params: &'a TensorMap,
        var: &str,
    ) -> Result<&'a Tensor, RuntimeError> {
        let t = required(params, var)?;
        match self.shapes.get(var) {
            Some(shape) if t.shape() == shape.as_slice() => Ok(t),
            Some(shape) => Err(RuntimeError::Shape {
                what: "plan parameters",
                expected: shape.clone(),
                got: t.shape().to_vec(),
            }),
            None => Err(RuntimeError::UnknownVariable {
                name: var.to_string(),
            }),
        }
    }

    fn slot_value(
        &self,
        params: &TensorMap,
        slot: &BoolSlot,
        t: usize,
    ) -> Result<f64, RuntimeError> {
        let tensor = self.checked(params, &slot.var)?;
        let stride = tensor.len() / self.horizon;
        Ok(tensor.data()[t * stride + slot.offset])
    }

    fn set_slot(
        &self,
        params: &mut TensorMap,
        slot: &BoolSlot,
        t: usize,
        v: f64,
    ) -> Result<(), RuntimeError> {
        let tensor = params
            .get_mut(&slot.var)
            .ok_or_else(|| RuntimeError::UnknownVariable {
                name: slot.var.clone(),
            })?;
        let stride = tensor.len() / self.horizon;
        tensor.data_mut()[t * stride + slot.offset] = v;
        Ok(())
    }
}

fn required<'a>(params: &'a TensorMap, var: &str) -> Result<&'a Tensor, RuntimeError> {
    params.get(var).ok_or_else(|| RuntimeError::UnknownVariable {
        name: var.to_string(),
    })
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Relaxed-action producer over a straight-line plan.
pub struct TrainPolicy(pub Arc<StraightLinePlan>);

impl ActionProducer for TrainPolicy {
    fn actions(
        &self,
        params: &TensorMap,
        hyper: &Hyperparams,
        step: usize,
    ) -> Result<TensorMap, RuntimeError> {
        self.0.train_action(params, hyper, step)
    }
}

/// Exact-action producer over a straight-line plan.
pub struct TestPolicy(pub Arc<StraightLinePlan>);

impl ActionProducer for TestPolicy {
    fn actions(
        &self,
        params: &TensorMap,
        _hyper: &Hyperparams,
        step: usize,
    ) -> Result<TensorMap, RuntimeError> {
        self.0.test_action(params, step)
    }
}
