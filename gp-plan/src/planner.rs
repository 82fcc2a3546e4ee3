//! Gradient-ascent optimization driver.
//!
//! One planner instance owns two compiled views of the same model: a relaxed
//! one that training losses and gradients flow through, and an exact one that
//! evaluates the thresholded plan. `optimize` yields a callback per reporting
//! period; the caller decides when to stop draining the iterator and which
//! checkpoint (`params` or `best_params`) to act on.

use std::sync::Arc;

use gp_model::{LiftedModel, ModelError, Role};
use gp_relax::{
    Compiler, ExactLogic, FrozenTrace, Hyperparams, ModelParams, RolloutFn, RolloutLog, SoftLogic,
};
use gp_runtime::{FiniteDifference, GradientEstimator, PrngKey, RuntimeError, Tensor, TensorMap};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::opt::{clip_by_global_norm, GradientTransform, OptimizerState};
use crate::plan::{PlanError, PlanOptions, StraightLinePlan, TestPolicy, TrainPolicy};

/// How per-trajectory returns aggregate into the scalar objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Utility {
    #[default]
    Mean,
    /// Risk-averse: optimize the worst trajectory in the batch.
    Min,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerOptions {
    pub batch_size_train: usize,
    /// Defaults to the training batch size.
    pub batch_size_test: Option<usize>,
    /// Plan over a shorter lookahead than the model's declared horizon.
    pub rollout_horizon: Option<usize>,
    pub optimizer: GradientTransform,
    /// Global-norm gradient clip; `None` disables clipping.
    pub clip_grad: Option<f64>,
    /// Compress reward magnitudes with symlog before discounting.
    pub use_symlog_reward: bool,
    pub utility: Utility,
    /// Sharpness of the fuzzy-logic relaxation.
    pub sharpness: f64,
    /// Finite-difference probe step.
    pub fd_step: f64,
    /// CPF targets whose forward values are kept but never differentiated.
    pub cpfs_without_grad: Vec<String>,
    pub plan: PlanOptions,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            batch_size_train: 32,
            batch_size_test: None,
            rollout_horizon: None,
            optimizer: GradientTransform::default(),
            clip_grad: None,
            use_symlog_reward: false,
            utility: Utility::Mean,
            sharpness: 10.0,
            fd_step: 1e-4,
            cpfs_without_grad: Vec::new(),
            plan: PlanOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OptimizeOptions {
    pub epochs: usize,
    /// Reporting period in iterations; 0 is treated as 1.
    pub step: usize,
    pub policy_hyperparams: Hyperparams,
    /// Initial state and non-fluent overrides; model defaults fill the rest.
    pub subs: Option<TensorMap>,
    /// Warm-start parameters, typically from `next_epoch_guess`.
    pub guess: Option<TensorMap>,
}

/// Snapshot emitted once per reporting period.
#[derive(Debug, Clone)]
pub struct Callback {
    pub iteration: usize,
    /// Utility of the relaxed rollout (after any symlog scaling).
    pub train_return: f64,
    /// Utility of the exact rollout of the thresholded plan.
    pub test_return: f64,
    pub best_return: f64,
    pub params: TensorMap,
    pub best_params: TensorMap,
    pub grad: TensorMap,
    pub updates: TensorMap,
    pub train_log: RolloutLog,
    /// False when the iterative projection hit its cap at some timestep.
    pub projection_converged: bool,
}

pub struct Planner {
    model: Arc<LiftedModel>,
    plan: Arc<StraightLinePlan>,
    train_policy: TrainPolicy,
    test_policy: TestPolicy,
    train_rollout: RolloutFn,
    test_rollout: RolloutFn,
    optimizer: GradientTransform,
    clip_grad: Option<f64>,
    grad: FiniteDifference,
    use_symlog: bool,
    utility: Utility,
    train_mp: ModelParams,
    test_mp: ModelParams,
    has_frozen: bool,
    /// Ground action name to its no-op value, for materialization filtering.
    noop_actions: FxHashMap<String, f64>,
}

impl Planner {
    pub fn new(model: Arc<LiftedModel>, opts: PlannerOptions) -> Result<Self, PlanError> {
        let model = match opts.rollout_horizon {
            Some(h) => Arc::new(LiftedModel {
                horizon: h,
                ..(*model).clone()
            }),
            None => model,
        };
        let plan = Arc::new(StraightLinePlan::new(Arc::clone(&model), None, opts.plan)?);

        let train_compiled = Compiler::new(Arc::new(SoftLogic))
            .without_grad(opts.cpfs_without_grad.iter().cloned())
            .compile(&model)?;
        let test_compiled = Compiler::new(Arc::new(ExactLogic)).compile(&model)?;
        let train_rollout = RolloutFn::new(train_compiled, opts.batch_size_train);
        let test_rollout = RolloutFn::new(
            test_compiled,
            opts.batch_size_test.unwrap_or(opts.batch_size_train),
        );

        let mut noop_actions = FxHashMap::default();
        for decl in model.action_vars() {
            let init =
                model
                    .init_values
                    .get(&decl.name)
                    .ok_or_else(|| ModelError::MissingInit {
                        name: decl.name.clone(),
                    })?;
            for (name, &v) in model.ground_names(&decl.name)?.iter().zip(init.data()) {
                noop_actions.insert(name.clone(), v);
            }
        }

        Ok(Self {
            model,
            train_policy: TrainPolicy(Arc::clone(&plan)),
            test_policy: TestPolicy(Arc::clone(&plan)),
            plan,
            train_rollout,
            test_rollout,
            optimizer: opts.optimizer,
            clip_grad: opts.clip_grad,
            grad: FiniteDifference {
                epsilon: opts.fd_step,
            },
            use_symlog: opts.use_symlog_reward,
            utility: opts.utility,
            train_mp: ModelParams {
                sharpness: opts.sharpness,
            },
            test_mp: ModelParams::default(),
            has_frozen: !opts.cpfs_without_grad.is_empty(),
            noop_actions,
        })
    }

    pub fn model(&self) -> &Arc<LiftedModel> {
        &self.model
    }

    pub fn plan(&self) -> &Arc<StraightLinePlan> {
        &self.plan
    }

    /// Start an optimization run. Validates the substitutions up front so the
    /// returned iterator never fails on malformed input mid-training.
    pub fn optimize(
        &self,
        key: PrngKey,
        opts: OptimizeOptions,
    ) -> Result<OptimizeRun<'_>, PlanError> {
        let subs = self.initial_subs(opts.subs.as_ref())?;
        let train_subs = self.train_rollout.batched_subs(&subs)?;
        let test_subs = self.test_rollout.batched_subs(&subs)?;

        let (init_key, carry) = key.split();
        let params = match opts.guess {
            Some(guess) => self.plan.box_project(&guess, &opts.policy_hyperparams)?,
            None => self
                .plan
                .initialize(init_key, &opts.policy_hyperparams, &subs)?,
        };
        let opt_state = self.optimizer.init(&params);

        Ok(OptimizeRun {
            planner: self,
            key: Some(carry),
            hyper: opts.policy_hyperparams,
            train_subs,
            test_subs,
            best_params: params.clone(),
            params,
            opt_state,
            best_return: f64::NEG_INFINITY,
            it: 0,
            epochs: opts.epochs,
            step: opts.step.max(1),
            done: false,
        })
    }

    /// Materialize the plan's decision at `step` as ground action assignments,
    /// omitting every action that sits at its no-op value.
    pub fn get_action(
        &self,
        _key: PrngKey,
        params: &TensorMap,
        step: usize,
        _subs: &TensorMap,
    ) -> Result<FxHashMap<String, f64>, PlanError> {
        let actions = self.plan.test_action(params, step)?;
        let mut out = FxHashMap::default();
        for (var, tensor) in &actions {
            for (name, &v) in self.model.ground_names(var)?.iter().zip(tensor.data()) {
                match self.noop_actions.get(name) {
                    Some(&noop) if noop == v => {}
                    _ => {
                        out.insert(name.clone(), v);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Model defaults for states and non-fluents, overlaid with caller values.
    fn initial_subs(&self, user: Option<&TensorMap>) -> Result<TensorMap, PlanError> {
        let mut subs = TensorMap::new();
        for decl in self.model.decls.values() {
            if matches!(decl.role, Role::State | Role::NonFluent) {
                let init =
                    self.model
                        .init_values
                        .get(&decl.name)
                        .ok_or_else(|| ModelError::MissingInit {
                            name: decl.name.clone(),
                        })?;
                subs.insert(decl.name.clone(), init.clone());
            }
        }
        if let Some(user) = user {
            for (name, value) in user {
                let decl = self
                    .model
                    .decl(name)
                    .ok_or_else(|| ModelError::UnknownVariable { name: name.clone() })?;
                if value.shape() != decl.shape.as_slice() {
                    return Err(ModelError::ShapeMismatch {
                        name: name.clone(),
                        declared: decl.shape.clone(),
                        got: value.shape().to_vec(),
                    }
                    .into());
                }
                subs.insert(name.clone(), value.clone());
            }
        }
        Ok(subs)
    }

    /// Discounted per-trajectory returns from a `[batch, horizon]` reward
    /// tensor, with optional symlog compression applied before discounting.
    fn returns(&self, rewards: &Tensor, symlog: bool) -> Result<Vec<f64>, RuntimeError> {
        let h = match rewards.shape() {
            [_, h] => *h,
            s => {
                return Err(RuntimeError::Shape {
                    what: "returns",
                    expected: vec![0, 0],
                    got: s.to_vec(),
                })
            }
        };
        let gamma = self.model.discount;
        let mut out = Vec::with_capacity(rewards.len() / h.max(1));
        for row in rewards.data().chunks(h.max(1)) {
            let mut acc = 0.0;
            let mut disc = 1.0;
            for &r in row {
                let r = if symlog { symlog_scale(r) } else { r };
                acc += disc * r;
                disc *= gamma;
            }
            out.push(acc);
        }
        Ok(out)
    }

    fn utility_of(&self, returns: &[f64]) -> f64 {
        match self.utility {
            Utility::Mean => {
                if returns.is_empty() {
                    0.0
                } else {
                    returns.iter().sum::<f64>() / returns.len() as f64
                }
            }
            Utility::Min => returns.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }

    fn loss(&self, rewards: &Tensor, symlog: bool) -> Result<f64, RuntimeError> {
        Ok(-self.utility_of(&self.returns(rewards, symlog)?))
    }
}

/// sign-preserving log compression; the identity near zero.
fn symlog_scale(x: f64) -> f64 {
    x.signum() * x.abs().ln_1p()
}

/// In-flight optimization run; each yielded item is one reporting period.
pub struct OptimizeRun<'a> {
    planner: &'a Planner,
    key: Option<PrngKey>,
    hyper: Hyperparams,
    train_subs: TensorMap,
    test_subs: TensorMap,
    params: TensorMap,
    opt_state: OptimizerState,
    best_params: TensorMap,
    best_return: f64,
    it: usize,
    epochs: usize,
    step: usize,
    done: bool,
}

impl OptimizeRun<'_> {
    pub fn params(&self) -> &TensorMap {
        &self.params
    }

    pub fn best_params(&self) -> &TensorMap {
        &self.best_params
    }

    fn advance(&mut self, it: usize) -> Result<Callback, PlanError> {
        let planner = self.planner;
        let key = self.key.take().unwrap_or_else(|| PrngKey::new(0));
        let (carry, k_grad, k_train, k_test) = key.split4();
        self.key = Some(carry);

        // All finite-difference probes replay the same stream, so the only
        // thing that varies between them is the perturbed parameter.
        let grad_seed = k_grad.into_seed();
        let trace: Option<FrozenTrace> = if planner.has_frozen {
            let (_, tr) = planner.train_rollout.run_traced(
                PrngKey::new(grad_seed),
                &planner.train_policy,
                &self.params,
                &self.hyper,
                &self.train_subs,
                &planner.train_mp,
            )?;
            Some(tr)
        } else {
            None
        };

        let hyper = &self.hyper;
        let train_subs = &self.train_subs;
        let loss = |p: &TensorMap| -> Result<f64, RuntimeError> {
            let log = planner.train_rollout.run(
                PrngKey::new(grad_seed),
                &planner.train_policy,
                p,
                hyper,
                train_subs,
                &planner.train_mp,
                trace.as_ref(),
            )?;
            planner.loss(&log.rewards, planner.use_symlog)
        };
        let grad = planner.grad.grad(&loss, &self.params)?;

        let clipped = match planner.clip_grad {
            Some(max_norm) => clip_by_global_norm(&grad, max_norm),
            None => grad.clone(),
        };
        let updates = planner.optimizer.update(&clipped, &mut self.opt_state)?;
        let mut next = TensorMap::new();
        for (name, p) in &self.params {
            let u = updates
                .get(name)
                .ok_or_else(|| RuntimeError::UnknownVariable { name: name.clone() })?;
            next.insert(name.clone(), p.add(u)?);
        }

        let (projected, flags) = planner.plan.concurrency_project(&next, hyper)?;
        self.params = projected;
        let projection_converged = flags.iter().all(|&c| c);
        if !projection_converged {
            log::warn!("concurrency projection hit its iteration cap at iteration {it}");
        }

        let train_log = planner.train_rollout.run(
            k_train,
            &planner.train_policy,
            &self.params,
            hyper,
            train_subs,
            &planner.train_mp,
            None,
        )?;
        let train_return =
            planner.utility_of(&planner.returns(&train_log.rewards, planner.use_symlog)?);

        let test_log = planner.test_rollout.run(
            k_test,
            &planner.test_policy,
            &self.params,
            hyper,
            &self.test_subs,
            &planner.test_mp,
            None,
        )?;
        let test_return = planner.utility_of(&planner.returns(&test_log.rewards, false)?);

        if test_return > self.best_return {
            self.best_return = test_return;
            self.best_params = self.params.clone();
        }

        Ok(Callback {
            iteration: it,
            train_return,
            test_return,
            best_return: self.best_return,
            params: self.params.clone(),
            best_params: self.best_params.clone(),
            grad,
            updates,
            train_log,
            projection_converged,
        })
    }
}

impl Iterator for OptimizeRun<'_> {
    type Item = Callback;

    fn next(&mut self) -> Option<Callback> {
        while !self.done && self.it < self.epochs {
            let it = self.it;
            self.it += 1;
            match self.advance(it) {
                Ok(cb) => {
                    if it % self.step == 0 || it + 1 == self.epochs {
                        return Some(cb);
                    }
                }
                Err(e) => {
                    log::warn!("optimization stopped at iteration {it}: {e}");
                    self.done = true;
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_model::{Cpf, Expr, VarDecl, VarKind};

    fn tiny_model() -> Arc<LiftedModel> {
        let mut m = LiftedModel::default();
        m.insert_var(
            VarDecl::new("x", Role::State, VarKind::Real, &[]),
            Tensor::scalar(0.0),
        );
        m.insert_var(
            VarDecl::new("a", Role::Action, VarKind::Real, &[]),
            Tensor::scalar(0.0),
        );
        m.levels = vec![vec![Cpf::next_state("x", Expr::var("x").add(Expr::var("a")))]];
        m.reward = Expr::var("x'");
        m.horizon = 3;
        m.discount = 0.5;
        Arc::new(m)
    }

    fn planner() -> Planner {
        Planner::new(tiny_model(), PlannerOptions::default()).unwrap()
    }

    #[test]
    fn returns_discount_per_step() {
        let p = planner();
        let rewards = Tensor::from_vec(vec![1, 3], vec![1.0, 1.0, 1.0]).unwrap();
        let r = p.returns(&rewards, false).unwrap();
        assert_eq!(r, vec![1.0 + 0.5 + 0.25]);
    }

    #[test]
    fn symlog_compresses_before_discounting() {
        let p = planner();
        let rewards = Tensor::from_vec(vec![1, 1], vec![f64::exp(1.0) - 1.0]).unwrap();
        let r = p.returns(&rewards, true).unwrap();
        assert!((r[0] - 1.0).abs() < 1e-12);
        assert_eq!(symlog_scale(0.0), 0.0);
        assert!((symlog_scale(-(f64::exp(1.0) - 1.0)) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn min_utility_takes_worst_trajectory() {
        let mut p = planner();
        p.utility = Utility::Min;
        let rewards = Tensor::from_vec(vec![2, 1], vec![5.0, -2.0]).unwrap();
        assert_eq!(p.utility_of(&p.returns(&rewards, false).unwrap()), -2.0);
    }

    #[test]
    fn initial_subs_rejects_unknown_and_misshapen_overrides() {
        let p = planner();
        let mut bad = TensorMap::new();
        bad.insert("ghost".to_string(), Tensor::scalar(1.0));
        assert!(matches!(
            p.initial_subs(Some(&bad)),
            Err(PlanError::Model(ModelError::UnknownVariable { .. }))
        ));

        let mut misshapen = TensorMap::new();
        misshapen.insert("x".to_string(), Tensor::zeros(&[2]));
        assert!(matches!(
            p.initial_subs(Some(&misshapen)),
            Err(PlanError::Model(ModelError::ShapeMismatch { .. }))
        ));
    }
}
