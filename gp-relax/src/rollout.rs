//! Batched rollout executor for a compiled model.
//!
//! One rollout applies the compiled CPF levels for `horizon` steps across
//! `n_batch` independent trajectories sharing the same policy parameters.
//! The "batch" is purely data-parallel: every tensor carries a leading batch
//! axis, broadcasting folds unbatched actions in.

use std::collections::BTreeMap;

use gp_runtime::{KeyStream, PrngKey, RuntimeError, Tensor, TensorMap};

use crate::compiler::CompiledModel;
use crate::logic::ModelParams;

/// Per-variable scalar hyperparameters (sigmoid sharpness weights for
/// boolean actions). Missing entries default to 1.0.
pub type Hyperparams = BTreeMap<String, f64>;

/// Produces the per-timestep action tensors injected into the rollout.
///
/// The train-time producer returns relaxed actions; the test-time producer
/// returns rounded/thresholded ones. Both are pure in their arguments.
pub trait ActionProducer: Send + Sync {
    fn actions(
        &self,
        params: &TensorMap,
        hyper: &Hyperparams,
        step: usize,
    ) -> Result<TensorMap, RuntimeError>;
}

/// Ephemeral product of one rollout batch; lives for one optimization step.
#[derive(Debug, Clone)]
pub struct RolloutLog {
    /// Per-trajectory, per-timestep reward, shape `[batch, horizon]`.
    pub rewards: Tensor,
    /// True when any sampling operator saw an invalid distribution.
    pub out_of_bounds: bool,
}

/// Recorded per-timestep values of stop-gradient CPFs at the base parameters.
///
/// Replaying these during perturbed loss evaluations pins the flagged CPFs,
/// so the estimated gradient through them is exactly zero while the forward
/// value stays exact.
#[derive(Debug, Default, Clone)]
pub struct FrozenTrace {
    steps: Vec<BTreeMap<String, Tensor>>,
}

impl FrozenTrace {
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|m| m.is_empty())
    }
}

pub struct RolloutFn {
    compiled: CompiledModel,
    n_batch: usize,
    horizon: usize,
}

impl RolloutFn {
    pub fn new(compiled: CompiledModel, n_batch: usize) -> Self {
        let horizon = compiled.model.horizon;
        Self {
            compiled,
            n_batch,
            horizon,
        }
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Replicate caller-owned substitutions along a new leading batch axis.
    pub fn batched_subs(&self, subs: &TensorMap) -> Result<TensorMap, RuntimeError> {
        let mut out = TensorMap::new();
        for (name, t) in subs {
            let copies: Vec<Tensor> = (0..self.n_batch).map(|_| t.clone()).collect();
            out.insert(name.clone(), Tensor::stack(&copies)?);
        }
        Ok(out)
    }

    /// Run the rollout; flagged CPFs are replayed from `frozen` when given.
    pub fn run(
        &self,
        key: PrngKey,
        policy: &dyn ActionProducer,
        params: &TensorMap,
        hyper: &Hyperparams,
        subs: &TensorMap,
        mp: &ModelParams,
        frozen: Option<&FrozenTrace>,
    ) -> Result<RolloutLog, RuntimeError> {
        let (log, _) = self.run_inner(key, policy, params, hyper, subs, mp, frozen, false)?;
        Ok(log)
    }

    /// Run the rollout and record the stop-gradient trace at these parameters.
    pub fn run_traced(
        &self,
        key: PrngKey,
        policy: &dyn ActionProducer,
        params: &TensorMap,
        hyper: &Hyperparams,
        subs: &TensorMap,
        mp: &ModelParams,
    ) -> Result<(RolloutLog, FrozenTrace), RuntimeError> {
        self.run_inner(key, policy, params, hyper, subs, mp, None, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_inner(
        &self,
        key: PrngKey,
        policy: &dyn ActionProducer,
        params: &TensorMap,
        hyper: &Hyperparams,
        subs: &TensorMap,
        mp: &ModelParams,
        frozen: Option<&FrozenTrace>,
        tracing: bool,
    ) -> Result<(RolloutLog, FrozenTrace), RuntimeError> {
        let mut subs = subs.clone();
        let mut ks = KeyStream::new(key);
        let mut rewards = vec![0.0f64; self.n_batch * self.horizon];
        let mut out_of_bounds = false;
        let mut trace = FrozenTrace::default();

        for t in 0..self.horizon {
            for (name, action) in policy.actions(params, hyper, t)? {
                subs.insert(name, action);
            }

            let mut recorded = BTreeMap::new();
            for level in &self.compiled.levels {
                // A level's results become visible to later levels only.
                let mut staged = Vec::with_capacity(level.len());
                for cpf in level {
                    let value = match (cpf.stop_grad, frozen) {
                        (true, Some(fr)) => fr
                            .steps
                            .get(t)
                            .and_then(|m| m.get(&cpf.target))
                            .cloned()
                            .ok_or_else(|| RuntimeError::UnknownVariable {
                                name: cpf.target.clone(),
                            })?,
                        _ => {
                            let s = (cpf.op)(&subs, mp, &mut ks)?;
                            out_of_bounds |= s.out_of_bounds;
                            s.value
                        }
                    };
                    if tracing && cpf.stop_grad {
                        recorded.insert(cpf.target.clone(), value.clone());
                    }
                    staged.push((cpf.target.clone(), value));
                }
                for (target, value) in staged {
                    subs.insert(target, value);
                }
            }
            if tracing {
                trace.steps.push(recorded);
            }

            let r = (self.compiled.reward)(&subs, mp, &mut ks)?;
            out_of_bounds |= r.out_of_bounds;
            self.write_reward_column(&mut rewards, t, &r.value)?;

            // Advance: primed next-state values replace the current ones.
            let primed: Vec<String> = self
                .compiled
                .model
                .decls
                .values()
                .filter(|d| d.role == gp_model::Role::State)
                .map(|d| d.name.clone())
                .collect();
            for name in primed {
                let primed_name = format!("{name}'");
                if let Some(next) = subs.remove(&primed_name) {
                    subs.insert(name, next);
                }
            }
        }

        Ok((
            RolloutLog {
                rewards: Tensor::from_vec(vec![self.n_batch, self.horizon], rewards)?,
                out_of_bounds,
            },
            trace,
        ))
    }

    fn write_reward_column(
        &self,
        rewards: &mut [f64],
        t: usize,
        r: &Tensor,
    ) -> Result<(), RuntimeError> {
        if r.len() == self.n_batch {
            for (b, &v) in r.data().iter().enumerate() {
                rewards[b * self.horizon + t] = v;
            }
            Ok(())
        } else if r.len() == 1 {
            for b in 0..self.n_batch {
                rewards[b * self.horizon + t] = r.data()[0];
            }
            Ok(())
        } else {
            Err(RuntimeError::Shape {
                what: "reward",
                expected: vec![self.n_batch],
                got: r.shape().to_vec(),
            })
        }
    }
}
