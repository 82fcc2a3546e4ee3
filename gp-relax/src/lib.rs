//! gp-relax: differentiable relaxation of a lifted planning model.
//!
//! A `Logic` strategy decides how each non-differentiable primitive is
//! approximated; the compiler turns the model's expression graph into
//! evaluation closures over real-valued tensors; the rollout executor runs the
//! compiled graph over the horizon across a batch of trajectories.

pub mod compiler;
pub mod logic;
pub mod rollout;

pub use compiler::{CompileError, CompiledModel, Compiler};
pub use logic::{ExactLogic, Logic, ModelParams, Sample, SoftLogic};
pub use rollout::{ActionProducer, FrozenTrace, Hyperparams, RolloutFn, RolloutLog};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_nonempty() {
        assert!(!VERSION.is_empty());
    }
}
