//! gp-plan: straight-line plan optimization over a relaxed model.
//!
//! The plan holds one free parameter tensor per action fluent and decision
//! epoch; the planner estimates gradients through relaxed rollouts, applies a
//! first-order update rule, projects the parameters back into the feasible
//! set, and tracks the best exactly-evaluated checkpoint.

pub mod config;
pub mod opt;
pub mod plan;
pub mod planner;

pub use config::{Config, ConfigError};
pub use opt::{clip_by_global_norm, GradientTransform, OptimizerState};
pub use plan::{
    PlanError, PlanOptions, ProjectionKind, StraightLinePlan, TestPolicy, TrainPolicy,
};
pub use planner::{
    Callback, OptimizeOptions, OptimizeRun, Planner, PlannerOptions, Utility,
};

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
