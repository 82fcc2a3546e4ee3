//! gp-runtime: numeric substrate for the planner.
//!
//! Dense tensors with right-aligned broadcasting, splittable PRNG keys, and
//! the gradient-computation collaborator interface consumed by the driver.

pub mod grad;
pub mod key;
pub mod tensor;

pub use grad::{FiniteDifference, GradientEstimator, LossFn};
pub use key::{splitmix64, KeyStream, PrngKey};
pub use tensor::{RuntimeError, Tensor, TensorMap};

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
