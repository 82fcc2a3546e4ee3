//! YAML configuration schema for the planner.
//!
//! Sections map one-to-one onto the option structs consumed by the planner
//! and the plan, so a loaded file converts without reinterpretation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::opt::GradientTransform;
use crate::plan::PlanOptions;
use crate::planner::{OptimizeOptions, PlannerOptions, Utility};

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Optimization driver settings.
    #[serde(default)]
    pub planner: PlannerSection,
    /// Straight-line plan settings.
    #[serde(default)]
    pub plan: PlanOptions,
    /// First-order update rule.
    #[serde(default)]
    pub optimizer: GradientTransform,
    /// Per-run loop settings.
    #[serde(default)]
    pub run: RunSection,
}

/// Optimization driver configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerSection {
    /// Relaxed rollouts per gradient step.
    #[serde(default = "default_batch_size_train")]
    pub batch_size_train: usize,
    /// Exact rollouts per evaluation; defaults to the training batch size.
    #[serde(default)]
    pub batch_size_test: Option<usize>,
    /// Lookahead override; defaults to the model's declared horizon.
    #[serde(default)]
    pub rollout_horizon: Option<usize>,
    /// Global-norm gradient clip; omit to disable.
    #[serde(default)]
    pub clip_grad: Option<f64>,
    #[serde(default)]
    pub use_symlog_reward: bool,
    #[serde(default)]
    pub utility: Utility,
    /// Sharpness of the fuzzy-logic relaxation.
    #[serde(default = "default_sharpness")]
    pub sharpness: f64,
    /// Finite-difference probe step.
    #[serde(default = "default_fd_step")]
    pub fd_step: f64,
    /// CPF targets evaluated forward but never differentiated.
    #[serde(default)]
    pub cpfs_without_grad: Vec<String>,
}

fn default_batch_size_train() -> usize {
    32
}

fn default_sharpness() -> f64 {
    10.0
}

fn default_fd_step() -> f64 {
    1e-4
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            batch_size_train: default_batch_size_train(),
            batch_size_test: None,
            rollout_horizon: None,
            clip_grad: None,
            use_symlog_reward: false,
            utility: Utility::default(),
            sharpness: default_sharpness(),
            fd_step: default_fd_step(),
            cpfs_without_grad: Vec::new(),
        }
    }
}

/// Per-run loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunSection {
    /// Gradient steps per optimization run.
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Reporting period in iterations.
    #[serde(default = "default_report_step")]
    pub step: usize,
}

fn default_epochs() -> usize {
    500
}

fn default_report_step() -> usize {
    1
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            step: default_report_step(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn planner_options(&self) -> PlannerOptions {
        PlannerOptions {
            batch_size_train: self.planner.batch_size_train,
            batch_size_test: self.planner.batch_size_test,
            rollout_horizon: self.planner.rollout_horizon,
            optimizer: self.optimizer,
            clip_grad: self.planner.clip_grad,
            use_symlog_reward: self.planner.use_symlog_reward,
            utility: self.planner.utility,
            sharpness: self.planner.sharpness,
            fd_step: self.planner.fd_step,
            cpfs_without_grad: self.planner.cpfs_without_grad.clone(),
            plan: self.plan,
        }
    }

    pub fn optimize_options(&self) -> OptimizeOptions {
        OptimizeOptions {
            epochs: self.run.epochs,
            step: self.run.step,
            ..OptimizeOptions::default()
        }
    }
}
