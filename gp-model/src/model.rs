//! Lifted model: variable tables, leveled CPFs, reward, and grounding.

use std::collections::BTreeMap;

use gp_runtime::{Tensor, TensorMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::Expr;

/// Declared value kind of a fluent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    Bool,
    Int,
    Real,
    /// Enumerated/object-valued; carried in states but has no differentiable
    /// action surrogate.
    Enumerated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    State,
    Action,
    Interm,
    NonFluent,
}

/// One lifted variable: fixed kind and shape for the life of a session.
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: String,
    pub role: Role,
    pub kind: VarKind,
    pub shape: Vec<usize>,
    /// Per-dimension object labels used for grounding; empty means indices.
    pub objects: Vec<Vec<String>>,
}

impl VarDecl {
    pub fn new(name: &str, role: Role, kind: VarKind, shape: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            role,
            kind,
            shape: shape.to_vec(),
            objects: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Next-value expression for one fluent.
///
/// A target `x'` (trailing prime) defines the next value of state fluent `x`;
/// an unprimed target must name an interm fluent computed within the step.
#[derive(Debug, Clone)]
pub struct Cpf {
    pub target: String,
    pub expr: Expr,
}

impl Cpf {
    pub fn next_state(var: &str, expr: Expr) -> Self {
        Self {
            target: format!("{var}'"),
            expr,
        }
    }

    pub fn interm(var: &str, expr: Expr) -> Self {
        Self {
            target: var.to_string(),
            expr,
        }
    }

    /// The state fluent this CPF advances, if it is a primed target.
    pub fn primed_state(&self) -> Option<&str> {
        self.target.strip_suffix('\'')
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown variable <{name}>")]
    UnknownVariable { name: String },
    #[error("missing initial value for <{name}>")]
    MissingInit { name: String },
    #[error("shape mismatch for <{name}>: declared {declared:?}, initial value {got:?}")]
    ShapeMismatch {
        name: String,
        declared: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("cpf target <{name}> is neither a primed state fluent nor an interm fluent")]
    BadCpfTarget { name: String },
    #[error("discount must be in (0, 1], got {got}")]
    BadDiscount { got: f64 },
    #[error("horizon must be >= 1")]
    BadHorizon,
    #[error("no-op value undefined for non-action <{name}>")]
    NoNoop { name: String },
}

/// A lifted planning model: the consumed half of the domain interface.
#[derive(Debug, Clone)]
pub struct LiftedModel {
    pub decls: BTreeMap<String, VarDecl>,
    /// Initial values for every state fluent and non-fluent, and the default
    /// (no-op) values for action fluents.
    pub init_values: TensorMap,
    /// Leveled dependency graph: each level's CPFs read only earlier levels
    /// and the previous state.
    pub levels: Vec<Vec<Cpf>>,
    pub reward: Expr,
    pub discount: f64,
    pub horizon: usize,
    /// Maximum number of simultaneously non-no-op boolean actions, if the
    /// domain declares one.
    pub max_concurrent_actions: Option<usize>,
    /// Declared legal ranges for int/real action fluents.
    pub action_bounds: BTreeMap<String, (f64, f64)>,
}

impl Default for LiftedModel {
    fn default() -> Self {
        Self {
            decls: BTreeMap::new(),
            init_values: TensorMap::new(),
            levels: Vec::new(),
            reward: Expr::Const(0.0),
            discount: 1.0,
            horizon: 1,
            max_concurrent_actions: None,
            action_bounds: BTreeMap::new(),
        }
    }
}

impl LiftedModel {
    /// Declare a variable together with its initial/default value.
    pub fn insert_var(&mut self, decl: VarDecl, init: Tensor) {
        self.init_values.insert(decl.name.clone(), init);
        self.decls.insert(decl.name.clone(), decl);
    }

    pub fn decl(&self, name: &str) -> Option<&VarDecl> {
        self.decls.get(name)
    }

    pub fn action_vars(&self) -> impl Iterator<Item = &VarDecl> {
        self.decls.values().filter(|d| d.role == Role::Action)
    }

    /// The value a boolean action takes when inactive (its declared default).
    pub fn noop_value(&self, name: &str) -> Result<f64, ModelError> {
        let decl = self.decl(name).ok_or_else(|| ModelError::UnknownVariable {
            name: name.to_string(),
        })?;
        if decl.role != Role::Action {
            return Err(ModelError::NoNoop {
                name: name.to_string(),
            });
        }
        let init = self
            .init_values
            .get(name)
            .ok_or_else(|| ModelError::MissingInit {
                name: name.to_string(),
            })?;
        init.data().first().copied().ok_or(ModelError::MissingInit {
            name: name.to_string(),
        })
    }

    /// Ground names for every slot of a lifted variable, in row-major order.
    ///
    /// Scalar variables ground to their own name; tensor variables use the
    /// `var___a__b` convention with per-dimension labels (indices if the
    /// declaration carries no object names).
    pub fn ground_names(&self, name: &str) -> Result<Vec<String>, ModelError> {
        let decl = self.decl(name).ok_or_else(|| ModelError::UnknownVariable {
            name: name.to_string(),
        })?;
        if decl.shape.is_empty() {
            return Ok(vec![decl.name.clone()]);
        }
        let labels: Vec<Vec<String>> = decl
            .shape
            .iter()
            .enumerate()
            .map(|(d, &n)| match decl.objects.get(d) {
                Some(objs) if objs.len() == n => objs.clone(),
                _ => (0..n).map(|i| i.to_string()).collect(),
            })
            .collect();

        let mut out = Vec::with_capacity(decl.size());
        let mut idx = vec![0usize; decl.shape.len()];
        for _ in 0..decl.size() {
            let mut s = decl.name.clone();
            s.push_str("___");
            for (d, &i) in idx.iter().enumerate() {
                if d > 0 {
                    s.push_str("__");
                }
                s.push_str(&labels[d][i]);
            }
            out.push(s);
            for d in (0..idx.len()).rev() {
                idx[d] += 1;
                if idx[d] < decl.shape[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
        Ok(out)
    }

    /// Structural checks; run before any compilation.
    pub fn validate(&self) -> Result<(), ModelError> {
        if !(self.discount > 0.0 && self.discount <= 1.0) {
            return Err(ModelError::BadDiscount { got: self.discount });
        }
        if self.horizon == 0 {
            return Err(ModelError::BadHorizon);
        }
        for decl in self.decls.values() {
            let init =
                self.init_values
                    .get(&decl.name)
                    .ok_or_else(|| ModelError::MissingInit {
                        name: decl.name.clone(),
                    })?;
            if init.shape() != decl.shape.as_slice() {
                return Err(ModelError::ShapeMismatch {
                    name: decl.name.clone(),
                    declared: decl.shape.clone(),
                    got: init.shape().to_vec(),
                });
            }
        }
        let known = |v: &str| -> bool {
            // A primed reference is valid iff its unprimed state fluent is.
            let base = v.strip_suffix('\'').unwrap_or(v);
            match self.decls.get(base) {
                Some(d) if v.ends_with('\'') => d.role == Role::State,
                Some(_) => true,
                None => false,
            }
        };
        let check_expr = |e: &Expr| -> Result<(), ModelError> {
            let mut missing = None;
            e.visit_vars(&mut |v| {
                if missing.is_none() && !known(v) {
                    missing = Some(v.to_string());
                }
            });
            match missing {
                Some(name) => Err(ModelError::UnknownVariable { name }),
                None => Ok(()),
            }
        };
        for level in &self.levels {
            for cpf in level {
                let target_ok = match cpf.primed_state() {
                    Some(base) => self.decl(base).map(|d| d.role) == Some(Role::State),
                    None => self.decl(&cpf.target).map(|d| d.role) == Some(Role::Interm),
                };
                if !target_ok {
                    return Err(ModelError::BadCpfTarget {
                        name: cpf.target.clone(),
                    });
                }
                check_expr(&cpf.expr)?;
            }
        }
        check_expr(&self.reward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_by_two_model() -> LiftedModel {
        let mut m = LiftedModel::default();
        m.insert_var(
            VarDecl::new("on", Role::State, VarKind::Bool, &[2]),
            Tensor::zeros(&[2]),
        );
        m.insert_var(
            VarDecl::new("flip", Role::Action, VarKind::Bool, &[2]),
            Tensor::zeros(&[2]),
        );
        m.levels = vec![vec![Cpf::next_state(
            "on",
            Expr::var("on").or(Expr::var("flip")),
        )]];
        m.reward = Expr::var("on'").sum_over();
        m
    }

    #[test]
    fn validate_rejects_unprimed_state_target() {
        let mut m = two_by_two_model();
        m.levels[0][0].target = "on".to_string();
        assert!(matches!(m.validate(), Err(ModelError::BadCpfTarget { .. })));
    }

    #[test]
    fn validate_accepts_well_formed_model() {
        assert!(two_by_two_model().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_variable_in_cpf() {
        let mut m = two_by_two_model();
        m.levels[0][0].expr = Expr::var("ghost");
        assert!(matches!(
            m.validate(),
            Err(ModelError::UnknownVariable { name }) if name == "ghost"
        ));
    }

    #[test]
    fn validate_rejects_shape_mismatch() {
        let mut m = two_by_two_model();
        m.init_values
            .insert("on".to_string(), Tensor::zeros(&[3]));
        assert!(matches!(m.validate(), Err(ModelError::ShapeMismatch { .. })));
    }

    #[test]
    fn ground_names_use_objects_then_indices() {
        let mut m = two_by_two_model();
        assert_eq!(m.ground_names("flip").unwrap(), ["flip___0", "flip___1"]);

        let mut decl = VarDecl::new("link", Role::Action, VarKind::Bool, &[2, 2]);
        decl.objects = vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["x".to_string(), "y".to_string()],
        ];
        m.insert_var(decl, Tensor::zeros(&[2, 2]));
        assert_eq!(
            m.ground_names("link").unwrap(),
            ["link___a__x", "link___a__y", "link___b__x", "link___b__y"]
        );
    }

    #[test]
    fn noop_comes_from_default_value() {
        let mut m = two_by_two_model();
        m.init_values
            .insert("flip".to_string(), Tensor::full(&[2], 1.0));
        assert_eq!(m.noop_value("flip").unwrap(), 1.0);
        assert!(matches!(
            m.noop_value("on"),
            Err(ModelError::NoNoop { .. })
        ));
    }
}
