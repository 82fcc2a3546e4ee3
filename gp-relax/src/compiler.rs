//! Compiles the model's expression graph into evaluation closures.
//!
//! The same compiler serves both sides: with `SoftLogic` it produces the
//! relaxed, differentiable graph used for training; with `ExactLogic` it
//! produces the unbiased graph used for test evaluation. All fluents are
//! carried as real tensors either way.

use std::collections::BTreeSet;
use std::sync::Arc;

use gp_model::{ArithOp, Expr, LiftedModel, ModelError, Role, UnaryOp, VarKind};
use gp_runtime::{KeyStream, RuntimeError, Tensor, TensorMap};
use thiserror::Error;

use crate::logic::{normal_sample, uniform_sample, Logic, ModelParams, Sample};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("action fluent <{name}> has kind {kind:?} with no differentiable surrogate")]
    UnsupportedActionKind { name: String, kind: VarKind },
    #[error("ungradable flag names unknown cpf <{name}>")]
    UnknownCpf { name: String },
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// One compiled operation: pure in `subs` and `params`, drawing any
/// randomness from the key stream.
pub type OpFn =
    Box<dyn Fn(&TensorMap, &ModelParams, &mut KeyStream) -> Result<Sample, RuntimeError> + Send + Sync>;

pub struct CompiledCpf {
    pub target: String,
    pub op: OpFn,
    /// Forward value is used as-is, but no gradient flows through it.
    pub stop_grad: bool,
}

pub struct CompiledModel {
    pub model: Arc<LiftedModel>,
    pub levels: Vec<Vec<CompiledCpf>>,
    pub reward: OpFn,
}

pub struct Compiler {
    logic: Arc<dyn Logic>,
    ungradable: BTreeSet<String>,
}

impl Compiler {
    pub fn new(logic: Arc<dyn Logic>) -> Self {
        Self {
            logic,
            ungradable: BTreeSet::new(),
        }
    }

    /// Flag CPF targets whose transition expression cannot be differentiated:
    /// their forward value stays exact, their gradient is forced to zero.
    pub fn without_grad(mut self, cpfs: impl IntoIterator<Item = String>) -> Self {
        self.ungradable.extend(cpfs);
        self
    }

    pub fn compile(&self, model: &Arc<LiftedModel>) -> Result<CompiledModel, CompileError> {
        model.validate()?;

        for decl in model.decls.values() {
            if decl.role == Role::Action
                && !matches!(decl.kind, VarKind::Bool | VarKind::Int | VarKind::Real)
            {
                return Err(CompileError::UnsupportedActionKind {
                    name: decl.name.clone(),
                    kind: decl.kind,
                });
            }
        }

        let targets: BTreeSet<&str> = model
            .levels
            .iter()
            .flatten()
            .map(|c| c.target.as_str())
            .collect();
        for name in &self.ungradable {
            if !targets.contains(name.as_str()) {
                return Err(CompileError::UnknownCpf { name: name.clone() });
            }
            log::warn!("cpf <{name}> is flagged ungradable; its gradient is stopped");
        }

        let levels = model
            .levels
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|cpf| CompiledCpf {
                        target: cpf.target.clone(),
                        op: self.compile_expr(&cpf.expr),
                        stop_grad: self.ungradable.contains(&cpf.target),
                    })
                    .collect()
            })
            .collect();

        Ok(CompiledModel {
            model: Arc::clone(model),
            levels,
            reward: self.compile_expr(&model.reward),
        })
    }

    fn compile_expr(&self, e: &Expr) -> OpFn {
        let logic = Arc::clone(&self.logic);
        match e {
            Expr::Const(v) => {
                let v = *v;
                Box::new(move |_, _, _| Ok(Sample::exact(Tensor::scalar(v))))
            }
            Expr::Var(name) => {
                let name = name.clone();
                Box::new(move |subs, _, _| {
                    subs.get(&name)
                        .cloned()
                        .map(Sample::exact)
                        .ok_or_else(|| RuntimeError::UnknownVariable { name: name.clone() })
                })
            }
            Expr::Arith(op, a, b) => {
                let (op, fa, fb) = (*op, self.compile_expr(a), self.compile_expr(b));
                Box::new(move |subs, mp, ks| {
                    let sa = fa(subs, mp, ks)?;
                    let sb = fb(subs, mp, ks)?;
                    let value = match op {
                        ArithOp::Add => sa.value.add(&sb.value)?,
                        ArithOp::Sub => sa.value.sub(&sb.value)?,
                        ArithOp::Mul => sa.value.mul(&sb.value)?,
                        ArithOp::Div => sa.value.div(&sb.value)?,
                        ArithOp::Min => sa.value.zip(&sb.value, f64::min)?,
                        ArithOp::Max => sa.value.zip(&sb.value, f64::max)?,
                    };
                    Ok(Sample {
                        value,
                        out_of_bounds: sa.out_of_bounds || sb.out_of_bounds,
                    })
                })
            }
            Expr::Unary(op, a) => {
                let (op, fa) = (*op, self.compile_expr(a));
                Box::new(move |subs, mp, ks| {
                    let sa = fa(subs, mp, ks)?;
                    let value = match op {
                        UnaryOp::Neg => sa.value.map(|x| -x),
                        UnaryOp::Abs => sa.value.map(f64::abs),
                        UnaryOp::Sqrt => sa.value.map(f64::sqrt),
                        UnaryOp::Exp => sa.value.map(f64::exp),
                        UnaryOp::Ln => sa.value.map(f64::ln),
                        UnaryOp::Sgn | UnaryOp::Floor | UnaryOp::Ceil | UnaryOp::Round => {
                            logic.rounding(op, &sa.value)
                        }
                    };
                    Ok(Sample {
                        value,
                        out_of_bounds: sa.out_of_bounds,
                    })
                })
            }
            Expr::Cmp(op, a, b) => {
                let (op, fa, fb) = (*op, self.compile_expr(a), self.compile_expr(b));
                Box::new(move |subs, mp, ks| {
                    let sa = fa(subs, mp, ks)?;
                    let sb = fb(subs, mp, ks)?;
                    Ok(Sample {
                        value: logic.compare(op, &sa.value, &sb.value, mp)?,
                        out_of_bounds: sa.out_of_bounds || sb.out_of_bounds,
                    })
                })
            }
            Expr::Connective(op, a, b) => {
                let (op, fa, fb) = (*op, self.compile_expr(a), self.compile_expr(b));
                Box::new(move |subs, mp, ks| {
                    let sa = fa(subs, mp, ks)?;
                    let sb = fb(subs, mp, ks)?;
                    Ok(Sample {
                        value: logic.connective(op, &sa.value, &sb.value, mp)?,
                        out_of_bounds: sa.out_of_bounds || sb.out_of_bounds,
                    })
                })
            }
            Expr::Not(a) => {
                let fa = self.compile_expr(a);
                Box::new(move |subs, mp, ks| {
                    let sa = fa(subs, mp, ks)?;
                    Ok(Sample {
                        value: logic.not(&sa.value, mp),
                        out_of_bounds: sa.out_of_bounds,
                    })
                })
            }
            Expr::Aggregate(op, a) => {
                let (op, fa) = (*op, self.compile_expr(a));
                Box::new(move |subs, mp, ks| {
                    let sa = fa(subs, mp, ks)?;
                    Ok(Sample {
                        value: logic.aggregate(op, &sa.value, mp)?,
                        out_of_bounds: sa.out_of_bounds,
                    })
                })
            }
            Expr::Branch { cond, then, orelse } => {
                let fc = self.compile_expr(cond);
                let ft = self.compile_expr(then);
                let fe = self.compile_expr(orelse);
                Box::new(move |subs, mp, ks| {
                    let sc = fc(subs, mp, ks)?;
                    let st = ft(subs, mp, ks)?;
                    let se = fe(subs, mp, ks)?;
                    Ok(Sample {
                        value: logic.branch(&sc.value, &st.value, &se.value, mp)?,
                        out_of_bounds: sc.out_of_bounds || st.out_of_bounds || se.out_of_bounds,
                    })
                })
            }
            Expr::Switch { selector, cases } => {
                let fs = self.compile_expr(selector);
                let fcases: Vec<OpFn> = cases.iter().map(|c| self.compile_expr(c)).collect();
                Box::new(move |subs, mp, ks| {
                    let sel = fs(subs, mp, ks)?;
                    let mut oob = sel.out_of_bounds;
                    let mut values = Vec::with_capacity(fcases.len());
                    for f in &fcases {
                        let s = f(subs, mp, ks)?;
                        oob |= s.out_of_bounds;
                        values.push(s.value);
                    }
                    Ok(Sample {
                        value: logic.switch(&sel.value, &values, mp)?,
                        out_of_bounds: oob,
                    })
                })
            }
            // Exact "pick one value" shortcut: passes through (already real).
            Expr::KronDelta(a) => self.compile_expr(a),
            Expr::Bernoulli(p) => {
                let fp = self.compile_expr(p);
                Box::new(move |subs, mp, ks| {
                    let sp = fp(subs, mp, ks)?;
                    let s = logic.bernoulli(ks.next_key(), &sp.value, mp)?;
                    Ok(Sample {
                        value: s.value,
                        out_of_bounds: sp.out_of_bounds || s.out_of_bounds,
                    })
                })
            }
            Expr::Discrete(ws) => {
                let fws: Vec<OpFn> = ws.iter().map(|w| self.compile_expr(w)).collect();
                Box::new(move |subs, mp, ks| {
                    let mut oob = false;
                    let mut values = Vec::with_capacity(fws.len());
                    for f in &fws {
                        let s = f(subs, mp, ks)?;
                        oob |= s.out_of_bounds;
                        values.push(s.value);
                    }
                    let weights = Tensor::stack_last(&values)?;
                    let s = logic.discrete(ks.next_key(), &weights, mp)?;
                    Ok(Sample {
                        value: s.value,
                        out_of_bounds: oob || s.out_of_bounds,
                    })
                })
            }
            Expr::Normal { mean, std } => {
                let fm = self.compile_expr(mean);
                let fs = self.compile_expr(std);
                Box::new(move |subs, mp, ks| {
                    let sm = fm(subs, mp, ks)?;
                    let ss = fs(subs, mp, ks)?;
                    Ok(Sample {
                        value: normal_sample(ks.next_key(), &sm.value, &ss.value)?,
                        out_of_bounds: sm.out_of_bounds || ss.out_of_bounds,
                    })
                })
            }
            Expr::Uniform { low, high } => {
                let fl = self.compile_expr(low);
                let fh = self.compile_expr(high);
                Box::new(move |subs, mp, ks| {
                    let sl = fl(subs, mp, ks)?;
                    let sh = fh(subs, mp, ks)?;
                    Ok(Sample {
                        value: uniform_sample(ks.next_key(), &sl.value, &sh.value)?,
                        out_of_bounds: sl.out_of_bounds || sh.out_of_bounds,
                    })
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{ExactLogic, SoftLogic};
    use gp_model::{Cpf, VarDecl};
    use gp_runtime::PrngKey;

    fn tiny_model() -> Arc<LiftedModel> {
        let mut m = LiftedModel::default();
        m.insert_var(
            VarDecl::new("x", Role::State, VarKind::Real, &[]),
            Tensor::scalar(1.0),
        );
        m.insert_var(
            VarDecl::new("a", Role::Action, VarKind::Real, &[]),
            Tensor::scalar(0.0),
        );
        m.levels = vec![vec![Cpf::next_state("x", Expr::var("x").add(Expr::var("a")))]];
        m.reward = Expr::var("x'");
        Arc::new(m)
    }

    #[test]
    fn compiles_and_evaluates_a_cpf() {
        let compiled = Compiler::new(Arc::new(ExactLogic)).compile(&tiny_model()).unwrap();
        let mut subs = TensorMap::new();
        subs.insert("x".to_string(), Tensor::scalar(1.0));
        subs.insert("a".to_string(), Tensor::scalar(2.5));
        let mut ks = KeyStream::new(PrngKey::new(0));
        let s = (compiled.levels[0][0].op)(&subs, &ModelParams::default(), &mut ks).unwrap();
        assert_eq!(s.value.item().unwrap(), 3.5);
        assert!(!s.out_of_bounds);
    }

    #[test]
    fn rejects_action_kind_without_surrogate() {
        let mut m = LiftedModel::default();
        m.insert_var(
            VarDecl::new("pick", Role::Action, VarKind::Enumerated, &[]),
            Tensor::scalar(0.0),
        );
        let err = Compiler::new(Arc::new(SoftLogic))
            .compile(&Arc::new(m))
            .err()
            .unwrap();
        assert!(matches!(err, CompileError::UnsupportedActionKind { .. }));
    }

    #[test]
    fn rejects_unknown_ungradable_cpf() {
        let err = Compiler::new(Arc::new(SoftLogic))
            .without_grad(["ghost'".to_string()])
            .compile(&tiny_model())
            .err()
            .unwrap();
        assert!(matches!(err, CompileError::UnknownCpf { .. }));
    }

    #[test]
    fn marks_flagged_cpf_stop_grad() {
        let compiled = Compiler::new(Arc::new(SoftLogic))
            .without_grad(["x'".to_string()])
            .compile(&tiny_model())
            .unwrap();
        assert!(compiled.levels[0][0].stop_grad);
    }
}
