//! Symbolic expression AST for transitions and rewards.
//!
//! Expressions are already lifted and grounded over object tensors: a `Var`
//! denotes a whole tensor, elementwise operators broadcast, and aggregations
//! reduce the trailing axis.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Ln,
    Sgn,
    Floor,
    Ceil,
    Round,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Ge,
    Le,
    Lt,
    Gt,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectiveOp {
    And,
    Or,
    Xor,
    Implies,
    Equiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Sum,
    Prod,
    Min,
    Max,
    Forall,
    Exists,
    Argmin,
    Argmax,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    /// State, action, interm, or non-fluent reference by name.
    Var(String),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Connective(ConnectiveOp, Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// Reduce the trailing axis of the operand.
    Aggregate(AggOp, Box<Expr>),
    Branch {
        cond: Box<Expr>,
        then: Box<Expr>,
        orelse: Box<Expr>,
    },
    /// Select among `cases` by the (real-valued) selector.
    Switch {
        selector: Box<Expr>,
        cases: Vec<Expr>,
    },
    /// Exact "pick one value" shortcut; passes through, cast to real.
    KronDelta(Box<Expr>),
    Bernoulli(Box<Expr>),
    /// Categorical draw over per-category weight tensors; yields the index.
    Discrete(Vec<Expr>),
    Normal {
        mean: Box<Expr>,
        std: Box<Expr>,
    },
    Uniform {
        low: Box<Expr>,
        high: Box<Expr>,
    },
}

impl Expr {
    pub fn var(name: &str) -> Expr {
        Expr::Var(name.to_string())
    }

    pub fn constant(v: f64) -> Expr {
        Expr::Const(v)
    }

    pub fn add(self, rhs: Expr) -> Expr {
        Expr::Arith(ArithOp::Add, Box::new(self), Box::new(rhs))
    }

    pub fn sub(self, rhs: Expr) -> Expr {
        Expr::Arith(ArithOp::Sub, Box::new(self), Box::new(rhs))
    }

    pub fn mul(self, rhs: Expr) -> Expr {
        Expr::Arith(ArithOp::Mul, Box::new(self), Box::new(rhs))
    }

    pub fn min(self, rhs: Expr) -> Expr {
        Expr::Arith(ArithOp::Min, Box::new(self), Box::new(rhs))
    }

    pub fn max(self, rhs: Expr) -> Expr {
        Expr::Arith(ArithOp::Max, Box::new(self), Box::new(rhs))
    }

    pub fn and(self, rhs: Expr) -> Expr {
        Expr::Connective(ConnectiveOp::And, Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Expr) -> Expr {
        Expr::Connective(ConnectiveOp::Or, Box::new(self), Box::new(rhs))
    }

    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn ge(self, rhs: Expr) -> Expr {
        Expr::Cmp(CmpOp::Ge, Box::new(self), Box::new(rhs))
    }

    pub fn gt(self, rhs: Expr) -> Expr {
        Expr::Cmp(CmpOp::Gt, Box::new(self), Box::new(rhs))
    }

    pub fn branch(cond: Expr, then: Expr, orelse: Expr) -> Expr {
        Expr::Branch {
            cond: Box::new(cond),
            then: Box::new(then),
            orelse: Box::new(orelse),
        }
    }

    pub fn sum_over(self) -> Expr {
        Expr::Aggregate(AggOp::Sum, Box::new(self))
    }

    pub fn forall(self) -> Expr {
        Expr::Aggregate(AggOp::Forall, Box::new(self))
    }

    pub fn exists(self) -> Expr {
        Expr::Aggregate(AggOp::Exists, Box::new(self))
    }

    /// Visit every variable name referenced by this expression.
    pub fn visit_vars(&self, f: &mut impl FnMut(&str)) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(name) => f(name),
            Expr::Arith(_, a, b)
            | Expr::Cmp(_, a, b)
            | Expr::Connective(_, a, b) => {
                a.visit_vars(f);
                b.visit_vars(f);
            }
            Expr::Unary(_, a) | Expr::Not(a) | Expr::Aggregate(_, a) | Expr::KronDelta(a) => {
                a.visit_vars(f)
            }
            Expr::Branch { cond, then, orelse } => {
                cond.visit_vars(f);
                then.visit_vars(f);
                orelse.visit_vars(f);
            }
            Expr::Switch { selector, cases } => {
                selector.visit_vars(f);
                for c in cases {
                    c.visit_vars(f);
                }
            }
            Expr::Bernoulli(p) => p.visit_vars(f),
            Expr::Discrete(ws) => {
                for w in ws {
                    w.visit_vars(f);
                }
            }
            Expr::Normal { mean, std } => {
                mean.visit_vars(f);
                std.visit_vars(f);
            }
            Expr::Uniform { low, high } => {
                low.visit_vars(f);
                high.visit_vars(f);
            }
        }
    }
}
