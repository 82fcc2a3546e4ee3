//! gp-model: lifted planning model interface.
//!
//! Variable declarations, the symbolic expression AST, the leveled CPF
//! dependency graph, and grounding of lifted variables to ground names.
//! This is the consumed side of the domain interface: something upstream
//! (a parser, a test fixture) builds a `LiftedModel`; the compiler and the
//! planner only read it.

pub mod expr;
pub mod model;

pub use expr::{AggOp, ArithOp, CmpOp, ConnectiveOp, Expr, UnaryOp};
pub use model::{Cpf, LiftedModel, ModelError, Role, VarDecl, VarKind};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
