//! Query language: expressions, binding, joins, and per-cell evaluation.

pub mod eval;
pub mod expr;
pub mod join;
pub mod plan;

pub use eval::evaluate;
pub use expr::{Expr, MAX_EXPRESSION_DEPTH};
pub use join::{JoinMap, in_array, table_join};
pub use plan::{BoundCatalog, BoundExpr, JoinType, OutputColumn, Query, QueryPlan, Symbol};
