//! Logical plan operator tree and the property/decoration traversals.
//!
//! The optimizer (outside this crate) builds a shape-only tree; this crate
//! turns it into an executable annotation: the bottom-up
//! [`property`] chain derives per-operator properties, and the named
//! [`traverse`] passes number operators, allocate expressions and granule
//! iterators, prune projections, derive location constraints and format
//! explain output.

pub mod alloc_expr;
pub mod error;
pub mod explain;
pub mod expr;
pub mod location;
pub mod numbering;
pub mod operator;
pub mod property;
pub mod pruning;
pub mod px;
pub mod traverse;

pub use error::{PlanError, Result};
pub use expr::{BinOp, ConstVal, Expr, ExprArena, ExprId, ExprKind};
pub use operator::{
    ContainsFlags, ExchangeOp, JoinAlgo, JoinType, LogicalOp, LogicalPlan, OpId, OpKind,
    OrderItem, PhyLocationType, PlanType, RelSet, SetOpType, Sharding, ShardingInfo, TableScanOp,
};
pub use property::{CostModel, DefaultCostModel};
pub use traverse::{TraverseCtx, TraverseOp};

#[cfg(test)]
mod tests;
