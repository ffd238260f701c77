//! The traversal driver.
//!
//! `do_plan_tree_traverse` runs one named traversal over the tree:
//! pre-order action, recurse left to right, post-order action. Per-type
//! logic lives with its concern (numbering, expression allocation,
//! pruning, px decoration, location constraints, explain), not in one
//! giant switch.

use crate::alloc_expr::AllocExprContext;
use crate::error::Result;
use crate::explain::PlanText;
use crate::numbering::{ExchangeNumberingCtx, NumberingCtx};
use crate::operator::{LogicalPlan, OpId};
use crate::px::{AllocGiCtx, PxPipeBlockingCtx};

/// The closed set of traversals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraverseOp {
    PxPipeBlocking,
    AllocGi,
    AllocExpr,
    OperatorNumbering,
    ExchangeNumbering,
    ProjectPruning,
    GenLocationConstraint,
    PxEstimateSize,
    AllocStartupExpr,
    AllocLink,
    ExplainCollectWidth,
    ExplainWriteBuffer,
    ExplainWriteBufferOutput,
    ExplainWriteBufferOutline,
}

/// Bundled state for every traversal; one instance usually lives for the
/// whole plan-decoration phase.
#[derive(Default)]
pub struct TraverseCtx {
    pub numbering: NumberingCtx,
    pub exchange_numbering: ExchangeNumberingCtx,
    pub alloc_expr: AllocExprContext,
    pub alloc_gi: AllocGiCtx,
    pub pipe_blocking: PxPipeBlockingCtx,
    pub explain: PlanText,
}

impl LogicalPlan {
    pub fn do_plan_tree_traverse(&mut self, op: TraverseOp, ctx: &mut TraverseCtx) -> Result<()> {
        let root = self.root()?;
        self.traverse_rec(root, op, ctx)
    }

    fn traverse_rec(&mut self, id: OpId, op: TraverseOp, ctx: &mut TraverseCtx) -> Result<()> {
        self.do_pre_traverse_operation(id, op, ctx)?;
        // The child list is captured up front: operators inserted above a
        // child during this traversal are not themselves traversed.
        for child in self.op(id).children.clone() {
            self.traverse_rec(child, op, ctx)?;
        }
        self.do_post_traverse_operation(id, op, ctx)
    }

    fn do_pre_traverse_operation(
        &mut self,
        id: OpId,
        op: TraverseOp,
        ctx: &mut TraverseCtx,
    ) -> Result<()> {
        match op {
            TraverseOp::PxPipeBlocking => self.px_pipe_blocking_pre(id),
            TraverseOp::AllocGi => self.alloc_gi_pre(id, &mut ctx.alloc_gi),
            TraverseOp::AllocExpr => self.allocate_expr_pre(id, &mut ctx.alloc_expr),
            TraverseOp::OperatorNumbering => {
                self.numbering_operator_pre(id, &mut ctx.numbering);
                Ok(())
            }
            TraverseOp::ExchangeNumbering => {
                self.numbering_exchange_pre(id, &mut ctx.exchange_numbering)
            }
            TraverseOp::ProjectPruning => self.project_pruning_pre(id),
            TraverseOp::GenLocationConstraint => Ok(()),
            TraverseOp::PxEstimateSize => self.px_estimate_size_pre(id),
            TraverseOp::AllocStartupExpr => Ok(()),
            TraverseOp::AllocLink => Ok(()),
            TraverseOp::ExplainCollectWidth => self.explain_collect_width_pre(id, &mut ctx.explain),
            TraverseOp::ExplainWriteBuffer => self.explain_write_buffer_pre(id, &mut ctx.explain),
            TraverseOp::ExplainWriteBufferOutput => {
                self.explain_write_buffer_output_pre(id, &mut ctx.explain)
            }
            TraverseOp::ExplainWriteBufferOutline => {
                self.explain_write_buffer_outline_pre(id, &mut ctx.explain)
            }
        }
    }

    fn do_post_traverse_operation(
        &mut self,
        id: OpId,
        op: TraverseOp,
        ctx: &mut TraverseCtx,
    ) -> Result<()> {
        match op {
            TraverseOp::PxPipeBlocking => self.px_pipe_blocking_post(id, &mut ctx.pipe_blocking),
            TraverseOp::AllocGi => self.alloc_gi_post(id, &mut ctx.alloc_gi),
            TraverseOp::AllocExpr => self.allocate_expr_post(id, &mut ctx.alloc_expr),
            TraverseOp::OperatorNumbering => {
                self.numbering_operator_post(id, &mut ctx.numbering);
                Ok(())
            }
            TraverseOp::ExchangeNumbering => {
                self.numbering_exchange_post(id, &mut ctx.exchange_numbering)
            }
            TraverseOp::ProjectPruning => self.wrap_const_outputs(id),
            TraverseOp::GenLocationConstraint => self.gen_location_constraint_post(id),
            TraverseOp::PxEstimateSize => self.px_estimate_size_post(id),
            TraverseOp::AllocStartupExpr => self.alloc_startup_expr_post(id),
            TraverseOp::AllocLink => self.alloc_link_post(id),
            TraverseOp::ExplainCollectWidth
            | TraverseOp::ExplainWriteBuffer
            | TraverseOp::ExplainWriteBufferOutput => self.explain_pop_level(id, &mut ctx.explain),
            TraverseOp::ExplainWriteBufferOutline => self.explain_outline_post(id, &mut ctx.explain),
        }
    }
}
