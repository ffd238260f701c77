//! Operator and exchange numbering.

use crate::error::Result;
use crate::operator::{LogicalPlan, OpId, OpKind};

/// State of `OPERATOR_NUMBERING`.
#[derive(Default, Debug)]
pub struct NumberingCtx {
    pub num: u32,
    pub post_num: u32,
    pub level: u32,
    pub branch: u32,
    pub next_branch: u32,
}

impl LogicalPlan {
    pub(crate) fn numbering_operator_pre(&mut self, id: OpId, ctx: &mut NumberingCtx) {
        let node = self.op_mut(id);
        node.op_id = Some(ctx.num);
        node.depth = ctx.level;
        node.branch_id = Some(ctx.branch);
        ctx.num += 1;
        ctx.level += 1;
    }

    pub(crate) fn numbering_operator_post(&mut self, id: OpId, ctx: &mut NumberingCtx) {
        ctx.level -= 1;
        self.op_mut(id).post_order_id = Some(ctx.post_num);
        ctx.post_num += 1;
        // Multi-child operators fork execution branches: siblings after
        // this subtree get a fresh branch id.
        if self.op(id).num_children() >= 2 {
            ctx.next_branch += 1;
            ctx.branch = ctx.next_branch;
        }
    }
}

/// State of `EXCHANGE_NUMBERING`: a stack of open parallel-execution
/// scopes and the dfo counter within each.
#[derive(Default, Debug)]
pub struct ExchangeNumberingCtx {
    next_px: u32,
    next_dfo: u32,
    px_stack: Vec<u32>,
}

impl ExchangeNumberingCtx {
    fn current_px(&mut self) -> u32 {
        match self.px_stack.last() {
            Some(px) => *px,
            None => {
                let px = self.next_px;
                self.next_px += 1;
                self.px_stack.push(px);
                px
            }
        }
    }
}

impl LogicalPlan {
    pub(crate) fn numbering_exchange_pre(
        &mut self,
        id: OpId,
        ctx: &mut ExchangeNumberingCtx,
    ) -> Result<()> {
        if let OpKind::Exchange(exch) = &self.op(id).kind {
            if !exch.is_producer && exch.is_rescanable {
                // A rescanable consumer opens a new px scope for its
                // subtree.
                let px = ctx.next_px;
                ctx.next_px += 1;
                ctx.px_stack.push(px);
                self.op_mut(id).px_id = Some(px);
            }
        }
        Ok(())
    }

    pub(crate) fn numbering_exchange_post(
        &mut self,
        id: OpId,
        ctx: &mut ExchangeNumberingCtx,
    ) -> Result<()> {
        let Some(exch) = (match &self.op(id).kind {
            OpKind::Exchange(e) => Some(e.clone()),
            _ => None,
        }) else {
            return Ok(());
        };
        if exch.is_producer {
            let px = ctx.current_px();
            let dfo = ctx.next_dfo;
            ctx.next_dfo += 1;
            let parallel = self.optimizer.parallel.max(1);
            let node = self.op_mut(id);
            node.px_id = Some(px);
            node.dfo_id = Some(dfo);
            // Hints refine the producer's parallelism to the session dop.
            if node.parallel < parallel {
                node.parallel = parallel;
            }
        } else if exch.is_rescanable {
            ctx.px_stack.pop();
        }
        Ok(())
    }
}
