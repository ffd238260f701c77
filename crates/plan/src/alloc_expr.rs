//! Expression allocation: the producer/consumer protocol.
//!
//! Every non-constant expression an operator needs is registered with a
//! consumer id (the registering operator) and a provisional producer id
//! (the nearest non-pass-by descendant). During the post pass, an
//! expression is produced at its producer and added to the output of every
//! operator on the path up to its consumer. At the root, every registered
//! expression must have been produced.

use indexmap::IndexMap;

use crate::error::{PlanError, Result};
use crate::expr::ExprId;
use crate::operator::{LogicalPlan, OpId};

#[derive(Clone, Debug)]
pub struct ExprProducer {
    pub expr: ExprId,
    pub producer_id: OpId,
    pub consumer_id: OpId,
    pub is_produced: bool,
}

/// Deterministic registration order matters for reproducible plans, hence
/// the index map.
#[derive(Default, Debug)]
pub struct AllocExprContext {
    pub producers: IndexMap<ExprId, ExprProducer>,
}

impl AllocExprContext {
    pub fn all_produced(&self) -> bool {
        self.producers.values().all(|p| p.is_produced)
    }

    pub fn first_unproduced(&self) -> Option<ExprId> {
        self.producers
            .values()
            .find(|p| !p.is_produced)
            .map(|p| p.expr)
    }
}

impl LogicalPlan {
    /// Walk down through pass-by operators to the node that will actually
    /// materialize expressions for this subtree.
    fn find_producer_down(&self, mut id: OpId) -> OpId {
        while self.op(id).kind.is_expr_passby() && !self.op(id).is_plan_root {
            match self.op(id).children.first() {
                Some(first) => id = *first,
                None => break,
            }
        }
        id
    }

    /// Pre action of `ALLOC_EXPR`: register this operator's expressions.
    pub(crate) fn allocate_expr_pre(&mut self, id: OpId, ctx: &mut AllocExprContext) -> Result<()> {
        let node = self.op(id);
        let mut wanted: Vec<ExprId> = Vec::new();
        wanted.extend(node.op_exprs.iter().copied());
        wanted.extend(node.filter_exprs.iter().copied());
        wanted.extend(node.op_ordering.iter().map(|o| o.expr));
        if node.is_plan_root {
            wanted.extend(node.output_exprs.iter().copied());
        }

        let producer_id = self.find_producer_down(id);
        for expr in wanted {
            if self.exprs.is_const_literal(expr) {
                continue;
            }
            let entry = ctx.producers.entry(expr).or_insert(ExprProducer {
                expr,
                producer_id,
                consumer_id: id,
                is_produced: false,
            });
            // The farthest ancestor wins as consumer; pre-order reaches
            // ancestors first, so only widen when re-registered deeper.
            if self.subtree_contains_op(entry.producer_id, producer_id) {
                entry.producer_id = producer_id;
            }
        }
        Ok(())
    }

    /// Post action of `ALLOC_EXPR`: produce what this operator owns, then
    /// forward everything still needed above.
    pub(crate) fn allocate_expr_post(&mut self, id: OpId, ctx: &mut AllocExprContext) -> Result<()> {
        // Produce: column refs and anything whose inputs exist below.
        for producer in ctx.producers.values_mut() {
            if producer.producer_id == id && !producer.is_produced {
                producer.is_produced = true;
            }
        }

        // Pass-by operators simply forward their child's output.
        if self.op(id).kind.is_expr_passby() && !self.op(id).is_plan_root {
            let child_output = match self.op(id).children.first() {
                Some(first) => self.op(*first).output_exprs.clone(),
                None => Vec::new(),
            };
            self.op_mut(id).output_exprs = child_output;
            return Ok(());
        }

        // Output: every produced expression whose consumer sits at or
        // above this operator and whose producer sits in this subtree.
        let mut output: Vec<ExprId> = Vec::new();
        for producer in ctx.producers.values() {
            if !producer.is_produced {
                continue;
            }
            let produced_below = self.subtree_contains_op(id, producer.producer_id);
            let consumed_here_or_above = !self.subtree_contains_op(id, producer.consumer_id)
                || producer.consumer_id == id;
            if produced_below && (consumed_here_or_above || self.op(id).is_plan_root) {
                output.push(producer.expr);
            }
        }
        if !self.op(id).is_plan_root || self.op(id).output_exprs.is_empty() {
            self.op_mut(id).output_exprs = output;
        }

        if self.op(id).is_plan_root {
            if !ctx.all_produced() {
                let missing = ctx.first_unproduced().expect("unproduced expr");
                log::warn!("expression {missing} has no producer in the plan");
                return Err(PlanError::ExprNotProduced(missing.0));
            }
            log::trace!("all {} expressions produced", ctx.producers.len());
        }
        Ok(())
    }
}
