//! Project pruning: drop child outputs nobody upstream references.

use crate::error::Result;
use crate::expr::ExprKind;
use crate::operator::{LogicalPlan, OpId, OpKind};

impl LogicalPlan {
    /// The expressions an operator needs from its children.
    fn output_dependencies(&self, id: OpId) -> Vec<crate::expr::ExprId> {
        let node = self.op(id);
        let mut deps = Vec::new();
        for expr in node
            .op_exprs
            .iter()
            .chain(node.filter_exprs.iter())
            .chain(node.startup_exprs.iter())
            .chain(node.output_exprs.iter())
            .chain(node.op_ordering.iter().map(|o| &o.expr))
        {
            self.exprs.collect_columns(*expr, &mut deps);
            if !deps.contains(expr) {
                deps.push(*expr);
            }
        }
        deps
    }

    /// Pre action of `PROJECT_PRUNING`: trim each child's output to the
    /// positions this operator references.
    ///
    /// Expression values, remote exchange producers and the plan root keep
    /// their outputs verbatim; pseudo columns (`ORA_ROWSCN`) are never
    /// pruned.
    pub(crate) fn project_pruning_pre(&mut self, id: OpId) -> Result<()> {
        let deps = self.output_dependencies(id);
        let children = self.op(id).children.clone();
        for child in children {
            let child_kind = &self.op(child).kind;
            if matches!(child_kind, OpKind::ExprValues { .. })
                || child_kind.is_remote_exchange_producer()
                || self.op(child).is_plan_root
            {
                continue;
            }
            // Table scans and subplan/table lookups prune against the same
            // dependence set; their specialization is which expr list gets
            // trimmed, which for this model is always `output_exprs`.
            let kept: Vec<_> = self
                .op(child)
                .output_exprs
                .iter()
                .copied()
                .filter(|e| {
                    deps.contains(e)
                        || matches!(self.exprs.get(*e).kind, ExprKind::OraRowscn)
                })
                .collect();
            self.op_mut(child).output_exprs = kept;
        }
        Ok(())
    }

    /// After pruning, constant outputs are wrapped in `remove_const` so
    /// executors evaluate them once. A dynamic param crossing an exchange
    /// producer must stay as-is, the datahub rewrites it per worker.
    pub(crate) fn wrap_const_outputs(&mut self, id: OpId) -> Result<()> {
        let is_exchange_producer = self.op(id).kind.is_exchange_producer();
        let output = self.op(id).output_exprs.clone();
        let mut rewritten = Vec::with_capacity(output.len());
        for expr in output {
            let is_const = self.exprs.is_const_literal(expr);
            let has_dyn_param = self.exprs.contains_dyn_param(expr);
            if is_const && !(is_exchange_producer && has_dyn_param) {
                rewritten.push(self.exprs.wrap_remove_const(expr));
            } else {
                rewritten.push(expr);
            }
        }
        self.op_mut(id).output_exprs = rewritten;
        Ok(())
    }
}
