//! Parallel-execution decoration: pipe blocking, granule iterators, size
//! estimation, startup filters, dblink wrapping.

use crate::error::Result;
use crate::operator::{GranuleIteratorOp, JoinAlgo, LogicalPlan, OpId, OpKind};

/// State of `PX_PIPE_BLOCKING`.
#[derive(Default, Debug)]
pub struct PxPipeBlockingCtx {
    pub materials_added: usize,
}

impl LogicalPlan {
    /// Pre action: nothing to push down in this model; the post pass
    /// re-derives exchange-fed inputs from the subtree.
    pub(crate) fn px_pipe_blocking_pre(&mut self, _id: OpId) -> Result<()> {
        Ok(())
    }

    /// Post action: a multi-child operator with more than one exchange-fed
    /// input can deadlock a fully pipelined px tree; block all but the
    /// first such input with a material.
    pub(crate) fn px_pipe_blocking_post(
        &mut self,
        id: OpId,
        ctx: &mut PxPipeBlockingCtx,
    ) -> Result<()> {
        if self.optimizer.parallel <= 1 {
            return Ok(());
        }
        let children = self.op(id).children.clone();
        if children.len() < 2 {
            return Ok(());
        }
        let exch_fed: Vec<OpId> = children
            .iter()
            .copied()
            .filter(|c| self.subtree_any(*c, &|op| op.kind.is_exchange()))
            .collect();
        if exch_fed.len() < 2 {
            return Ok(());
        }
        for child in exch_fed.into_iter().skip(1) {
            if self.op(child).is_pipelined {
                let material = self.insert_above(child, OpKind::Material);
                self.op_mut(material).is_pipelined = false;
                ctx.materials_added += 1;
                log::debug!("inserted material above {child} to break a px pipe cycle");
            }
        }
        Ok(())
    }
}

/// State of `ALLOC_GI`.
#[derive(Default, Debug)]
pub struct AllocGiCtx {
    pub multi_child_op_count: usize,
    pub gi_added: usize,
}

impl LogicalPlan {
    pub(crate) fn alloc_gi_pre(&mut self, id: OpId, ctx: &mut AllocGiCtx) -> Result<()> {
        if self.op(id).num_children() >= 2 {
            ctx.multi_child_op_count += 1;
        }
        Ok(())
    }

    /// Post action: partitioned scans under px get a granule iterator
    /// above them, inheriting partition-wise and affinity decisions.
    pub(crate) fn alloc_gi_post(&mut self, id: OpId, ctx: &mut AllocGiCtx) -> Result<()> {
        if self.op(id).num_children() >= 2 {
            ctx.multi_child_op_count -= 1;
        }
        let wants_gi = match &self.op(id).kind {
            OpKind::TableScan(scan) => {
                !scan.is_das && scan.partition_cnt > 1 && self.op(id).parallel > 1
            }
            _ => false,
        };
        if !wants_gi {
            return Ok(());
        }
        if let Some(parent) = self.op(id).parent {
            if matches!(self.op(parent).kind, OpKind::GranuleIterator(_)) {
                return Ok(());
            }
        }
        let partition_wise = self.op(id).is_partition_wise;
        // Affinity pins granules to workers when several granule
        // iterators must iterate partitions in lock step.
        let affinitize = partition_wise && ctx.multi_child_op_count > 0;
        let gi = self.insert_above(
            id,
            OpKind::GranuleIterator(GranuleIteratorOp {
                partition_wise,
                affinitize,
            }),
        );
        self.op_mut(gi).is_partition_wise = partition_wise;
        ctx.gi_added += 1;
        Ok(())
    }
}

impl LogicalPlan {
    /// Pre action of `PX_ESTIMATE_SIZE`: push the size factor down,
    /// resetting across exchanges and into the build side of a hash join.
    pub(crate) fn px_estimate_size_pre(&mut self, id: OpId) -> Result<()> {
        let factor = self.op(id).px_est_size_factor;
        let children = self.op(id).children.clone();
        let is_hash_join = matches!(
            self.op(id).kind,
            OpKind::Join {
                algo: JoinAlgo::Hash,
                ..
            }
        );
        for (idx, child) in children.iter().enumerate() {
            let reset = self.op(id).kind.is_exchange() || (is_hash_join && idx == 1);
            self.op_mut(*child).px_est_size_factor = if reset { 1.0 } else { factor };
        }
        Ok(())
    }

    /// Post action: fold the children's factors back into the parent.
    pub(crate) fn px_estimate_size_post(&mut self, id: OpId) -> Result<()> {
        let children = self.op(id).children.clone();
        if children.is_empty() {
            return Ok(());
        }
        let factor = children
            .iter()
            .map(|c| self.op(*c).px_est_size_factor)
            .fold(1.0_f64, f64::max);
        if let OpKind::GranuleIterator(gi) = &self.op(id).kind {
            // Granules subdivide partitions; downstream sizes shrink.
            let parts = if gi.partition_wise { 1.0 } else { 2.0 };
            self.op_mut(id).px_est_size_factor = factor / parts;
        } else if !self.op(id).kind.is_exchange() {
            self.op_mut(id).px_est_size_factor = factor;
        }
        Ok(())
    }

    /// Post action of `ALLOC_STARTUP_EXPR`: hoist child startup filters
    /// unless they depend on ROWNUM or a dynamic param, which must stay
    /// where they were placed.
    pub(crate) fn alloc_startup_expr_post(&mut self, id: OpId) -> Result<()> {
        let children = self.op(id).children.clone();
        let mut lifted = Vec::new();
        for child in children {
            let (keep, lift): (Vec<_>, Vec<_>) = self
                .op(child)
                .startup_exprs
                .clone()
                .into_iter()
                .partition(|e| {
                    self.exprs.contains_rownum(*e) || self.exprs.contains_dyn_param(*e)
                });
            self.op_mut(child).startup_exprs = keep;
            lifted.extend(lift);
        }
        let node = self.op_mut(id);
        for expr in lifted {
            if !node.startup_exprs.contains(&expr) {
                node.startup_exprs.push(expr);
            }
        }
        Ok(())
    }

    /// Post action of `ALLOC_LINK`: an operator whose children all read
    /// the same remote database link executes remotely itself; otherwise
    /// each remote child is wrapped in a link node.
    pub(crate) fn alloc_link_post(&mut self, id: OpId) -> Result<()> {
        let scan_link = match &self.op(id).kind {
            OpKind::TableScan(scan) => Some(scan.dblink_id),
            _ => None,
        };
        if let Some(dblink_id) = scan_link {
            self.op_mut(id).dblink_id = dblink_id;
            return Ok(());
        }
        let children = self.op(id).children.clone();
        if children.is_empty() {
            return Ok(());
        }
        let first = self.op(children[0]).dblink_id;
        let all_same = first.is_some() && children.iter().all(|c| self.op(*c).dblink_id == first);
        if all_same {
            self.op_mut(id).dblink_id = first;
            return Ok(());
        }
        for child in children {
            if self.op(child).dblink_id.is_some()
                && !matches!(self.op(child).kind, OpKind::Link)
            {
                let link = self.insert_above(child, OpKind::Link);
                self.op_mut(link).dblink_id = None;
                log::debug!("wrapped {child} in a link operator");
            }
        }
        Ok(())
    }
}
