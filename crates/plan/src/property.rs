//! Property derivation: the bottom-up `compute_property` chain.
//!
//! Every derived field of an operator is recomputed from scratch here, so
//! running the chain twice over the same tree is idempotent.

use itertools::Itertools;

use crate::error::Result;
use crate::expr::build_equal_sets;
use crate::operator::{
    AggAlgo, ContainsFlags, JoinAlgo, LogicalPlan, OpId, OpKind, PlanType, RelSet,
};

/// The external cost model. Estimation happens per node with the
/// children's stats already final.
pub trait CostModel {
    fn est_card(&self, plan: &LogicalPlan, op: OpId) -> f64;
    fn est_cost(&self, plan: &LogicalPlan, op: OpId) -> f64;
}

/// Textbook constants; the real model lives outside this crate.
pub struct DefaultCostModel;

impl DefaultCostModel {
    const ROW_COST: f64 = 0.1;
    const DEFAULT_SCAN_ROWS: f64 = 1000.0;
    const JOIN_SELECTIVITY: f64 = 0.1;
}

impl CostModel for DefaultCostModel {
    fn est_card(&self, plan: &LogicalPlan, op: OpId) -> f64 {
        let node = plan.op(op);
        let child_card = |i: usize| plan.op(node.children[i]).card;
        match &node.kind {
            OpKind::TableScan(_) => Self::DEFAULT_SCAN_ROWS,
            OpKind::ExprValues { row_cnt } => *row_cnt as f64,
            OpKind::Join { .. } => {
                (child_card(0) * child_card(1) * Self::JOIN_SELECTIVITY).max(1.0)
            }
            OpKind::GroupBy { .. } => (child_card(0) * 0.5).max(1.0),
            OpKind::Limit | OpKind::Count => child_card(0).min(100.0),
            OpKind::Set { .. } => node.children.iter().map(|c| plan.op(*c).card).sum(),
            _ if !node.children.is_empty() => child_card(0),
            _ => 1.0,
        }
    }

    fn est_cost(&self, plan: &LogicalPlan, op: OpId) -> f64 {
        let node = plan.op(op);
        let children_cost: f64 = node.children.iter().map(|c| plan.op(*c).cost).sum();
        let own = match &node.kind {
            OpKind::Sort { .. } => {
                let card = node.card.max(1.0);
                card * card.log2().max(1.0) * Self::ROW_COST
            }
            OpKind::Join { algo, .. } => {
                let build = plan.op(node.children[0]).card;
                let probe = plan.op(node.children[1]).card;
                match algo {
                    JoinAlgo::Hash => (build + probe) * Self::ROW_COST,
                    JoinAlgo::Merge => (build + probe) * Self::ROW_COST * 1.2,
                    JoinAlgo::NestedLoop => build * probe * Self::ROW_COST,
                }
            }
            _ => node.card * Self::ROW_COST,
        };
        children_cost + own
    }
}

impl LogicalPlan {
    /// Run the full property chain over every node, bottom-up.
    pub fn compute_all_properties(&mut self, model: &dyn CostModel) -> Result<()> {
        let root = self.root()?;
        let mut failed = None;
        self.for_each_post_order(root, &mut |plan, id| {
            if failed.is_none() {
                if let Err(e) = plan.compute_property(id, model) {
                    failed = Some(e);
                }
            }
        });
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The per-node chain, in the canonical order. Children must already
    /// be final.
    pub fn compute_property(&mut self, id: OpId, model: &dyn CostModel) -> Result<()> {
        self.compute_const_exprs(id);
        self.compute_equal_set(id);
        self.compute_fd_item_set(id);
        self.compute_table_set(id);
        self.compute_one_row_info(id);
        self.compute_pipeline_info(id);
        self.compute_sharding_info(id);
        self.compute_plan_type(id);
        self.compute_op_other_info(id);
        self.compute_op_ordering(id);
        self.compute_op_parallel_and_server_info(id);
        self.est_width(id);
        self.est_cost(id, model);
        Ok(())
    }

    /// Union the children's constant outputs; an equality filter pinning
    /// an expression to a constant adds the other side.
    fn compute_const_exprs(&mut self, id: OpId) {
        let mut consts: Vec<_> = self
            .op(id)
            .children
            .iter()
            .flat_map(|c| self.op(*c).output_const_exprs.iter().copied())
            .sorted()
            .dedup()
            .collect();

        for filter in self.op(id).filter_exprs.clone() {
            let Some((lhs, rhs)) = self.exprs.as_equality(filter) else {
                continue;
            };
            let lhs_const = self.exprs.is_const_literal(lhs) || consts.contains(&lhs);
            let rhs_const = self.exprs.is_const_literal(rhs) || consts.contains(&rhs);
            if lhs_const && !rhs_const && !consts.contains(&rhs) {
                consts.push(rhs);
            } else if rhs_const && !lhs_const && !consts.contains(&lhs) {
                consts.push(lhs);
            }
        }
        consts.sort();
        self.op_mut(id).output_const_exprs = consts;
    }

    /// No filters: inherit the first child's equal sets. Otherwise run
    /// equivalence analysis over children's sets plus the filters.
    fn compute_equal_set(&mut self, id: OpId) {
        let node = self.op(id);
        let seed: Vec<Vec<_>> = node
            .children
            .iter()
            .flat_map(|c| self.op(*c).equal_sets.iter().cloned())
            .collect();
        let filters = node.filter_exprs.clone();
        let equal_sets = if filters.is_empty() {
            match node.children.first() {
                Some(first) => self.op(*first).equal_sets.clone(),
                None => Vec::new(),
            }
        } else {
            let pairs: Vec<_> = filters
                .iter()
                .filter_map(|f| self.exprs.as_equality(*f))
                .collect();
            build_equal_sets(&seed, &pairs)
        };
        self.op_mut(id).equal_sets = equal_sets;
    }

    /// Inherit from the first child; leaves start empty (a scan's key
    /// dependencies come from the optimizer above this layer).
    fn compute_fd_item_set(&mut self, id: OpId) {
        let fd = match self.op(id).children.first() {
            Some(first) => self.op(*first).fd_item_set.clone(),
            None => Vec::new(),
        };
        self.op_mut(id).fd_item_set = fd;
    }

    /// Single-child operators and subplan filters expose only the first
    /// child's relations; the right side of a subplan filter is internal.
    fn compute_table_set(&mut self, id: OpId) {
        let node = self.op(id);
        let table_set = match &node.kind {
            OpKind::TableScan(scan) => RelSet::single(scan.rel),
            OpKind::SubplanFilter => match node.children.first() {
                Some(first) => self.op(*first).table_set,
                None => RelSet::default(),
            },
            _ if node.children.len() == 1 => self.op(node.children[0]).table_set,
            _ => node
                .children
                .iter()
                .fold(RelSet::default(), |acc, c| acc.union(self.op(*c).table_set)),
        };
        self.op_mut(id).table_set = table_set;
    }

    /// At most one row iff every child is.
    fn compute_one_row_info(&mut self, id: OpId) {
        let node = self.op(id);
        let one_row = match &node.kind {
            OpKind::ExprValues { row_cnt } => *row_cnt <= 1,
            _ if node.children.is_empty() => node.at_most_one_row,
            _ => node
                .children
                .iter()
                .all(|c| self.op(*c).at_most_one_row),
        };
        self.op_mut(id).at_most_one_row = one_row;
    }

    /// Pipelined iff not a blocking operator and every child is pipelined.
    fn compute_pipeline_info(&mut self, id: OpId) {
        let node = self.op(id);
        let pipelined = !node.kind.is_block_op()
            && node.children.iter().all(|c| self.op(*c).is_pipelined);
        self.op_mut(id).is_pipelined = pipelined;
    }

    /// Inherit the first child's strong/weak sharding. Leaves keep what
    /// the optimizer assigned; exchanges install their own.
    fn compute_sharding_info(&mut self, id: OpId) {
        let node = self.op(id);
        if node.kind.is_exchange() || node.children.is_empty() {
            return;
        }
        let first = node.children[0];
        let sharding = self.op(first).sharding.clone();
        self.op_mut(id).sharding = sharding;
    }

    /// LOCAL/REMOTE/DISTRIBUTED from our sharding; any exchange below
    /// promotes to DISTRIBUTED; UNCERTAIN propagates.
    fn compute_plan_type(&mut self, id: OpId) {
        let node = self.op(id);
        let child_uncertain = node
            .children
            .iter()
            .any(|c| self.op(*c).plan_type == PlanType::Uncertain);
        let exchange_below = node.kind.is_exchange()
            || node.children.iter().any(|c| self.op(*c).exchange_allocated);
        let plan_type = if child_uncertain && !node.children.is_empty() {
            PlanType::Uncertain
        } else if exchange_below {
            PlanType::Distributed
        } else {
            node.sharding.plan_type()
        };
        let node = self.op_mut(id);
        node.plan_type = plan_type;
        node.exchange_allocated = exchange_below;
    }

    /// OR-fold of containment flags, with the per-type exceptions.
    fn compute_op_other_info(&mut self, id: OpId) {
        let node = self.op(id);
        let mut contains = node
            .children
            .iter()
            .fold(ContainsFlags::default(), |acc, c| acc | self.op(*c).contains);
        match &node.kind {
            // A recursive union consumes its own fake CTE; containment
            // stops here.
            OpKind::Set {
                is_recursive: true, ..
            } => {
                contains -= ContainsFlags::FAKE_CTE;
            }
            OpKind::TableScan(scan) => {
                if scan.is_fake_cte {
                    contains |= ContainsFlags::FAKE_CTE;
                }
                if scan.is_das {
                    contains |= ContainsFlags::DAS;
                }
            }
            OpKind::GroupBy { algo: AggAlgo::Merge } if node.is_partition_wise => {
                contains |= ContainsFlags::PW_MERGE;
            }
            _ => {}
        }
        self.op_mut(id).contains = contains;
    }

    /// Inherit the first child's sort keys; a sort installs its own.
    fn compute_op_ordering(&mut self, id: OpId) {
        let node = self.op(id);
        let (ordering, local, range) = match &node.kind {
            OpKind::Sort { sort_keys } => (sort_keys.clone(), false, false),
            _ => match node.children.first() {
                Some(first) => {
                    let child = self.op(*first);
                    (
                        child.op_ordering.clone(),
                        child.is_local_order,
                        child.is_range_order,
                    )
                }
                None => (node.op_ordering.clone(), node.is_local_order, node.is_range_order),
            },
        };
        let node = self.op_mut(id);
        node.op_ordering = ordering;
        node.is_local_order = local;
        node.is_range_order = range;
    }

    /// Parallel degree from the first non-exchange child; every exchange
    /// child is refined to the chosen dop.
    fn compute_op_parallel_and_server_info(&mut self, id: OpId) {
        let node = self.op(id);
        if node.children.is_empty() {
            return;
        }
        let chosen = node
            .children
            .iter()
            .find(|c| !self.op(**c).kind.is_exchange())
            .or(node.children.first())
            .map(|c| (self.op(*c).parallel, self.op(*c).server_cnt))
            .unwrap_or((1, 1));
        let children = node.children.clone();
        let node = self.op_mut(id);
        node.parallel = chosen.0;
        node.server_cnt = chosen.1;
        for child in children {
            if self.op(child).kind.is_exchange() {
                self.op_mut(child).parallel = chosen.0;
            }
        }
    }

    fn est_width(&mut self, id: OpId) {
        let width: f64 = self
            .op(id)
            .output_exprs
            .iter()
            .map(|e| self.exprs.width_of(*e))
            .sum();
        let width = if width == 0.0 {
            match self.op(id).children.first() {
                Some(first) => self.op(*first).width,
                None => 8.0,
            }
        } else {
            width
        };
        self.op_mut(id).width = width;
    }

    fn est_cost(&mut self, id: OpId, model: &dyn CostModel) {
        let card = model.est_card(self, id);
        self.op_mut(id).card = card;
        let cost = model.est_cost(self, id);
        self.op_mut(id).cost = cost;
    }
}
