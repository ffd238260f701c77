//! The logical operator tree.
//!
//! Operators live in an arena indexed by [`OpId`]; children own their
//! position in the parent's child list and the parent back-pointer is a
//! plain id, so destruction and mutation stay trivially safe. Traversals
//! are strictly top-down and never follow `parent` during recursion.

use std::fmt;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::error::{PlanError, Result};
use crate::expr::{EqualSets, ExprArena, ExprId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u32);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlanType {
    #[default]
    Uncertain,
    Local,
    Remote,
    Distributed,
}

/// Physical distribution of an operator's output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Sharding {
    #[default]
    Local,
    Remote,
    Distributed {
        part_exprs: Vec<ExprId>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardingInfo {
    pub strong: Option<Sharding>,
    pub weak: Option<Sharding>,
}

impl ShardingInfo {
    pub fn local() -> Self {
        Self {
            strong: Some(Sharding::Local),
            weak: None,
        }
    }

    pub fn distributed(part_exprs: Vec<ExprId>) -> Self {
        Self {
            strong: Some(Sharding::Distributed { part_exprs }),
            weak: None,
        }
    }

    pub fn plan_type(&self) -> PlanType {
        match &self.strong {
            Some(Sharding::Local) => PlanType::Local,
            Some(Sharding::Remote) => PlanType::Remote,
            Some(Sharding::Distributed { .. }) => PlanType::Distributed,
            None => PlanType::Uncertain,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderItem {
    pub expr: ExprId,
    pub asc: bool,
}

impl OrderItem {
    pub fn asc(expr: ExprId) -> Self {
        Self { expr, asc: true }
    }
}

/// One functional dependency: the determinant column set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FdItem {
    pub determinants: Vec<ExprId>,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ContainsFlags: u32 {
        const FAKE_CTE = 1 << 0;
        const PW_MERGE = 1 << 1;
        const DAS = 1 << 2;
        const MATCH_ALL_FAKE_CTE = 1 << 3;
    }
}

/// Bitset of relation ids referenced by a subtree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelSet(pub u64);

impl RelSet {
    pub fn single(rel: u32) -> Self {
        Self(1u64 << rel)
    }

    pub fn union(self, other: RelSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, rel: u32) -> bool {
        self.0 & (1u64 << rel) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    Semi,
    Anti,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinAlgo {
    NestedLoop,
    Hash,
    Merge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggAlgo {
    Hash,
    Merge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOpType {
    UnionAll,
    UnionDistinct,
    Intersect,
    Except,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhyLocationType {
    Local,
    Remote,
    Distributed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableScanOp {
    pub table_id: u64,
    pub ref_id: u64,
    pub rel: u32,
    pub table_name: String,
    pub location: PhyLocationType,
    pub partition_cnt: usize,
    pub is_das: bool,
    pub is_fake_cte: bool,
    pub dblink_id: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeOp {
    pub is_producer: bool,
    pub is_remote: bool,
    pub is_rescanable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmlTargetOp {
    pub table_id: u64,
    pub ref_id: u64,
    pub location: PhyLocationType,
    pub partition_cnt: usize,
    /// Index-maintenance writes under PDML also contribute location
    /// constraints.
    pub is_index_maintenance: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GranuleIteratorOp {
    pub partition_wise: bool,
    pub affinitize: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    TableScan(TableScanOp),
    Join {
        join_type: JoinType,
        algo: JoinAlgo,
    },
    GroupBy {
        algo: AggAlgo,
    },
    Exchange(ExchangeOp),
    Sort {
        sort_keys: Vec<OrderItem>,
    },
    Limit,
    SubplanFilter,
    Insert(DmlTargetOp),
    Update(DmlTargetOp),
    Delete(DmlTargetOp),
    Merge(DmlTargetOp),
    Set {
        set_type: SetOpType,
        is_recursive: bool,
    },
    WindowFunction,
    Count,
    Material,
    GranuleIterator(GranuleIteratorOp),
    JoinFilter,
    TempTableInsert,
    TempTableAccess,
    TempTableTransformation,
    ExprValues {
        row_cnt: usize,
    },
    FunctionTable,
    Link,
    MonitoringDump,
    Unpivot,
    ErrLog,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::TableScan(_) => "TABLE SCAN",
            OpKind::Join { .. } => "JOIN",
            OpKind::GroupBy { .. } => "GROUP BY",
            OpKind::Exchange(e) => {
                if e.is_producer {
                    "EXCHANGE OUT"
                } else {
                    "EXCHANGE IN"
                }
            }
            OpKind::Sort { .. } => "SORT",
            OpKind::Limit => "LIMIT",
            OpKind::SubplanFilter => "SUBPLAN FILTER",
            OpKind::Insert(_) => "INSERT",
            OpKind::Update(_) => "UPDATE",
            OpKind::Delete(_) => "DELETE",
            OpKind::Merge(_) => "MERGE",
            OpKind::Set { .. } => "SET",
            OpKind::WindowFunction => "WINDOW FUNCTION",
            OpKind::Count => "COUNT",
            OpKind::Material => "MATERIAL",
            OpKind::GranuleIterator(_) => "PX GRANULE ITERATOR",
            OpKind::JoinFilter => "JOIN FILTER",
            OpKind::TempTableInsert => "TEMP TABLE INSERT",
            OpKind::TempTableAccess => "TEMP TABLE ACCESS",
            OpKind::TempTableTransformation => "TEMP TABLE TRANSFORMATION",
            OpKind::ExprValues { .. } => "EXPRESSION",
            OpKind::FunctionTable => "FUNCTION TABLE",
            OpKind::Link => "LINK",
            OpKind::MonitoringDump => "MONITORING DUMP",
            OpKind::Unpivot => "UNPIVOT",
            OpKind::ErrLog => "ERROR LOGGING",
        }
    }

    /// Operators that materialize their input before producing output.
    pub fn is_block_op(&self) -> bool {
        matches!(
            self,
            OpKind::Sort { .. }
                | OpKind::Material
                | OpKind::WindowFunction
                | OpKind::GroupBy { algo: AggAlgo::Hash }
                | OpKind::Set {
                    set_type: SetOpType::UnionDistinct | SetOpType::Intersect | SetOpType::Except,
                    ..
                }
        )
    }

    /// Operators that only forward their child's expressions: expression
    /// allocation looks through them for the real producer.
    pub fn is_expr_passby(&self) -> bool {
        matches!(
            self,
            OpKind::GranuleIterator(_)
                | OpKind::MonitoringDump
                | OpKind::JoinFilter
                | OpKind::Material
        )
    }

    pub fn is_exchange(&self) -> bool {
        matches!(self, OpKind::Exchange(_))
    }

    pub fn is_exchange_producer(&self) -> bool {
        matches!(self, OpKind::Exchange(e) if e.is_producer)
    }

    pub fn is_remote_exchange_producer(&self) -> bool {
        matches!(self, OpKind::Exchange(e) if e.is_producer && e.is_remote)
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            OpKind::Insert(_) | OpKind::Update(_) | OpKind::Delete(_) | OpKind::Merge(_)
        )
    }
}

/// One node of the plan tree, with every derived property in line.
///
/// Each property field has exactly one source: either copied from the
/// child designated by the per-type rules, or computed from local data by
/// the owning post-traversal.
#[derive(Clone, Debug)]
pub struct LogicalOp {
    pub kind: OpKind,
    pub children: SmallVec<[OpId; 2]>,
    pub parent: Option<OpId>,

    pub output_exprs: Vec<ExprId>,
    pub filter_exprs: Vec<ExprId>,
    pub startup_exprs: Vec<ExprId>,
    /// Expressions this operator itself evaluates.
    pub op_exprs: Vec<ExprId>,
    pub output_const_exprs: Vec<ExprId>,
    pub equal_sets: EqualSets,
    pub fd_item_set: Vec<FdItem>,
    pub table_set: RelSet,

    pub op_ordering: Vec<OrderItem>,
    pub is_local_order: bool,
    pub is_range_order: bool,

    pub sharding: ShardingInfo,
    pub plan_type: PlanType,
    pub is_partition_wise: bool,
    pub is_pipelined: bool,
    pub at_most_one_row: bool,
    pub exchange_allocated: bool,

    pub card: f64,
    pub cost: f64,
    pub width: f64,
    pub parallel: usize,
    pub server_cnt: usize,

    pub op_id: Option<u32>,
    pub post_order_id: Option<u32>,
    pub branch_id: Option<u32>,
    pub depth: u32,
    pub px_id: Option<u32>,
    pub dfo_id: Option<u32>,

    pub contains: ContainsFlags,
    pub px_est_size_factor: f64,
    pub is_plan_root: bool,

    pub strict_pwj_constraint: Vec<usize>,
    pub non_strict_pwj_constraint: Vec<usize>,
    pub dblink_id: Option<u64>,
}

impl LogicalOp {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            children: SmallVec::new(),
            parent: None,
            output_exprs: Vec::new(),
            filter_exprs: Vec::new(),
            startup_exprs: Vec::new(),
            op_exprs: Vec::new(),
            output_const_exprs: Vec::new(),
            equal_sets: Vec::new(),
            fd_item_set: Vec::new(),
            table_set: RelSet::default(),
            op_ordering: Vec::new(),
            is_local_order: false,
            is_range_order: false,
            sharding: ShardingInfo::default(),
            plan_type: PlanType::Uncertain,
            is_partition_wise: false,
            is_pipelined: true,
            at_most_one_row: false,
            exchange_allocated: false,
            card: 0.0,
            cost: 0.0,
            width: 0.0,
            parallel: 1,
            server_cnt: 1,
            op_id: None,
            post_order_id: None,
            branch_id: None,
            depth: 0,
            px_id: None,
            dfo_id: None,
            contains: ContainsFlags::default(),
            px_est_size_factor: 1.0,
            is_plan_root: false,
            strict_pwj_constraint: Vec::new(),
            non_strict_pwj_constraint: Vec::new(),
            dblink_id: None,
        }
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }
}

/// Plan-wide context the traversals feed (location constraints,
/// partition-wise join groups, the configured parallelism).
#[derive(Clone, Debug, Default)]
pub struct OptimizerCtx {
    pub parallel: usize,
    pub location_constraints: Vec<crate::location::LocationConstraint>,
    pub strict_pwj_groups: Vec<Vec<usize>>,
    pub non_strict_pwj_groups: Vec<Vec<usize>>,
}

pub struct LogicalPlan {
    pub exprs: ExprArena,
    pub optimizer: OptimizerCtx,
    ops: Vec<LogicalOp>,
    root: Option<OpId>,
}

impl LogicalPlan {
    pub fn new(parallel: usize) -> Self {
        Self {
            exprs: ExprArena::new(),
            optimizer: OptimizerCtx {
                parallel,
                ..Default::default()
            },
            ops: Vec::new(),
            root: None,
        }
    }

    pub fn add_op(&mut self, kind: OpKind, children: &[OpId]) -> OpId {
        let id = OpId(self.ops.len() as u32);
        let mut op = LogicalOp::new(kind);
        op.children = SmallVec::from_slice(children);
        self.ops.push(op);
        for child in children {
            self.ops[child.0 as usize].parent = Some(id);
        }
        id
    }

    pub fn set_root(&mut self, root: OpId) {
        if let Some(old) = self.root {
            self.ops[old.0 as usize].is_plan_root = false;
        }
        self.root = Some(root);
        self.ops[root.0 as usize].is_plan_root = true;
    }

    pub fn root(&self) -> Result<OpId> {
        self.root.ok_or(PlanError::NoRoot)
    }

    pub fn op(&self, id: OpId) -> &LogicalOp {
        &self.ops[id.0 as usize]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut LogicalOp {
        &mut self.ops[id.0 as usize]
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn child(&self, id: OpId, idx: usize) -> Result<OpId> {
        self.op(id)
            .children
            .get(idx)
            .copied()
            .ok_or(PlanError::MissingChild(id, idx))
    }

    pub fn first_child(&self, id: OpId) -> Result<OpId> {
        self.child(id, 0)
    }

    /// Insert a fresh operator between `child` and its parent (or above
    /// the root). Returns the new operator's id.
    pub fn insert_above(&mut self, child: OpId, kind: OpKind) -> OpId {
        let parent = self.op(child).parent;
        let new_id = OpId(self.ops.len() as u32);
        let mut op = LogicalOp::new(kind);
        op.children = SmallVec::from_slice(&[child]);
        op.parent = parent;
        // The wrapper starts with its child's derived properties so a
        // later compute pass has something coherent to refine.
        let child_op = self.op(child);
        op.output_exprs = child_op.output_exprs.clone();
        op.table_set = child_op.table_set;
        op.card = child_op.card;
        op.width = child_op.width;
        op.parallel = child_op.parallel;
        op.sharding = child_op.sharding.clone();
        self.ops.push(op);

        self.ops[child.0 as usize].parent = Some(new_id);
        match parent {
            Some(parent) => {
                let slot = self.ops[parent.0 as usize]
                    .children
                    .iter()
                    .position(|c| *c == child)
                    .expect("child missing from its parent");
                self.ops[parent.0 as usize].children[slot] = new_id;
            }
            None => {
                if self.root == Some(child) {
                    self.ops[child.0 as usize].is_plan_root = false;
                    self.root = Some(new_id);
                    self.ops[new_id.0 as usize].is_plan_root = true;
                }
            }
        }
        new_id
    }

    /// Whether any operator in the subtree matches `pred`.
    pub fn subtree_any(&self, id: OpId, pred: &impl Fn(&LogicalOp) -> bool) -> bool {
        if pred(self.op(id)) {
            return true;
        }
        self.op(id)
            .children
            .iter()
            .any(|c| self.subtree_any(*c, pred))
    }

    pub fn subtree_contains_op(&self, root: OpId, target: OpId) -> bool {
        if root == target {
            return true;
        }
        self.op(root)
            .children
            .iter()
            .any(|c| self.subtree_contains_op(*c, target))
    }

    /// Post-order visit of the subtree under `id`.
    pub fn for_each_post_order(&mut self, id: OpId, f: &mut impl FnMut(&mut LogicalPlan, OpId)) {
        for child in self.op(id).children.clone() {
            self.for_each_post_order(child, f);
        }
        f(self, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn insert_above_rewires_parent_and_root() {
        let mut plan = LogicalPlan::new(1);
        let scan = plan.add_op(
            OpKind::TableScan(TableScanOp {
                table_id: 1,
                ref_id: 1,
                rel: 0,
                table_name: "t1".into(),
                location: PhyLocationType::Local,
                partition_cnt: 1,
                is_das: false,
                is_fake_cte: false,
                dblink_id: None,
            }),
            &[],
        );
        let limit = plan.add_op(OpKind::Limit, &[scan]);
        plan.set_root(limit);

        let material = plan.insert_above(scan, OpKind::Material);
        assert_eq!(plan.op(limit).children[0], material);
        assert_eq!(plan.op(material).children[0], scan);
        assert_eq!(plan.op(scan).parent, Some(material));
        assert_eq!(plan.root().unwrap(), limit);

        let new_root = plan.insert_above(limit, OpKind::Count);
        assert_eq!(plan.root().unwrap(), new_root);
        assert!(plan.op(new_root).is_plan_root);
        assert!(!plan.op(limit).is_plan_root);
    }
}
