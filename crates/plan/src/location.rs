//! Location-constraint derivation for partition-wise join analysis.

use bitflags::bitflags;

use crate::error::Result;
use crate::operator::{LogicalPlan, OpId, OpKind, PhyLocationType, SetOpType};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LocationConstraintFlags: u32 {
        /// The base table is a duplicate table readable on any server.
        const DUPLICATE = 1 << 0;
        /// Partitions are accessed through a single granule.
        const SINGLE_PART = 1 << 1;
    }
}

/// One base-table access the executor must co-locate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocationConstraint {
    pub table_id: u64,
    pub ref_id: u64,
    pub phy_location_type: PhyLocationType,
    pub partition_cnt: usize,
    pub flags: LocationConstraintFlags,
}

impl LogicalPlan {
    /// Post action of `GEN_LOCATION_CONSTRAINT`.
    ///
    /// Base-table operators register a constraint and remember its index;
    /// single-child operators pass their child's lists through; multi-child
    /// operators combine them (union-all set ops OR the non-strict lists,
    /// everything else appends the strict lists) and register the combined
    /// list as a new partition-wise-join group when more than one child
    /// contributed.
    pub(crate) fn gen_location_constraint_post(&mut self, id: OpId) -> Result<()> {
        let constraint = match &self.op(id).kind {
            OpKind::TableScan(scan) => Some(LocationConstraint {
                table_id: scan.table_id,
                ref_id: scan.ref_id,
                phy_location_type: scan.location,
                partition_cnt: scan.partition_cnt,
                flags: LocationConstraintFlags::default(),
            }),
            OpKind::Insert(dml) | OpKind::Update(dml) | OpKind::Delete(dml)
            | OpKind::Merge(dml)
                if matches!(self.op(id).kind, OpKind::Insert(_)) || dml.is_index_maintenance =>
            {
                Some(LocationConstraint {
                    table_id: dml.table_id,
                    ref_id: dml.ref_id,
                    phy_location_type: dml.location,
                    partition_cnt: dml.partition_cnt,
                    flags: LocationConstraintFlags::default(),
                })
            }
            _ => None,
        };

        let mut strict: Vec<usize> = Vec::new();
        let mut non_strict: Vec<usize> = Vec::new();
        let children = self.op(id).children.clone();
        let mut contributing_children = 0usize;
        for child in &children {
            let child_op = self.op(*child);
            if child_op.strict_pwj_constraint.is_empty()
                && child_op.non_strict_pwj_constraint.is_empty()
            {
                continue;
            }
            contributing_children += 1;
            strict.extend(child_op.strict_pwj_constraint.iter().copied());
            non_strict.extend(child_op.non_strict_pwj_constraint.iter().copied());
        }

        if let Some(constraint) = constraint {
            let idx = self.optimizer.location_constraints.len();
            self.optimizer.location_constraints.push(constraint);
            strict.push(idx);
            non_strict.push(idx);
        }

        if contributing_children > 1 {
            let is_union_all = matches!(
                self.op(id).kind,
                OpKind::Set {
                    set_type: SetOpType::UnionAll,
                    ..
                }
            );
            if is_union_all {
                // Union-all branches need not be strictly co-located; only
                // the weaker grouping survives.
                self.optimizer.non_strict_pwj_groups.push(non_strict.clone());
            } else {
                self.optimizer.strict_pwj_groups.push(strict.clone());
            }
        }

        let node = self.op_mut(id);
        node.strict_pwj_constraint = strict;
        node.non_strict_pwj_constraint = non_strict;
        Ok(())
    }
}
