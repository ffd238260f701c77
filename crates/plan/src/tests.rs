//! Tree-level tests: property propagation, numbering, expression
//! allocation, pruning, px decoration, location constraints, explain.

use pretty_assertions::assert_eq;

use crate::expr::ExprKind;
use crate::operator::*;
use crate::property::DefaultCostModel;
use crate::traverse::{TraverseCtx, TraverseOp};

fn scan_op(rel: u32, table_id: u64, name: &str) -> OpKind {
    OpKind::TableScan(TableScanOp {
        table_id,
        ref_id: table_id,
        rel,
        table_name: name.into(),
        location: PhyLocationType::Local,
        partition_cnt: 1,
        is_das: false,
        is_fake_cte: false,
        dblink_id: None,
    })
}

/// `PROJECT(a, b) -> JOIN(a = a') -> [ SORT(a) -> SCAN(T1), SCAN(T2) ]`,
/// with `T1.a = 5` pushed down under the left scan.
fn join_tree() -> (LogicalPlan, crate::expr::ExprId, crate::expr::ExprId) {
    let mut plan = LogicalPlan::new(1);
    let a = plan.exprs.column(0, 0, "a");
    let b = plan.exprs.column(0, 1, "b");
    let a1 = plan.exprs.column(1, 0, "a'");
    let five = plan.exprs.int_const(5);
    let a_eq_5 = plan.exprs.eq(a, five);
    let a_eq_a1 = plan.exprs.eq(a, a1);

    let scan1 = plan.add_op(scan_op(0, 101, "t1"), &[]);
    plan.op_mut(scan1).output_exprs = vec![a, b];
    plan.op_mut(scan1).filter_exprs = vec![a_eq_5];
    plan.op_mut(scan1).sharding = ShardingInfo::local();

    let sort = plan.add_op(
        OpKind::Sort {
            sort_keys: vec![OrderItem::asc(a)],
        },
        &[scan1],
    );

    let scan2 = plan.add_op(scan_op(1, 102, "t2"), &[]);
    plan.op_mut(scan2).output_exprs = vec![a1];
    plan.op_mut(scan2).sharding = ShardingInfo::local();

    let join = plan.add_op(
        OpKind::Join {
            join_type: JoinType::Inner,
            algo: JoinAlgo::Merge,
        },
        &[sort, scan2],
    );
    plan.op_mut(join).filter_exprs = vec![a_eq_a1];

    let project = plan.add_op(OpKind::Material, &[join]);
    plan.op_mut(project).output_exprs = vec![a, b];
    plan.set_root(project);
    (plan, a, a1)
}

#[test]
fn ordering_is_inherited_from_the_first_child() {
    let (mut plan, a, _) = join_tree();
    plan.compute_all_properties(&DefaultCostModel).unwrap();

    let root = plan.root().unwrap();
    assert_eq!(plan.op(root).op_ordering, vec![OrderItem::asc(a)]);

    let join = plan.first_child(root).unwrap();
    assert_eq!(plan.op(join).op_ordering, vec![OrderItem::asc(a)]);
}

#[test]
fn const_exprs_propagate_through_join_equalities() {
    let (mut plan, a, a1) = join_tree();
    plan.compute_all_properties(&DefaultCostModel).unwrap();

    let root = plan.root().unwrap();
    let join = plan.first_child(root).unwrap();
    let consts = &plan.op(join).output_const_exprs;
    assert!(consts.contains(&a), "join consts: {consts:?}");
    assert!(consts.contains(&a1), "join consts: {consts:?}");
}

#[test]
fn table_sets_union_across_join() {
    let (mut plan, _, _) = join_tree();
    plan.compute_all_properties(&DefaultCostModel).unwrap();

    let root = plan.root().unwrap();
    let join = plan.first_child(root).unwrap();
    assert!(plan.op(join).table_set.contains(0));
    assert!(plan.op(join).table_set.contains(1));
    // The sort only sees its scan.
    let sort = plan.first_child(join).unwrap();
    assert!(plan.op(sort).table_set.contains(0));
    assert!(!plan.op(sort).table_set.contains(1));
}

#[test]
fn property_derivation_is_idempotent() {
    let (mut plan, _, _) = join_tree();
    plan.compute_all_properties(&DefaultCostModel).unwrap();

    let snapshot: Vec<_> = (0..plan.op_count() as u32)
        .map(|i| {
            let op = plan.op(OpId(i));
            (
                op.output_const_exprs.clone(),
                op.equal_sets.clone(),
                op.op_ordering.clone(),
                op.table_set,
                op.plan_type,
                op.is_pipelined,
                op.at_most_one_row,
                op.card.to_bits(),
                op.cost.to_bits(),
                op.width.to_bits(),
            )
        })
        .collect();

    plan.compute_all_properties(&DefaultCostModel).unwrap();
    let again: Vec<_> = (0..plan.op_count() as u32)
        .map(|i| {
            let op = plan.op(OpId(i));
            (
                op.output_const_exprs.clone(),
                op.equal_sets.clone(),
                op.op_ordering.clone(),
                op.table_set,
                op.plan_type,
                op.is_pipelined,
                op.at_most_one_row,
                op.card.to_bits(),
                op.cost.to_bits(),
                op.width.to_bits(),
            )
        })
        .collect();
    assert_eq!(snapshot, again);
}

#[test]
fn pipeline_breaks_at_blocking_operators() {
    let (mut plan, _, _) = join_tree();
    plan.compute_all_properties(&DefaultCostModel).unwrap();

    let root = plan.root().unwrap();
    let join = plan.first_child(root).unwrap();
    let sort = plan.first_child(join).unwrap();
    assert!(!plan.op(sort).is_pipelined);
    assert!(!plan.op(join).is_pipelined);
    let scan2 = plan.child(join, 1).unwrap();
    assert!(plan.op(scan2).is_pipelined);
}

#[test]
fn operator_numbering_assigns_pre_and_post_orders() {
    let (mut plan, _, _) = join_tree();
    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::OperatorNumbering, &mut ctx)
        .unwrap();

    let root = plan.root().unwrap();
    let join = plan.first_child(root).unwrap();
    let sort = plan.first_child(join).unwrap();
    let scan1 = plan.first_child(sort).unwrap();
    let scan2 = plan.child(join, 1).unwrap();

    assert_eq!(plan.op(root).op_id, Some(0));
    assert_eq!(plan.op(join).op_id, Some(1));
    assert_eq!(plan.op(sort).op_id, Some(2));
    assert_eq!(plan.op(scan1).op_id, Some(3));
    assert_eq!(plan.op(scan2).op_id, Some(4));

    assert_eq!(plan.op(scan1).post_order_id, Some(0));
    assert_eq!(plan.op(sort).post_order_id, Some(1));
    assert_eq!(plan.op(scan2).post_order_id, Some(2));
    assert_eq!(plan.op(join).post_order_id, Some(3));
    assert_eq!(plan.op(root).post_order_id, Some(4));

    assert_eq!(plan.op(root).depth, 0);
    assert_eq!(plan.op(join).depth, 1);
    assert_eq!(plan.op(scan1).depth, 3);
}

#[test]
fn expression_allocation_produces_everything() {
    let (mut plan, a, a1) = join_tree();
    plan.compute_all_properties(&DefaultCostModel).unwrap();
    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::OperatorNumbering, &mut ctx)
        .unwrap();
    plan.do_plan_tree_traverse(TraverseOp::AllocExpr, &mut ctx)
        .unwrap();

    assert!(ctx.alloc_expr.all_produced());
    // The sort key is materialized below the join and forwarded upward.
    let root = plan.root().unwrap();
    let join = plan.first_child(root).unwrap();
    assert!(plan.op(join).output_exprs.contains(&a));

    // Every output expression has a producer inside the operator's
    // subtree.
    let root = plan.root().unwrap();
    let join = plan.first_child(root).unwrap();
    for expr in &plan.op(join).output_exprs {
        let producer = ctx.alloc_expr.producers.get(expr).unwrap();
        assert!(
            plan.subtree_contains_op(join, producer.producer_id),
            "{expr} produced outside the join subtree"
        );
    }
    let _ = (a, a1);
}

#[test]
fn project_pruning_drops_unreferenced_outputs() {
    let mut plan = LogicalPlan::new(1);
    let a = plan.exprs.column(0, 0, "a");
    let b = plan.exprs.column(0, 1, "b");
    let rowscn = plan.exprs.add(ExprKind::OraRowscn, smallvec::SmallVec::new());

    let scan = plan.add_op(scan_op(0, 101, "t1"), &[]);
    plan.op_mut(scan).output_exprs = vec![a, b, rowscn];
    let limit = plan.add_op(OpKind::Limit, &[scan]);
    plan.op_mut(limit).op_exprs = vec![a];
    plan.op_mut(limit).output_exprs = vec![a];
    plan.set_root(limit);

    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::ProjectPruning, &mut ctx)
        .unwrap();

    // `b` is gone; the pseudo column survives pruning.
    assert_eq!(plan.op(scan).output_exprs, vec![a, rowscn]);
}

#[test]
fn constant_outputs_get_wrapped_after_pruning() {
    let mut plan = LogicalPlan::new(1);
    let a = plan.exprs.column(0, 0, "a");
    let five = plan.exprs.int_const(5);
    let scan = plan.add_op(scan_op(0, 101, "t1"), &[]);
    plan.op_mut(scan).output_exprs = vec![a, five];
    let limit = plan.add_op(OpKind::Limit, &[scan]);
    plan.op_mut(limit).op_exprs = vec![a, five];
    plan.set_root(limit);

    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::ProjectPruning, &mut ctx)
        .unwrap();

    let outputs = &plan.op(scan).output_exprs;
    assert!(outputs.contains(&a));
    assert!(outputs
        .iter()
        .any(|e| matches!(plan.exprs.get(*e).kind, ExprKind::RemoveConst)));
}

#[test]
fn location_constraints_group_join_children() {
    let (mut plan, _, _) = join_tree();
    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::GenLocationConstraint, &mut ctx)
        .unwrap();

    assert_eq!(plan.optimizer.location_constraints.len(), 2);
    assert_eq!(plan.optimizer.strict_pwj_groups, vec![vec![0, 1]]);
    assert!(plan.optimizer.non_strict_pwj_groups.is_empty());

    let root = plan.root().unwrap();
    assert_eq!(plan.op(root).strict_pwj_constraint, vec![0, 1]);
}

#[test]
fn union_all_builds_non_strict_groups() {
    let mut plan = LogicalPlan::new(1);
    let scan1 = plan.add_op(scan_op(0, 101, "t1"), &[]);
    let scan2 = plan.add_op(scan_op(1, 102, "t2"), &[]);
    let set = plan.add_op(
        OpKind::Set {
            set_type: SetOpType::UnionAll,
            is_recursive: false,
        },
        &[scan1, scan2],
    );
    plan.set_root(set);

    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::GenLocationConstraint, &mut ctx)
        .unwrap();
    assert_eq!(plan.optimizer.non_strict_pwj_groups, vec![vec![0, 1]]);
    assert!(plan.optimizer.strict_pwj_groups.is_empty());
}

#[test]
fn px_pipe_blocking_inserts_material_between_dfos() {
    let mut plan = LogicalPlan::new(2);
    let mk_branch = |plan: &mut LogicalPlan, rel: u32, table_id: u64| {
        let scan = plan.add_op(scan_op(rel, table_id, "t"), &[]);
        let producer = plan.add_op(
            OpKind::Exchange(ExchangeOp {
                is_producer: true,
                is_remote: false,
                is_rescanable: false,
            }),
            &[scan],
        );
        plan.add_op(
            OpKind::Exchange(ExchangeOp {
                is_producer: false,
                is_remote: false,
                is_rescanable: false,
            }),
            &[producer],
        )
    };
    let left = mk_branch(&mut plan, 0, 101);
    let right = mk_branch(&mut plan, 1, 102);
    let join = plan.add_op(
        OpKind::Join {
            join_type: JoinType::Inner,
            algo: JoinAlgo::Hash,
        },
        &[left, right],
    );
    plan.set_root(join);

    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::PxPipeBlocking, &mut ctx)
        .unwrap();
    assert_eq!(ctx.pipe_blocking.materials_added, 1);
    // The right input is now blocked by a material.
    let new_right = plan.child(join, 1).unwrap();
    assert!(matches!(plan.op(new_right).kind, OpKind::Material));
}

#[test]
fn granule_iterators_cover_partitioned_scans() {
    let mut plan = LogicalPlan::new(2);
    let scan = plan.add_op(
        OpKind::TableScan(TableScanOp {
            table_id: 101,
            ref_id: 101,
            rel: 0,
            table_name: "t1".into(),
            location: PhyLocationType::Distributed,
            partition_cnt: 8,
            is_das: false,
            is_fake_cte: false,
            dblink_id: None,
        }),
        &[],
    );
    plan.op_mut(scan).parallel = 2;
    let limit = plan.add_op(OpKind::Limit, &[scan]);
    plan.set_root(limit);

    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::AllocGi, &mut ctx)
        .unwrap();
    assert_eq!(ctx.alloc_gi.gi_added, 1);
    let gi = plan.first_child(limit).unwrap();
    assert!(matches!(plan.op(gi).kind, OpKind::GranuleIterator(_)));
    assert_eq!(plan.first_child(gi).unwrap(), scan);
}

#[test]
fn startup_exprs_lift_unless_param_dependent() {
    let mut plan = LogicalPlan::new(1);
    let a = plan.exprs.column(0, 0, "a");
    let five = plan.exprs.int_const(5);
    let plain = plan.exprs.eq(a, five);
    let rownum = plan.exprs.rownum();
    let rownum_pred = plan.exprs.binary(crate::expr::BinOp::Lt, rownum, five);

    let scan = plan.add_op(scan_op(0, 101, "t1"), &[]);
    plan.op_mut(scan).startup_exprs = vec![plain, rownum_pred];
    let limit = plan.add_op(OpKind::Limit, &[scan]);
    plan.set_root(limit);

    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::AllocStartupExpr, &mut ctx)
        .unwrap();

    assert_eq!(plan.op(scan).startup_exprs, vec![rownum_pred]);
    assert_eq!(plan.op(limit).startup_exprs, vec![plain]);
}

#[test]
fn exchange_numbering_assigns_px_and_dfo_ids() {
    let mut plan = LogicalPlan::new(2);
    let scan = plan.add_op(scan_op(0, 101, "t1"), &[]);
    let producer = plan.add_op(
        OpKind::Exchange(ExchangeOp {
            is_producer: true,
            is_remote: false,
            is_rescanable: false,
        }),
        &[scan],
    );
    let consumer = plan.add_op(
        OpKind::Exchange(ExchangeOp {
            is_producer: false,
            is_remote: false,
            is_rescanable: false,
        }),
        &[producer],
    );
    let limit = plan.add_op(OpKind::Limit, &[consumer]);
    plan.set_root(limit);

    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::ExchangeNumbering, &mut ctx)
        .unwrap();

    assert_eq!(plan.op(producer).px_id, Some(0));
    assert_eq!(plan.op(producer).dfo_id, Some(0));
    assert_eq!(plan.op(producer).parallel, 2);
}

#[test]
fn all_children_on_one_dblink_mark_the_parent() {
    let mut plan = LogicalPlan::new(1);
    let mut remote_scan = |plan: &mut LogicalPlan, rel: u32| {
        plan.add_op(
            OpKind::TableScan(TableScanOp {
                table_id: 100 + rel as u64,
                ref_id: 100 + rel as u64,
                rel,
                table_name: format!("r{rel}"),
                location: PhyLocationType::Remote,
                partition_cnt: 1,
                is_das: false,
                is_fake_cte: false,
                dblink_id: Some(77),
            }),
            &[],
        )
    };
    let s1 = remote_scan(&mut plan, 0);
    let s2 = remote_scan(&mut plan, 1);
    let join = plan.add_op(
        OpKind::Join {
            join_type: JoinType::Inner,
            algo: JoinAlgo::NestedLoop,
        },
        &[s1, s2],
    );
    plan.set_root(join);

    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::AllocLink, &mut ctx)
        .unwrap();
    assert_eq!(plan.op(join).dblink_id, Some(77));
}

#[test]
fn mixed_dblinks_wrap_remote_children() {
    let mut plan = LogicalPlan::new(1);
    let local = plan.add_op(scan_op(0, 101, "t1"), &[]);
    let remote = plan.add_op(
        OpKind::TableScan(TableScanOp {
            table_id: 102,
            ref_id: 102,
            rel: 1,
            table_name: "r1".into(),
            location: PhyLocationType::Remote,
            partition_cnt: 1,
            is_das: false,
            is_fake_cte: false,
            dblink_id: Some(77),
        }),
        &[],
    );
    let join = plan.add_op(
        OpKind::Join {
            join_type: JoinType::Inner,
            algo: JoinAlgo::NestedLoop,
        },
        &[local, remote],
    );
    plan.set_root(join);

    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::AllocLink, &mut ctx)
        .unwrap();
    assert!(plan.op(join).dblink_id.is_none());
    let wrapped = plan.child(join, 1).unwrap();
    assert!(matches!(plan.op(wrapped).kind, OpKind::Link));
}

#[test]
fn explain_buffer_lists_every_operator() {
    let (mut plan, _, _) = join_tree();
    plan.compute_all_properties(&DefaultCostModel).unwrap();
    let mut ctx = TraverseCtx::default();
    plan.do_plan_tree_traverse(TraverseOp::OperatorNumbering, &mut ctx)
        .unwrap();
    plan.do_plan_tree_traverse(TraverseOp::ExplainCollectWidth, &mut ctx)
        .unwrap();
    plan.do_plan_tree_traverse(TraverseOp::ExplainWriteBufferOutput, &mut ctx)
        .unwrap();

    let text = &ctx.explain.buf;
    assert!(text.contains("MATERIAL"), "{text}");
    assert!(text.contains("JOIN"), "{text}");
    assert!(text.contains("SORT"), "{text}");
    assert!(text.contains("TABLE SCAN"), "{text}");
    assert!(text.contains("output("), "{text}");
}

#[test]
fn fake_cte_containment_stops_at_recursive_union() {
    let mut plan = LogicalPlan::new(1);
    let cte_scan = plan.add_op(
        OpKind::TableScan(TableScanOp {
            table_id: 900,
            ref_id: 900,
            rel: 0,
            table_name: "cte".into(),
            location: PhyLocationType::Local,
            partition_cnt: 1,
            is_das: false,
            is_fake_cte: true,
            dblink_id: None,
        }),
        &[],
    );
    let base = plan.add_op(scan_op(1, 101, "t1"), &[]);
    let union = plan.add_op(
        OpKind::Set {
            set_type: SetOpType::UnionAll,
            is_recursive: true,
        },
        &[base, cte_scan],
    );
    let limit = plan.add_op(OpKind::Limit, &[union]);
    plan.set_root(limit);
    plan.compute_all_properties(&DefaultCostModel).unwrap();

    assert!(plan
        .op(cte_scan)
        .contains
        .contains(ContainsFlags::FAKE_CTE));
    assert!(!plan.op(union).contains.contains(ContainsFlags::FAKE_CTE));
    assert!(!plan.op(limit).contains.contains(ContainsFlags::FAKE_CTE));
}
