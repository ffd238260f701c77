//! Scalar expression arena.
//!
//! Expressions are interned: structurally equal nodes share one id, which
//! makes equal-set and constant analysis cheap set arithmetic over ids.

use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExprId(pub u32);

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConstVal {
    Null,
    Int(i64),
    Str(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Eq,
    Lt,
    Gt,
    Add,
    And,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExprKind {
    /// A base-table column: `(relation id, column index)`.
    ColumnRef { rel: u32, col: u32, name: String },
    Const(ConstVal),
    Binary(BinOp),
    /// The pseudo column carrying the row's commit version; never pruned.
    OraRowscn,
    Rownum,
    DynParam(u32),
    Aggr(String),
    /// Wrapper marking a constant output that executors need not
    /// re-evaluate per row.
    RemoveConst,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expr {
    pub kind: ExprKind,
    pub children: SmallVec<[ExprId; 2]>,
}

#[derive(Default, Debug, Clone)]
pub struct ExprArena {
    exprs: Vec<Expr>,
    interned: HashMap<(ExprKind, SmallVec<[ExprId; 2]>), ExprId>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: ExprKind, children: impl Into<SmallVec<[ExprId; 2]>>) -> ExprId {
        let children = children.into();
        if let Some(id) = self.interned.get(&(kind.clone(), children.clone())) {
            return *id;
        }
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(Expr {
            kind: kind.clone(),
            children: children.clone(),
        });
        self.interned.insert((kind, children), id);
        id
    }

    pub fn column(&mut self, rel: u32, col: u32, name: &str) -> ExprId {
        self.add(
            ExprKind::ColumnRef {
                rel,
                col,
                name: name.to_owned(),
            },
            SmallVec::new(),
        )
    }

    pub fn int_const(&mut self, v: i64) -> ExprId {
        self.add(ExprKind::Const(ConstVal::Int(v)), SmallVec::new())
    }

    pub fn binary(&mut self, op: BinOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.add(ExprKind::Binary(op), SmallVec::from_slice(&[lhs, rhs]))
    }

    pub fn eq(&mut self, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.binary(BinOp::Eq, lhs, rhs)
    }

    pub fn rownum(&mut self) -> ExprId {
        self.add(ExprKind::Rownum, SmallVec::new())
    }

    pub fn dyn_param(&mut self, idx: u32) -> ExprId {
        self.add(ExprKind::DynParam(idx), SmallVec::new())
    }

    /// Wrap a constant output in a `remove_const` marker.
    pub fn wrap_remove_const(&mut self, inner: ExprId) -> ExprId {
        self.add(ExprKind::RemoveConst, SmallVec::from_slice(&[inner]))
    }

    pub fn get(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub fn is_const_literal(&self, id: ExprId) -> bool {
        matches!(self.get(id).kind, ExprKind::Const(_))
    }

    pub fn is_column(&self, id: ExprId) -> bool {
        matches!(self.get(id).kind, ExprKind::ColumnRef { .. })
    }

    /// Whether the expression tree contains a node matching `pred`.
    pub fn contains(&self, id: ExprId, pred: &impl Fn(&ExprKind) -> bool) -> bool {
        let expr = self.get(id);
        if pred(&expr.kind) {
            return true;
        }
        expr.children.iter().any(|c| self.contains(*c, pred))
    }

    pub fn contains_rownum(&self, id: ExprId) -> bool {
        self.contains(id, &|k| matches!(k, ExprKind::Rownum))
    }

    pub fn contains_dyn_param(&self, id: ExprId) -> bool {
        self.contains(id, &|k| matches!(k, ExprKind::DynParam(_)))
    }

    /// Deterministic equality `lhs = rhs` decomposition, if `id` is one.
    pub fn as_equality(&self, id: ExprId) -> Option<(ExprId, ExprId)> {
        let expr = self.get(id);
        match expr.kind {
            ExprKind::Binary(BinOp::Eq) => Some((expr.children[0], expr.children[1])),
            _ => None,
        }
    }

    /// Column ids referenced anywhere under `id`.
    pub fn collect_columns(&self, id: ExprId, out: &mut Vec<ExprId>) {
        if self.is_column(id) {
            if !out.contains(&id) {
                out.push(id);
            }
            return;
        }
        for child in self.get(id).children.clone() {
            self.collect_columns(child, out);
        }
    }

    /// Byte width estimate used by `est_width`.
    pub fn width_of(&self, id: ExprId) -> f64 {
        match &self.get(id).kind {
            ExprKind::Const(ConstVal::Str(s)) => s.len() as f64,
            ExprKind::ColumnRef { .. } | ExprKind::Const(_) => 8.0,
            ExprKind::OraRowscn | ExprKind::Rownum | ExprKind::DynParam(_) => 8.0,
            ExprKind::Aggr(_) => 8.0,
            ExprKind::Binary(_) | ExprKind::RemoveConst => self
                .get(id)
                .children
                .iter()
                .map(|c| self.width_of(*c))
                .sum::<f64>()
                .max(8.0),
        }
    }

    pub fn display_name(&self, id: ExprId) -> String {
        match &self.get(id).kind {
            ExprKind::ColumnRef { name, .. } => name.clone(),
            ExprKind::Const(ConstVal::Int(v)) => v.to_string(),
            ExprKind::Const(ConstVal::Str(s)) => format!("'{s}'"),
            ExprKind::Const(ConstVal::Null) => "NULL".into(),
            ExprKind::Binary(BinOp::Eq) => {
                let c = &self.get(id).children;
                format!("{} = {}", self.display_name(c[0]), self.display_name(c[1]))
            }
            ExprKind::Binary(op) => format!("{op:?}"),
            ExprKind::OraRowscn => "ORA_ROWSCN".into(),
            ExprKind::Rownum => "ROWNUM".into(),
            ExprKind::DynParam(i) => format!("?{i}"),
            ExprKind::Aggr(name) => format!("{name}(..)"),
            ExprKind::RemoveConst => {
                format!("remove_const({})", self.display_name(self.get(id).children[0]))
            }
        }
    }
}

/// Equivalence classes over expression ids.
pub type EqualSets = Vec<Vec<ExprId>>;

/// Merge `seed` classes with the equalities in `pairs` (union-find over
/// ids).
pub fn build_equal_sets(seed: &[Vec<ExprId>], pairs: &[(ExprId, ExprId)]) -> EqualSets {
    let mut sets: Vec<Vec<ExprId>> = seed.to_vec();
    for (a, b) in pairs {
        let ia = sets.iter().position(|s| s.contains(a));
        let ib = sets.iter().position(|s| s.contains(b));
        match (ia, ib) {
            (Some(ia), Some(ib)) if ia != ib => {
                let merged = sets.remove(ia.max(ib));
                sets[ia.min(ib)].extend(merged);
            }
            (Some(_), Some(_)) => {}
            (Some(ia), None) => sets[ia].push(*b),
            (None, Some(ib)) => sets[ib].push(*a),
            (None, None) => sets.push(vec![*a, *b]),
        }
    }
    for set in &mut sets {
        set.sort();
        set.dedup();
    }
    sets
}
