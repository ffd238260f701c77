//! Per-transaction table-lock bookkeeping.
//!
//! The lock table itself is an inner tablet owned by the lock service; this
//! module only tracks the lock operations a single transaction has taken,
//! so they can be released at commit, undone on abort, and recovered on
//! restart.

use tabletdb_primitives::{Scn, SeqNo, TabletId, TxId, Version};

use crate::memtable::callback::{LockMode, TableLockOp};

#[derive(Clone, Debug)]
struct LockRecord {
    op: TableLockOp,
    committed: bool,
}

/// Recovery image of a transaction's lock ops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableLockInfo {
    pub ops: Vec<TableLockOp>,
    pub max_durable_scn: Scn,
}

/// Owns the transaction's lock-op records.
#[derive(Default)]
pub struct TableLockMemCtx {
    records: Vec<LockRecord>,
}

impl TableLockMemCtx {
    pub fn add_lock_record(&mut self, op: TableLockOp) {
        self.records.push(LockRecord {
            op,
            committed: false,
        });
    }

    pub fn check_lock_exist(&self, tablet_id: TabletId, owner: TxId, mode: LockMode) -> bool {
        self.records
            .iter()
            .any(|r| r.op.tablet_id == tablet_id && r.op.owner == owner && r.op.mode == mode)
    }

    /// Release (commit) or undo (abort) every lock op of the transaction.
    /// Returns the number of records resolved.
    pub fn clear_table_lock(
        &mut self,
        is_commit: bool,
        commit_version: Version,
        commit_scn: Scn,
    ) -> usize {
        let n = self.records.len();
        if is_commit {
            for record in &mut self.records {
                record.committed = true;
            }
            log::trace!(
                "table locks committed: cnt={n} version={commit_version} scn={commit_scn}"
            );
        }
        self.records.clear();
        n
    }

    /// Undo lock ops with seq-no strictly greater than `to_seq_no`.
    pub fn rollback_table_lock(&mut self, to_seq_no: SeqNo) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.op.seq_no <= to_seq_no);
        before - self.records.len()
    }

    pub fn iterate_tx_lock_ops(&self) -> impl Iterator<Item = &TableLockOp> {
        self.records.iter().map(|r| &r.op)
    }

    pub fn op_count(&self) -> usize {
        self.records.len()
    }

    /// Snapshot for persistence alongside the transaction context.
    pub fn get_table_lock_store_info(&self, max_durable_scn: Scn) -> TableLockInfo {
        TableLockInfo {
            ops: self.records.iter().map(|r| r.op.clone()).collect(),
            max_durable_scn,
        }
    }

    /// Rebuild the lock records from a persisted image.
    pub fn recover_from_table_lock_info(&mut self, info: &TableLockInfo) {
        self.records.clear();
        for op in &info.ops {
            self.add_lock_record(op.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(seq: u64) -> TableLockOp {
        TableLockOp {
            tablet_id: TabletId(1001),
            owner: TxId(7),
            mode: LockMode::RowExclusive,
            seq_no: SeqNo(seq),
        }
    }

    #[test]
    fn rollback_drops_later_ops_only() {
        let mut ctx = TableLockMemCtx::default();
        ctx.add_lock_record(op(1));
        ctx.add_lock_record(op(5));
        ctx.add_lock_record(op(9));
        assert_eq!(ctx.rollback_table_lock(SeqNo(5)), 1);
        assert_eq!(ctx.op_count(), 2);
        // Idempotent on a second call.
        assert_eq!(ctx.rollback_table_lock(SeqNo(5)), 0);
    }

    #[test]
    fn store_info_roundtrip() {
        let mut ctx = TableLockMemCtx::default();
        ctx.add_lock_record(op(1));
        ctx.add_lock_record(op(2));
        let info = ctx.get_table_lock_store_info(Scn(77));

        let mut recovered = TableLockMemCtx::default();
        recovered.recover_from_table_lock_info(&info);
        assert_eq!(recovered.op_count(), 2);
        assert!(recovered.check_lock_exist(TabletId(1001), TxId(7), LockMode::RowExclusive));
    }

    #[test]
    fn clear_resolves_everything() {
        let mut ctx = TableLockMemCtx::default();
        ctx.add_lock_record(op(1));
        assert_eq!(ctx.clear_table_lock(true, Version(100), Scn(10)), 1);
        assert_eq!(ctx.op_count(), 0);
    }
}
