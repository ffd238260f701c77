//! Transaction callbacks.
//!
//! Every write a transaction performs on a memtable appends one callback to
//! its context. The callback list is the unit of redo generation, partial
//! rollback and commit/abort application. Callbacks reference their memtable
//! weakly: a memtable released after flush drops out from under its
//! callbacks, and commit then only consults the list itself.

use std::sync::Weak;

use tabletdb_primitives::{Scn, SeqNo, TabletId, TxId};
use tabletdb_slog::buffer::BufWriter;

use crate::datum::{Row, RowKey};
use crate::memtable::Memtable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmlOp {
    Insert,
    Update,
    Delete,
    Lock,
}

impl DmlOp {
    pub(crate) fn tag(self) -> u8 {
        match self {
            DmlOp::Insert => 1,
            DmlOp::Update => 2,
            DmlOp::Delete => 3,
            DmlOp::Lock => 4,
        }
    }
}

/// Table lock modes, weakest to strongest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    RowShare,
    RowExclusive,
    Share,
    Exclusive,
}

impl LockMode {
    pub fn conflicts_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (RowShare, Exclusive) | (Exclusive, RowShare) => true,
            (RowExclusive, Share) | (Share, RowExclusive) => true,
            (RowExclusive, Exclusive) | (Exclusive, RowExclusive) => true,
            (Share, Exclusive) | (Exclusive, Share) => true,
            (Exclusive, Exclusive) => true,
            (Share, Share) => false,
            _ => false,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            LockMode::RowShare => 1,
            LockMode::RowExclusive => 2,
            LockMode::Share => 4,
            LockMode::Exclusive => 8,
        }
    }
}

/// One table-lock operation owned by a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableLockOp {
    pub tablet_id: TabletId,
    pub owner: TxId,
    pub mode: LockMode,
    pub seq_no: SeqNo,
}

/// Progress of one callback through the redo pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CbState {
    /// Appended, not yet packed into a redo record.
    #[default]
    Pending,
    /// Packed into a redo record that is in flight.
    Submitted,
    /// Acknowledged by the log layer; `scn` is set.
    Synced,
}

/// One entry of a transaction's callback list.
#[derive(Clone, Debug)]
pub enum TxCallback {
    /// A row write (or row lock) on one memtable.
    Row {
        seq_no: SeqNo,
        tablet_id: TabletId,
        op: DmlOp,
        key: RowKey,
        new_row: Option<Row>,
        memtable: Weak<Memtable>,
        scn: Option<Scn>,
        state: CbState,
    },
    /// A table-lock operation. Only packed into redo when the driver asks
    /// for lock nodes.
    LockOp {
        op: TableLockOp,
        memtable: Weak<Memtable>,
        scn: Option<Scn>,
        state: CbState,
    },
    /// A tablet auto-increment sequence sync, replicated as its own record.
    SyncTabletSeq {
        seq_no: SeqNo,
        tablet_id: TabletId,
        new_seq: u64,
        scn: Option<Scn>,
        state: CbState,
    },
}

impl TxCallback {
    pub fn seq_no(&self) -> SeqNo {
        match self {
            TxCallback::Row { seq_no, .. } | TxCallback::SyncTabletSeq { seq_no, .. } => *seq_no,
            TxCallback::LockOp { op, .. } => op.seq_no,
        }
    }

    pub fn tablet_id(&self) -> TabletId {
        match self {
            TxCallback::Row { tablet_id, .. } | TxCallback::SyncTabletSeq { tablet_id, .. } => {
                *tablet_id
            }
            TxCallback::LockOp { op, .. } => op.tablet_id,
        }
    }

    pub fn is_lock_node(&self) -> bool {
        matches!(self, TxCallback::LockOp { .. })
    }

    pub fn state(&self) -> CbState {
        match self {
            TxCallback::Row { state, .. }
            | TxCallback::LockOp { state, .. }
            | TxCallback::SyncTabletSeq { state, .. } => *state,
        }
    }

    pub(crate) fn set_state(&mut self, new: CbState) {
        match self {
            TxCallback::Row { state, .. }
            | TxCallback::LockOp { state, .. }
            | TxCallback::SyncTabletSeq { state, .. } => *state = new,
        }
    }

    pub fn scn(&self) -> Option<Scn> {
        match self {
            TxCallback::Row { scn, .. }
            | TxCallback::LockOp { scn, .. }
            | TxCallback::SyncTabletSeq { scn, .. } => *scn,
        }
    }

    pub(crate) fn set_scn(&mut self, new: Scn) {
        match self {
            TxCallback::Row { scn, .. }
            | TxCallback::LockOp { scn, .. }
            | TxCallback::SyncTabletSeq { scn, .. } => *scn = Some(new),
        }
    }

    /// Serialize the redo form of this callback. The same bytes feed the
    /// running transaction checksum, so encoding must be deterministic.
    pub fn encode_redo(&self, out: &mut impl BufWriter) {
        match self {
            TxCallback::Row {
                seq_no,
                tablet_id,
                op,
                key,
                new_row,
                ..
            } => {
                out.put_u8(1);
                out.put_u64(seq_no.0);
                out.put_u64(tablet_id.0);
                out.put_u8(op.tag());
                key.encode(out);
                match new_row {
                    Some(row) => {
                        out.put_u8(1);
                        row.encode(out);
                    }
                    None => out.put_u8(0),
                }
            }
            TxCallback::LockOp { op, .. } => {
                out.put_u8(2);
                out.put_u64(op.seq_no.0);
                out.put_u64(op.tablet_id.0);
                out.put_u64(op.owner.0);
                out.put_u8(op.mode.tag());
            }
            TxCallback::SyncTabletSeq {
                seq_no,
                tablet_id,
                new_seq,
                ..
            } => {
                out.put_u8(3);
                out.put_u64(seq_no.0);
                out.put_u64(tablet_id.0);
                out.put_u64(*new_seq);
            }
        }
    }

    /// Length of [`Self::encode_redo`] output.
    pub fn redo_len(&self) -> usize {
        match self {
            TxCallback::Row { key, new_row, .. } => {
                1 + 8
                    + 8
                    + 1
                    + key.encoded_len()
                    + 1
                    + new_row.as_ref().map_or(0, |r| r.encoded_len())
            }
            TxCallback::LockOp { .. } => 1 + 8 + 8 + 8 + 1,
            TxCallback::SyncTabletSeq { .. } => 1 + 8 + 8 + 8,
        }
    }
}

/// A contiguous range of callback-list positions, inclusive on both ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackScope {
    pub first: usize,
    pub last: usize,
}

impl CallbackScope {
    /// Scopes are non-empty by construction.
    pub fn len(&self) -> usize {
        self.last - self.first + 1
    }
}

/// Filled by `fill_redo_log`, consumed by `log_submitted` and the sync
/// notifications.
#[derive(Clone, Debug, Default)]
pub struct RedoSubmitHelper {
    pub scope: Option<CallbackScope>,
    pub data_size: usize,
    pub callback_cnt: usize,
}

impl RedoSubmitHelper {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
