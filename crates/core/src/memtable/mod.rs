//! In-memory LSM level.
//!
//! A memtable is the active (or frozen, awaiting flush) level of one
//! tablet's LSM tree. Rows carry full MVCC version chains; uncommitted
//! writes live next to committed versions, guarded by a per-row lock owned
//! by the writing transaction.

pub mod callback;
pub mod context;
pub mod redo;
pub mod table_lock;

pub use callback::{CallbackScope, CbState, DmlOp, LockMode, RedoSubmitHelper, TableLockOp, TxCallback};
pub use context::{EndCode, MemtableCtx, WriteAuth};

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tabletdb_primitives::{Scn, SchemaVersion, SeqNo, TabletId, TxId, Version};

use crate::datum::{Row, RowKey};
use crate::error::{DmlError, Result, StorageError};
use crate::tablet::meta::{BindingInfo, TxData};

/// A typed payload produced by a transaction that must be visible to
/// readers before commit, and replicated alongside normal redo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MultiSourceData {
    TabletStatus(TxData),
    Binding(BindingInfo),
    AutoincSeq(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsdKind {
    TabletStatus,
    Binding,
    AutoincSeq,
}

impl MultiSourceData {
    pub fn kind(&self) -> MsdKind {
        match self {
            MultiSourceData::TabletStatus(_) => MsdKind::TabletStatus,
            MultiSourceData::Binding(_) => MsdKind::Binding,
            MultiSourceData::AutoincSeq(_) => MsdKind::AutoincSeq,
        }
    }
}

#[derive(Default)]
struct MsdSlots {
    tablet_status: Option<TxData>,
    binding: Option<BindingInfo>,
    autoinc_seq: Option<u64>,
}

/// One committed MVCC version of a row. `row == None` records a delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowVersion {
    pub version: Version,
    pub scn: Scn,
    pub op: DmlOp,
    pub row: Option<Row>,
}

#[derive(Clone, Debug)]
struct PendingWrite {
    tx_id: TxId,
    seq_no: SeqNo,
    op: DmlOp,
    row: Option<Row>,
}

#[derive(Default)]
struct RowEntry {
    /// The transaction currently holding this row's write lock, with the
    /// seq-no of its first write.
    lock_owner: Option<(TxId, SeqNo)>,
    /// Committed versions, ascending by commit version.
    versions: Vec<RowVersion>,
    /// Uncommitted writes of the lock owner, in seq order.
    pending: Vec<PendingWrite>,
}

/// Verdict of a point lookup in one store: the first definitive verdict
/// (newest store first) wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyVerdict {
    Exists,
    Deleted,
}

pub struct Memtable {
    /// Back-reference handed to callbacks; see [`Arc::new_cyclic`] in
    /// [`Memtable::new`].
    weak_self: Weak<Memtable>,
    tablet_id: TabletId,
    /// Left boundary: the tablet's clog checkpoint at creation. The range
    /// of this memtable is `(start_scn, end_scn]`.
    start_scn: Scn,
    end_scn: AtomicU64,
    frozen: AtomicBool,
    for_replay: bool,
    max_schema_version: AtomicU64,
    rows: RwLock<BTreeMap<RowKey, RowEntry>>,
    msd: RwLock<MsdSlots>,
    /// Number of callbacks referencing this memtable that are not yet
    /// committed or aborted. A memtable may only be released at zero.
    pending_cb_cnt: AtomicU64,
}

impl Memtable {
    pub fn new(
        tablet_id: TabletId,
        start_scn: Scn,
        schema_version: SchemaVersion,
        for_replay: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            tablet_id,
            start_scn,
            end_scn: AtomicU64::new(u64::MAX),
            frozen: AtomicBool::new(false),
            for_replay,
            max_schema_version: AtomicU64::new(schema_version.0),
            rows: RwLock::new(BTreeMap::new()),
            msd: RwLock::new(MsdSlots::default()),
            pending_cb_cnt: AtomicU64::new(0),
        })
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn start_scn(&self) -> Scn {
        self.start_scn
    }

    /// Right boundary, [`Scn::MAX`] while active.
    pub fn end_scn(&self) -> Scn {
        Scn(self.end_scn.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        !self.frozen.load(Ordering::Acquire)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn is_for_replay(&self) -> bool {
        self.for_replay
    }

    pub fn max_schema_version(&self) -> SchemaVersion {
        SchemaVersion(self.max_schema_version.load(Ordering::Acquire))
    }

    pub fn record_schema_version(&self, version: SchemaVersion) {
        self.max_schema_version.fetch_max(version.0, Ordering::AcqRel);
    }

    /// Whether a redo record at `scn` belongs to this memtable.
    pub fn contains_scn(&self, scn: Scn) -> bool {
        self.start_scn < scn && scn <= self.end_scn()
    }

    /// Freeze: no further writes, right boundary fixed at `end_scn`.
    pub fn freeze(&self, end_scn: Scn) {
        self.end_scn.fetch_min(end_scn.0, Ordering::AcqRel);
        self.frozen.store(true, Ordering::Release);
    }

    pub fn pending_callback_cnt(&self) -> u64 {
        self.pending_cb_cnt.load(Ordering::Acquire)
    }

    /// A frozen memtable whose writes are all resolved and whose data is
    /// durable up to `scn` may be dropped.
    pub fn ready_for_release(&self, scn: Scn) -> bool {
        self.is_frozen() && self.end_scn() <= scn && self.pending_callback_cnt() == 0
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    // ---------------------------------------------------------------- writes

    /// Write-path entry: lock the row, run MVCC conflict checks, stage the
    /// write and append a callback to `ctx`.
    ///
    /// `snapshot` is the transaction's read snapshot; a newer committed
    /// version on the row fails with a transaction-set violation.
    pub fn set(
        &self,
        ctx: &MemtableCtx,
        op: DmlOp,
        key: RowKey,
        new_row: Option<Row>,
        snapshot: Version,
    ) -> Result<SeqNo> {
        if self.is_frozen() {
            return Err(StorageError::Eagain);
        }
        let tx_id = ctx.tx_id();
        let mut rows = self.rows.write();
        let entry = rows.entry(key.clone()).or_default();

        if let Some((holder, _)) = entry.lock_owner {
            if holder != tx_id {
                ctx.add_conflict_tx(holder);
                return Err(DmlError::TryLockRowConflict {
                    tablet_id: self.tablet_id,
                    holder,
                }
                .into());
            }
        }
        if let Some(last) = entry.versions.last() {
            if last.version > snapshot {
                return Err(DmlError::TransactionSetViolation { snapshot }.into());
            }
        }

        let seq_no = ctx.alloc_seq_no();
        if entry.lock_owner.is_none() {
            entry.lock_owner = Some((tx_id, seq_no));
            ctx.reset_conflict_txs();
        }
        entry.pending.push(PendingWrite {
            tx_id,
            seq_no,
            op,
            row: new_row.clone(),
        });
        drop(rows);

        self.pending_cb_cnt.fetch_add(1, Ordering::AcqRel);
        ctx.register_callback(TxCallback::Row {
            seq_no,
            tablet_id: self.tablet_id,
            op,
            key,
            new_row,
            memtable: self.weak_self.clone(),
            scn: None,
            state: CbState::Pending,
        });
        Ok(seq_no)
    }

    pub fn lock(&self, ctx: &MemtableCtx, key: RowKey, snapshot: Version) -> Result<SeqNo> {
        self.set(ctx, DmlOp::Lock, key, None, snapshot)
    }

    /// Replay-path write: the record is already durable at `scn`, so the
    /// callback is appended in synced state and no conflict checks run
    /// (they were run on the leader).
    pub fn replay_set(
        &self,
        ctx: &MemtableCtx,
        op: DmlOp,
        key: RowKey,
        new_row: Option<Row>,
        seq_no: SeqNo,
        scn: Scn,
    ) -> Result<()> {
        let tx_id = ctx.tx_id();
        {
            let mut rows = self.rows.write();
            let entry = rows.entry(key.clone()).or_default();
            if entry.lock_owner.is_none() {
                entry.lock_owner = Some((tx_id, seq_no));
            }
            entry.pending.push(PendingWrite {
                tx_id,
                seq_no,
                op,
                row: new_row.clone(),
            });
        }
        self.pending_cb_cnt.fetch_add(1, Ordering::AcqRel);
        ctx.register_replayed_callback(TxCallback::Row {
            seq_no,
            tablet_id: self.tablet_id,
            op,
            key,
            new_row,
            memtable: self.weak_self.clone(),
            scn: Some(scn),
            state: CbState::Synced,
        });
        Ok(())
    }

    /// Commit the staged write `(tx_id, seq_no)` at `version`. Lock-only
    /// writes release without creating a version.
    pub(crate) fn commit_write(
        &self,
        tx_id: TxId,
        seq_no: SeqNo,
        key: &RowKey,
        version: Version,
        scn: Scn,
    ) {
        let mut rows = self.rows.write();
        let Some(entry) = rows.get_mut(key) else {
            return;
        };
        let Some(pos) = entry
            .pending
            .iter()
            .position(|p| p.tx_id == tx_id && p.seq_no == seq_no)
        else {
            return;
        };
        let pending = entry.pending.remove(pos);
        if pending.op != DmlOp::Lock {
            entry.versions.push(RowVersion {
                version,
                scn,
                op: pending.op,
                row: pending.row,
            });
        }
        Self::maybe_release_lock(entry, tx_id);
        self.pending_cb_cnt.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drop the staged write `(tx_id, seq_no)`.
    pub(crate) fn abort_write(&self, tx_id: TxId, seq_no: SeqNo, key: &RowKey) {
        let mut rows = self.rows.write();
        let Some(entry) = rows.get_mut(key) else {
            return;
        };
        let Some(pos) = entry
            .pending
            .iter()
            .position(|p| p.tx_id == tx_id && p.seq_no == seq_no)
        else {
            return;
        };
        entry.pending.remove(pos);
        Self::maybe_release_lock(entry, tx_id);
        let empty = entry.pending.is_empty() && entry.versions.is_empty();
        if empty {
            rows.remove(key);
        }
        self.pending_cb_cnt.fetch_sub(1, Ordering::AcqRel);
    }

    fn maybe_release_lock(entry: &mut RowEntry, tx_id: TxId) {
        let still_pending = entry.pending.iter().any(|p| p.tx_id == tx_id);
        if !still_pending && entry.lock_owner.map(|(owner, _)| owner) == Some(tx_id) {
            entry.lock_owner = None;
        }
    }

    // ----------------------------------------------------------------- reads

    /// Definitive existence verdict at `snapshot`, or `None` if this
    /// memtable has no information about the key.
    ///
    /// `reader`'s own uncommitted writes are visible to it.
    pub fn key_state(
        &self,
        key: &RowKey,
        snapshot: Version,
        reader: Option<TxId>,
    ) -> Option<KeyVerdict> {
        let rows = self.rows.read();
        let entry = rows.get(key)?;
        if let Some(tx_id) = reader {
            if let Some(last) = entry.pending.iter().rev().find(|p| p.tx_id == tx_id) {
                return match last.op {
                    DmlOp::Delete => Some(KeyVerdict::Deleted),
                    DmlOp::Lock => None,
                    _ => Some(KeyVerdict::Exists),
                };
            }
        }
        let visible = entry.versions.iter().rev().find(|v| v.version <= snapshot)?;
        Some(match visible.op {
            DmlOp::Delete => KeyVerdict::Deleted,
            _ => KeyVerdict::Exists,
        })
    }

    /// The newest committed state of the key at `snapshot`.
    ///
    /// `Some(Some(row))`: the row; `Some(None)`: deleted at that snapshot;
    /// `None`: no information here.
    pub fn read_row(&self, key: &RowKey, snapshot: Version) -> Option<Option<Row>> {
        let rows = self.rows.read();
        let entry = rows.get(key)?;
        let visible = entry.versions.iter().rev().find(|v| v.version <= snapshot)?;
        Some(visible.row.clone())
    }

    /// Merge all keys in `range` visible at `snapshot` into `out`,
    /// first-writer-wins: a key already present in `out` came from a newer
    /// store and is left alone.
    pub fn collect_visible(
        &self,
        snapshot: Version,
        range: (Bound<&RowKey>, Bound<&RowKey>),
        out: &mut BTreeMap<RowKey, Option<Row>>,
    ) {
        let rows = self.rows.read();
        for (key, entry) in rows.range::<RowKey, _>(range) {
            if out.contains_key(key) {
                continue;
            }
            if let Some(visible) = entry.versions.iter().rev().find(|v| v.version <= snapshot) {
                out.insert(key.clone(), visible.row.clone());
            }
        }
    }

    // ------------------------------------------------------------------- msd

    pub fn save_multi_source_data(&self, data: MultiSourceData) {
        let mut slots = self.msd.write();
        match data {
            MultiSourceData::TabletStatus(v) => slots.tablet_status = Some(v),
            MultiSourceData::Binding(v) => slots.binding = Some(v),
            MultiSourceData::AutoincSeq(v) => slots.autoinc_seq = Some(v),
        }
    }

    pub fn get_multi_source_data(&self, kind: MsdKind) -> Option<MultiSourceData> {
        let slots = self.msd.read();
        match kind {
            MsdKind::TabletStatus => slots.tablet_status.clone().map(MultiSourceData::TabletStatus),
            MsdKind::Binding => slots.binding.clone().map(MultiSourceData::Binding),
            MsdKind::AutoincSeq => slots.autoinc_seq.map(MultiSourceData::AutoincSeq),
        }
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("tablet_id", &self.tablet_id)
            .field("start_scn", &self.start_scn)
            .field("end_scn", &self.end_scn())
            .field("frozen", &self.is_frozen())
            .field("rows", &self.row_count())
            .field("pending_cbs", &self.pending_callback_cnt())
            .finish()
    }
}
