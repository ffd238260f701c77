//! Per-transaction memtable context.
//!
//! Owns the callback list, the redo-log generator cursors, the running
//! replay checksum and the transaction's table-lock records. One context
//! exists per transaction per log stream; the DML layer runs under its
//! write latch, the log layer drives the redo cursors under the byte lock.
//!
//! Lock order: write latch, then log state. The log state mutex (the "byte
//! lock") serializes `fill_redo_log`, `log_submitted`, `sync_log_succ`,
//! `sync_log_fail` and `rollback` against each other.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crc32c::crc32c_append;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tabletdb_primitives::{LogStreamId, Scn, SeqNo, TabletId, TxId, Version};

use crate::config::EngineConfig;
use crate::error::{DmlError, Result, StorageError, TxError};
use crate::memtable::callback::{
    CallbackScope, CbState, DmlOp, RedoSubmitHelper, TableLockOp, TxCallback,
};
use crate::memtable::redo::{LogBaseHeader, LogBaseType, LogHandler, MAX_REDO_PAYLOAD};
use crate::memtable::table_lock::{TableLockInfo, TableLockMemCtx};

/// Final state of a transaction context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EndCode {
    Ok = 0,
    Committed = 1,
    Rollbacked = 2,
    Killed = 3,
    /// Some synced callbacks were dropped (savepoint rollback past a synced
    /// write, or a redo sync failure). The transaction may still abort, but
    /// never commit.
    PartialRollbacked = 4,
}

impl EndCode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EndCode::Ok,
            1 => EndCode::Committed,
            2 => EndCode::Rollbacked,
            3 => EndCode::Killed,
            _ => EndCode::PartialRollbacked,
        }
    }

    /// Whether the context still accepts finalization.
    pub fn is_active(self) -> bool {
        matches!(self, EndCode::Ok | EndCode::PartialRollbacked)
    }
}

/// Per-statement and per-transaction row counters, kept when sql audit is
/// enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxAuditStat {
    pub insert_rows: u64,
    pub update_rows: u64,
    pub delete_rows: u64,
    pub lock_rows: u64,
}

impl TxAuditStat {
    fn add(&mut self, other: &TxAuditStat) {
        self.insert_rows += other.insert_rows;
        self.update_rows += other.update_rows;
        self.delete_rows += other.delete_rows;
        self.lock_rows += other.lock_rows;
    }
}

#[derive(Default)]
struct AuditState {
    stmt: TxAuditStat,
    total: TxAuditStat,
}

const MAX_CONFLICT_TXS: usize = 32;

struct LogState {
    callbacks: Vec<TxCallback>,
    /// Next callback to pack into a redo record.
    generated_pos: usize,
    /// Number of callbacks acknowledged by the log layer. Invariant:
    /// `synced_pos <= generated_pos <= callbacks.len()`.
    synced_pos: usize,
    /// Number of callbacks folded into `checksum`. Advances with
    /// `synced_pos`.
    folded_pos: usize,
    checksum: u32,
    checksum_scn: Scn,
}

impl LogState {
    fn new() -> Self {
        Self {
            callbacks: Vec::new(),
            generated_pos: 0,
            synced_pos: 0,
            folded_pos: 0,
            checksum: 0,
            checksum_scn: Scn::MIN,
        }
    }

    fn fold_one(&mut self, idx: usize) {
        let mut buf = Vec::with_capacity(self.callbacks[idx].redo_len());
        self.callbacks[idx].encode_redo(&mut buf);
        self.checksum = crc32c_append(self.checksum, &buf);
    }
}

pub struct MemtableCtx {
    tx_id: TxId,
    ls_id: LogStreamId,
    config: Arc<EngineConfig>,

    latch: RwLock<()>,
    state: Mutex<LogState>,

    end_code: AtomicU8,
    is_master: AtomicBool,
    is_read_only: AtomicBool,
    seq_gen: AtomicU64,

    pending_log_size: AtomicUsize,
    flushed_log_size: AtomicUsize,
    cb_alloc_cnt: AtomicU64,
    cb_free_cnt: AtomicU64,

    lock_ctx: Mutex<TableLockMemCtx>,
    audit: Mutex<AuditState>,
    conflict_txs: Mutex<Vec<TxId>>,
    replay_bracket: Mutex<Option<Scn>>,
}

/// Holds the context's write latch. Dropping it is `write_done`.
#[derive(Debug)]
pub struct WriteAuth<'a> {
    _guard: AuthGuard<'a>,
}

#[derive(Debug)]
enum AuthGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

impl<'a> WriteAuth<'a> {
    pub fn write_done(self) {}
}

impl MemtableCtx {
    pub fn new(tx_id: TxId, ls_id: LogStreamId, config: Arc<EngineConfig>, is_master: bool) -> Self {
        Self {
            tx_id,
            ls_id,
            config,
            latch: RwLock::new(()),
            state: Mutex::new(LogState::new()),
            end_code: AtomicU8::new(EndCode::Ok as u8),
            is_master: AtomicBool::new(is_master),
            is_read_only: AtomicBool::new(false),
            seq_gen: AtomicU64::new(0),
            pending_log_size: AtomicUsize::new(0),
            flushed_log_size: AtomicUsize::new(0),
            cb_alloc_cnt: AtomicU64::new(0),
            cb_free_cnt: AtomicU64::new(0),
            lock_ctx: Mutex::new(TableLockMemCtx::default()),
            audit: Mutex::new(AuditState::default()),
            conflict_txs: Mutex::new(Vec::new()),
            replay_bracket: Mutex::new(None),
        }
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub fn ls_id(&self) -> LogStreamId {
        self.ls_id
    }

    pub fn end_code(&self) -> EndCode {
        EndCode::from_u8(self.end_code.load(Ordering::Acquire))
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self) {
        self.is_read_only.store(true, Ordering::Release);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------ write path

    /// Acquire the write latch and verify the context accepts writes.
    ///
    /// Try-lock first, then block; the precondition checks run under the
    /// latch either way, so a context can never be latched after it ended.
    pub fn write_auth(&self, exclusive: bool) -> Result<WriteAuth<'_>> {
        let guard = if exclusive {
            AuthGuard::Exclusive(self.latch.try_write().unwrap_or_else(|| self.latch.write()))
        } else {
            AuthGuard::Shared(self.latch.try_read().unwrap_or_else(|| self.latch.read()))
        };
        if self.is_read_only.load(Ordering::Acquire) {
            return Err(TxError::ReadOnly.into());
        }
        match self.end_code() {
            EndCode::Ok => {}
            other => return Err(TxError::AlreadyEnded(other).into()),
        }
        if !self.is_master() {
            return Err(TxError::NotMaster.into());
        }
        Ok(WriteAuth { _guard: guard })
    }

    /// Release and immediately reacquire the latch, giving a queued
    /// exclusive waiter (e.g. a killer) a chance to run.
    pub fn write_lock_yield<'a>(&'a self, auth: WriteAuth<'a>) -> Result<WriteAuth<'a>> {
        let exclusive = matches!(auth._guard, AuthGuard::Exclusive(_));
        drop(auth);
        self.write_auth(exclusive)
    }

    pub(crate) fn alloc_seq_no(&self) -> SeqNo {
        SeqNo(self.seq_gen.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// The highest seq-no handed out so far.
    pub fn current_seq_no(&self) -> SeqNo {
        SeqNo(self.seq_gen.load(Ordering::Acquire))
    }

    pub(crate) fn register_callback(&self, cb: TxCallback) {
        let size = cb.redo_len();
        if let TxCallback::Row { op, .. } = &cb {
            self.audit_row(*op);
        }
        let mut st = self.state.lock();
        st.callbacks.push(cb);
        drop(st);
        self.cb_alloc_cnt.fetch_add(1, Ordering::AcqRel);
        self.pending_log_size.fetch_add(size, Ordering::AcqRel);
    }

    /// Append a callback that is already durable (replay path): cursors and
    /// checksum advance immediately.
    pub(crate) fn register_replayed_callback(&self, cb: TxCallback) {
        debug_assert_eq!(cb.state(), CbState::Synced);
        let scn = cb.scn().unwrap_or(Scn::MIN);
        let mut st = self.state.lock();
        st.callbacks.push(cb);
        let idx = st.callbacks.len() - 1;
        st.fold_one(idx);
        st.generated_pos = idx + 1;
        st.synced_pos = idx + 1;
        st.folded_pos = idx + 1;
        st.checksum_scn = st.checksum_scn.max(scn);
        drop(st);
        self.cb_alloc_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn add_lock_record(&self, op: TableLockOp) {
        self.lock_ctx.lock().add_lock_record(op.clone());
        self.register_callback(TxCallback::LockOp {
            op,
            memtable: std::sync::Weak::new(),
            scn: None,
            state: CbState::Pending,
        });
    }

    pub fn replay_add_lock_record(&self, op: TableLockOp, scn: Scn) {
        self.lock_ctx.lock().add_lock_record(op.clone());
        self.register_replayed_callback(TxCallback::LockOp {
            op,
            memtable: std::sync::Weak::new(),
            scn: Some(scn),
            state: CbState::Synced,
        });
    }

    /// Record a tablet-seq sync produced during replay.
    pub fn replay_sync_tablet_seq(&self, tablet_id: TabletId, new_seq: u64, scn: Scn) {
        let seq_no = self.alloc_seq_no();
        self.register_replayed_callback(TxCallback::SyncTabletSeq {
            seq_no,
            tablet_id,
            new_seq,
            scn: Some(scn),
            state: CbState::Synced,
        });
    }

    // -------------------------------------------------------------- counters

    pub fn unsubmitted_cnt(&self) -> usize {
        let st = self.state.lock();
        st.callbacks.len() - st.generated_pos
    }

    pub fn unsynced_cnt(&self) -> usize {
        let st = self.state.lock();
        st.generated_pos - st.synced_pos
    }

    pub fn callback_cnt(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    pub fn pending_log_size(&self) -> usize {
        self.pending_log_size.load(Ordering::Acquire)
    }

    pub fn flushed_log_size(&self) -> usize {
        self.flushed_log_size.load(Ordering::Acquire)
    }

    /// Whether pending redo crossed the configured packing threshold.
    pub fn pending_log_size_overflow(&self) -> bool {
        let threshold = self.config.private_buffer_size();
        threshold > 0 && self.pending_log_size() > threshold
    }

    // ---------------------------------------------------------- redo packing

    /// Pack callbacks beyond the "generated" cursor into `buf`, producing at
    /// most one redo record of bounded size.
    ///
    /// Returns [`StorageError::Eagain`] when there is nothing to fill, or
    /// when the next callback would not fit (the packed prefix, if any, is
    /// recorded in `helper` and must be submitted before retrying). A single
    /// callback larger than the bound fails with `TooBigRowsize`.
    ///
    /// Lock-op callbacks are packed only when `log_for_lock_node` is set;
    /// an unpacked lock node stops the fill, and the driver alternates.
    pub fn fill_redo_log(
        &self,
        buf: &mut Vec<u8>,
        helper: &mut RedoSubmitHelper,
        log_for_lock_node: bool,
    ) -> Result<()> {
        helper.reset();
        let st = self.state.lock();
        let first = st.generated_pos;
        if first >= st.callbacks.len() {
            return Err(StorageError::Eagain);
        }

        let mut last = None;
        let mut packed = 0usize;
        let mut data_size = 0usize;
        for (idx, cb) in st.callbacks.iter().enumerate().skip(first) {
            if cb.is_lock_node() && !log_for_lock_node {
                break;
            }
            let len = cb.redo_len();
            if len > MAX_REDO_PAYLOAD {
                if packed == 0 {
                    return Err(DmlError::TooBigRowsize { size: len }.into());
                }
                break;
            }
            if buf.len() + len > MAX_REDO_PAYLOAD {
                break;
            }
            cb.encode_redo(buf);
            data_size += len;
            packed += 1;
            last = Some(idx);
        }
        drop(st);

        let Some(last) = last else {
            // Either a lock node blocked the very first callback, or the
            // buffer is already at the bound.
            return Err(StorageError::Eagain);
        };
        helper.scope = Some(CallbackScope { first, last });
        helper.data_size = data_size;
        helper.callback_cnt = packed;

        let drained = {
            let st = self.state.lock();
            last + 1 == st.callbacks.len()
        };
        if drained {
            Ok(())
        } else {
            Err(StorageError::Eagain)
        }
    }

    /// Drive the full redo pipeline until the callback list is drained:
    /// fill a record, append it through `handler`, mark it submitted and
    /// synced. Alternates lock-node packing the way the transaction layer
    /// does.
    pub fn submit_log(&self, handler: &dyn LogHandler) -> Result<()> {
        let mut helper = RedoSubmitHelper::default();
        let mut log_for_lock_node = false;
        let mut empty_rounds = 0;
        while empty_rounds < 2 {
            let mut buf = Vec::new();
            LogBaseHeader::new(LogBaseType::TxRedo).encode(&mut buf);
            match self.fill_redo_log(&mut buf, &mut helper, log_for_lock_node) {
                Ok(()) => {
                    self.dispatch_record(handler, &buf, &helper)?;
                    return Ok(());
                }
                Err(StorageError::Eagain) => {
                    if helper.callback_cnt > 0 {
                        self.dispatch_record(handler, &buf, &helper)?;
                        empty_rounds = 0;
                    } else {
                        empty_rounds += 1;
                    }
                    log_for_lock_node = !log_for_lock_node;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn dispatch_record(
        &self,
        handler: &dyn LogHandler,
        buf: &[u8],
        helper: &RedoSubmitHelper,
    ) -> Result<()> {
        let Some(scope) = helper.scope else {
            return Ok(());
        };
        self.log_submitted(helper)?;
        match handler.append(buf) {
            Ok(scn) => self.sync_log_succ(scn, &scope),
            Err(e) => {
                self.sync_log_fail(&scope);
                Err(e)
            }
        }
    }

    /// Advance the "generated" cursor past the callbacks packed into
    /// `helper` and release their share of the pending-log budget.
    pub fn log_submitted(&self, helper: &RedoSubmitHelper) -> Result<()> {
        let Some(scope) = helper.scope else {
            return Ok(());
        };
        let mut st = self.state.lock();
        if scope.first != st.generated_pos {
            return Err(StorageError::Unexpected(format!(
                "out-of-order log_submitted: scope.first={} generated_pos={}",
                scope.first, st.generated_pos
            )));
        }
        for cb in &mut st.callbacks[scope.first..=scope.last] {
            cb.set_state(CbState::Submitted);
        }
        st.generated_pos = scope.last + 1;
        drop(st);
        self.pending_log_size.fetch_sub(helper.data_size, Ordering::AcqRel);
        self.flushed_log_size.fetch_add(helper.data_size, Ordering::AcqRel);
        Ok(())
    }

    /// The log layer acknowledged the record holding `scope`: stamp the
    /// durable scn, advance the synced cursor, fold the checksum.
    ///
    /// A no-op when the transaction was already finalized (unless partially
    /// rollbacked, where bookkeeping must continue).
    pub fn sync_log_succ(&self, scn: Scn, scope: &CallbackScope) -> Result<()> {
        let code = self.end_code();
        if !(code == EndCode::Ok || code == EndCode::PartialRollbacked) {
            log::info!(
                "redo sync after trans end ignored: tx={} end_code={code:?} scn={scn}",
                self.tx_id
            );
            return Ok(());
        }
        let mut st = self.state.lock();
        if scope.first != st.synced_pos {
            return Err(StorageError::Unexpected(format!(
                "out-of-order sync_log_succ: scope.first={} synced_pos={}",
                scope.first, st.synced_pos
            )));
        }
        for idx in scope.first..=scope.last {
            st.callbacks[idx].set_scn(scn);
            st.callbacks[idx].set_state(CbState::Synced);
            st.fold_one(idx);
        }
        st.synced_pos = scope.last + 1;
        st.folded_pos = st.synced_pos;
        st.checksum_scn = st.checksum_scn.max(scn);
        Ok(())
    }

    /// The log layer failed the record holding `scope`: the context becomes
    /// partially rollbacked and the affected callbacks are dropped.
    pub fn sync_log_fail(&self, scope: &CallbackScope) {
        self.set_partial_rollbacked();
        let code = self.end_code();
        if !(code == EndCode::Ok || code == EndCode::PartialRollbacked) {
            log::info!(
                "redo sync-fail after trans end ignored: tx={} end_code={code:?}",
                self.tx_id
            );
            return;
        }
        let mut st = self.state.lock();
        let removed = self.remove_range(&mut st, scope.first, scope.last);
        log::warn!(
            "redo sync failed, dropped {removed} callbacks: tx={} scope={scope:?}",
            self.tx_id
        );
    }

    fn set_partial_rollbacked(&self) {
        let _ = self.end_code.compare_exchange(
            EndCode::Ok as u8,
            EndCode::PartialRollbacked as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Remove callbacks `[first..=last]` from the list, undoing their
    /// staged memtable writes and fixing the cursors. Caller holds the log
    /// state lock.
    fn remove_range(&self, st: &mut LogState, first: usize, last: usize) -> usize {
        let last = last.min(st.callbacks.len().saturating_sub(1));
        if first > last || st.callbacks.is_empty() {
            return 0;
        }
        for cb in &st.callbacks[first..=last] {
            Self::undo_callback(self.tx_id, cb);
        }
        let removed = last - first + 1;
        st.callbacks.drain(first..=last);
        let adjust = |pos: usize| {
            if pos <= first {
                pos
            } else {
                first.max(pos - removed)
            }
        };
        st.generated_pos = adjust(st.generated_pos);
        st.synced_pos = adjust(st.synced_pos);
        st.folded_pos = adjust(st.folded_pos);
        self.cb_free_cnt.fetch_add(removed as u64, Ordering::AcqRel);
        removed
    }

    fn undo_callback(tx_id: TxId, cb: &TxCallback) {
        if let TxCallback::Row {
            seq_no,
            key,
            memtable,
            ..
        } = cb
        {
            if let Some(mt) = memtable.upgrade() {
                mt.abort_write(tx_id, *seq_no, key);
            }
        }
    }

    // ------------------------------------------------------------- checksums

    pub fn checksum(&self) -> u32 {
        self.state.lock().checksum
    }

    pub fn checksum_scn(&self) -> Scn {
        self.state.lock().checksum_scn
    }

    /// Fold every remaining callback into the running checksum and return
    /// it. Used at commit to compare against the coordinator's value.
    pub fn calc_checksum_all(&self) -> u32 {
        let mut st = self.state.lock();
        for idx in st.folded_pos..st.callbacks.len() {
            st.fold_one(idx);
        }
        st.folded_pos = st.callbacks.len();
        st.checksum
    }

    /// Fold all callbacks durable at or below `scn`. Whole-callback
    /// granularity: a callback split across records counts once its last
    /// fragment is synced.
    pub fn calc_checksum_before_scn(&self, scn: Scn) -> (u32, Scn) {
        let mut st = self.state.lock();
        while st.folded_pos < st.synced_pos {
            let idx = st.folded_pos;
            match st.callbacks[idx].scn() {
                Some(cb_scn) if cb_scn <= scn => {
                    st.fold_one(idx);
                    st.folded_pos += 1;
                    st.checksum_scn = st.checksum_scn.max(cb_scn);
                }
                _ => break,
            }
        }
        (st.checksum, st.checksum_scn)
    }

    // ------------------------------------------------------------- lifecycle

    /// Finalize the transaction.
    ///
    /// Commit requires every callback synced and no partial rollback; it
    /// stamps each staged write with `trans_version`. Abort undoes every
    /// staged write. Either way the table locks are resolved and the audit
    /// cache is dropped.
    pub fn trans_end(&self, commit: bool, trans_version: Version, final_scn: Scn) -> Result<()> {
        let _latch = self.latch.write();
        let code = self.end_code();
        if !code.is_active() {
            return Err(TxError::AlreadyEnded(code).into());
        }
        if commit && code == EndCode::PartialRollbacked {
            return Err(TxError::PartialRollbacked.into());
        }
        if commit {
            let unsynced = self.unsynced_cnt() + self.unsubmitted_cnt();
            if unsynced != 0 && self.is_master() {
                return Err(TxError::UnsyncedRemain { unsynced }.into());
            }
        }
        self.do_trans_end(
            commit,
            trans_version,
            final_scn,
            if commit {
                EndCode::Committed
            } else {
                EndCode::Rollbacked
            },
        )
    }

    /// Replay-side finalization: on commit, the callback checksum must match
    /// the coordinator's `expected_checksum`. A mismatch is fatal unless
    /// downgraded by configuration.
    pub fn replay_trans_end(
        &self,
        commit: bool,
        trans_version: Version,
        final_scn: Scn,
        expected_checksum: u32,
    ) -> Result<()> {
        let _latch = self.latch.write();
        let code = self.end_code();
        if !code.is_active() {
            return Err(TxError::AlreadyEnded(code).into());
        }
        if commit {
            let calculated = self.calc_checksum_all();
            if calculated != expected_checksum {
                if self.config.ignore_replay_checksum_error() {
                    log::warn!(
                        "replay checksum mismatch ignored: tx={} expected={expected_checksum:#x} calculated={calculated:#x}",
                        self.tx_id
                    );
                } else {
                    log::error!(
                        "replay checksum mismatch: tx={} expected={expected_checksum:#x} calculated={calculated:#x}",
                        self.tx_id
                    );
                    return Err(TxError::Checksum {
                        expected: expected_checksum,
                        calculated,
                    }
                    .into());
                }
            }
        }
        self.do_trans_end(
            commit,
            trans_version,
            final_scn,
            if commit {
                EndCode::Committed
            } else {
                EndCode::Rollbacked
            },
        )
    }

    /// Kill the transaction: immediate abort effects, final state `Killed`.
    pub fn trans_kill(&self) -> Result<()> {
        let _latch = self.latch.write();
        let code = self.end_code();
        if !code.is_active() {
            return Err(TxError::AlreadyEnded(code).into());
        }
        self.do_trans_end(false, Version::MIN, Scn::MIN, EndCode::Killed)
    }

    fn do_trans_end(
        &self,
        commit: bool,
        trans_version: Version,
        final_scn: Scn,
        target: EndCode,
    ) -> Result<()> {
        let mut st = self.state.lock();
        let callbacks = std::mem::take(&mut st.callbacks);
        for cb in &callbacks {
            match cb {
                TxCallback::Row {
                    seq_no,
                    key,
                    memtable,
                    scn,
                    ..
                } => {
                    if let Some(mt) = memtable.upgrade() {
                        if commit {
                            mt.commit_write(
                                self.tx_id,
                                *seq_no,
                                key,
                                trans_version,
                                scn.unwrap_or(final_scn),
                            );
                        } else {
                            mt.abort_write(self.tx_id, *seq_no, key);
                        }
                    }
                }
                TxCallback::LockOp { .. } | TxCallback::SyncTabletSeq { .. } => {}
            }
        }
        self.cb_free_cnt.fetch_add(callbacks.len() as u64, Ordering::AcqRel);
        st.generated_pos = 0;
        st.synced_pos = 0;
        st.folded_pos = 0;
        drop(st);

        self.lock_ctx
            .lock()
            .clear_table_lock(commit, trans_version, final_scn);
        {
            let mut audit = self.audit.lock();
            if commit && self.config.sql_audit() {
                let stmt = audit.stmt;
                audit.total.add(&stmt);
                log::trace!("tx {} audit: {:?}", self.tx_id, audit.total);
            }
            *audit = AuditState::default();
        }
        self.pending_log_size.store(0, Ordering::Release);
        self.end_code.store(target as u8, Ordering::Release);
        Ok(())
    }

    /// Detach everything so the context can be reused or destroyed. Valid
    /// only after finalization.
    pub fn trans_clear(&self) -> Result<()> {
        let code = self.end_code();
        if code.is_active() {
            return Err(StorageError::Unexpected(
                "trans_clear on an active context".into(),
            ));
        }
        let mut st = self.state.lock();
        st.callbacks.clear();
        st.generated_pos = 0;
        st.synced_pos = 0;
        st.folded_pos = 0;
        Ok(())
    }

    // ------------------------------------------------------ partial rollback

    /// Remove callbacks with seq-no in `(to_seq_no, from_seq_no]` and roll
    /// back the matching lock records.
    ///
    /// If any removed callback was already synced, commit is no longer
    /// possible. Calling again with the same arguments removes nothing.
    pub fn rollback(&self, to_seq_no: SeqNo, from_seq_no: SeqNo) -> Result<()> {
        if to_seq_no > from_seq_no {
            return Err(StorageError::InvalidArgument("rollback seq range inverted"));
        }
        let _latch = self.latch.write();
        let code = self.end_code();
        if !code.is_active() {
            return Err(TxError::AlreadyEnded(code).into());
        }

        let mut st = self.state.lock();
        let in_range = |cb: &TxCallback| {
            let seq = cb.seq_no();
            seq > to_seq_no && seq <= from_seq_no
        };
        let mut touched_synced = false;
        let mut removed = 0usize;
        let mut idx = 0;
        while idx < st.callbacks.len() {
            if in_range(&st.callbacks[idx]) {
                if st.callbacks[idx].state() == CbState::Synced {
                    touched_synced = true;
                }
                Self::undo_callback(self.tx_id, &st.callbacks[idx]);
                st.callbacks.remove(idx);
                let fix = |pos: usize| if pos > idx { pos - 1 } else { pos };
                st.generated_pos = fix(st.generated_pos);
                st.synced_pos = fix(st.synced_pos);
                st.folded_pos = fix(st.folded_pos);
                removed += 1;
            } else {
                idx += 1;
            }
        }
        // Reset the generator to the earliest remaining un-synced callback.
        st.generated_pos = st.generated_pos.min(st.callbacks.len());
        st.synced_pos = st.synced_pos.min(st.generated_pos);
        drop(st);

        self.cb_free_cnt.fetch_add(removed as u64, Ordering::AcqRel);
        self.lock_ctx.lock().rollback_table_lock(to_seq_no);
        if touched_synced {
            self.set_partial_rollbacked();
        }
        log::debug!(
            "rollback tx={} range=({},{}] removed={removed} partial={}",
            self.tx_id,
            to_seq_no,
            from_seq_no,
            touched_synced
        );
        Ok(())
    }

    /// Drop every callback not yet submitted to the log (leader revoke).
    /// The context becomes partially rollbacked if anything was dropped.
    pub fn clean_unlog_callbacks(&self) -> Result<usize> {
        let mut st = self.state.lock();
        let first = st.generated_pos;
        let len = st.callbacks.len();
        if first >= len {
            return Ok(0);
        }
        let removed = self.remove_range(&mut st, first, len - 1);
        drop(st);
        if removed > 0 {
            self.set_partial_rollbacked();
        }
        Ok(removed)
    }

    // ------------------------------------------------- leader <-> follower

    pub fn replay_begin(&self, scn: Scn) -> Result<()> {
        if self.is_master() {
            return Err(StorageError::Unexpected("replay_begin on master".into()));
        }
        *self.replay_bracket.lock() = Some(scn);
        Ok(())
    }

    /// Close a replay bracket. On failure, every callback stamped with this
    /// record's scn is removed.
    pub fn replay_end(&self, is_succ: bool, scn: Scn) -> Result<()> {
        let bracket = self.replay_bracket.lock().take();
        if bracket != Some(scn) {
            return Err(StorageError::Unexpected(format!(
                "replay_end scn {scn} does not match open bracket {bracket:?}"
            )));
        }
        if is_succ {
            return Ok(());
        }
        let mut st = self.state.lock();
        let mut removed = 0usize;
        let mut idx = 0;
        while idx < st.callbacks.len() {
            if st.callbacks[idx].scn() == Some(scn) {
                Self::undo_callback(self.tx_id, &st.callbacks[idx]);
                st.callbacks.remove(idx);
                let fix = |pos: usize| if pos > idx { pos - 1 } else { pos };
                st.generated_pos = fix(st.generated_pos);
                st.synced_pos = fix(st.synced_pos);
                st.folded_pos = fix(st.folded_pos);
                removed += 1;
            } else {
                idx += 1;
            }
        }
        drop(st);
        self.cb_free_cnt.fetch_add(removed as u64, Ordering::AcqRel);
        log::warn!("replay failed at scn={scn}, dropped {removed} callbacks");
        Ok(())
    }

    /// Leader takeover: the context switches from replay to active duty.
    /// Requires every callback synced; resets a partial-rollback mark left
    /// by replay, after verification that nothing is in flight.
    pub fn replay_to_commit(&self) -> Result<()> {
        let _latch = self.latch.write();
        let unsynced = self.unsynced_cnt();
        if unsynced != 0 {
            return Err(TxError::UnsyncedRemain { unsynced }.into());
        }
        {
            let mut st = self.state.lock();
            let len = st.callbacks.len();
            st.generated_pos = len;
            st.synced_pos = len;
        }
        let _ = self.end_code.compare_exchange(
            EndCode::PartialRollbacked as u8,
            EndCode::Ok as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.is_master.store(true, Ordering::Release);
        self.pending_log_size.store(0, Ordering::Release);
        log::info!("replay to commit: tx={}", self.tx_id);
        Ok(())
    }

    /// Leader revoke: back to replay. The callback list is already in
    /// append order, so replay observes the same order the writers did.
    pub fn commit_to_replay(&self) {
        self.is_master.store(false, Ordering::Release);
        let _latch = self.latch.write();
        log::info!("commit to replay: tx={}", self.tx_id);
    }

    // ------------------------------------------------------- schema elapse

    /// `Eagain` while this context still has unresolved writes on
    /// `tablet_id` predating `schema_version`.
    pub fn check_modify_schema_elapsed(
        &self,
        tablet_id: TabletId,
        schema_version: tabletdb_primitives::SchemaVersion,
    ) -> Result<()> {
        if !self.end_code().is_active() {
            return Ok(());
        }
        let st = self.state.lock();
        let touches = st.callbacks.iter().any(|cb| cb.tablet_id() == tablet_id);
        if touches {
            log::debug!(
                "schema change waiting on tx {}: tablet={tablet_id} version={schema_version}",
                self.tx_id
            );
            return Err(StorageError::Eagain);
        }
        Ok(())
    }

    /// `Eagain` while this context still has writes on `tablet_id`.
    pub fn check_modify_time_elapsed(&self, tablet_id: TabletId) -> Result<()> {
        if !self.end_code().is_active() {
            return Ok(());
        }
        let st = self.state.lock();
        if st.callbacks.iter().any(|cb| cb.tablet_id() == tablet_id) {
            return Err(StorageError::Eagain);
        }
        Ok(())
    }

    // ----------------------------------------------------- conflicts, audit

    pub(crate) fn add_conflict_tx(&self, holder: TxId) {
        let mut txs = self.conflict_txs.lock();
        if txs.len() < MAX_CONFLICT_TXS && !txs.contains(&holder) {
            txs.push(holder);
        }
    }

    pub(crate) fn reset_conflict_txs(&self) {
        self.conflict_txs.lock().clear();
    }

    /// Transactions this context is currently blocked behind; feeds the
    /// deadlock detector.
    pub fn get_conflict_txs(&self) -> Vec<TxId> {
        self.conflict_txs.lock().clone()
    }

    fn audit_row(&self, op: DmlOp) {
        if !self.config.sql_audit() {
            return;
        }
        let mut audit = self.audit.lock();
        match op {
            DmlOp::Insert => audit.stmt.insert_rows += 1,
            DmlOp::Update => audit.stmt.update_rows += 1,
            DmlOp::Delete => audit.stmt.delete_rows += 1,
            DmlOp::Lock => audit.stmt.lock_rows += 1,
        }
    }

    /// Fold the running statement's counters into the transaction totals
    /// (or drop them when the statement failed).
    pub fn stmt_end(&self, succeeded: bool) {
        let mut audit = self.audit.lock();
        if succeeded {
            let stmt = audit.stmt;
            audit.total.add(&stmt);
        }
        audit.stmt = TxAuditStat::default();
    }

    pub fn audit_total(&self) -> TxAuditStat {
        self.audit.lock().total
    }

    // -------------------------------------------------------------- locking

    pub fn lock_ctx(&self) -> &Mutex<TableLockMemCtx> {
        &self.lock_ctx
    }

    pub fn get_table_lock_store_info(&self) -> TableLockInfo {
        let scn = self.checksum_scn();
        self.lock_ctx.lock().get_table_lock_store_info(scn)
    }

    pub fn recover_from_table_lock_info(&self, info: &TableLockInfo) {
        self.lock_ctx.lock().recover_from_table_lock_info(info);
    }
}

impl Drop for MemtableCtx {
    /// A context may only be destroyed once nothing is in flight. Anything
    /// else means redo could land on freed state: log and abort.
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        if self.end_code().is_active() && self.callback_cnt() == 0 {
            // Never-used context, nothing to check.
            return;
        }
        let unsubmitted = self.unsubmitted_cnt();
        let unsynced = self.unsynced_cnt();
        if unsubmitted != 0 || unsynced != 0 {
            log::error!(
                "memtable context destroyed with redo in flight: tx={} unsubmitted={unsubmitted} unsynced={unsynced}",
                self.tx_id
            );
            panic!("memtable context destroyed with redo in flight");
        }
        let alloc = self.cb_alloc_cnt.load(Ordering::Acquire);
        let freed = self.cb_free_cnt.load(Ordering::Acquire);
        if alloc != freed {
            log::error!(
                "callback alloc/free imbalance on context teardown: tx={} alloc={alloc} free={freed}",
                self.tx_id
            );
        }
    }
}

impl std::fmt::Debug for MemtableCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemtableCtx")
            .field("tx_id", &self.tx_id)
            .field("ls_id", &self.ls_id)
            .field("end_code", &self.end_code())
            .field("is_master", &self.is_master())
            .field("callbacks", &self.callback_cnt())
            .field("unsubmitted", &self.unsubmitted_cnt())
            .field("unsynced", &self.unsynced_cnt())
            .finish()
    }
}
