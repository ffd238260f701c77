//! Per-log-stream tablet service.
//!
//! The owning surface for every tablet operation on one log stream:
//! lifecycle (create/remove/migrate/rebuild), table-store swaps, DML entry
//! points, snapshot scans, and the SLOG write-then-swap protocol that makes
//! metadata changes durable before they become visible.
//!
//! Publication discipline: build the successor tablet, append the SLOG
//! batch, then compare-and-swap the pointer map. A SLOG failure leaves the
//! pre-mutation object authoritative; a swap failure after a successful
//! SLOG write is a fatal invariant break.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tabletdb_primitives::{LogStreamId, Scn, TabletId, TabletKey, TxId, Version};
use tabletdb_slog::{DiskAddr, Replay, SlogRecord, SlogWriter};

use crate::config::EngineConfig;
use crate::datum::Row;
use crate::error::{Result, StorageError, TabletError};
use crate::memtable::redo::LogHandler;
use crate::memtable::{MemtableCtx, MultiSourceData};
use crate::schema::StorageSchema;
use crate::service::dml::{
    check_old_row_legitimacy, translate_batch_error, DmlFlags, DmlParam, DmlRunningCtx,
};
use crate::service::lob::{is_lob_candidate, InRowLobManager, LobAccessParam, SharedLobManager};
use crate::service::scan::{TableScanParam, TabletScanIter};
use crate::tablet::meta::{TabletMeta, TabletStatus, TxData};
use crate::tablet::{
    MacroBlockRegistry, Tablet, TabletBuildParam, TabletHandle, TabletPointerMap,
    TabletUpdateParam, TableStore,
};

/// One tablet of a batch-create request.
pub struct CreateTabletArg {
    pub tablet_id: TabletId,
    pub data_tablet_id: TabletId,
    pub schema: StorageSchema,
    pub binding_info: crate::tablet::BindingInfo,
    pub snapshot_version: Version,
}

/// A full transported tablet image (migration, rebuild).
pub struct MigrationParam {
    pub meta: TabletMeta,
    pub schema: StorageSchema,
    pub table_store: TableStore,
}

pub struct TabletService {
    ls_id: LogStreamId,
    config: Arc<EngineConfig>,
    pointer_map: TabletPointerMap,
    slog: Mutex<SlogWriter<Box<dyn Write + Send>>>,
    log_handler: Arc<dyn LogHandler>,
    lob_mgr: SharedLobManager,
    macro_registry: Arc<MacroBlockRegistry>,
    /// Serializes SLOG-producing operations; DML and reads do not take it.
    lifecycle_lock: Mutex<()>,
    is_offline: AtomicBool,
}

impl TabletService {
    pub fn new(
        ls_id: LogStreamId,
        config: Arc<EngineConfig>,
        slog_sink: Box<dyn Write + Send>,
        log_handler: Arc<dyn LogHandler>,
    ) -> Self {
        Self {
            ls_id,
            config,
            pointer_map: TabletPointerMap::new(),
            slog: Mutex::new(SlogWriter::new(slog_sink)),
            log_handler,
            lob_mgr: Arc::new(InRowLobManager),
            macro_registry: Arc::new(MacroBlockRegistry::default()),
            lifecycle_lock: Mutex::new(()),
            is_offline: AtomicBool::new(false),
        }
    }

    pub fn with_lob_manager(mut self, lob_mgr: SharedLobManager) -> Self {
        self.lob_mgr = lob_mgr;
        self
    }

    pub fn ls_id(&self) -> LogStreamId {
        self.ls_id
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn log_handler(&self) -> &Arc<dyn LogHandler> {
        &self.log_handler
    }

    pub fn macro_registry(&self) -> &Arc<MacroBlockRegistry> {
        &self.macro_registry
    }

    pub fn tablet_count(&self) -> usize {
        self.pointer_map.tablet_count()
    }

    fn key(&self, tablet_id: TabletId) -> TabletKey {
        TabletKey::new(self.ls_id, tablet_id)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_offline.load(Ordering::Acquire) {
            return Err(StorageError::NotInit);
        }
        Ok(())
    }

    // ------------------------------------------------------------ resolution

    pub fn get_tablet(&self, tablet_id: TabletId) -> Result<TabletHandle> {
        let key = self.key(tablet_id);
        self.pointer_map
            .acquire_tablet(&key)
            .ok_or_else(|| TabletError::NotExist(key).into())
    }

    /// Resolve a tablet, bounded by an absolute deadline. The deadline only
    /// matters when a concurrent swap holds the bucket; an absent tablet
    /// fails immediately.
    pub fn get_tablet_with_timeout(
        &self,
        tablet_id: TabletId,
        timeout: Instant,
    ) -> Result<TabletHandle> {
        if Instant::now() > timeout {
            return Err(StorageError::Timeout);
        }
        self.get_tablet(tablet_id)
    }

    // ----------------------------------------------------------- publication

    /// Write-then-swap: persist a PutTablet record, then publish. The swap
    /// is infallible given the SLOG token; see the pointer map.
    fn persist_and_publish(
        &self,
        tablet: Tablet,
        old: Option<&TabletHandle>,
    ) -> Result<TabletHandle> {
        let key = tablet.key();
        let mut image = Vec::new();
        tablet.serialize(&mut image);
        let addr = DiskAddr::memory(image.len() as u64);
        let _token = self
            .slog
            .lock()
            .append(&[SlogRecord::PutTablet { addr, image }])?;
        let handle = Arc::new(tablet);
        self.pointer_map
            .compare_and_swap_tablet(&key, addr, old, Arc::clone(&handle))?;
        Ok(handle)
    }

    // ------------------------------------------------------------- lifecycle

    /// Create every tablet in `args` at `create_scn`: build, one SLOG batch,
    /// then publish each. Replay skips tablets that already exist.
    pub fn batch_create_tablets(
        &self,
        mut args: Vec<CreateTabletArg>,
        create_scn: Scn,
        is_replay: bool,
    ) -> Result<usize> {
        self.check_running()?;
        let _lifecycle = self.lifecycle_lock.lock();
        // Deterministic multi-bucket order, so concurrent batches cannot
        // deadlock on bucket locks.
        args.sort_by_key(|arg| {
            let key = self.key(arg.tablet_id);
            (self.pointer_map.bucket_index(&key), arg.tablet_id)
        });

        let mut pending = Vec::new();
        for arg in args {
            let key = self.key(arg.tablet_id);
            if self.pointer_map.contains(&key) {
                if is_replay {
                    log::debug!("replay create skips existing tablet {key}");
                    continue;
                }
                return Err(TabletError::Exist(key).into());
            }
            let compat_mode = arg.schema.compat_mode;
            let tablet = Tablet::init_create(
                TabletBuildParam {
                    key,
                    data_tablet_id: arg.data_tablet_id,
                    binding_info: arg.binding_info,
                    create_scn,
                    snapshot_version: arg.snapshot_version,
                    schema: arg.schema,
                    compat_mode,
                },
                &self.macro_registry,
            )?;
            pending.push(tablet);
        }
        if pending.is_empty() {
            return Ok(0);
        }

        let mut records = Vec::with_capacity(pending.len());
        let mut addrs = Vec::with_capacity(pending.len());
        for tablet in &pending {
            let mut image = Vec::new();
            tablet.serialize(&mut image);
            let addr = DiskAddr::memory(image.len() as u64);
            addrs.push(addr);
            records.push(SlogRecord::PutTablet { addr, image });
        }
        let _token = self.slog.lock().append(&records)?;

        let created = pending.len();
        for (tablet, addr) in pending.into_iter().zip(addrs) {
            let key = tablet.key();
            self.pointer_map
                .compare_and_swap_tablet(&key, addr, None, Arc::new(tablet))?;
            log::info!("created tablet {key} at scn {create_scn}");
        }
        Ok(created)
    }

    /// Remove every tablet in `tablet_ids`: verify, one delete-SLOG batch,
    /// then drop each from the map. Replay skips tablets already gone.
    pub fn batch_remove_tablets(&self, tablet_ids: &[TabletId], is_replay: bool) -> Result<usize> {
        self.check_running()?;
        let _lifecycle = self.lifecycle_lock.lock();
        let mut ids: Vec<TabletId> = tablet_ids.to_vec();
        ids.sort_by_key(|id| {
            let key = self.key(*id);
            (self.pointer_map.bucket_index(&key), *id)
        });

        let mut doomed = Vec::new();
        for id in ids {
            let key = self.key(id);
            if !self.pointer_map.contains(&key) {
                if is_replay {
                    continue;
                }
                return Err(TabletError::NotExist(key).into());
            }
            doomed.push(key);
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        let records: Vec<SlogRecord> = doomed
            .iter()
            .map(|key| SlogRecord::DeleteTablet { key: *key })
            .collect();
        let _token = self.slog.lock().append(&records)?;

        for key in &doomed {
            // Post-SLOG removal must succeed; del_tablet is idempotent and
            // infallible on an existing map.
            self.pointer_map.del_tablet(key)?;
            log::info!("removed tablet {key}");
        }
        Ok(doomed.len())
    }

    /// Construct a tablet from a transported image and publish it.
    /// Re-running with identical parameters reproduces an identical image.
    pub fn migrate_create_tablet(&self, mig: MigrationParam) -> Result<TabletHandle> {
        self.check_running()?;
        let _lifecycle = self.lifecycle_lock.lock();
        let key = mig.meta.key();
        let old = self.pointer_map.acquire_tablet(&key);
        let tablet =
            Tablet::init_for_migration(mig.meta, mig.schema, mig.table_store, &self.macro_registry)?;
        self.persist_and_publish(tablet, old.as_ref())
    }

    /// Replace an existing tablet, keeping its identity.
    pub fn migrate_update_tablet(&self, mig: MigrationParam) -> Result<TabletHandle> {
        self.check_running()?;
        let _lifecycle = self.lifecycle_lock.lock();
        let key = mig.meta.key();
        let old = self
            .pointer_map
            .acquire_tablet(&key)
            .ok_or(TabletError::NotExist(key))?;
        let tablet =
            Tablet::init_for_migration(mig.meta, mig.schema, mig.table_store, &self.macro_registry)?;
        self.persist_and_publish(tablet, Some(&old))
    }

    /// Rebuild: with `keep_old`, the incoming tablet chains the current one
    /// behind it until trim or rollback resolves the window.
    pub fn rebuild_create_tablet(&self, mig: MigrationParam, keep_old: bool) -> Result<TabletHandle> {
        self.check_running()?;
        let _lifecycle = self.lifecycle_lock.lock();
        let key = mig.meta.key();
        let old = self.pointer_map.acquire_tablet(&key);
        let mut tablet =
            Tablet::init_for_migration(mig.meta, mig.schema, mig.table_store, &self.macro_registry)?;
        if keep_old {
            if let Some(old_handle) = &old {
                tablet.set_next_tablet(Arc::clone(old_handle))?;
            }
        }
        self.persist_and_publish(tablet, old.as_ref())
    }

    /// Rebuild succeeded: drop the chained predecessor.
    pub fn trim_rebuild_tablet(&self, tablet_id: TabletId) -> Result<()> {
        self.check_running()?;
        let _lifecycle = self.lifecycle_lock.lock();
        let current = self.get_tablet(tablet_id)?;
        if current.next_tablet().is_none() {
            return Ok(());
        }
        let mut trimmed = Tablet::init_for_update(&current, TabletUpdateParam::default())?;
        trimmed.clear_next_tablet();
        self.persist_and_publish(trimmed, Some(&current))?;
        Ok(())
    }

    /// Rebuild failed: restore the chained predecessor as authoritative.
    pub fn rollback_rebuild_tablet(&self, tablet_id: TabletId) -> Result<()> {
        self.check_running()?;
        let _lifecycle = self.lifecycle_lock.lock();
        let key = self.key(tablet_id);
        let current = self.get_tablet(tablet_id)?;
        let Some(old) = current.next_tablet() else {
            return Err(StorageError::Unexpected(format!(
                "rollback_rebuild on {key} without a chained tablet"
            )));
        };
        let mut restored = Tablet::init_for_update(old, TabletUpdateParam::default())?;
        restored.clear_next_tablet();
        self.persist_and_publish(restored, Some(&current))?;
        Ok(())
    }

    /// Swap in a table store produced by a flush or compaction. An
    /// advancing clog checkpoint freezes the active memtable first.
    pub fn update_tablet_table_store(
        &self,
        tablet_id: TabletId,
        param: TabletUpdateParam,
    ) -> Result<TabletHandle> {
        self.check_running()?;
        let _lifecycle = self.lifecycle_lock.lock();
        let old = self.get_tablet(tablet_id)?;
        if let Some(new_checkpoint) = param.clog_checkpoint_scn {
            if new_checkpoint > old.meta().clog_checkpoint_scn {
                old.memtable_mgr().freeze_active(new_checkpoint);
            }
        }
        let tablet = Tablet::init_for_update(&old, param)?;
        self.persist_and_publish(tablet, Some(&old))
    }

    /// Drop flushed memtables up to `scn`; see the memtable manager.
    pub fn release_memtables(&self, tablet_id: TabletId, scn: Scn) -> Result<usize> {
        let tablet = self.get_tablet(tablet_id)?;
        Ok(tablet.memtable_mgr().release_memtables(scn))
    }

    /// Follower offline: release every memtable and refuse further work.
    pub fn offline(&self) -> Result<()> {
        if self.is_offline.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut released = 0usize;
        self.pointer_map.for_each(|_, tablet| {
            released += tablet.memtable_mgr().release_all();
        });
        log::info!("tablet service offline: ls={} released={released}", self.ls_id);
        Ok(())
    }

    /// Restart path: rebuild the pointer map from a SLOG stream. Later
    /// records win, matching commit order.
    pub fn replay_slog<R: Read>(&self, reader: R) -> Result<usize> {
        let _lifecycle = self.lifecycle_lock.lock();
        let mut applied = 0usize;
        for item in Replay::new(reader) {
            let (_offset, record) = item?;
            match record {
                SlogRecord::PutTablet { addr, image } => {
                    let key = crate::tablet::deserialize_id(&image)?;
                    if key.ls_id != self.ls_id {
                        continue;
                    }
                    let mut reader = image.as_slice();
                    let tablet = Tablet::load_deserialize(&mut reader)?;
                    tablet.deserialize_post_work(&self.macro_registry);
                    let old = self.pointer_map.acquire_tablet(&key);
                    self.pointer_map.compare_and_swap_tablet(
                        &key,
                        addr,
                        old.as_ref(),
                        Arc::new(tablet),
                    )?;
                }
                SlogRecord::DeleteTablet { key } => {
                    if key.ls_id != self.ls_id {
                        continue;
                    }
                    self.pointer_map.del_tablet(&key)?;
                }
            }
            applied += 1;
        }
        log::info!("slog replay applied {applied} records: ls={}", self.ls_id);
        Ok(applied)
    }

    // ------------------------------------------------------------------- DML

    fn dml_prologue<'a>(
        &self,
        tablet_id: TabletId,
        tx: &'a MemtableCtx,
        param: &'a DmlParam,
    ) -> Result<DmlRunningCtx<'a>> {
        self.check_running()?;
        param.check_timeout()?;
        let tablet = self.get_tablet_with_timeout(tablet_id, param.timeout)?;
        Ok(DmlRunningCtx::new(tablet, tx, param))
    }

    /// After a successful statement, pack redo if the private buffer
    /// crossed its threshold.
    fn maybe_submit_redo(&self, tx: &MemtableCtx) -> Result<()> {
        if tx.pending_log_size_overflow() {
            tx.submit_log(self.log_handler.as_ref())?;
        }
        Ok(())
    }

    fn route_lob_columns(&self, ctx: &DmlRunningCtx<'_>, row: Row) -> Result<Row> {
        let schema = ctx.schema();
        let mut out = Vec::with_capacity(row.len());
        for (idx, datum) in row.0.into_iter().enumerate() {
            if is_lob_candidate(&datum) {
                let param = LobAccessParam {
                    ls_id: self.ls_id,
                    tablet_id: ctx.tablet.key().tablet_id,
                    col_id: schema.columns[idx].id,
                    snapshot: ctx.param.snapshot,
                };
                out.push(self.lob_mgr.prepare_insert(&param, datum)?);
            } else {
                out.push(datum);
            }
        }
        Ok(Row::new(out))
    }

    fn erase_lob_columns(&self, ctx: &DmlRunningCtx<'_>, row: &Row) -> Result<()> {
        let schema = ctx.schema();
        for (idx, datum) in row.0.iter().enumerate() {
            if is_lob_candidate(datum) {
                let param = LobAccessParam {
                    ls_id: self.ls_id,
                    tablet_id: ctx.tablet.key().tablet_id,
                    col_id: schema.columns[idx].id,
                    snapshot: ctx.param.snapshot,
                };
                self.lob_mgr.erase(&param, datum)?;
            }
        }
        Ok(())
    }

    fn run_dml<F>(&self, tx: &MemtableCtx, param: &DmlParam, body: F) -> Result<usize>
    where
        F: FnOnce() -> Result<usize>,
    {
        let auth = tx.write_auth(false)?;
        let result = body();
        auth.write_done();
        match result {
            Ok(affected) => {
                tx.stmt_end(true);
                self.maybe_submit_redo(tx)?;
                Ok(affected)
            }
            Err(e) => {
                tx.stmt_end(false);
                Err(translate_batch_error(e, param.flags))
            }
        }
    }

    pub fn insert_rows(
        &self,
        tablet_id: TabletId,
        tx: &MemtableCtx,
        param: &DmlParam,
        rows: Vec<Row>,
    ) -> Result<usize> {
        let ctx = self.dml_prologue(tablet_id, tx, param)?;
        self.run_dml(tx, param, || {
            let mut affected = 0;
            for row in rows {
                ctx.schema().validate_row(&row)?;
                let row = self.route_lob_columns(&ctx, row)?;
                if param.flags.contains(DmlFlags::SKIP_ROWKEY_CHECK) {
                    ctx.tablet
                        .insert_row_without_rowkey_check(tx, row, param.snapshot)?;
                } else {
                    ctx.tablet.insert_row(tx, row, param.snapshot)?;
                }
                affected += 1;
            }
            Ok(affected)
        })
    }

    pub fn insert_row(
        &self,
        tablet_id: TabletId,
        tx: &MemtableCtx,
        param: &DmlParam,
        row: Row,
    ) -> Result<()> {
        self.insert_rows(tablet_id, tx, param, vec![row]).map(|_| ())
    }

    /// Put semantics: write the row as the new image of its key, no
    /// duplicate check.
    pub fn put_rows(
        &self,
        tablet_id: TabletId,
        tx: &MemtableCtx,
        param: &DmlParam,
        rows: Vec<Row>,
    ) -> Result<usize> {
        let ctx = self.dml_prologue(tablet_id, tx, param)?;
        self.run_dml(tx, param, || {
            let mut affected = 0;
            for row in rows {
                ctx.schema().validate_row(&row)?;
                let row = self.route_lob_columns(&ctx, row)?;
                ctx.tablet
                    .insert_row_without_rowkey_check(tx, row, param.snapshot)?;
                affected += 1;
            }
            Ok(affected)
        })
    }

    pub fn update_rows(
        &self,
        tablet_id: TabletId,
        tx: &MemtableCtx,
        param: &DmlParam,
        old_rows: &[Row],
        new_rows: Vec<Row>,
    ) -> Result<usize> {
        if old_rows.len() != new_rows.len() {
            return Err(StorageError::InvalidArgument(
                "update old/new row count mismatch",
            ));
        }
        let ctx = self.dml_prologue(tablet_id, tx, param)?;
        self.run_dml(tx, param, || {
            let mut affected = 0;
            for (old_row, new_row) in old_rows.iter().zip(new_rows) {
                ctx.schema().validate_row(&new_row)?;
                if self.config.defensive_check() {
                    check_old_row_legitimacy(&ctx, old_row)?;
                }
                self.erase_lob_columns(&ctx, old_row)?;
                let new_row = self.route_lob_columns(&ctx, new_row)?;
                ctx.tablet.update_row(tx, new_row, param.snapshot)?;
                affected += 1;
            }
            Ok(affected)
        })
    }

    pub fn delete_rows(
        &self,
        tablet_id: TabletId,
        tx: &MemtableCtx,
        param: &DmlParam,
        rows: &[Row],
    ) -> Result<usize> {
        let ctx = self.dml_prologue(tablet_id, tx, param)?;
        self.run_dml(tx, param, || {
            let mut affected = 0;
            for row in rows {
                if self.config.defensive_check() {
                    check_old_row_legitimacy(&ctx, row)?;
                }
                self.erase_lob_columns(&ctx, row)?;
                let key = row.rowkey(ctx.schema().rowkey_count);
                ctx.tablet.delete_row(tx, key, param.snapshot)?;
                affected += 1;
            }
            Ok(affected)
        })
    }

    pub fn lock_rows(
        &self,
        tablet_id: TabletId,
        tx: &MemtableCtx,
        param: &DmlParam,
        rows: &[Row],
    ) -> Result<usize> {
        let ctx = self.dml_prologue(tablet_id, tx, param)?;
        self.run_dml(tx, param, || {
            let mut affected = 0;
            for row in rows {
                ctx.tablet.lock_row_by_row(tx, row, param.snapshot)?;
                affected += 1;
            }
            Ok(affected)
        })
    }

    pub fn lock_row(
        &self,
        tablet_id: TabletId,
        tx: &MemtableCtx,
        param: &DmlParam,
        row: &Row,
    ) -> Result<()> {
        self.lock_rows(tablet_id, tx, param, std::slice::from_ref(row))
            .map(|_| ())
    }

    // ------------------------------------------------------------------ scan

    pub fn table_scan(
        &self,
        tablet_id: TabletId,
        param: &TableScanParam,
    ) -> Result<TabletScanIter> {
        self.check_running()?;
        if Instant::now() > param.timeout {
            return Err(StorageError::Timeout);
        }
        let tablet = self.get_tablet_with_timeout(tablet_id, param.timeout)?;
        TabletScanIter::build(&tablet, param)
    }

    /// Rescan with the cached per-query parameter, optionally narrowing the
    /// range.
    pub fn table_rescan(
        &self,
        tablet_id: TabletId,
        param: &TableScanParam,
        range: Option<(std::ops::Bound<crate::datum::RowKey>, std::ops::Bound<crate::datum::RowKey>)>,
    ) -> Result<TabletScanIter> {
        match range {
            Some(range) => {
                let param = param.clone().with_range(range);
                self.table_scan(tablet_id, &param)
            }
            None => self.table_scan(tablet_id, param),
        }
    }

    // --------------------------------------------- multi-source replay hooks

    fn save_status_msd(&self, tablet: &TabletHandle, tx_data: TxData) -> Result<()> {
        let mt = match tablet.memtable_mgr().get_active_memtable() {
            Ok(mt) => mt,
            Err(_) => {
                tablet.create_memtable(tablet.storage_schema().version, true)?;
                tablet.memtable_mgr().get_active_memtable()?
            }
        };
        mt.save_multi_source_data(MultiSourceData::TabletStatus(tx_data));
        Ok(())
    }

    pub fn on_prepare_create_tablet(&self, tablet_id: TabletId, _tx_id: TxId) -> Result<()> {
        self.get_tablet(tablet_id).map(|_| ())
    }

    pub fn on_redo_create_tablet(&self, tablet_id: TabletId, tx_id: TxId, scn: Scn) -> Result<()> {
        let tablet = self.get_tablet(tablet_id)?;
        self.pointer_map.pin(self.key(tablet_id));
        self.save_status_msd(
            &tablet,
            TxData {
                tx_id,
                tablet_status: TabletStatus::Creating,
                tx_scn: scn,
            },
        )
    }

    pub fn on_commit_create_tablet(
        &self,
        tablet_id: TabletId,
        tx_id: TxId,
        commit_scn: Scn,
    ) -> Result<()> {
        let _lifecycle = self.lifecycle_lock.lock();
        let old = self.get_tablet(tablet_id)?;
        let tablet = Tablet::init_for_update(
            &old,
            TabletUpdateParam {
                tx_data: Some(TxData {
                    tx_id,
                    tablet_status: TabletStatus::Normal,
                    tx_scn: commit_scn,
                }),
                ..Default::default()
            },
        )?;
        self.persist_and_publish(tablet, Some(&old))?;
        self.save_status_msd(
            &self.get_tablet(tablet_id)?,
            TxData {
                tx_id,
                tablet_status: TabletStatus::Normal,
                tx_scn: commit_scn,
            },
        )
    }

    pub fn on_abort_create_tablet(&self, tablet_id: TabletId, _tx_id: TxId) -> Result<()> {
        self.batch_remove_tablets(&[tablet_id], true).map(|_| ())
    }

    pub fn on_tx_end_create_tablet(&self, tablet_id: TabletId) -> Result<()> {
        self.pointer_map.unpin(&self.key(tablet_id));
        Ok(())
    }

    pub fn on_prepare_remove_tablet(&self, tablet_id: TabletId, _tx_id: TxId) -> Result<()> {
        self.get_tablet(tablet_id).map(|_| ())
    }

    pub fn on_redo_remove_tablet(&self, tablet_id: TabletId, tx_id: TxId, scn: Scn) -> Result<()> {
        let tablet = self.get_tablet(tablet_id)?;
        self.pointer_map.pin(self.key(tablet_id));
        self.save_status_msd(
            &tablet,
            TxData {
                tx_id,
                tablet_status: TabletStatus::Deleting,
                tx_scn: scn,
            },
        )
    }

    pub fn on_commit_remove_tablet(
        &self,
        tablet_id: TabletId,
        _tx_id: TxId,
        _commit_scn: Scn,
    ) -> Result<()> {
        self.pointer_map.unpin(&self.key(tablet_id));
        self.batch_remove_tablets(&[tablet_id], true).map(|_| ())
    }

    pub fn on_abort_remove_tablet(&self, tablet_id: TabletId, tx_id: TxId) -> Result<()> {
        let tablet = self.get_tablet(tablet_id)?;
        self.save_status_msd(
            &tablet,
            TxData {
                tx_id,
                tablet_status: TabletStatus::Normal,
                tx_scn: Scn::MIN,
            },
        )
    }

    pub fn on_tx_end_remove_tablet(&self, tablet_id: TabletId) -> Result<()> {
        self.pointer_map.unpin(&self.key(tablet_id));
        Ok(())
    }

    // --------------------------------------------------------------- queries

    pub fn get_tablet_status(&self, tablet_id: TabletId) -> Result<TxData> {
        Ok(self.get_tablet(tablet_id)?.get_tablet_status())
    }
}
