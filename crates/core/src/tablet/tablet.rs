//! The tablet object.
//!
//! A tablet bundles persistent meta, the storage-schema snapshot, the
//! ordered sstable arrays and the precomputed read info. It is
//! immutable-ish: mutations build a successor object which the service
//! publishes with a compare-and-swap against the pointer map. The memtable
//! manager is shared across versions of the same identity.

use std::sync::Arc;

use bitflags::bitflags;
use tabletdb_primitives::{Scn, SchemaVersion, SeqNo, TabletId, TabletKey, TxId, Version};
use tabletdb_slog::buffer::{BufReader, BufWriter, DecodeError};

use crate::datum::{Row, RowKey};
use crate::error::{DmlError, Result, StorageError, TabletError};
use crate::memtable::redo::{LogHandler, SyncTabletSeqLog};
use crate::memtable::{DmlOp, KeyVerdict, Memtable, MemtableCtx, MsdKind, MultiSourceData};
use crate::schema::{CompatMode, ReadInfo, StorageSchema};
use crate::tablet::memtable_mgr::MemtableMgr;
use crate::tablet::meta::{BindingInfo, MediumInfoList, TabletMeta, TabletStatus, TxData};
use crate::tablet::table_store::{MacroBlockRegistry, ReadTable, SsTable, TableStore};

pub const TABLET_IMAGE_VERSION: i32 = 1;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TabletStoreFlags: u32 {
        /// The schema does not demand a major sstable from creation.
        const NO_MAJOR = 1 << 0;
    }
}

/// Everything needed to build a tablet from scratch.
pub struct TabletBuildParam {
    pub key: TabletKey,
    pub data_tablet_id: TabletId,
    pub binding_info: BindingInfo,
    pub create_scn: Scn,
    pub snapshot_version: Version,
    pub schema: StorageSchema,
    pub compat_mode: CompatMode,
}

/// The delta applied when producing the next tablet version after a
/// compaction, DDL or minor flush.
#[derive(Default)]
pub struct TabletUpdateParam {
    pub table_store: Option<TableStore>,
    pub storage_schema: Option<StorageSchema>,
    pub tx_data: Option<TxData>,
    pub binding_info: Option<BindingInfo>,
    pub autoinc_seq: Option<u64>,
    pub clog_checkpoint_scn: Option<Scn>,
    pub snapshot_version: Option<Version>,
    pub multi_version_start: Option<Version>,
}

pub struct Tablet {
    meta: TabletMeta,
    storage_schema: Arc<StorageSchema>,
    read_info: ReadInfo,
    table_store: TableStore,
    store_flags: TabletStoreFlags,
    medium_info: MediumInfoList,
    memtable_mgr: Arc<MemtableMgr>,
    /// Bounded chain (length <= 2) alive only during a rebuild window.
    next_tablet: Option<Arc<Tablet>>,
}

impl Tablet {
    /// Construct from scratch. Builds an empty major iff the schema demands
    /// one; otherwise the store records "no major".
    pub fn init_create(
        param: TabletBuildParam,
        registry: &Arc<MacroBlockRegistry>,
    ) -> Result<Self> {
        if !param.key.tablet_id.is_valid() {
            return Err(StorageError::InvalidArgument("invalid tablet id"));
        }
        let mut store_flags = TabletStoreFlags::empty();
        let majors = if param.schema.demands_major() {
            vec![SsTable::empty_major(param.snapshot_version, registry)]
        } else {
            store_flags |= TabletStoreFlags::NO_MAJOR;
            Vec::new()
        };
        let table_store = TableStore::new(majors, Vec::new(), Vec::new(), param.create_scn)?;
        let meta = TabletMeta {
            ls_id: param.key.ls_id,
            tablet_id: param.key.tablet_id,
            data_tablet_id: param.data_tablet_id,
            create_scn: param.create_scn,
            start_scn: param.create_scn,
            clog_checkpoint_scn: param.create_scn,
            snapshot_version: param.snapshot_version,
            multi_version_start: param.snapshot_version,
            compat_mode: param.compat_mode,
            ha_status: Default::default(),
            tx_data: TxData::default(),
            binding_info: param.binding_info,
            autoinc_seq: 1,
            max_sync_schema_version: param.schema.version,
        };
        let read_info = param.schema.build_read_info();
        Ok(Self {
            meta,
            storage_schema: Arc::new(param.schema),
            read_info,
            table_store,
            store_flags,
            medium_info: MediumInfoList::default(),
            memtable_mgr: MemtableMgr::new(param.key.tablet_id),
            next_tablet: None,
        })
    }

    /// Produce the successor version of `old` with `update` applied.
    ///
    /// Monotonic fields never move backward: a stale checkpoint or start
    /// scn in the update is clamped to the old value.
    pub fn init_for_update(old: &Tablet, update: TabletUpdateParam) -> Result<Self> {
        let mut meta = old.meta.clone();
        if let Some(scn) = update.clog_checkpoint_scn {
            meta.clog_checkpoint_scn = meta.clog_checkpoint_scn.max(scn);
        }
        if let Some(v) = update.snapshot_version {
            meta.snapshot_version = meta.snapshot_version.max(v);
        }
        if let Some(v) = update.multi_version_start {
            meta.multi_version_start = meta.multi_version_start.max(v);
        }
        if let Some(tx_data) = update.tx_data {
            meta.tx_data = tx_data;
        }
        if let Some(binding) = update.binding_info {
            meta.binding_info = binding;
        }
        if let Some(seq) = update.autoinc_seq {
            meta.autoinc_seq = meta.autoinc_seq.max(seq);
        }

        let storage_schema = match update.storage_schema {
            Some(schema) => {
                meta.max_sync_schema_version = meta.max_sync_schema_version.max(schema.version);
                Arc::new(schema)
            }
            None => Arc::clone(&old.storage_schema),
        };
        debug_assert!(meta.max_sync_schema_version <= storage_schema.version);

        let table_store = match update.table_store {
            Some(store) => {
                store.check_invariants()?;
                meta.start_scn = meta.start_scn.max(store.start_scn);
                store
            }
            None => old.table_store.clone(),
        };

        let read_info = storage_schema.build_read_info();
        Ok(Self {
            meta,
            storage_schema,
            read_info,
            table_store,
            store_flags: old.store_flags,
            medium_info: old.medium_info.clone(),
            memtable_mgr: Arc::clone(&old.memtable_mgr),
            next_tablet: None,
        })
    }

    /// Construct from a replicated snapshot (migration / rebuild).
    pub fn init_for_migration(
        meta: TabletMeta,
        schema: StorageSchema,
        table_store: TableStore,
        registry: &Arc<MacroBlockRegistry>,
    ) -> Result<Self> {
        table_store.check_invariants()?;
        table_store.register_macro_refs(registry);
        let store_flags = if schema.demands_major() {
            TabletStoreFlags::empty()
        } else {
            TabletStoreFlags::NO_MAJOR
        };
        let read_info = schema.build_read_info();
        let tablet_id = meta.tablet_id;
        Ok(Self {
            meta,
            storage_schema: Arc::new(schema),
            read_info,
            table_store,
            store_flags,
            medium_info: MediumInfoList::default(),
            memtable_mgr: MemtableMgr::new(tablet_id),
            next_tablet: None,
        })
    }

    pub fn key(&self) -> TabletKey {
        self.meta.key()
    }

    pub fn meta(&self) -> &TabletMeta {
        &self.meta
    }

    pub fn storage_schema(&self) -> &Arc<StorageSchema> {
        &self.storage_schema
    }

    pub fn read_info(&self) -> &ReadInfo {
        &self.read_info
    }

    pub fn table_store(&self) -> &TableStore {
        &self.table_store
    }

    pub fn memtable_mgr(&self) -> &Arc<MemtableMgr> {
        &self.memtable_mgr
    }

    pub fn next_tablet(&self) -> Option<&Arc<Tablet>> {
        self.next_tablet.as_ref()
    }

    /// Chain the old tablet behind a rebuild candidate. The chain is
    /// bounded at length two; trimming or rollback resolves it.
    pub fn set_next_tablet(&mut self, next: Arc<Tablet>) -> Result<()> {
        if next.next_tablet.is_some() {
            return Err(StorageError::Unexpected(
                "rebuild chain would exceed the bound".into(),
            ));
        }
        self.next_tablet = Some(next);
        Ok(())
    }

    pub fn clear_next_tablet(&mut self) {
        self.next_tablet = None;
    }

    /// Current lifecycle status: uncommitted multi-source data first,
    /// persisted meta second.
    pub fn get_tablet_status(&self) -> TxData {
        match self.memtable_mgr.get_multi_source_data(MsdKind::TabletStatus) {
            Some(MultiSourceData::TabletStatus(tx_data)) => tx_data,
            _ => self.meta.tx_data,
        }
    }

    pub fn get_binding_info(&self) -> BindingInfo {
        match self.memtable_mgr.get_multi_source_data(MsdKind::Binding) {
            Some(MultiSourceData::Binding(binding)) => binding,
            _ => self.meta.binding_info,
        }
    }

    pub fn get_kept_multi_version_start(&self) -> Version {
        self.meta.multi_version_start
    }

    // ----------------------------------------------------------------- reads

    /// The set of stores that together cover everything visible at
    /// `snapshot`: chosen major, minors, then memtables oldest to newest.
    pub fn get_read_tables(
        &self,
        snapshot: Version,
        allow_no_ready_read: bool,
    ) -> Result<Vec<ReadTable>> {
        if !self.meta.ha_status.is_none() {
            return Err(TabletError::NotReadable(self.key()).into());
        }
        if snapshot < self.meta.multi_version_start {
            return Err(TabletError::SnapshotDiscarded {
                snapshot,
                multi_version_start: self.meta.multi_version_start,
            }
            .into());
        }
        let mut tables = self.table_store.read_tables(snapshot);
        if tables.is_empty()
            && !allow_no_ready_read
            && !self.store_flags.contains(TabletStoreFlags::NO_MAJOR)
        {
            return Err(TabletError::EntryNotExist.into());
        }
        for mt in self.memtable_mgr.get_all_memtables() {
            tables.push(ReadTable::Mem(mt));
        }
        Ok(tables)
    }

    /// Merge-iterate all read tables newest to oldest; the first
    /// definitive verdict wins.
    pub fn rowkey_exists(
        &self,
        key: &RowKey,
        snapshot: Version,
        reader: Option<TxId>,
    ) -> Result<bool> {
        let tables = self.get_read_tables(snapshot, true)?;
        for table in tables.iter().rev() {
            match table.key_state(key, snapshot, reader) {
                Some(KeyVerdict::Exists) => return Ok(true),
                Some(KeyVerdict::Deleted) => return Ok(false),
                None => continue,
            }
        }
        Ok(false)
    }

    pub fn rowkeys_exist(
        &self,
        keys: &[RowKey],
        snapshot: Version,
        reader: Option<TxId>,
    ) -> Result<bool> {
        for key in keys {
            if self.rowkey_exists(key, snapshot, reader)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The newest committed row state at `snapshot`, across all stores.
    pub fn read_row(&self, key: &RowKey, snapshot: Version) -> Result<Option<Row>> {
        let tables = self.get_read_tables(snapshot, true)?;
        for table in tables.iter().rev() {
            if let Some(state) = table.read_row(key, snapshot) {
                return Ok(state);
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------- memtables

    /// Append a new active memtable, left boundary at the current clog
    /// checkpoint. Idempotent when one already exists.
    pub fn create_memtable(&self, schema_version: SchemaVersion, for_replay: bool) -> Result<()> {
        match self.memtable_mgr.create_memtable(
            self.meta.clog_checkpoint_scn,
            schema_version,
            for_replay,
        ) {
            Ok(_) => Ok(()),
            Err(StorageError::Tablet(TabletError::EntryExist)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Fetch the active memtable, creating it on first touch. Retries once
    /// when a concurrent freeze swapped the active table out from under
    /// the caller.
    fn active_memtable_for_write(&self) -> Result<Arc<Memtable>> {
        for _ in 0..2 {
            match self.memtable_mgr.get_active_memtable() {
                Ok(mt) => return Ok(mt),
                Err(StorageError::Tablet(TabletError::EntryNotExist)) => {
                    self.create_memtable(self.storage_schema.version, false)?;
                }
                Err(e) => return Err(e),
            }
        }
        self.memtable_mgr.get_active_memtable()
    }

    // ------------------------------------------------------------ DML writes

    fn check_dml_allowed(&self) -> Result<()> {
        if !self.meta.ha_status.is_none() {
            return Err(TabletError::NotReadable(self.key()).into());
        }
        if !self.meta.tablet_id.is_inner()
            && self.get_tablet_status().tablet_status != TabletStatus::Normal
        {
            return Err(TabletError::NotExist(self.key()).into());
        }
        Ok(())
    }

    fn write_memtable(
        &self,
        ctx: &MemtableCtx,
        op: DmlOp,
        key: RowKey,
        new_row: Option<Row>,
        snapshot: Version,
    ) -> Result<SeqNo> {
        // The freeze protocol can retire the active memtable between the
        // lookup and the write; refresh the guard and retry once.
        for _ in 0..2 {
            let mt = self.active_memtable_for_write()?;
            mt.record_schema_version(self.storage_schema.version);
            match mt.set(ctx, op, key.clone(), new_row.clone(), snapshot) {
                Err(StorageError::Eagain) => continue,
                other => return other,
            }
        }
        Err(StorageError::Eagain)
    }

    /// Insert with a uniqueness check against every visible store.
    pub fn insert_row(
        &self,
        ctx: &MemtableCtx,
        row: Row,
        snapshot: Version,
    ) -> Result<SeqNo> {
        self.check_dml_allowed()?;
        let key = row.rowkey(self.read_info.rowkey_count);
        if self.rowkey_exists(&key, Version::MAX, Some(ctx.tx_id()))? {
            return Err(DmlError::PrimaryKeyDuplicate {
                key: key.to_string(),
                index_name: self.storage_schema.constraint_name().to_owned(),
            }
            .into());
        }
        self.write_memtable(ctx, DmlOp::Insert, key, Some(row), snapshot)
    }

    /// Insert without the uniqueness check (multi-row conflict checking
    /// done by the caller, or a non-unique index target).
    pub fn insert_row_without_rowkey_check(
        &self,
        ctx: &MemtableCtx,
        row: Row,
        snapshot: Version,
    ) -> Result<SeqNo> {
        self.check_dml_allowed()?;
        let key = row.rowkey(self.read_info.rowkey_count);
        self.write_memtable(ctx, DmlOp::Insert, key, Some(row), snapshot)
    }

    pub fn update_row(&self, ctx: &MemtableCtx, new_row: Row, snapshot: Version) -> Result<SeqNo> {
        self.check_dml_allowed()?;
        let key = new_row.rowkey(self.read_info.rowkey_count);
        self.write_memtable(ctx, DmlOp::Update, key, Some(new_row), snapshot)
    }

    pub fn delete_row(&self, ctx: &MemtableCtx, key: RowKey, snapshot: Version) -> Result<SeqNo> {
        self.check_dml_allowed()?;
        self.write_memtable(ctx, DmlOp::Delete, key, None, snapshot)
    }

    pub fn lock_row(&self, ctx: &MemtableCtx, key: RowKey, snapshot: Version) -> Result<SeqNo> {
        self.check_dml_allowed()?;
        self.write_memtable(ctx, DmlOp::Lock, key, None, snapshot)
    }

    pub fn lock_row_by_row(&self, ctx: &MemtableCtx, row: &Row, snapshot: Version) -> Result<SeqNo> {
        let key = row.rowkey(self.read_info.rowkey_count);
        self.lock_row(ctx, key, snapshot)
    }

    // --------------------------------------------------------------- autoinc

    /// Reserve `[start, start + cache_size - 1]` of the tablet sequence.
    ///
    /// The new high watermark is replicated synchronously through the log
    /// handler before the interval is handed out; concurrent callers are
    /// serialized on the tablet.
    pub fn fetch_tablet_autoinc_seq_cache(
        &self,
        cache_size: u64,
        handler: &dyn LogHandler,
    ) -> Result<(u64, u64)> {
        if cache_size == 0 {
            return Err(StorageError::InvalidArgument("autoinc cache size zero"));
        }
        let _serial = self.memtable_mgr.autoinc_lock.lock();
        let old = match self.memtable_mgr.get_multi_source_data(MsdKind::AutoincSeq) {
            Some(MultiSourceData::AutoincSeq(seq)) => seq.max(self.meta.autoinc_seq),
            _ => self.meta.autoinc_seq,
        };
        let new_seq = old + cache_size;

        let mut payload = Vec::new();
        SyncTabletSeqLog {
            tablet_id: self.meta.tablet_id,
            new_seq,
        }
        .encode(&mut payload);
        // Majority-wait; failure leaves the sequence untouched.
        handler.append(&payload)?;

        let mt = self.active_memtable_for_write()?;
        mt.save_multi_source_data(MultiSourceData::AutoincSeq(new_seq));
        Ok((old, new_seq - 1))
    }

    /// Replay of a sync-tablet-seq record.
    pub fn update_tablet_autoinc_seq(&self, new_seq: u64, scn: Scn, ctx: &MemtableCtx) -> Result<()> {
        ctx.replay_sync_tablet_seq(self.meta.tablet_id, new_seq, scn);
        let mt = self.active_memtable_for_write()?;
        mt.save_multi_source_data(MultiSourceData::AutoincSeq(new_seq));
        Ok(())
    }

    // ---------------------------------------------------------- schema gates

    /// All memtable writes must have caught up with `schema_version`
    /// before a DDL may proceed on this tablet.
    pub fn check_schema_version_elapsed(&self, schema_version: SchemaVersion) -> Result<()> {
        for mt in self.memtable_mgr.get_all_memtables() {
            if mt.pending_callback_cnt() > 0 && mt.max_schema_version() < schema_version {
                return Err(StorageError::Eagain);
            }
        }
        Ok(())
    }

    // --------------------------------------------------------- serialization

    /// Serialize the full image (recursing into a rebuild chain).
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        self.meta.encode(&mut body);
        self.table_store.encode(&mut body);
        self.storage_schema.encode(&mut body);
        self.medium_info.encode(&mut body);
        match &self.next_tablet {
            Some(next) => {
                body.put_u8(1);
                next.serialize(&mut body);
            }
            None => body.put_u8(0),
        }

        out.put_i32(TABLET_IMAGE_VERSION);
        out.put_i32((8 + body.len()) as i32);
        out.put_slice(&body);
    }

    /// Phase-1 deserialization: decode the tree. Macro-block references
    /// are registered by [`Self::deserialize_post_work`].
    pub fn load_deserialize<'a>(reader: &mut impl BufReader<'a>) -> Result<Self> {
        let version = reader.get_i32()?;
        if version != TABLET_IMAGE_VERSION {
            return Err(DecodeError::InvalidVersion {
                ty: "Tablet",
                version,
            }
            .into());
        }
        let _total_length = reader.get_i32()?;
        let meta = TabletMeta::decode(reader)?;
        let table_store = TableStore::decode(reader)?;
        let storage_schema = StorageSchema::decode(reader)?;
        let medium_info = MediumInfoList::decode(reader)?;
        let next_tablet = if reader.get_u8()? != 0 {
            Some(Arc::new(Self::load_deserialize(reader)?))
        } else {
            None
        };
        let store_flags = if storage_schema.demands_major() {
            TabletStoreFlags::empty()
        } else {
            TabletStoreFlags::NO_MAJOR
        };
        let read_info = storage_schema.build_read_info();
        let tablet_id = meta.tablet_id;
        Ok(Self {
            meta,
            storage_schema: Arc::new(storage_schema),
            read_info,
            table_store,
            store_flags,
            medium_info,
            memtable_mgr: MemtableMgr::new(tablet_id),
            next_tablet,
        })
    }

    /// Phase-2 deserialization: re-register every sstable's macro-block
    /// disk references, recursing into the rebuild chain.
    pub fn deserialize_post_work(&self, registry: &Arc<MacroBlockRegistry>) {
        self.table_store.register_macro_refs(registry);
        if let Some(next) = &self.next_tablet {
            next.deserialize_post_work(registry);
        }
    }
}

/// Fast-path identity decode: reads only `(ls_id, tablet_id)` from a
/// serialized image, for indexing during replay.
pub fn deserialize_id(buf: &[u8]) -> Result<TabletKey> {
    let mut reader = buf;
    let version = reader.get_i32()?;
    if version != TABLET_IMAGE_VERSION {
        return Err(DecodeError::InvalidVersion {
            ty: "Tablet",
            version,
        }
        .into());
    }
    let _total_length = reader.get_i32()?;
    let ls_id = reader.get_u64()?;
    let tablet_id = reader.get_u64()?;
    Ok(TabletKey::new(ls_id.into(), tablet_id.into()))
}

impl std::fmt::Debug for Tablet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tablet")
            .field("key", &self.key())
            .field("status", &self.meta.tx_data.tablet_status)
            .field("snapshot_version", &self.meta.snapshot_version)
            .field("clog_checkpoint_scn", &self.meta.clog_checkpoint_scn)
            .field("tables", &self.table_store.table_count())
            .field("memtables", &self.memtable_mgr.memtable_count())
            .field("has_next", &self.next_tablet.is_some())
            .finish()
    }
}
