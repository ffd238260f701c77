//! Ordered sstable arrays of one tablet, plus the macro-block reference
//! registry.
//!
//! Sstables here are in-memory sorted runs: block encoding and the I/O
//! layer live below this crate. What matters to the engine is ordering,
//! version visibility and the reference counting of the macro blocks an
//! sstable pins on disk.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tabletdb_primitives::{Scn, Version};
use tabletdb_slog::buffer::{BufReader, BufWriter, DecodeError};

use crate::datum::{Row, RowKey};
use crate::error::{Result, StorageError};
use crate::memtable::{DmlOp, KeyVerdict, Memtable, RowVersion};

/// Reference counts for macro blocks pinned by sstables. Every sstable
/// registration increments its blocks, every destruction decrements.
/// Going negative means a double free of on-disk state: abort.
#[derive(Default)]
pub struct MacroBlockRegistry {
    refs: Mutex<HashMap<u64, i64>>,
}

impl MacroBlockRegistry {
    pub fn inc(&self, macro_ids: &[u64]) {
        let mut refs = self.refs.lock();
        for id in macro_ids {
            *refs.entry(*id).or_insert(0) += 1;
        }
    }

    pub fn dec(&self, macro_ids: &[u64]) {
        let mut refs = self.refs.lock();
        for id in macro_ids {
            let cnt = refs.entry(*id).or_insert(0);
            *cnt -= 1;
            if *cnt < 0 {
                log::error!("macro block {id} ref count went negative");
                panic!("macro block ref count underflow");
            }
            if *cnt == 0 {
                refs.remove(id);
            }
        }
    }

    pub fn ref_count(&self, macro_id: u64) -> i64 {
        self.refs.lock().get(&macro_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.refs.lock().is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SsTableKind {
    Major,
    Minor,
    Ddl,
}

/// An immutable sorted run.
pub struct SsTable {
    kind: SsTableKind,
    /// Majors: the compaction snapshot. Minors: the max commit version
    /// contained.
    snapshot_version: Version,
    start_scn: Scn,
    end_scn: Scn,
    rows: BTreeMap<RowKey, Vec<RowVersion>>,
    macro_ids: Vec<u64>,
    registered: AtomicBool,
    registry: Mutex<Option<Arc<MacroBlockRegistry>>>,
}

impl SsTable {
    pub fn new(
        kind: SsTableKind,
        snapshot_version: Version,
        start_scn: Scn,
        end_scn: Scn,
        rows: BTreeMap<RowKey, Vec<RowVersion>>,
        macro_ids: Vec<u64>,
        registry: &Arc<MacroBlockRegistry>,
    ) -> Arc<Self> {
        registry.inc(&macro_ids);
        Arc::new(Self {
            kind,
            snapshot_version,
            start_scn,
            end_scn,
            rows,
            macro_ids,
            registered: AtomicBool::new(true),
            registry: Mutex::new(Some(Arc::clone(registry))),
        })
    }

    /// An empty major at `snapshot_version`, built at tablet creation.
    pub fn empty_major(
        snapshot_version: Version,
        registry: &Arc<MacroBlockRegistry>,
    ) -> Arc<Self> {
        Self::new(
            SsTableKind::Major,
            snapshot_version,
            Scn::MIN,
            Scn::MIN,
            BTreeMap::new(),
            Vec::new(),
            registry,
        )
    }

    pub fn kind(&self) -> SsTableKind {
        self.kind
    }

    pub fn snapshot_version(&self) -> Version {
        self.snapshot_version
    }

    pub fn start_scn(&self) -> Scn {
        self.start_scn
    }

    pub fn end_scn(&self) -> Scn {
        self.end_scn
    }

    pub fn macro_ids(&self) -> &[u64] {
        &self.macro_ids
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn key_state(&self, key: &RowKey, snapshot: Version) -> Option<KeyVerdict> {
        let versions = self.rows.get(key)?;
        let visible = versions.iter().rev().find(|v| v.version <= snapshot)?;
        Some(match visible.op {
            DmlOp::Delete => KeyVerdict::Deleted,
            _ => KeyVerdict::Exists,
        })
    }

    pub fn read_row(&self, key: &RowKey, snapshot: Version) -> Option<Option<Row>> {
        let versions = self.rows.get(key)?;
        let visible = versions.iter().rev().find(|v| v.version <= snapshot)?;
        Some(visible.row.clone())
    }

    pub fn collect_visible(
        &self,
        snapshot: Version,
        range: (Bound<&RowKey>, Bound<&RowKey>),
        out: &mut BTreeMap<RowKey, Option<Row>>,
    ) {
        for (key, versions) in self.rows.range::<RowKey, _>(range) {
            if out.contains_key(key) {
                continue;
            }
            if let Some(visible) = versions.iter().rev().find(|v| v.version <= snapshot) {
                out.insert(key.clone(), visible.row.clone());
            }
        }
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u8(match self.kind {
            SsTableKind::Major => 0,
            SsTableKind::Minor => 1,
            SsTableKind::Ddl => 2,
        });
        out.put_u64(self.snapshot_version.0);
        out.put_u64(self.start_scn.0);
        out.put_u64(self.end_scn.0);
        out.put_u32(self.macro_ids.len() as u32);
        for id in &self.macro_ids {
            out.put_u64(*id);
        }
        out.put_u32(self.rows.len() as u32);
        for (key, versions) in &self.rows {
            key.encode(out);
            out.put_u32(versions.len() as u32);
            for v in versions {
                out.put_u64(v.version.0);
                out.put_u64(v.scn.0);
                out.put_u8(v.op.tag());
                match &v.row {
                    Some(row) => {
                        out.put_u8(1);
                        row.encode(out);
                    }
                    None => out.put_u8(0),
                }
            }
        }
    }

    /// Phase-1 deserialization: decodes the run but registers no macro
    /// references. [`Self::register_macro_refs`] completes construction.
    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> std::result::Result<Self, DecodeError> {
        let kind = match reader.get_u8()? {
            0 => SsTableKind::Major,
            1 => SsTableKind::Minor,
            2 => SsTableKind::Ddl,
            tag => {
                return Err(DecodeError::InvalidTag {
                    ty: "SsTable",
                    tag: tag as u16,
                })
            }
        };
        let snapshot_version = Version(reader.get_u64()?);
        let start_scn = Scn(reader.get_u64()?);
        let end_scn = Scn(reader.get_u64()?);
        let n_macro = reader.get_u32()? as usize;
        let mut macro_ids = Vec::with_capacity(n_macro.min(4096));
        for _ in 0..n_macro {
            macro_ids.push(reader.get_u64()?);
        }
        let n_rows = reader.get_u32()? as usize;
        let mut rows = BTreeMap::new();
        for _ in 0..n_rows {
            let key = RowKey::decode(reader)?;
            let n_versions = reader.get_u32()? as usize;
            let mut versions = Vec::with_capacity(n_versions.min(1024));
            for _ in 0..n_versions {
                let version = Version(reader.get_u64()?);
                let scn = Scn(reader.get_u64()?);
                let op = match reader.get_u8()? {
                    1 => DmlOp::Insert,
                    2 => DmlOp::Update,
                    3 => DmlOp::Delete,
                    4 => DmlOp::Lock,
                    tag => {
                        return Err(DecodeError::InvalidTag {
                            ty: "DmlOp",
                            tag: tag as u16,
                        })
                    }
                };
                let row = if reader.get_u8()? != 0 {
                    Some(Row::decode(reader)?)
                } else {
                    None
                };
                versions.push(RowVersion {
                    version,
                    scn,
                    op,
                    row,
                });
            }
            rows.insert(key, versions);
        }
        Ok(Self {
            kind,
            snapshot_version,
            start_scn,
            end_scn,
            rows,
            macro_ids,
            registered: AtomicBool::new(false),
            registry: Mutex::new(None),
        })
    }

    /// Phase-2 deserialization: pin this run's macro blocks.
    pub fn register_macro_refs(&self, registry: &Arc<MacroBlockRegistry>) {
        if self.registered.swap(true, Ordering::AcqRel) {
            return;
        }
        registry.inc(&self.macro_ids);
        *self.registry.lock() = Some(Arc::clone(registry));
    }
}

impl Drop for SsTable {
    fn drop(&mut self) {
        if self.registered.load(Ordering::Acquire) {
            if let Some(registry) = self.registry.lock().take() {
                registry.dec(&self.macro_ids);
            }
        }
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("kind", &self.kind)
            .field("snapshot_version", &self.snapshot_version)
            .field("scn_range", &(self.start_scn, self.end_scn))
            .field("rows", &self.rows.len())
            .field("macro_ids", &self.macro_ids.len())
            .finish()
    }
}

/// One read source, in the order produced by `get_read_tables`.
#[derive(Clone, Debug)]
pub enum ReadTable {
    Ss(Arc<SsTable>),
    Mem(Arc<Memtable>),
}

impl ReadTable {
    pub fn key_state(
        &self,
        key: &RowKey,
        snapshot: Version,
        reader: Option<tabletdb_primitives::TxId>,
    ) -> Option<KeyVerdict> {
        match self {
            ReadTable::Ss(ss) => ss.key_state(key, snapshot),
            ReadTable::Mem(mt) => mt.key_state(key, snapshot, reader),
        }
    }

    pub fn read_row(&self, key: &RowKey, snapshot: Version) -> Option<Option<Row>> {
        match self {
            ReadTable::Ss(ss) => ss.read_row(key, snapshot),
            ReadTable::Mem(mt) => mt.read_row(key, snapshot),
        }
    }

    pub fn collect_visible(
        &self,
        snapshot: Version,
        range: (Bound<&RowKey>, Bound<&RowKey>),
        out: &mut BTreeMap<RowKey, Option<Row>>,
    ) {
        match self {
            ReadTable::Ss(ss) => ss.collect_visible(snapshot, range, out),
            ReadTable::Mem(mt) => mt.collect_visible(snapshot, range, out),
        }
    }
}

/// The ordered sstable arrays of one tablet.
#[derive(Clone, Debug, Default)]
pub struct TableStore {
    /// Majors, ascending by snapshot version. Disjoint across versions.
    pub majors: Vec<Arc<SsTable>>,
    /// Minors, ascending by scn-range start; adjacent runs may touch only
    /// at boundaries.
    pub minors: Vec<Arc<SsTable>>,
    /// DDL dump sstables, ascending by scn.
    pub ddl: Vec<Arc<SsTable>>,
    /// Lower bound of log-sequence data represented by this store.
    pub start_scn: Scn,
}

impl TableStore {
    pub fn new(
        majors: Vec<Arc<SsTable>>,
        minors: Vec<Arc<SsTable>>,
        ddl: Vec<Arc<SsTable>>,
        start_scn: Scn,
    ) -> Result<Self> {
        let store = Self {
            majors,
            minors,
            ddl,
            start_scn,
        };
        store.check_invariants()?;
        Ok(store)
    }

    pub fn check_invariants(&self) -> Result<()> {
        for pair in self.majors.windows(2) {
            if pair[0].snapshot_version() >= pair[1].snapshot_version() {
                return Err(StorageError::Unexpected(
                    "majors not strictly ordered by snapshot version".into(),
                ));
            }
        }
        for pair in self.minors.windows(2) {
            if pair[1].start_scn() < pair[0].end_scn() {
                return Err(StorageError::Unexpected(
                    "minors overlap beyond their boundaries".into(),
                ));
            }
        }
        if let Some(first_minor) = self.minors.first() {
            if self.start_scn > first_minor.start_scn() {
                return Err(StorageError::Unexpected(
                    "table store start scn past the first minor".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn latest_major(&self) -> Option<&Arc<SsTable>> {
        self.majors.last()
    }

    /// The sstable part of a read at `snapshot`: the newest major at or
    /// below the snapshot, then every minor past that major's data.
    pub fn read_tables(&self, snapshot: Version) -> Vec<ReadTable> {
        let mut out = Vec::new();
        let major = self
            .majors
            .iter()
            .rev()
            .find(|m| m.snapshot_version() <= snapshot);
        if let Some(major) = major {
            out.push(ReadTable::Ss(Arc::clone(major)));
        }
        for minor in &self.minors {
            out.push(ReadTable::Ss(Arc::clone(minor)));
        }
        out
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u64(self.start_scn.0);
        for array in [&self.majors, &self.minors, &self.ddl] {
            out.put_u32(array.len() as u32);
        }
        for array in [&self.majors, &self.minors, &self.ddl] {
            for table in array.iter() {
                table.encode(out);
            }
        }
    }

    /// Phase-1 decode; macro references are registered by the tablet's
    /// post-deserialization work.
    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> std::result::Result<Self, DecodeError> {
        let start_scn = Scn(reader.get_u64()?);
        let n_majors = reader.get_u32()? as usize;
        let n_minors = reader.get_u32()? as usize;
        let n_ddl = reader.get_u32()? as usize;
        let mut decode_n = |n: usize| -> std::result::Result<Vec<Arc<SsTable>>, DecodeError> {
            let mut v = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                v.push(Arc::new(SsTable::decode(reader)?));
            }
            Ok(v)
        };
        let majors = decode_n(n_majors)?;
        let minors = decode_n(n_minors)?;
        let ddl = decode_n(n_ddl)?;
        Ok(Self {
            majors,
            minors,
            ddl,
            start_scn,
        })
    }

    pub fn register_macro_refs(&self, registry: &Arc<MacroBlockRegistry>) {
        for array in [&self.majors, &self.minors, &self.ddl] {
            for table in array.iter() {
                table.register_macro_refs(registry);
            }
        }
    }

    pub fn table_count(&self) -> usize {
        self.majors.len() + self.minors.len() + self.ddl.len()
    }
}
