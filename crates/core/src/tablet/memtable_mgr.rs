//! Per-tablet memtable list.
//!
//! Up to [`MAX_MEMTABLE_CNT`] memtables exist per tablet: one active tail
//! plus frozen predecessors awaiting flush. Creation and freezing happen
//! under the freeze lock; readers only take the list lock.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tabletdb_primitives::{Scn, SchemaVersion, TabletId};

use crate::error::{Result, TabletError};
use crate::memtable::{Memtable, MsdKind, MultiSourceData};

pub const MAX_MEMTABLE_CNT: usize = 16;

pub struct MemtableMgr {
    tablet_id: TabletId,
    freeze_lock: Mutex<()>,
    list: RwLock<VecDeque<Arc<Memtable>>>,
    /// Serializes tablet auto-increment fetches across callers.
    pub(crate) autoinc_lock: Mutex<()>,
}

impl MemtableMgr {
    pub fn new(tablet_id: TabletId) -> Arc<Self> {
        Arc::new(Self {
            tablet_id,
            freeze_lock: Mutex::new(()),
            list: RwLock::new(VecDeque::new()),
            autoinc_lock: Mutex::new(()),
        })
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    /// The latest unfrozen memtable.
    pub fn get_active_memtable(&self) -> Result<Arc<Memtable>> {
        let list = self.list.read();
        match list.back() {
            Some(mt) if mt.is_active() => Ok(Arc::clone(mt)),
            _ => Err(TabletError::EntryNotExist.into()),
        }
    }

    /// Append a new active memtable whose left boundary is the tablet's
    /// current clog checkpoint.
    ///
    /// Fails with `EntryExist` if an active memtable is already present,
    /// and with `MinorFreezeNotAllow` when the frozen backlog is full
    /// (backpressure until a flush completes).
    pub fn create_memtable(
        &self,
        clog_checkpoint_scn: Scn,
        schema_version: SchemaVersion,
        for_replay: bool,
    ) -> Result<Arc<Memtable>> {
        let _freeze = self.freeze_lock.lock();
        let mut list = self.list.write();
        if let Some(back) = list.back() {
            if back.is_active() {
                return Err(TabletError::EntryExist.into());
            }
        }
        if list.len() >= MAX_MEMTABLE_CNT {
            return Err(TabletError::MinorFreezeNotAllow.into());
        }
        let mt = Memtable::new(self.tablet_id, clog_checkpoint_scn, schema_version, for_replay);
        list.push_back(Arc::clone(&mt));
        log::debug!(
            "created memtable: tablet={} start_scn={clog_checkpoint_scn} cnt={}",
            self.tablet_id,
            list.len()
        );
        Ok(mt)
    }

    /// Freeze the active memtable at `end_scn`. No-op if there is none.
    pub fn freeze_active(&self, end_scn: Scn) -> Option<Arc<Memtable>> {
        let _freeze = self.freeze_lock.lock();
        let list = self.list.read();
        let back = list.back()?;
        if !back.is_active() {
            return None;
        }
        back.freeze(end_scn);
        Some(Arc::clone(back))
    }

    /// Drop all frozen memtables whose data is durable at or below
    /// `scn` and whose callbacks are fully resolved. Returns the number
    /// released.
    pub fn release_memtables(&self, scn: Scn) -> usize {
        let mut list = self.list.write();
        let mut released = 0;
        while let Some(front) = list.front() {
            if front.ready_for_release(scn) {
                list.pop_front();
                released += 1;
            } else {
                break;
            }
        }
        if released > 0 {
            log::debug!(
                "released {released} memtables: tablet={} up_to_scn={scn}",
                self.tablet_id
            );
        }
        released
    }

    /// Drop everything regardless of durability; follower offline only.
    pub fn release_all(&self) -> usize {
        let mut list = self.list.write();
        let n = list.len();
        list.clear();
        n
    }

    /// The memtable whose scn range contains `replay_scn`.
    pub fn get_memtable_for_replay(&self, replay_scn: Scn) -> Result<Arc<Memtable>> {
        let list = self.list.read();
        for mt in list.iter() {
            if mt.contains_scn(replay_scn) {
                return Ok(Arc::clone(mt));
            }
        }
        // The record predates the first memtable: its data is already in
        // sstables.
        Err(TabletError::EntryNotExist.into())
    }

    /// Latest multi-source-data unit of `kind` from any memtable, newest
    /// first. Observes uncommitted state by design.
    pub fn get_multi_source_data(&self, kind: MsdKind) -> Option<MultiSourceData> {
        let list = self.list.read();
        list.iter().rev().find_map(|mt| mt.get_multi_source_data(kind))
    }

    pub fn memtable_count(&self) -> usize {
        self.list.read().len()
    }

    pub fn get_all_memtables(&self) -> Vec<Arc<Memtable>> {
        self.list.read().iter().cloned().collect()
    }

    pub fn has_memtable(&self) -> bool {
        !self.list.read().is_empty()
    }
}
