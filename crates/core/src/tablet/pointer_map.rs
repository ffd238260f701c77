//! Tablet pointer registry.
//!
//! Maps `(log_stream_id, tablet_id)` to the published tablet object and
//! the disk address of its serialized image. Publication goes through one
//! primitive only: [`TabletPointerMap::compare_and_swap_tablet`], called
//! after the corresponding SLOG batch committed. Readers take a shared
//! handle under the bucket lock.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tabletdb_primitives::TabletKey;
use tabletdb_slog::DiskAddr;

use crate::error::{Result, TabletError};
use crate::tablet::Tablet;

pub type TabletHandle = Arc<Tablet>;

const BUCKET_CNT: usize = 128;

#[derive(Clone)]
struct TabletPointer {
    addr: DiskAddr,
    tablet: TabletHandle,
}

pub struct TabletPointerMap {
    buckets: Vec<RwLock<HashMap<TabletKey, TabletPointer>>>,
    /// Tablets whose lifecycle transaction has not finalized; kept out of
    /// eviction until unpinned.
    pinned: Mutex<HashSet<TabletKey>>,
}

impl Default for TabletPointerMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TabletPointerMap {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_CNT).map(|_| RwLock::new(HashMap::new())).collect(),
            pinned: Mutex::new(HashSet::new()),
        }
    }

    /// Bucket index of `key`. Multi-key operations must take bucket locks
    /// in ascending index order.
    pub fn bucket_index(&self, key: &TabletKey) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % BUCKET_CNT
    }

    fn bucket(&self, key: &TabletKey) -> &RwLock<HashMap<TabletKey, TabletPointer>> {
        &self.buckets[self.bucket_index(key)]
    }

    /// The currently-published handle, if any.
    pub fn acquire_tablet(&self, key: &TabletKey) -> Option<TabletHandle> {
        let bucket = self.bucket(key).read();
        bucket.get(key).map(|p| Arc::clone(&p.tablet))
    }

    pub fn get_disk_addr(&self, key: &TabletKey) -> Option<DiskAddr> {
        let bucket = self.bucket(key).read();
        bucket.get(key).map(|p| p.addr)
    }

    pub fn contains(&self, key: &TabletKey) -> bool {
        self.bucket(key).read().contains_key(key)
    }

    /// Atomically replace the published handle, iff the current one equals
    /// `old`. `old == None` publishes a new tablet and demands the slot be
    /// empty.
    ///
    /// The caller has already persisted the SLOG batch, so a mismatch here
    /// means the registry diverged from durable state: that is a fatal
    /// invariant break, not an error to handle.
    pub fn compare_and_swap_tablet(
        &self,
        key: &TabletKey,
        new_addr: DiskAddr,
        old: Option<&TabletHandle>,
        new: TabletHandle,
    ) -> Result<()> {
        let mut bucket = self.bucket(key).write();
        let current = bucket.get(key);
        let matches = match (current, old) {
            (None, None) => true,
            (Some(cur), Some(old)) => Arc::ptr_eq(&cur.tablet, old),
            _ => false,
        };
        if !matches {
            log::error!(
                "tablet CAS mismatch after slog commit: key={key} have={} expect-old={}",
                current.is_some(),
                old.is_some()
            );
            panic!("tablet pointer map diverged from slog");
        }
        bucket.insert(
            *key,
            TabletPointer {
                addr: new_addr,
                tablet: new,
            },
        );
        Ok(())
    }

    /// Remove the tablet. Idempotent: removing an absent key is `Ok`.
    pub fn del_tablet(&self, key: &TabletKey) -> Result<()> {
        let mut bucket = self.bucket(key).write();
        if bucket.remove(key).is_none() {
            log::debug!("del_tablet on absent key {key}");
        }
        self.pinned.lock().remove(key);
        Ok(())
    }

    pub fn pin(&self, key: TabletKey) {
        self.pinned.lock().insert(key);
    }

    pub fn unpin(&self, key: &TabletKey) {
        self.pinned.lock().remove(key);
    }

    pub fn is_pinned(&self, key: &TabletKey) -> bool {
        self.pinned.lock().contains(key)
    }

    pub fn tablet_count(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    pub fn keys(&self) -> Vec<TabletKey> {
        let mut keys = Vec::new();
        for bucket in &self.buckets {
            keys.extend(bucket.read().keys().copied());
        }
        keys
    }

    pub fn for_each<F: FnMut(&TabletKey, &TabletHandle)>(&self, mut f: F) {
        for bucket in &self.buckets {
            let bucket = bucket.read();
            for (key, ptr) in bucket.iter() {
                f(key, &ptr.tablet);
            }
        }
    }

    /// Ensure the currently-published handle is exactly `expected`; used
    /// by callers that validated state before writing SLOG.
    pub fn verify_published(&self, key: &TabletKey, expected: &TabletHandle) -> Result<()> {
        let bucket = self.bucket(key).read();
        match bucket.get(key) {
            Some(ptr) if Arc::ptr_eq(&ptr.tablet, expected) => Ok(()),
            Some(_) => Err(TabletError::EntryExist.into()),
            None => Err(TabletError::NotExist(*key).into()),
        }
    }
}
