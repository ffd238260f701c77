//! Large-object routing.
//!
//! LOB columns are a DML-time indirection: inserts may move a large value
//! out of row, deletes and updates must erase prior out-of-row storage
//! before the new value lands. The manager is a collaborator behind a
//! trait; the engine only guarantees it is consulted at the right points.

use std::sync::Arc;

use tabletdb_primitives::{ColId, LogStreamId, TabletId, Version};

use crate::datum::Datum;
use crate::error::Result;

/// Values at or below this many bytes always stay in row.
pub const LOB_INROW_THRESHOLD: usize = 4096;

/// Addressing context handed to the LOB manager on every call.
#[derive(Clone, Debug)]
pub struct LobAccessParam {
    pub ls_id: LogStreamId,
    pub tablet_id: TabletId,
    pub col_id: ColId,
    pub snapshot: Version,
}

/// The LOB storage collaborator.
///
/// `prepare_insert` returns the datum to store in row: either the value
/// itself (in-row) or a locator the manager can resolve later.
/// `erase` releases whatever `prepare_insert` allocated for a stored datum.
pub trait LobManager: Send + Sync {
    fn prepare_insert(&self, param: &LobAccessParam, value: Datum) -> Result<Datum>;
    fn erase(&self, param: &LobAccessParam, stored: &Datum) -> Result<()>;
}

/// Keeps every value in row. The default when no out-of-row storage is
/// wired up.
#[derive(Default)]
pub struct InRowLobManager;

impl LobManager for InRowLobManager {
    fn prepare_insert(&self, _param: &LobAccessParam, value: Datum) -> Result<Datum> {
        Ok(value)
    }

    fn erase(&self, _param: &LobAccessParam, _stored: &Datum) -> Result<()> {
        Ok(())
    }
}

/// Whether a value is large enough to interest the LOB manager.
pub fn is_lob_candidate(value: &Datum) -> bool {
    matches!(value, Datum::Str(s) if s.len() > LOB_INROW_THRESHOLD)
}

pub type SharedLobManager = Arc<dyn LobManager>;
