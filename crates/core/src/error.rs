use std::io;

use tabletdb_primitives::{TabletId, TabletKey, TxId, Version};
use tabletdb_slog::buffer::DecodeError;
use thiserror::Error;

/// Errors raised while resolving or mutating tablets.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TabletError {
    #[error("tablet {0} not found")]
    NotExist(TabletKey),
    #[error("tablet {0} already exists")]
    Exist(TabletKey),
    #[error("tablet {0} is not readable: replica in restore or migration")]
    NotReadable(TabletKey),
    #[error("snapshot {snapshot} discarded: oldest kept version is {multi_version_start}")]
    SnapshotDiscarded {
        snapshot: Version,
        multi_version_start: Version,
    },
    #[error("no such entry")]
    EntryNotExist,
    #[error("entry already exists")]
    EntryExist,
    #[error("minor freeze not allowed: previous frozen memtables not yet persisted")]
    MinorFreezeNotAllow,
}

/// Errors raised on the DML write path.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DmlError {
    #[error("duplicate entry '{key}' for key '{index_name}'")]
    PrimaryKeyDuplicate { key: String, index_name: String },
    #[error("row lock conflict on tablet {tablet_id}: held by transaction {holder}")]
    TryLockRowConflict { tablet_id: TabletId, holder: TxId },
    #[error("transaction set violation: row changed after snapshot {snapshot}")]
    TransactionSetViolation { snapshot: Version },
    #[error("defensive check failed: {0}")]
    DefensiveCheck(String),
    #[error("column '{column}' cannot be null")]
    BadNull { column: String },
    #[error("batched multi statement rollback")]
    BatchedMultiStmtRollback,
    #[error("row too big for a single redo record: {size} bytes")]
    TooBigRowsize { size: usize },
}

/// Errors raised by memtable transaction contexts.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TxError {
    #[error("not master: write on a replay follower")]
    NotMaster,
    #[error("transaction context is read only")]
    ReadOnly,
    #[error("transaction already finalized with {0:?}")]
    AlreadyEnded(crate::memtable::EndCode),
    #[error("commit not allowed after partial rollback")]
    PartialRollbacked,
    #[error("replay checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    Checksum { expected: u32, calculated: u32 },
    #[error("{unsynced} callbacks not yet synced")]
    UnsyncedRemain { unsynced: usize },
}

/// Errors raised by schema version checks on reads.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaCheckError {
    #[error("schema not refreshed yet, retry")]
    Eagain,
    #[error("schema version is behind the tablet, refresh required")]
    NotUptodate,
    #[error("schema error: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("not initialized")]
    NotInit,
    #[error("operation timed out")]
    Timeout,
    #[error("try again")]
    Eagain,
    #[error("TabletError: {0}")]
    Tablet(#[from] TabletError),
    #[error("DmlError: {0}")]
    Dml(#[from] DmlError),
    #[error("TxError: {0}")]
    Tx(#[from] TxError),
    #[error("SchemaCheckError: {0}")]
    Schema(#[from] SchemaCheckError),
    #[error("DecodeError: {0}")]
    Decode(#[from] DecodeError),
    #[error("IoError: {0}")]
    Io(#[from] io::Error),
    #[error("SlogError: {0}")]
    Slog(#[from] tabletdb_slog::error::Traversal),
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl StorageError {
    /// Whether the caller is expected to retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Eagain
                | StorageError::Dml(DmlError::TryLockRowConflict { .. })
                | StorageError::Dml(DmlError::TransactionSetViolation { .. })
                | StorageError::Schema(SchemaCheckError::Eagain)
                | StorageError::Tablet(TabletError::MinorFreezeNotAllow)
        )
    }
}

impl PartialEq for StorageError {
    fn eq(&self, other: &Self) -> bool {
        use StorageError::*;
        match (self, other) {
            (InvalidArgument(a), InvalidArgument(b)) => a == b,
            (NotInit, NotInit) | (Timeout, Timeout) | (Eagain, Eagain) => true,
            (Tablet(a), Tablet(b)) => a == b,
            (Dml(a), Dml(b)) => a == b,
            (Tx(a), Tx(b)) => a == b,
            (Schema(a), Schema(b)) => a == b,
            (Decode(a), Decode(b)) => a == b,
            (Unexpected(a), Unexpected(b)) => a == b,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
