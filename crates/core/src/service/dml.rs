//! DML plumbing: per-call parameters, the running context bundle and the
//! defensive row checks.

use std::time::Instant;

use bitflags::bitflags;
use tabletdb_primitives::{SchemaVersion, Version};

use crate::datum::{Datum, Row};
use crate::error::{DmlError, Result, StorageError};
use crate::memtable::MemtableCtx;
use crate::schema::StorageSchema;
use crate::tablet::TabletHandle;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DmlFlags: u32 {
        /// Skip the rowkey duplicate check (multi-row conflict handling is
        /// done by the caller).
        const SKIP_ROWKEY_CHECK = 1 << 0;
        /// The statement is part of a batched multi-statement
        /// optimization; logical violations roll back the whole batch.
        const BATCHED_MULTI_STMT = 1 << 1;
    }
}

/// Per-call DML parameters.
#[derive(Clone, Debug)]
pub struct DmlParam {
    /// Read snapshot of the owning transaction.
    pub snapshot: Version,
    /// Absolute deadline; any blocking primitive returns `Timeout` past it.
    pub timeout: Instant,
    pub schema_version: SchemaVersion,
    pub flags: DmlFlags,
}

impl DmlParam {
    pub fn new(snapshot: Version, timeout: Instant, schema_version: SchemaVersion) -> Self {
        Self {
            snapshot,
            timeout,
            schema_version,
            flags: DmlFlags::default(),
        }
    }

    pub fn check_timeout(&self) -> Result<()> {
        if Instant::now() > self.timeout {
            return Err(StorageError::Timeout);
        }
        Ok(())
    }
}

/// Everything one DML call carries through the write path.
pub struct DmlRunningCtx<'a> {
    pub tablet: TabletHandle,
    pub tx: &'a MemtableCtx,
    pub param: &'a DmlParam,
}

impl<'a> DmlRunningCtx<'a> {
    pub fn new(tablet: TabletHandle, tx: &'a MemtableCtx, param: &'a DmlParam) -> Self {
        Self { tablet, tx, param }
    }

    pub fn schema(&self) -> &StorageSchema {
        self.tablet.storage_schema()
    }
}

/// Old-row legitimacy: the row the statement claims to replace must match
/// what storage holds, column by column. A mismatch means the plan worked
/// from stale state and must not blindly overwrite.
pub fn check_old_row_legitimacy(
    ctx: &DmlRunningCtx<'_>,
    claimed_old: &Row,
) -> Result<()> {
    let schema = ctx.schema();
    let key = claimed_old.rowkey(schema.rowkey_count);
    let stored = ctx.tablet.read_row(&key, Version::MAX)?;
    let Some(stored) = stored else {
        return Err(DmlError::DefensiveCheck(format!(
            "old row vanished from storage: key={key}"
        ))
        .into());
    };
    if stored.len() != claimed_old.len() {
        return Err(DmlError::DefensiveCheck(format!(
            "old row arity mismatch: key={key} stored={} claimed={}",
            stored.len(),
            claimed_old.len()
        ))
        .into());
    }
    for (idx, (stored_col, claimed_col)) in stored.0.iter().zip(&claimed_old.0).enumerate() {
        // Nop columns carry no claim; lob locators are resolved elsewhere.
        if matches!(claimed_col, Datum::Null) && !matches!(stored_col, Datum::Null) {
            continue;
        }
        if stored_col != claimed_col {
            return Err(DmlError::DefensiveCheck(format!(
                "old row mismatch at column {idx}: key={key} stored={stored_col} claimed={claimed_col}"
            ))
            .into());
        }
    }
    Ok(())
}

/// Translate logical violations in a batched multi-statement so the
/// optimizer retries without the batch.
pub fn translate_batch_error(err: StorageError, flags: DmlFlags) -> StorageError {
    if !flags.contains(DmlFlags::BATCHED_MULTI_STMT) {
        return err;
    }
    match &err {
        StorageError::Dml(DmlError::DefensiveCheck(_))
        | StorageError::Dml(DmlError::PrimaryKeyDuplicate { .. })
        | StorageError::Dml(DmlError::BadNull { .. }) => {
            DmlError::BatchedMultiStmtRollback.into()
        }
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn batch_translation_only_covers_logical_violations() {
        let flags = DmlFlags::BATCHED_MULTI_STMT;
        let translated = translate_batch_error(
            DmlError::DefensiveCheck("x".into()).into(),
            flags,
        );
        assert_eq!(
            translated,
            StorageError::Dml(DmlError::BatchedMultiStmtRollback)
        );

        let untouched = translate_batch_error(StorageError::Timeout, flags);
        assert_eq!(untouched, StorageError::Timeout);

        let unbatched = translate_batch_error(
            DmlError::DefensiveCheck("x".into()).into(),
            DmlFlags::default(),
        );
        assert!(matches!(
            unbatched,
            StorageError::Dml(DmlError::DefensiveCheck(_))
        ));
    }
}
