//! Snapshot-consistent scans.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Instant;

use tabletdb_primitives::{SchemaVersion, Version};

use crate::datum::{Row, RowKey};
use crate::error::{Result, SchemaCheckError};
use crate::tablet::Tablet;

/// Per-query scan parameters; built once per statement and reused on
/// rescans.
#[derive(Clone, Debug)]
pub struct TableScanParam {
    pub snapshot: Version,
    pub timeout: Instant,
    /// The schema version the plan was compiled against.
    pub schema_version: SchemaVersion,
    /// The newest schema version this node has refreshed to.
    pub tenant_schema_version: SchemaVersion,
    /// Inclusive/exclusive key range; `None` scans everything.
    pub key_range: Option<(Bound<RowKey>, Bound<RowKey>)>,
}

impl TableScanParam {
    pub fn full(snapshot: Version, timeout: Instant, schema_version: SchemaVersion) -> Self {
        Self {
            snapshot,
            timeout,
            schema_version,
            tenant_schema_version: schema_version,
            key_range: None,
        }
    }

    pub fn with_range(mut self, range: (Bound<RowKey>, Bound<RowKey>)) -> Self {
        self.key_range = Some(range);
        self
    }
}

/// Compare the plan's schema version against the tablet's.
///
/// A plan compiled against an older schema must refresh
/// (`SCHEMA_NOT_UPTODATE`); a plan newer than the tablet has seen waits for
/// the tablet to catch up (`SCHEMA_EAGAIN`), unless this node already
/// refreshed past it, which is a plain schema error upstream.
pub fn check_schema_freshness(tablet: &Tablet, param: &TableScanParam) -> Result<()> {
    let tablet_version = tablet.storage_schema().version;
    if param.schema_version < tablet_version {
        return Err(SchemaCheckError::NotUptodate.into());
    }
    if param.schema_version > tablet_version
        && param.tenant_schema_version < param.schema_version
    {
        return Err(SchemaCheckError::Eagain.into());
    }
    Ok(())
}

/// Materialized merge over all read tables of one tablet. Deleted rows are
/// filtered; survivors come out in rowkey order.
#[derive(Debug)]
pub struct TabletScanIter {
    rows: std::vec::IntoIter<(RowKey, Row)>,
    row_count: usize,
}

impl TabletScanIter {
    pub(crate) fn build(tablet: &Tablet, param: &TableScanParam) -> Result<Self> {
        check_schema_freshness(tablet, param)?;
        let tables = tablet.get_read_tables(param.snapshot, false)?;

        let range = match &param.key_range {
            Some((lo, hi)) => (lo.as_ref(), hi.as_ref()),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        let mut merged: BTreeMap<RowKey, Option<Row>> = BTreeMap::new();
        // Newest store first: the first state seen for a key wins.
        for table in tables.iter().rev() {
            table.collect_visible(param.snapshot, range, &mut merged);
        }
        let rows: Vec<(RowKey, Row)> = merged
            .into_iter()
            .filter_map(|(key, state)| state.map(|row| (key, row)))
            .collect();
        let row_count = rows.len();
        Ok(Self {
            rows: rows.into_iter(),
            row_count,
        })
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }
}

impl Iterator for TabletScanIter {
    type Item = (RowKey, Row);

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}
