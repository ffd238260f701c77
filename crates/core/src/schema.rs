//! Storage schema: the logical-schema snapshot a tablet carries, plus the
//! precomputed read projection shared by all readers.

use tabletdb_primitives::{ColId, SchemaVersion};
use tabletdb_slog::buffer::{get_str, put_str, BufReader, BufWriter, DecodeError};

use crate::datum::{DatumKind, Row};
use crate::error::{DmlError, StorageError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompatMode {
    #[default]
    Mysql,
    Oracle,
}

/// What kind of table this schema describes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexKind {
    /// A data table (the primary key is the rowkey).
    #[default]
    Data,
    /// A unique index table: rowkey duplicates fail the write.
    UniqueIndex,
    /// A non-unique index table.
    Index,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSchema {
    pub id: ColId,
    pub name: String,
    pub kind: DatumKind,
    pub nullable: bool,
}

impl ColumnSchema {
    fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.id.0);
        put_str(out, &self.name);
        out.put_u8(match self.kind {
            DatumKind::Int => 1,
            DatumKind::Uint => 2,
            DatumKind::Str => 3,
        });
        out.put_u8(self.nullable as u8);
    }

    fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let id = ColId(reader.get_u32()?);
        let name = get_str(reader)?;
        let kind = match reader.get_u8()? {
            1 => DatumKind::Int,
            2 => DatumKind::Uint,
            3 => DatumKind::Str,
            tag => {
                return Err(DecodeError::InvalidTag {
                    ty: "ColumnSchema",
                    tag: tag as u16,
                })
            }
        };
        let nullable = reader.get_u8()? != 0;
        Ok(Self {
            id,
            name,
            kind,
            nullable,
        })
    }
}

/// The schema snapshot stored in a tablet. Columns are in storage order;
/// the first `rowkey_count` columns form the rowkey.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageSchema {
    pub version: SchemaVersion,
    pub compat_mode: CompatMode,
    pub index_kind: IndexKind,
    pub rowkey_count: usize,
    pub columns: Vec<ColumnSchema>,
}

impl StorageSchema {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Whether an empty major sstable must exist from creation. Index
    /// tables start without one; their majors appear at first compaction.
    pub fn demands_major(&self) -> bool {
        self.index_kind == IndexKind::Data
    }

    pub fn is_unique_index(&self) -> bool {
        matches!(self.index_kind, IndexKind::UniqueIndex)
    }

    /// The index name used in duplicate-key messages.
    pub fn constraint_name(&self) -> &str {
        match self.index_kind {
            IndexKind::Data => "PRIMARY",
            IndexKind::UniqueIndex | IndexKind::Index => "INDEX",
        }
    }

    /// Validate arity, column kinds and nullability of a full row.
    pub fn validate_row(&self, row: &Row) -> Result<(), StorageError> {
        if row.len() != self.columns.len() {
            return Err(StorageError::InvalidArgument("row arity mismatch"));
        }
        for (datum, col) in row.0.iter().zip(&self.columns) {
            if datum.is_null() && !col.nullable {
                return Err(DmlError::BadNull {
                    column: col.name.clone(),
                }
                .into());
            }
            if !datum.conforms_to(col.kind) {
                return Err(StorageError::InvalidArgument("column type mismatch"));
            }
        }
        // Rowkey columns may never be null, nullable or not.
        for (datum, col) in row.0.iter().zip(&self.columns).take(self.rowkey_count) {
            if datum.is_null() {
                return Err(DmlError::BadNull {
                    column: col.name.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn build_read_info(&self) -> ReadInfo {
        ReadInfo {
            schema_version: self.version,
            rowkey_count: self.rowkey_count,
            compat_mode: self.compat_mode,
            cols: self.columns.iter().map(|c| c.id).collect(),
        }
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u64(self.version.0);
        out.put_u8(match self.compat_mode {
            CompatMode::Mysql => 0,
            CompatMode::Oracle => 1,
        });
        out.put_u8(match self.index_kind {
            IndexKind::Data => 0,
            IndexKind::UniqueIndex => 1,
            IndexKind::Index => 2,
        });
        out.put_u32(self.rowkey_count as u32);
        out.put_u32(self.columns.len() as u32);
        for col in &self.columns {
            col.encode(out);
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let version = SchemaVersion(reader.get_u64()?);
        let compat_mode = match reader.get_u8()? {
            0 => CompatMode::Mysql,
            1 => CompatMode::Oracle,
            tag => {
                return Err(DecodeError::InvalidTag {
                    ty: "CompatMode",
                    tag: tag as u16,
                })
            }
        };
        let index_kind = match reader.get_u8()? {
            0 => IndexKind::Data,
            1 => IndexKind::UniqueIndex,
            2 => IndexKind::Index,
            tag => {
                return Err(DecodeError::InvalidTag {
                    ty: "IndexKind",
                    tag: tag as u16,
                })
            }
        };
        let rowkey_count = reader.get_u32()? as usize;
        let n = reader.get_u32()? as usize;
        let mut columns = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            columns.push(ColumnSchema::decode(reader)?);
        }
        Ok(Self {
            version,
            compat_mode,
            index_kind,
            rowkey_count,
            columns,
        })
    }
}

/// Precomputed projection shared by every reader of one tablet: rowkey
/// length, projected column ids and the compat mode. Rebuilt whenever the
/// storage schema advances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadInfo {
    pub schema_version: SchemaVersion,
    pub rowkey_count: usize,
    pub compat_mode: CompatMode,
    pub cols: Vec<ColId>,
}

impl ReadInfo {
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u64(self.schema_version.0);
        out.put_u32(self.rowkey_count as u32);
        out.put_u8(match self.compat_mode {
            CompatMode::Mysql => 0,
            CompatMode::Oracle => 1,
        });
        out.put_u32(self.cols.len() as u32);
        for col in &self.cols {
            out.put_u32(col.0);
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let schema_version = SchemaVersion(reader.get_u64()?);
        let rowkey_count = reader.get_u32()? as usize;
        let compat_mode = match reader.get_u8()? {
            0 => CompatMode::Mysql,
            _ => CompatMode::Oracle,
        };
        let n = reader.get_u32()? as usize;
        let mut cols = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            cols.push(ColId(reader.get_u32()?));
        }
        Ok(Self {
            schema_version,
            rowkey_count,
            compat_mode,
            cols,
        })
    }
}

/// Convenience constructor used widely in tests and by the service layer.
pub fn schema_of(
    version: u64,
    rowkey_count: usize,
    cols: &[(&str, DatumKind, bool)],
) -> StorageSchema {
    StorageSchema {
        version: SchemaVersion(version),
        compat_mode: CompatMode::Mysql,
        index_kind: IndexKind::Data,
        rowkey_count,
        columns: cols
            .iter()
            .enumerate()
            .map(|(i, (name, kind, nullable))| ColumnSchema {
                id: ColId(16 + i as u32),
                name: (*name).to_owned(),
                kind: *kind,
                nullable: *nullable,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::Datum;
    use pretty_assertions::assert_eq;

    fn two_col_schema() -> StorageSchema {
        schema_of(
            1,
            1,
            &[("a", DatumKind::Int, false), ("b", DatumKind::Int, true)],
        )
    }

    #[test]
    fn roundtrip() {
        let schema = two_col_schema();
        let mut buf = Vec::new();
        schema.encode(&mut buf);
        assert_eq!(StorageSchema::decode(&mut buf.as_slice()).unwrap(), schema);
    }

    #[test]
    fn validate_rejects_null_in_non_nullable() {
        let schema = two_col_schema();
        let row = Row::new(vec![Datum::Int(1), Datum::Null]);
        assert!(schema.validate_row(&row).is_ok());

        let row = Row::new(vec![Datum::Null, Datum::Int(1)]);
        assert!(matches!(
            schema.validate_row(&row),
            Err(StorageError::Dml(DmlError::BadNull { .. }))
        ));
    }

    #[test]
    fn validate_rejects_wrong_arity_and_kind() {
        let schema = two_col_schema();
        assert!(schema.validate_row(&Row::new(vec![Datum::Int(1)])).is_err());
        assert!(schema
            .validate_row(&Row::new(vec![Datum::Str("x".into()), Datum::Int(2)]))
            .is_err());
    }

    #[test]
    fn read_info_projects_all_columns() {
        let schema = two_col_schema();
        let info = schema.build_read_info();
        assert_eq!(info.rowkey_count, 1);
        assert_eq!(info.cols.len(), 2);
        assert_eq!(info.schema_version, schema.version);
    }
}
