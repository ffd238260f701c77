//! Row value model.
//!
//! The storage layer is typed but deliberately narrow: integers, unsigned
//! integers and strings cover everything the engine itself needs to order,
//! compare and serialize. Wider SQL types live above this layer.

use std::fmt;

use tabletdb_slog::buffer::{get_bytes, put_bytes, BufReader, BufWriter, DecodeError};

/// One column value.
///
/// The derived ordering is by variant first (`Null` sorts lowest), then by
/// value, which matches the rowkey comparator of the original engine in
/// mysql compat mode.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Datum {
    Null,
    Int(i64),
    Uint(u64),
    Str(Box<str>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatumKind {
    Int,
    Uint,
    Str,
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Whether this value is storable in a column of `kind`.
    pub fn conforms_to(&self, kind: DatumKind) -> bool {
        matches!(
            (self, kind),
            (Datum::Null, _)
                | (Datum::Int(_), DatumKind::Int)
                | (Datum::Uint(_), DatumKind::Uint)
                | (Datum::Str(_), DatumKind::Str)
        )
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        match self {
            Datum::Null => out.put_u8(0),
            Datum::Int(v) => {
                out.put_u8(1);
                out.put_i64(*v);
            }
            Datum::Uint(v) => {
                out.put_u8(2);
                out.put_u64(*v);
            }
            Datum::Str(s) => {
                out.put_u8(3);
                put_bytes(out, s.as_bytes());
            }
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        Ok(match reader.get_u8()? {
            0 => Datum::Null,
            1 => Datum::Int(reader.get_i64()?),
            2 => Datum::Uint(reader.get_u64()?),
            3 => {
                let bytes = get_bytes(reader)?;
                Datum::Str(String::from_utf8_lossy(bytes).into())
            }
            tag => {
                return Err(DecodeError::InvalidTag {
                    ty: "Datum",
                    tag: tag as u16,
                })
            }
        })
    }

    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Datum::Null => 0,
            Datum::Int(_) | Datum::Uint(_) => 8,
            Datum::Str(s) => 4 + s.len(),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Int(v) => write!(f, "{v}"),
            Datum::Uint(v) => write!(f, "{v}"),
            Datum::Str(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<u64> for Datum {
    fn from(v: u64) -> Self {
        Datum::Uint(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Str(v.into())
    }
}

/// One full row, column values in schema order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Row(pub Vec<Datum>);

impl Row {
    pub fn new(cols: Vec<Datum>) -> Self {
        Self(cols)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The rowkey prefix of this row.
    pub fn rowkey(&self, rowkey_count: usize) -> RowKey {
        RowKey(self.0[..rowkey_count].to_vec())
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.0.len() as u32);
        for datum in &self.0 {
            datum.encode(out);
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let n = reader.get_u32()? as usize;
        let mut cols = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            cols.push(Datum::decode(reader)?);
        }
        Ok(Self(cols))
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.0.iter().map(Datum::encoded_len).sum::<usize>()
    }
}

impl std::ops::Index<usize> for Row {
    type Output = Datum;

    fn index(&self, idx: usize) -> &Datum {
        &self.0[idx]
    }
}

impl FromIterator<Datum> for Row {
    fn from_iter<T: IntoIterator<Item = Datum>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An ordered rowkey: the leading columns of a row.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey(pub Vec<Datum>);

impl RowKey {
    pub fn new(cols: Vec<Datum>) -> Self {
        Self(cols)
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.0.len() as u32);
        for datum in &self.0 {
            datum.encode(out);
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        Ok(Self(Row::decode(reader)?.0))
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.0.iter().map(Datum::encoded_len).sum::<usize>()
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for datum in &self.0 {
            if !first {
                write!(f, "-")?;
            }
            first = false;
            match datum {
                Datum::Str(s) => write!(f, "{s}")?,
                other => write!(f, "{other}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn null_sorts_first() {
        assert!(Datum::Null < Datum::Int(i64::MIN));
        assert!(Datum::Int(i64::MAX) < Datum::Uint(0));
        assert!(Datum::Uint(u64::MAX) < Datum::Str("".into()));
    }

    #[test]
    fn rowkey_display_matches_error_format() {
        let key = RowKey::new(vec![Datum::Int(1), Datum::Str("x".into())]);
        assert_eq!(key.to_string(), "1-x");
    }

    fn datum_strategy() -> impl Strategy<Value = Datum> {
        prop_oneof![
            Just(Datum::Null),
            any::<i64>().prop_map(Datum::Int),
            any::<u64>().prop_map(Datum::Uint),
            "[a-z]{0,12}".prop_map(|s| Datum::Str(s.into())),
        ]
    }

    proptest! {
        #[test]
        fn row_roundtrip(cols in prop::collection::vec(datum_strategy(), 0..8)) {
            let row = Row::new(cols);
            let mut buf = Vec::new();
            row.encode(&mut buf);
            prop_assert_eq!(buf.len(), row.encoded_len());
            let decoded = Row::decode(&mut buf.as_slice()).unwrap();
            prop_assert_eq!(row, decoded);
        }
    }
}
