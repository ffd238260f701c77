//! Redo record framing.
//!
//! Redo (clog) is the consensus-replicated transaction log, distinct from
//! the SLOG metadata log. Every record begins with a [`LogBaseHeader`];
//! transaction redo carries packed callbacks, while tablet-seq syncs and
//! schema-version changes are small structured records.

use tabletdb_primitives::{Scn, SchemaVersion, TabletId};
use tabletdb_slog::buffer::{BufReader, BufWriter, DecodeError};

use crate::error::Result;

/// Upper bound of one redo record's payload: 1.875 MiB. A single row that
/// does not fit is rejected as too big.
pub const MAX_REDO_PAYLOAD: usize = 15 << 17;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogBaseType {
    TxRedo,
    SyncTabletSeq,
    SchemaVersionChange,
}

/// Whether replay of this record must be ordered against all others.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayBarrier {
    NoNeed,
    Strict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogBaseHeader {
    pub base_type: LogBaseType,
    pub barrier: ReplayBarrier,
}

impl LogBaseHeader {
    pub fn new(base_type: LogBaseType) -> Self {
        let barrier = match base_type {
            LogBaseType::TxRedo | LogBaseType::SyncTabletSeq => ReplayBarrier::NoNeed,
            LogBaseType::SchemaVersionChange => ReplayBarrier::Strict,
        };
        Self { base_type, barrier }
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u8(match self.base_type {
            LogBaseType::TxRedo => 1,
            LogBaseType::SyncTabletSeq => 2,
            LogBaseType::SchemaVersionChange => 3,
        });
        out.put_u8(match self.barrier {
            ReplayBarrier::NoNeed => 0,
            ReplayBarrier::Strict => 1,
        });
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> std::result::Result<Self, DecodeError> {
        let base_type = match reader.get_u8()? {
            1 => LogBaseType::TxRedo,
            2 => LogBaseType::SyncTabletSeq,
            3 => LogBaseType::SchemaVersionChange,
            tag => {
                return Err(DecodeError::InvalidTag {
                    ty: "LogBaseHeader",
                    tag: tag as u16,
                })
            }
        };
        let barrier = match reader.get_u8()? {
            0 => ReplayBarrier::NoNeed,
            1 => ReplayBarrier::Strict,
            tag => {
                return Err(DecodeError::InvalidTag {
                    ty: "ReplayBarrier",
                    tag: tag as u16,
                })
            }
        };
        Ok(Self { base_type, barrier })
    }
}

/// Structured record: a tablet auto-increment sequence sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncTabletSeqLog {
    pub tablet_id: TabletId,
    pub new_seq: u64,
}

impl SyncTabletSeqLog {
    pub fn encode(&self, out: &mut impl BufWriter) {
        LogBaseHeader::new(LogBaseType::SyncTabletSeq).encode(out);
        out.put_u64(self.tablet_id.0);
        out.put_u64(self.new_seq);
    }

    pub fn decode_payload<'a>(
        reader: &mut impl BufReader<'a>,
    ) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            tablet_id: TabletId(reader.get_u64()?),
            new_seq: reader.get_u64()?,
        })
    }
}

/// Structured record: a storage schema version change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchemaVersionChangeLog {
    pub tablet_id: TabletId,
    pub schema_version: SchemaVersion,
}

impl SchemaVersionChangeLog {
    pub fn encode(&self, out: &mut impl BufWriter) {
        LogBaseHeader::new(LogBaseType::SchemaVersionChange).encode(out);
        out.put_u64(self.tablet_id.0);
        out.put_u64(self.schema_version.0);
    }

    pub fn decode_payload<'a>(
        reader: &mut impl BufReader<'a>,
    ) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            tablet_id: TabletId(reader.get_u64()?),
            schema_version: SchemaVersion(reader.get_u64()?),
        })
    }
}

/// The consensus log layer, an external collaborator.
///
/// `append` blocks until majority acknowledgement and returns the scn the
/// record was assigned. Implementations must assign strictly increasing
/// scns per log stream.
pub trait LogHandler: Send + Sync {
    fn append(&self, payload: &[u8]) -> Result<Scn>;

    /// Current maximum assigned scn.
    fn max_scn(&self) -> Scn;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// In-process log handler assigning consecutive scns.
    #[derive(Default)]
    pub struct MockLogHandler {
        next: AtomicU64,
        pub appended: parking_lot::Mutex<Vec<Vec<u8>>>,
    }

    impl MockLogHandler {
        pub fn starting_at(scn: u64) -> Self {
            Self {
                next: AtomicU64::new(scn),
                appended: Default::default(),
            }
        }
    }

    impl LogHandler for MockLogHandler {
        fn append(&self, payload: &[u8]) -> Result<Scn> {
            self.appended.lock().push(payload.to_vec());
            Ok(Scn(self.next.fetch_add(1, Ordering::AcqRel) + 1))
        }

        fn max_scn(&self) -> Scn {
            Scn(self.next.load(Ordering::Acquire))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_roundtrip_and_barriers() {
        for base_type in [
            LogBaseType::TxRedo,
            LogBaseType::SyncTabletSeq,
            LogBaseType::SchemaVersionChange,
        ] {
            let hdr = LogBaseHeader::new(base_type);
            let mut buf = Vec::new();
            hdr.encode(&mut buf);
            assert_eq!(LogBaseHeader::decode(&mut buf.as_slice()).unwrap(), hdr);
        }
        assert_eq!(
            LogBaseHeader::new(LogBaseType::SyncTabletSeq).barrier,
            ReplayBarrier::NoNeed
        );
        assert_eq!(
            LogBaseHeader::new(LogBaseType::SchemaVersionChange).barrier,
            ReplayBarrier::Strict
        );
    }

    #[test]
    fn sync_tablet_seq_roundtrip() {
        let rec = SyncTabletSeqLog {
            tablet_id: TabletId(1001),
            new_seq: 5000,
        };
        let mut buf = Vec::new();
        rec.encode(&mut buf);
        let mut reader = buf.as_slice();
        let hdr = LogBaseHeader::decode(&mut reader).unwrap();
        assert_eq!(hdr.base_type, LogBaseType::SyncTabletSeq);
        assert_eq!(SyncTabletSeqLog::decode_payload(&mut reader).unwrap(), rec);
    }

    #[test]
    fn schema_version_change_carries_a_strict_barrier() {
        let rec = SchemaVersionChangeLog {
            tablet_id: TabletId(1001),
            schema_version: SchemaVersion(7),
        };
        let mut buf = Vec::new();
        rec.encode(&mut buf);
        let mut reader = buf.as_slice();
        let hdr = LogBaseHeader::decode(&mut reader).unwrap();
        assert_eq!(hdr.barrier, ReplayBarrier::Strict);
        assert_eq!(
            SchemaVersionChangeLog::decode_payload(&mut reader).unwrap(),
            rec
        );
    }
}
