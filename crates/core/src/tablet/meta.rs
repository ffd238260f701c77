//! Persistent tablet metadata.

use tabletdb_primitives::{LogStreamId, Scn, SchemaVersion, TabletId, TabletKey, TxId, Version};
use tabletdb_slog::buffer::{BufReader, BufWriter, DecodeError};

use crate::schema::CompatMode;

/// Lifecycle state of a tablet within its creation/removal transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TabletStatus {
    #[default]
    Normal,
    Creating,
    Deleting,
    Deleted,
    Max,
}

impl TabletStatus {
    fn tag(self) -> u8 {
        match self {
            TabletStatus::Normal => 0,
            TabletStatus::Creating => 1,
            TabletStatus::Deleting => 2,
            TabletStatus::Deleted => 3,
            TabletStatus::Max => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        Ok(match tag {
            0 => TabletStatus::Normal,
            1 => TabletStatus::Creating,
            2 => TabletStatus::Deleting,
            3 => TabletStatus::Deleted,
            4 => TabletStatus::Max,
            tag => {
                return Err(DecodeError::InvalidTag {
                    ty: "TabletStatus",
                    tag: tag as u16,
                })
            }
        })
    }
}

/// Current tablet-lifecycle-transaction state. `tablet_status == Normal`
/// if and only if the tablet is visible to DML and reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxData {
    pub tx_id: TxId,
    pub tablet_status: TabletStatus,
    pub tx_scn: Scn,
}

impl TxData {
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u64(self.tx_id.0);
        out.put_u8(self.tablet_status.tag());
        out.put_u64(self.tx_scn.0);
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        Ok(Self {
            tx_id: TxId(reader.get_u64()?),
            tablet_status: TabletStatus::from_tag(reader.get_u8()?)?,
            tx_scn: Scn(reader.get_u64()?),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TabletDataStatus {
    #[default]
    None,
    Full,
    Incomplete,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TabletRestoreStatus {
    #[default]
    None,
    Pending,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TabletExpectedStatus {
    #[default]
    None,
    Deleted,
}

/// High-availability status triple. Anything other than all-`None` makes
/// the replica unreadable for user reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HaStatus {
    pub data_status: TabletDataStatus,
    pub restore_status: TabletRestoreStatus,
    pub expected_status: TabletExpectedStatus,
}

impl HaStatus {
    pub fn is_none(&self) -> bool {
        self.data_status == TabletDataStatus::None
            && self.restore_status == TabletRestoreStatus::None
            && self.expected_status == TabletExpectedStatus::None
    }

    pub fn migrating() -> Self {
        Self {
            data_status: TabletDataStatus::Incomplete,
            ..Default::default()
        }
    }

    fn encode(&self, out: &mut impl BufWriter) {
        out.put_u8(match self.data_status {
            TabletDataStatus::None => 0,
            TabletDataStatus::Full => 1,
            TabletDataStatus::Incomplete => 2,
        });
        out.put_u8(match self.restore_status {
            TabletRestoreStatus::None => 0,
            TabletRestoreStatus::Pending => 1,
        });
        out.put_u8(match self.expected_status {
            TabletExpectedStatus::None => 0,
            TabletExpectedStatus::Deleted => 1,
        });
    }

    fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let data_status = match reader.get_u8()? {
            0 => TabletDataStatus::None,
            1 => TabletDataStatus::Full,
            _ => TabletDataStatus::Incomplete,
        };
        let restore_status = match reader.get_u8()? {
            0 => TabletRestoreStatus::None,
            _ => TabletRestoreStatus::Pending,
        };
        let expected_status = match reader.get_u8()? {
            0 => TabletExpectedStatus::None,
            _ => TabletExpectedStatus::Deleted,
        };
        Ok(Self {
            data_status,
            restore_status,
            expected_status,
        })
    }
}

/// Links to the auxiliary large-object tablets, when the tablet has any.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BindingInfo {
    pub lob_meta_tablet_id: Option<TabletId>,
    pub lob_piece_tablet_id: Option<TabletId>,
}

impl BindingInfo {
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u64(self.lob_meta_tablet_id.map_or(0, |id| id.0));
        out.put_u64(self.lob_piece_tablet_id.map_or(0, |id| id.0));
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let meta = reader.get_u64()?;
        let piece = reader.get_u64()?;
        Ok(Self {
            lob_meta_tablet_id: (meta != 0).then_some(TabletId(meta)),
            lob_piece_tablet_id: (piece != 0).then_some(TabletId(piece)),
        })
    }
}

/// The fixed part of a tablet's persistent state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletMeta {
    pub ls_id: LogStreamId,
    pub tablet_id: TabletId,
    /// Identity for data tablets; the parent data tablet for index tablets.
    pub data_tablet_id: TabletId,
    pub create_scn: Scn,
    /// Inclusive lower bound of the log-sequence data this tablet
    /// represents. Never moves backward.
    pub start_scn: Scn,
    /// All redo at or below this scn is durable in sstables. Monotonically
    /// non-decreasing per identity.
    pub clog_checkpoint_scn: Scn,
    /// Data at or above this version is visible.
    pub snapshot_version: Version,
    /// Oldest version kept for multi-version reads.
    pub multi_version_start: Version,
    pub compat_mode: CompatMode,
    pub ha_status: HaStatus,
    pub tx_data: TxData,
    pub binding_info: BindingInfo,
    /// Monotone per-tablet auto-increment sequence.
    pub autoinc_seq: u64,
    /// Highest storage schema version made durable so far; never exceeds
    /// the schema carried by the tablet.
    pub max_sync_schema_version: SchemaVersion,
}

impl TabletMeta {
    pub fn key(&self) -> TabletKey {
        TabletKey::new(self.ls_id, self.tablet_id)
    }

    /// Whether DML and reads may see this tablet at all.
    pub fn is_user_visible(&self) -> bool {
        self.tx_data.tablet_status == TabletStatus::Normal
    }

    /// The encoding deliberately leads with the identity pair so that
    /// [`deserialize_id`] can index images without decoding them.
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u64(self.ls_id.0);
        out.put_u64(self.tablet_id.0);
        out.put_u64(self.data_tablet_id.0);
        out.put_u64(self.create_scn.0);
        out.put_u64(self.start_scn.0);
        out.put_u64(self.clog_checkpoint_scn.0);
        out.put_u64(self.snapshot_version.0);
        out.put_u64(self.multi_version_start.0);
        out.put_u8(match self.compat_mode {
            CompatMode::Mysql => 0,
            CompatMode::Oracle => 1,
        });
        self.ha_status.encode(out);
        self.tx_data.encode(out);
        self.binding_info.encode(out);
        out.put_u64(self.autoinc_seq);
        out.put_u64(self.max_sync_schema_version.0);
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let ls_id = LogStreamId(reader.get_u64()?);
        let tablet_id = TabletId(reader.get_u64()?);
        let data_tablet_id = TabletId(reader.get_u64()?);
        let create_scn = Scn(reader.get_u64()?);
        let start_scn = Scn(reader.get_u64()?);
        let clog_checkpoint_scn = Scn(reader.get_u64()?);
        let snapshot_version = Version(reader.get_u64()?);
        let multi_version_start = Version(reader.get_u64()?);
        let compat_mode = match reader.get_u8()? {
            0 => CompatMode::Mysql,
            _ => CompatMode::Oracle,
        };
        let ha_status = HaStatus::decode(reader)?;
        let tx_data = TxData::decode(reader)?;
        let binding_info = BindingInfo::decode(reader)?;
        let autoinc_seq = reader.get_u64()?;
        let max_sync_schema_version = SchemaVersion(reader.get_u64()?);
        Ok(Self {
            ls_id,
            tablet_id,
            data_tablet_id,
            create_scn,
            start_scn,
            clog_checkpoint_scn,
            snapshot_version,
            multi_version_start,
            compat_mode,
            ha_status,
            tx_data,
            binding_info,
            autoinc_seq,
            max_sync_schema_version,
        })
    }
}

/// Medium-compaction bookkeeping carried in the tablet image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediumInfoList {
    pub medium_snapshots: Vec<Version>,
}

impl MediumInfoList {
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.medium_snapshots.len() as u32);
        for v in &self.medium_snapshots {
            out.put_u64(v.0);
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let n = reader.get_u32()? as usize;
        let mut medium_snapshots = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            medium_snapshots.push(Version(reader.get_u64()?));
        }
        Ok(Self { medium_snapshots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn sample_meta() -> TabletMeta {
        TabletMeta {
            ls_id: LogStreamId(1),
            tablet_id: TabletId(1001),
            data_tablet_id: TabletId(1001),
            create_scn: Scn(100),
            start_scn: Scn(100),
            clog_checkpoint_scn: Scn(100),
            snapshot_version: Version(100),
            multi_version_start: Version(100),
            compat_mode: CompatMode::Mysql,
            ha_status: HaStatus::default(),
            tx_data: TxData {
                tx_id: TxId(9),
                tablet_status: TabletStatus::Normal,
                tx_scn: Scn(100),
            },
            binding_info: BindingInfo::default(),
            autoinc_seq: 1,
            max_sync_schema_version: SchemaVersion(1),
        }
    }

    #[test]
    fn meta_roundtrip() {
        let meta = sample_meta();
        let mut buf = Vec::new();
        meta.encode(&mut buf);
        assert_eq!(TabletMeta::decode(&mut buf.as_slice()).unwrap(), meta);
    }

    #[test]
    fn identity_leads_the_encoding() {
        let meta = sample_meta();
        let mut buf = Vec::new();
        meta.encode(&mut buf);
        let mut reader = buf.as_slice();
        assert_eq!(reader.get_u64().unwrap(), meta.ls_id.0);
        assert_eq!(reader.get_u64().unwrap(), meta.tablet_id.0);
    }

    #[test]
    fn visibility_follows_tx_data() {
        let mut meta = sample_meta();
        assert!(meta.is_user_visible());
        meta.tx_data.tablet_status = TabletStatus::Creating;
        assert!(!meta.is_user_visible());
    }
}
