//! SLOG record model.
//!
//! Each record is a 16-bit command code followed by a length-prefixed
//! payload. Two commands exist: publishing a tablet image at a disk address,
//! and deleting a tablet.

use tabletdb_primitives::{LogStreamId, TabletId, TabletKey};

use crate::buffer::{BufReader, BufWriter, DecodeError};
use crate::varint::{decode_varint, encode_varint};

/// Command code of a [`SlogRecord::PutTablet`].
pub const CMD_PUT_TABLET: u16 = 0x0001;
/// Command code of a [`SlogRecord::DeleteTablet`].
pub const CMD_DELETE_TABLET: u16 = 0x0002;

/// Where a tablet's serialized form lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DiskAddrKind {
    #[default]
    None,
    Memory,
    Disk,
}

/// A disk address. Serializes to exactly [`DiskAddr::ENCODED_LEN`] bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskAddr {
    pub file_id: u64,
    pub offset: u64,
    pub size: u64,
    pub kind: DiskAddrKind,
}

impl DiskAddr {
    pub const ENCODED_LEN: usize = 32;

    pub const fn memory(size: u64) -> Self {
        Self {
            file_id: 0,
            offset: 0,
            size,
            kind: DiskAddrKind::Memory,
        }
    }

    pub const fn none() -> Self {
        Self {
            file_id: 0,
            offset: 0,
            size: 0,
            kind: DiskAddrKind::None,
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == DiskAddrKind::None
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u64(self.file_id);
        out.put_u64(self.offset);
        out.put_u64(self.size);
        out.put_u8(match self.kind {
            DiskAddrKind::None => 0,
            DiskAddrKind::Memory => 1,
            DiskAddrKind::Disk => 2,
        });
        out.put_slice(&[0u8; 7]);
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let file_id = reader.get_u64()?;
        let offset = reader.get_u64()?;
        let size = reader.get_u64()?;
        let kind = match reader.get_u8()? {
            0 => DiskAddrKind::None,
            1 => DiskAddrKind::Memory,
            2 => DiskAddrKind::Disk,
            tag => {
                return Err(DecodeError::InvalidTag {
                    ty: "DiskAddr",
                    tag: tag as u16,
                })
            }
        };
        reader.get_slice(7)?;
        Ok(Self {
            file_id,
            offset,
            size,
            kind,
        })
    }
}

/// One entry of a SLOG batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlogRecord {
    /// Publish a tablet: the serialized image now lives at `addr`.
    PutTablet { addr: DiskAddr, image: Vec<u8> },
    /// Remove a tablet.
    DeleteTablet { key: TabletKey },
}

impl SlogRecord {
    pub fn cmd(&self) -> u16 {
        match self {
            SlogRecord::PutTablet { .. } => CMD_PUT_TABLET,
            SlogRecord::DeleteTablet { .. } => CMD_DELETE_TABLET,
        }
    }

    /// Payload length, excluding the command code and length prefix.
    pub fn payload_len(&self) -> usize {
        match self {
            SlogRecord::PutTablet { image, .. } => DiskAddr::ENCODED_LEN + image.len(),
            SlogRecord::DeleteTablet { .. } => 16,
        }
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u16(self.cmd());
        encode_varint(self.payload_len(), out);
        match self {
            SlogRecord::PutTablet { addr, image } => {
                addr.encode(out);
                out.put_slice(image);
            }
            SlogRecord::DeleteTablet { key } => {
                out.put_u64(key.ls_id.0);
                out.put_u64(key.tablet_id.0);
            }
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let cmd = reader.get_u16()?;
        let len = decode_varint(reader)?;
        if len > reader.remaining() {
            return Err(DecodeError::BadLength {
                declared: len,
                remaining: reader.remaining(),
            });
        }
        let mut payload = reader.get_slice(len)?;
        match cmd {
            CMD_PUT_TABLET => {
                let addr = DiskAddr::decode(&mut payload)?;
                let image = payload.to_vec();
                Ok(SlogRecord::PutTablet { addr, image })
            }
            CMD_DELETE_TABLET => {
                let ls_id = LogStreamId(payload.get_u64()?);
                let tablet_id = TabletId(payload.get_u64()?);
                Ok(SlogRecord::DeleteTablet {
                    key: TabletKey::new(ls_id, tablet_id),
                })
            }
            tag => Err(DecodeError::InvalidTag {
                ty: "SlogRecord",
                tag,
            }),
        }
    }
}
