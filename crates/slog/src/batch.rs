//! Batch framing.
//!
//! A [`Batch`] is the atomic commit unit of the SLOG: a header, a buffer of
//! serialized records, and a crc32c trailer over both. A torn or corrupted
//! batch fails checksum verification as a whole, so either every record in a
//! batch replays or none does.

use std::io::{self, Read, Write};
use std::ops::Range;

use crc32c::crc32c_append;

use crate::buffer::{BufReader, DecodeError};
use crate::error::ChecksumMismatch;
use crate::record::SlogRecord;

pub struct Header {
    pub min_rec_offset: u64,
    pub n: u16,
    pub len: u32,
}

impl Header {
    pub const LEN: usize = /* offset */ 8 + /* n */ 2 + /* len */ 4;

    /// Read [`Self::LEN`] bytes from `reader` and interpret them as a batch
    /// header.
    ///
    /// Returns `None` if the reader is at EOF, or if the read bytes are all
    /// zeroes (preallocated tail of a segment).
    pub fn decode<R: Read>(mut reader: R) -> io::Result<Option<Self>> {
        let mut hdr = [0; Self::LEN];
        if let Err(e) = reader.read_exact(&mut hdr) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e);
        }
        if hdr == [0; Self::LEN] {
            return Ok(None);
        }
        let mut buf = hdr.as_slice();
        let min_rec_offset = buf.get_u64().map_err(decode_error)?;
        let n = buf.get_u16().map_err(decode_error)?;
        let len = buf.get_u32().map_err(decode_error)?;
        Ok(Some(Self {
            min_rec_offset,
            n,
            len,
        }))
    }
}

/// Entry type of the SLOG: one atomically-committed batch of records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    /// The offset of the first record in this batch, counted from the
    /// beginning of the log.
    pub min_rec_offset: u64,
    /// The number of records in the batch.
    pub n: u16,
    /// All records of the batch in serialized form.
    pub records: Vec<u8>,
}

impl Batch {
    pub const FRAMING_LEN: usize = Header::LEN + /* crc32c */ 4;

    pub fn from_records(min_rec_offset: u64, records: &[SlogRecord]) -> Self {
        let mut buf = Vec::new();
        for record in records {
            record.encode(&mut buf);
        }
        Self {
            min_rec_offset,
            n: records.len() as u16,
            records: buf,
        }
    }

    /// The range of record offsets contained in this batch.
    pub fn rec_range(&self) -> Range<u64> {
        self.min_rec_offset..self.min_rec_offset + self.n as u64
    }

    /// Length in bytes of this batch when written via [`Self::write`].
    pub fn encoded_len(&self) -> usize {
        Self::FRAMING_LEN + self.records.len()
    }

    /// Serialize and write `self` to `out`.
    ///
    /// Returns the crc32c checksum of the batch on success.
    pub fn write<W: Write>(&self, mut out: W) -> io::Result<u32> {
        let mut crc = 0;
        let mut put = |out: &mut W, bytes: &[u8]| -> io::Result<()> {
            crc = crc32c_append(crc, bytes);
            out.write_all(bytes)
        };

        put(&mut out, &self.min_rec_offset.to_le_bytes())?;
        put(&mut out, &self.n.to_le_bytes())?;
        put(&mut out, &(self.records.len() as u32).to_le_bytes())?;
        put(&mut out, &self.records)?;

        out.write_all(&crc.to_le_bytes())?;
        Ok(crc)
    }

    /// Attempt to read one [`Batch`] from the given reader.
    ///
    /// Returns `None` if the reader is already at EOF. Verifies the checksum:
    /// a mismatch yields an [`io::ErrorKind::InvalidData`] error whose inner
    /// error downcasts to [`ChecksumMismatch`].
    pub fn decode<R: Read>(mut reader: R) -> io::Result<Option<Self>> {
        let mut hdr = [0; Header::LEN];
        if let Err(e) = reader.read_exact(&mut hdr) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e);
        }
        if hdr == [0; Header::LEN] {
            return Ok(None);
        }
        let mut buf = hdr.as_slice();
        let min_rec_offset = buf.get_u64().map_err(decode_error)?;
        let n = buf.get_u16().map_err(decode_error)?;
        let len = buf.get_u32().map_err(decode_error)?;

        let mut records = vec![0; len as usize];
        reader.read_exact(&mut records)?;

        let mut chk = crc32c_append(0, &hdr);
        chk = crc32c_append(chk, &records);

        let mut crc_bytes = [0; 4];
        reader.read_exact(&mut crc_bytes)?;
        if chk != u32::from_le_bytes(crc_bytes) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, ChecksumMismatch));
        }

        Ok(Some(Self {
            min_rec_offset,
            n,
            records,
        }))
    }

    /// Convert `self` into an iterator yielding the decoded records with
    /// their log offsets.
    pub fn into_records(self) -> impl Iterator<Item = (u64, Result<SlogRecord, DecodeError>)> {
        let range = self.rec_range();
        let records = self.records;
        let mut pos = 0usize;
        range.map(move |offset| {
            let mut cursor = &records[pos..];
            let before = cursor.remaining();
            let rec = SlogRecord::decode(&mut cursor);
            pos += before - cursor.remaining();
            (offset, rec)
        })
    }
}

fn decode_error(e: DecodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DiskAddr;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tabletdb_primitives::{LogStreamId, TabletId, TabletKey};

    fn sample_records() -> Vec<SlogRecord> {
        vec![
            SlogRecord::PutTablet {
                addr: DiskAddr::memory(64),
                image: vec![9; 64],
            },
            SlogRecord::DeleteTablet {
                key: TabletKey::new(LogStreamId(1), TabletId(1001)),
            },
        ]
    }

    #[test]
    fn batch_roundtrip() {
        let batch = Batch::from_records(7, &sample_records());
        let mut buf = Vec::with_capacity(batch.encoded_len());
        batch.write(&mut buf).unwrap();
        let batch2 = Batch::decode(&mut buf.as_slice()).unwrap().unwrap();
        assert_eq!(batch, batch2);

        let decoded: Vec<_> = batch2
            .into_records()
            .map(|(offset, rec)| (offset, rec.unwrap()))
            .collect();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, 7);
        assert_eq!(decoded[1].0, 8);
        assert_eq!(decoded[1].1, sample_records()[1]);
    }

    #[test]
    fn eof_and_zero_header_mean_none() {
        assert!(Batch::decode(&mut [].as_slice()).unwrap().is_none());
        let zeroes = [0u8; Header::LEN];
        assert!(Batch::decode(&mut zeroes.as_slice()).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn bitflip_is_detected(pos in Header::LEN..128usize, mask in 1u8..) {
            let batch = Batch {
                min_rec_offset: 42,
                n: 10,
                records: vec![1; 128],
            };
            let mut buf = Vec::with_capacity(batch.encoded_len());
            batch.write(&mut buf).unwrap();

            // Flip a bit in the records section, so we get ChecksumMismatch
            // and not a header decode error.
            buf[pos] ^= mask;

            match Batch::decode(&mut buf.as_slice()) {
                Err(e) => {
                    prop_assert_eq!(e.kind(), io::ErrorKind::InvalidData);
                    e.into_inner()
                        .unwrap()
                        .downcast::<ChecksumMismatch>()
                        .expect("inner error should be checksum mismatch");
                }
                Ok(b) => prop_assert!(false, "expected checksum mismatch, got {b:?}"),
            }
        }
    }
}
