//! Synchronous SLOG writer and replay.
//!
//! The writer encodes the write-then-swap invariant of tablet metadata
//! changes: [`SlogWriter::append`] durably commits a batch and returns a
//! [`SlogToken`]; only a caller holding a token may publish the corresponding
//! in-memory state. Appends are totally ordered per writer.

use std::io::{self, Read, Write};

use crate::batch::Batch;
use crate::error::{ChecksumMismatch, Traversal};
use crate::record::SlogRecord;

/// Proof that a batch of records reached durable storage.
///
/// Tokens are deliberately opaque and non-cloneable: one token per committed
/// batch.
#[derive(Debug)]
pub struct SlogToken {
    first_rec_offset: u64,
    n: u16,
}

impl SlogToken {
    pub fn first_rec_offset(&self) -> u64 {
        self.first_rec_offset
    }

    pub fn record_count(&self) -> u16 {
        self.n
    }
}

/// Appends batches to an underlying sink, flushing after every batch.
pub struct SlogWriter<W> {
    out: W,
    next_rec_offset: u64,
    bytes_written: u64,
}

impl<W: Write> SlogWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            next_rec_offset: 0,
            bytes_written: 0,
        }
    }

    /// Resume an existing log whose last record offset is known from replay.
    pub fn resume(out: W, next_rec_offset: u64, bytes_written: u64) -> Self {
        Self {
            out,
            next_rec_offset,
            bytes_written,
        }
    }

    pub fn next_rec_offset(&self) -> u64 {
        self.next_rec_offset
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Commit `records` as one atomic batch.
    ///
    /// On success every record is durable and the returned token may be used
    /// to publish the corresponding in-memory state. On failure nothing was
    /// committed and the in-memory state must remain untouched.
    pub fn append(&mut self, records: &[SlogRecord]) -> io::Result<SlogToken> {
        assert!(!records.is_empty(), "empty slog batch");
        assert!(records.len() <= u16::MAX as usize, "slog batch too large");

        let batch = Batch::from_records(self.next_rec_offset, records);
        let encoded_len = batch.encoded_len() as u64;
        batch.write(&mut self.out)?;
        self.out.flush()?;

        let token = SlogToken {
            first_rec_offset: self.next_rec_offset,
            n: batch.n,
        };
        self.next_rec_offset += batch.n as u64;
        self.bytes_written += encoded_len;
        log::trace!(
            "slog batch committed: offset={} n={} bytes={}",
            token.first_rec_offset,
            token.n,
            encoded_len
        );
        Ok(token)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Iterator over all records of a SLOG, in commit order.
///
/// Batches are checksum-verified before any of their records are yielded.
/// Replay stops at EOF or at a zeroed (preallocated) header.
pub struct Replay<R> {
    src: R,
    expected_offset: u64,
    current: Option<Box<dyn Iterator<Item = (u64, Result<SlogRecord, crate::buffer::DecodeError>)>>>,
    done: bool,
}

impl<R: Read> Replay<R> {
    pub fn new(src: R) -> Self {
        Self {
            src,
            expected_offset: 0,
            current: None,
            done: false,
        }
    }

    /// The offset the next appended record would get, valid once the
    /// iterator is exhausted.
    pub fn next_rec_offset(&self) -> u64 {
        self.expected_offset
    }

    fn next_batch(&mut self) -> Result<bool, Traversal> {
        let batch = Batch::decode(&mut self.src).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData
                && e.get_ref().is_some_and(|inner| inner.is::<ChecksumMismatch>())
            {
                Traversal::Checksum {
                    offset: self.expected_offset,
                    source: ChecksumMismatch,
                }
            } else {
                Traversal::Io(e)
            }
        })?;
        let Some(batch) = batch else {
            return Ok(false);
        };
        if batch.min_rec_offset != self.expected_offset {
            return Err(Traversal::OutOfOrder {
                expected_offset: self.expected_offset,
                actual_offset: batch.min_rec_offset,
            });
        }
        self.expected_offset = batch.rec_range().end;
        self.current = Some(Box::new(batch.into_records()));
        Ok(true)
    }
}

impl<R: Read> Iterator for Replay<R> {
    type Item = Result<(u64, SlogRecord), Traversal>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(iter) = self.current.as_mut() {
                match iter.next() {
                    Some((offset, Ok(rec))) => return Some(Ok((offset, rec))),
                    Some((offset, Err(source))) => {
                        self.done = true;
                        return Some(Err(Traversal::Decode { offset, source }));
                    }
                    None => self.current = None,
                }
                continue;
            }
            match self.next_batch() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DiskAddr;
    use pretty_assertions::assert_eq;
    use tabletdb_primitives::{LogStreamId, TabletId, TabletKey};

    fn put(n: u8) -> SlogRecord {
        SlogRecord::PutTablet {
            addr: DiskAddr::memory(n as u64),
            image: vec![n; 16],
        }
    }

    fn del(id: u64) -> SlogRecord {
        SlogRecord::DeleteTablet {
            key: TabletKey::new(LogStreamId(1), TabletId(id)),
        }
    }

    #[test]
    fn append_then_replay() {
        let mut writer = SlogWriter::new(Vec::new());
        let t0 = writer.append(&[put(1), put(2)]).unwrap();
        let t1 = writer.append(&[del(1001)]).unwrap();
        assert_eq!(t0.first_rec_offset(), 0);
        assert_eq!(t1.first_rec_offset(), 2);
        assert_eq!(writer.next_rec_offset(), 3);

        let buf = writer.into_inner();
        let mut replay = Replay::new(buf.as_slice());
        let recs: Vec<_> = replay.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(
            recs,
            vec![(0, put(1)), (1, put(2)), (2, del(1001))]
        );
        assert_eq!(replay.next_rec_offset(), 3);
    }

    #[test]
    fn replay_detects_out_of_order() {
        let mut buf = Vec::new();
        // Write a batch claiming a non-zero starting offset.
        Batch::from_records(5, &[del(7)]).write(&mut buf).unwrap();
        let mut replay = Replay::new(buf.as_slice());
        match replay.next() {
            Some(Err(Traversal::OutOfOrder {
                expected_offset: 0,
                actual_offset: 5,
            })) => {}
            other => panic!("expected out-of-order, got {other:?}"),
        }
        assert!(replay.next().is_none());
    }

    #[test]
    fn replay_stops_at_preallocated_tail() {
        let mut writer = SlogWriter::new(Vec::new());
        writer.append(&[put(1)]).unwrap();
        let mut buf = writer.into_inner();
        buf.extend_from_slice(&[0u8; 64]);

        let recs: Vec<_> = Replay::new(buf.as_slice()).map(|r| r.unwrap()).collect();
        assert_eq!(recs.len(), 1);
    }
}
