//! Storage-log (SLOG) framing and replay.
//!
//! The SLOG is the metadata-change log of the tablet engine: tablet
//! create/remove/update operations write a batch of records here *before*
//! publishing the corresponding in-memory state. Batches commit atomically
//! (crc32c over the whole frame) and are totally ordered per log stream.
//!
//! This crate knows nothing about tablets beyond their identity: images are
//! opaque byte strings produced and consumed by the core crate.

mod batch;
mod record;
mod writer;

pub use crate::{
    batch::{Batch, Header},
    record::{DiskAddr, DiskAddrKind, SlogRecord, CMD_DELETE_TABLET, CMD_PUT_TABLET},
    writer::{Replay, SlogToken, SlogWriter},
};

pub mod buffer;
pub mod error;
pub mod varint;
