use std::io;

use thiserror::Error;

use crate::buffer::DecodeError;

/// A checksum mismatch was detected.
///
/// Usually wrapped in another error, such as [`io::Error`].
#[derive(Debug, Error)]
#[error("checksum mismatch")]
pub struct ChecksumMismatch;

/// Error yielded by SLOG replay iterators.
#[derive(Debug, Error)]
pub enum Traversal {
    #[error("out-of-order batch: expected-offset={expected_offset} actual-offset={actual_offset}")]
    OutOfOrder {
        expected_offset: u64,
        actual_offset: u64,
    },
    #[error("failed to decode slog record at offset={offset}")]
    Decode {
        offset: u64,
        #[source]
        source: DecodeError,
    },
    #[error("checksum mismatch at offset={offset}")]
    Checksum {
        offset: u64,
        #[source]
        source: ChecksumMismatch,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}
