//! Per-log-stream tablet engine.
//!
//! The storage half of a distributed, multi-tenant relational database:
//! per-log-stream tablet management ([`service::TabletService`]), the
//! tablet object with its ordered sstable arrays ([`tablet`]), the
//! in-memory LSM level with MVCC row locks ([`memtable`]), and the
//! per-transaction write buffer driving redo generation and
//! commit/rollback ([`memtable::MemtableCtx`]).
//!
//! Metadata changes follow a write-then-swap protocol against the SLOG
//! (see the `tabletdb-slog` crate): persist first, publish second, and the
//! pre-mutation object stays authoritative on failure.

pub mod config;
pub mod datum;
pub mod error;
pub mod memtable;
pub mod schema;
pub mod service;
pub mod tablet;

pub use config::EngineConfig;
pub use datum::{Datum, DatumKind, Row, RowKey};
pub use error::{DmlError, Result, SchemaCheckError, StorageError, TabletError, TxError};

#[cfg(test)]
mod tests;
