//! Engine knobs.
//!
//! One [`EngineConfig`] is shared by a tablet service and every transaction
//! context it creates. All knobs are runtime-changeable; readers see the
//! latest value at the next operation boundary.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct EngineConfig {
    /// Run old-row legitimacy, nullability and shadow-pk re-checks during
    /// DML.
    pub enable_defensive_check: AtomicBool,
    /// If > 0, redo packing is triggered when a transaction's pending log
    /// size exceeds this many bytes. 0 disables the threshold.
    pub private_buffer_size: AtomicUsize,
    /// Downgrade a replay checksum mismatch from fatal to a warning.
    pub ignore_replay_checksum_error: AtomicBool,
    /// Cache per-statement row counters in the transaction context.
    pub enable_sql_audit: AtomicBool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_defensive_check: AtomicBool::new(true),
            private_buffer_size: AtomicUsize::new(0),
            ignore_replay_checksum_error: AtomicBool::new(false),
            enable_sql_audit: AtomicBool::new(true),
        }
    }
}

impl EngineConfig {
    pub fn defensive_check(&self) -> bool {
        self.enable_defensive_check.load(Ordering::Relaxed)
    }

    pub fn private_buffer_size(&self) -> usize {
        self.private_buffer_size.load(Ordering::Relaxed)
    }

    pub fn ignore_replay_checksum_error(&self) -> bool {
        self.ignore_replay_checksum_error.load(Ordering::Relaxed)
    }

    pub fn sql_audit(&self) -> bool {
        self.enable_sql_audit.load(Ordering::Relaxed)
    }
}
