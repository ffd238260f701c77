pub mod dml;
pub mod lob;
pub mod scan;
pub mod tablet_service;

pub use dml::{DmlFlags, DmlParam, DmlRunningCtx};
pub use lob::{InRowLobManager, LobAccessParam, LobManager, SharedLobManager, LOB_INROW_THRESHOLD};
pub use scan::{TableScanParam, TabletScanIter};
pub use tablet_service::{CreateTabletArg, MigrationParam, TabletService};
