pub mod memtable_mgr;
pub mod meta;
pub mod pointer_map;
pub mod table_store;

mod tablet;

pub use memtable_mgr::{MemtableMgr, MAX_MEMTABLE_CNT};
pub use meta::{
    BindingInfo, HaStatus, MediumInfoList, TabletMeta, TabletStatus, TxData,
};
pub use pointer_map::{TabletHandle, TabletPointerMap};
pub use table_store::{MacroBlockRegistry, ReadTable, SsTable, SsTableKind, TableStore};
pub use tablet::{deserialize_id, Tablet, TabletBuildParam, TabletUpdateParam, TABLET_IMAGE_VERSION};
