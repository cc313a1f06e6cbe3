//! Core types shared by the engine's components.

pub mod ids;
pub mod work_item;

pub use ids::{HolderId, ReplicaId, WorkItemType};
pub use work_item::{
    WorkItem, WorkItemError, decode_work_item, encode_work_item, peek_work_item_type,
};
