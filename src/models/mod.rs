mod sync_action;
mod sync_item;

pub use sync_action::SyncAction;
pub use sync_item::{
    generate_item_id, LocalChange, SyncItem, SyncItemPatch, SyncMetadata, APP_VERSION,
};
