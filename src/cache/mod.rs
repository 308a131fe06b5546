pub mod controller;
pub mod entity_model;
pub mod metadata_model;
pub mod recency_map;
pub mod set_value;

pub use controller::{entity_handle, EntityHandle, StoreCacheController};
pub use entity_model::{CachedEntityModel, Entity, Page};
pub use metadata_model::CachedMetadataModel;
