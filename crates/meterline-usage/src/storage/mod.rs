pub mod connection;
pub mod entities;
pub mod memory;
pub mod volume_types;

pub use connection::DatabaseConnection;

pub use entities::{EntityStore, SqlEntityStore};

pub use memory::MemoryEntityStore;

pub use volume_types::{MemoryVolumeTypeCatalog, SqlVolumeTypeCatalog, VolumeTypeCatalog};
