//! World dataset model: chunk index, placed-object records, instance batches

pub mod index;
pub mod record;
pub mod batch;

pub use index::{ChunkIndex, ChunkKey, ChunkEntry, ZBounds};
pub use record::{EntityRecord, NodeKey, parse_tile, TILE_MAGIC};
pub use batch::{BatchVersion, InstanceBatch};
