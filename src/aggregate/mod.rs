//! Instance aggregation: grouping, LOD selection, visibility gating

pub mod lod;
pub mod gating;
pub mod interior;
pub mod hierarchy;
pub mod aggregator;

pub use lod::{LodTier, LodThresholds};
pub use gating::{GatingTable, WorldClock};
pub use interior::{InteriorDef, InteriorInstance, ActiveInterior};
pub use hierarchy::{EntityGraph, ORPHAN_HD_RANK};
pub use aggregator::{
    Aggregator, AggregatorConfig, ArchetypeCatalog, ArchetypeId, ArchetypeInfo, RebuildStats,
    RenderSink, build_archetype_batches,
};
