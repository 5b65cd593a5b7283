//! Instance aggregation across the loaded working set
//!
//! Converts raw per-chunk records into per-archetype (or cross-archetype
//! bucket) instance batches, selects a LOD tier per group by distance,
//! applies interior and time/weather gating, and publishes the result to
//! the render collaborator.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use crate::core::types::Vec3;
use crate::world::batch::{BatchVersion, InstanceBatch};
use crate::world::index::ChunkKey;
use crate::world::record::EntityRecord;

use super::gating::{region_visible, GatingTable, WorldClock};
use super::hierarchy::EntityGraph;
use super::interior::{find_active_interior, ActiveInterior, InteriorDef, InteriorInstance};
use super::lod::{LodThresholds, LodTier};

/// Reusable object type identity (geometry + material set hash).
pub type ArchetypeId = u32;

/// Externally supplied per-archetype metadata.
#[derive(Clone, Debug, Default)]
pub struct ArchetypeInfo {
    pub lod: LodThresholds,
    pub mesh_file: String,
    pub material_signature: u64,
    /// Placeholder meshes sort behind everything else in the capacity cut.
    pub placeholder: bool,
}

/// Archetype metadata lookup. Unknown archetypes get default metadata
/// rather than being dropped.
#[derive(Clone, Debug, Default)]
pub struct ArchetypeCatalog {
    infos: HashMap<ArchetypeId, ArchetypeInfo>,
}

impl ArchetypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ArchetypeId, info: ArchetypeInfo) {
        self.infos.insert(id, info);
    }

    pub fn get(&self, id: ArchetypeId) -> Option<&ArchetypeInfo> {
        self.infos.get(&id)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// Interface to the rendering collaborator. `None` clears a group.
pub trait RenderSink {
    fn set_archetype_instances(
        &mut self,
        archetype: ArchetypeId,
        tier: LodTier,
        batch: Option<InstanceBatch>,
        min_distance: f32,
    );

    #[allow(clippy::too_many_arguments)]
    fn set_bucket_instances(
        &mut self,
        bucket_id: u64,
        tier: LodTier,
        mesh_file: &str,
        material: u64,
        batch: Option<InstanceBatch>,
        min_distance: f32,
    );
}

/// Aggregation behavior knobs.
#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// Regroup by (tier, mesh, material) buckets instead of archetype.
    pub cross_archetype: bool,
    /// Route records carrying hierarchy identity through the entity graph.
    pub hierarchical: bool,
    /// Keep at most this many groups after sorting; 0 = unlimited.
    pub max_archetypes: usize,
    /// Groups entirely beyond this distance are dropped before the cap.
    pub max_render_distance: f32,
    /// Layout version for produced batches.
    pub batch_version: BatchVersion,
    /// Portal-graph expansion bound.
    pub interior_bfs_depth: usize,
    /// Strength of the forward-facing bias in the capacity sort.
    pub forward_bias: f32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            cross_archetype: false,
            hierarchical: false,
            max_archetypes: 0,
            max_render_distance: 4000.0,
            batch_version: BatchVersion::Tinted,
            interior_bfs_depth: 2,
            forward_bias: 0.25,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RebuildStats {
    pub groups_published: usize,
    pub groups_cleared: usize,
    pub instances: usize,
    pub batches_dropped_nonfinite: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum GroupId {
    Archetype(ArchetypeId, LodTier),
    Bucket(u64, LodTier),
}

struct GroupDraft<'a> {
    id: GroupId,
    mesh_file: String,
    material: u64,
    placeholder: bool,
    min_distance: f32,
    /// Dot of camera-forward with the direction to the closest instance.
    forward_dot: f32,
    records: Vec<&'a EntityRecord>,
}

/// Aggregates loaded chunk records into render-ready instance groups.
pub struct Aggregator {
    config: AggregatorConfig,
    catalog: ArchetypeCatalog,
    interiors: HashMap<ArchetypeId, InteriorDef>,
    gating: Option<GatingTable>,
    entity_set_overrides: HashMap<u32, bool>,
    chunks: HashMap<ChunkKey, Vec<EntityRecord>>,
    graph: EntityGraph,
    published: HashSet<GroupId>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, catalog: ArchetypeCatalog) -> Self {
        Self {
            config,
            catalog,
            interiors: HashMap::new(),
            gating: None,
            entity_set_overrides: HashMap::new(),
            chunks: HashMap::new(),
            graph: EntityGraph::new(),
            published: HashSet::new(),
        }
    }

    pub fn set_interiors(&mut self, interiors: HashMap<ArchetypeId, InteriorDef>) {
        self.interiors = interiors;
    }

    pub fn set_gating(&mut self, table: Option<GatingTable>) {
        self.gating = table;
    }

    /// Per-entity-set enable/disable override; absent means enabled.
    pub fn set_entity_set_override(&mut self, entity_set: u32, enabled: bool) {
        self.entity_set_overrides.insert(entity_set, enabled);
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn insert_chunk(&mut self, key: ChunkKey, records: Vec<EntityRecord>) {
        if self.config.hierarchical {
            self.graph.insert_chunk(key, &records);
        }
        self.chunks.insert(key, records);
    }

    pub fn remove_chunk(&mut self, key: ChunkKey) {
        if self.config.hierarchical {
            self.graph.remove_chunk(key);
        }
        self.chunks.remove(&key);
    }

    /// Rebuild all groups and publish them to the sink, clearing groups
    /// that disappeared since the previous rebuild.
    pub fn rebuild(
        &mut self,
        camera: Vec3,
        camera_forward: Vec3,
        clock: Option<WorldClock>,
        sink: &mut dyn RenderSink,
    ) -> RebuildStats {
        let mut stats = RebuildStats::default();

        let drafts = self.collect_groups(camera, camera_forward, clock);

        let mut now_published = HashSet::new();
        for draft in &drafts {
            let mut batch = InstanceBatch::with_capacity(self.config.batch_version, draft.records.len());
            for record in &draft.records {
                batch.push(record);
            }
            if !batch.is_finite() {
                // A poisoned batch is dropped whole, never uploaded.
                stats.batches_dropped_nonfinite += 1;
                log::warn!("aggregator: dropping non-finite batch for {:?}", draft.id);
                continue;
            }

            stats.instances += batch.len();
            stats.groups_published += 1;
            now_published.insert(draft.id.clone());
            match &draft.id {
                GroupId::Archetype(archetype, tier) => {
                    sink.set_archetype_instances(*archetype, *tier, Some(batch), draft.min_distance);
                }
                GroupId::Bucket(bucket_id, tier) => {
                    sink.set_bucket_instances(
                        *bucket_id,
                        *tier,
                        &draft.mesh_file,
                        draft.material,
                        Some(batch),
                        draft.min_distance,
                    );
                }
            }
        }

        drop(drafts);

        // Clear anything published last rebuild that is gone now.
        for stale in self.published.difference(&now_published) {
            stats.groups_cleared += 1;
            match stale {
                GroupId::Archetype(archetype, tier) => {
                    sink.set_archetype_instances(*archetype, *tier, None, f32::MAX);
                }
                GroupId::Bucket(bucket_id, tier) => {
                    sink.set_bucket_instances(*bucket_id, *tier, "", 0, None, f32::MAX);
                }
            }
        }
        self.published = now_published;
        stats
    }

    // --- Internal passes ---

    fn collect_groups(
        &self,
        camera: Vec3,
        camera_forward: Vec3,
        clock: Option<WorldClock>,
    ) -> Vec<GroupDraft<'_>> {
        // Candidate records: hierarchy leaves plus everything without a
        // hierarchy identity.
        let mut records: Vec<&EntityRecord> = Vec::new();
        if self.config.hierarchical {
            for (chunk, index) in self.graph.select_leaves(camera) {
                if let Some(record) = self.chunks.get(&chunk).and_then(|r| r.get(index)) {
                    records.push(record);
                }
            }
            for chunk_records in self.chunks.values() {
                records.extend(chunk_records.iter().filter(|r| r.node_key().is_none()));
            }
        } else {
            for chunk_records in self.chunks.values() {
                records.extend(chunk_records.iter());
            }
        }

        // Interior context for this camera position.
        let containers: Vec<InteriorInstance> = records
            .iter()
            .filter(|r| r.is_mlo_instance && self.interiors.contains_key(&r.archetype))
            .map(|r| InteriorInstance {
                parent_guid: r.mlo_parent_guid,
                archetype: r.archetype,
                position: r.position(),
                rotation: r.rotation(),
            })
            .collect();
        let active =
            find_active_interior(camera, &containers, &self.interiors, self.config.interior_bfs_depth);

        // Per-archetype accumulation.
        struct ArchAccum<'a> {
            min_distance: f32,
            forward_dot: f32,
            records: Vec<&'a EntityRecord>,
        }
        let mut per_archetype: HashMap<ArchetypeId, ArchAccum<'_>> = HashMap::new();

        for record in records {
            if !self.record_visible(record, active.as_ref(), clock) {
                continue;
            }
            let position = record.position();
            let distance = camera.distance(position);
            let accum = per_archetype
                .entry(record.archetype)
                .or_insert_with(|| ArchAccum {
                    min_distance: f32::MAX,
                    forward_dot: 0.0,
                    records: Vec::new(),
                });
            if distance < accum.min_distance {
                accum.min_distance = distance;
                let to_instance = (position - camera).normalize_or_zero();
                accum.forward_dot = to_instance.dot(camera_forward);
            }
            accum.records.push(record);
        }

        // Group drafts, with the render-distance cut applied before the
        // archetype cap.
        let mut drafts: Vec<GroupDraft<'_>> = Vec::new();
        if self.config.cross_archetype {
            let mut buckets: HashMap<(LodTier, String, u64), GroupDraft<'_>> = HashMap::new();
            for (archetype, accum) in per_archetype {
                if accum.min_distance > self.config.max_render_distance {
                    continue;
                }
                let info = self.catalog.get(archetype).cloned().unwrap_or_default();
                let tier = info.lod.tier_for_distance(accum.min_distance);
                let bucket_key = (tier, info.mesh_file.clone(), info.material_signature);
                let bucket_id = bucket_hash(&bucket_key.1, bucket_key.2, tier);
                let draft = buckets.entry(bucket_key).or_insert_with(|| GroupDraft {
                    id: GroupId::Bucket(bucket_id, tier),
                    mesh_file: info.mesh_file.clone(),
                    material: info.material_signature,
                    placeholder: info.placeholder,
                    min_distance: f32::MAX,
                    forward_dot: 0.0,
                    records: Vec::new(),
                });
                if accum.min_distance < draft.min_distance {
                    draft.min_distance = accum.min_distance;
                    draft.forward_dot = accum.forward_dot;
                }
                draft.placeholder &= info.placeholder;
                draft.records.extend(accum.records);
            }
            drafts.extend(buckets.into_values());
        } else {
            for (archetype, accum) in per_archetype {
                if accum.min_distance > self.config.max_render_distance {
                    continue;
                }
                let info = self.catalog.get(archetype).cloned().unwrap_or_default();
                let tier = info.lod.tier_for_distance(accum.min_distance);
                drafts.push(GroupDraft {
                    id: GroupId::Archetype(archetype, tier),
                    mesh_file: info.mesh_file,
                    material: info.material_signature,
                    placeholder: info.placeholder,
                    min_distance: accum.min_distance,
                    forward_dot: accum.forward_dot,
                    records: accum.records,
                });
            }
        }

        // Capacity policy: placeholder meshes last, then forward-biased
        // distance; keep the first max_archetypes.
        let bias = self.config.forward_bias;
        drafts.sort_by(|a, b| {
            a.placeholder.cmp(&b.placeholder).then_with(|| {
                let ka = a.min_distance * (1.0 - bias * a.forward_dot.clamp(-1.0, 1.0));
                let kb = b.min_distance * (1.0 - bias * b.forward_dot.clamp(-1.0, 1.0));
                ka.total_cmp(&kb)
            })
        });
        if self.config.max_archetypes > 0 {
            drafts.truncate(self.config.max_archetypes);
        }
        drafts
    }

    fn record_visible(
        &self,
        record: &EntityRecord,
        active: Option<&ActiveInterior>,
        clock: Option<WorldClock>,
    ) -> bool {
        // Interior children are gated by the active interior.
        if record.is_interior_child() {
            let Some(active) = active else {
                return false; // outside: all interior children dropped
            };
            if record.mlo_parent_guid != active.instance.parent_guid {
                return false;
            }
            if let Some(&enabled) = self.entity_set_overrides.get(&record.mlo_entity_set_hash) {
                if !enabled {
                    return false;
                }
            }
            if let Some(def) = self.interiors.get(&active.instance.archetype) {
                let local = active.instance.to_local(record.position());
                if let Some(room) = def.room_of_point(local) {
                    if !active.visible_rooms.contains(&room) {
                        return false;
                    }
                }
            }
        }

        // Time/weather gating by owning-region hash, fail-open.
        if let Some(clock) = clock {
            if record.ymap != 0 && !region_visible(self.gating.as_ref(), record.ymap, clock) {
                return false;
            }
        }
        true
    }
}

fn bucket_hash(mesh_file: &str, material: u64, tier: LodTier) -> u64 {
    let mut hasher = DefaultHasher::new();
    mesh_file.hash(&mut hasher);
    material.hash(&mut hasher);
    tier.hash(&mut hasher);
    hasher.finish()
}

/// Group a chunk's records into per-archetype batches. Shared with the
/// worker offload path so both sides produce identical layouts.
pub fn build_archetype_batches(
    records: &[EntityRecord],
    version: BatchVersion,
) -> HashMap<ArchetypeId, InstanceBatch> {
    let mut batches: HashMap<ArchetypeId, InstanceBatch> = HashMap::new();
    for record in records {
        batches
            .entry(record.archetype)
            .or_insert_with(|| InstanceBatch::new(version))
            .push(record);
    }
    batches
}
