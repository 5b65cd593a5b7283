//! Placed-object records: JSONL wire form and the binary tile fast path

use bytemuck::{Pod, Zeroable};
use serde::Deserialize;

use crate::core::error::Error;
use crate::core::types::{Quat, Result, Vec3};

/// Magic bytes at the head of a binary chunk tile.
pub const TILE_MAGIC: [u8; 4] = *b"WTIL";

/// Stable identity of an entity inside the hierarchy graph:
/// owning region hash plus the entity's index within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub ymap: u32,
    pub index: u32,
}

impl NodeKey {
    pub fn new(ymap: u32, index: u32) -> Self {
        Self { ymap, index }
    }
}

fn default_scale() -> f32 {
    1.0
}

/// One placed-object instance as it appears on the wire.
///
/// Only `archetype` and `position` are guaranteed; everything else is
/// optional and defaults to "absent" semantics.
#[derive(Clone, Debug, Deserialize)]
pub struct EntityRecord {
    pub archetype: u32,
    pub position: [f32; 3],
    #[serde(default)]
    pub rotation_quat: Option<[f32; 4]>,
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default, rename = "tintIndex")]
    pub tint_index: Option<u32>,

    // Interior linkage
    #[serde(default)]
    pub mlo_parent_guid: u64,
    #[serde(default)]
    pub mlo_entity_set_hash: u32,
    #[serde(default)]
    pub is_mlo_instance: bool,

    // Owning region (time/weather gating) and hierarchy identity
    #[serde(default)]
    pub ymap: u32,
    #[serde(default)]
    pub ymap_entity_index: Option<u32>,

    // Hierarchy fields
    #[serde(default)]
    pub parent_index: Option<i32>,
    #[serde(default)]
    pub num_children: u32,
    #[serde(default)]
    pub lod_dist: Option<f32>,
    #[serde(default)]
    pub child_lod_dist: Option<f32>,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub lod_level: Option<u8>,
}

impl EntityRecord {
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn rotation(&self) -> Quat {
        match self.rotation_quat {
            Some([x, y, z, w]) => Quat::from_xyzw(x, y, z, w),
            None => Quat::IDENTITY,
        }
    }

    /// Stable hierarchy key, present only for records that carry one.
    pub fn node_key(&self) -> Option<NodeKey> {
        self.ymap_entity_index
            .map(|index| NodeKey::new(self.ymap, index))
    }

    /// Declared parent key, if any. A negative parent index means "root".
    pub fn parent_key(&self) -> Option<NodeKey> {
        match self.parent_index {
            Some(idx) if idx >= 0 => Some(NodeKey::new(self.ymap, idx as u32)),
            _ => None,
        }
    }

    /// Child of an interior container (kept only while inside one).
    /// Containers themselves carry their own guid and are not children.
    pub fn is_interior_child(&self) -> bool {
        self.mlo_parent_guid != 0 && !self.is_mlo_instance
    }

    /// All float payload finite (NaN/inf poisoning guard).
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.scale.is_finite()
            && self
                .rotation_quat
                .map(|q| q.iter().all(|v| v.is_finite()))
                .unwrap_or(true)
    }
}

// Binary tile record layouts. Read with pod_read_unaligned: tile bytes
// come straight off the wire with no alignment guarantee.

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawRecord44 {
    archetype: u32,
    position: [f32; 3],
    rotation: [f32; 4],
    scale: f32,
    tint: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawRecord48 {
    archetype: u32,
    position: [f32; 3],
    rotation: [f32; 4],
    scale: f32,
    tint: u32,
    flags: u32,
    region: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawRecord64 {
    archetype: u32,
    position: [f32; 3],
    rotation: [f32; 4],
    scale: f32,
    tint: u32,
    flags: u32,
    region: u32,
    parent_guid: u64,
    entity_set: u32,
    mlo_flags: u32,
}

const STRIDE_BASE: usize = 44;
const STRIDE_REGION: usize = 48;
const STRIDE_INTERIOR: usize = 64;

fn record_from_44(raw: RawRecord44) -> EntityRecord {
    EntityRecord {
        archetype: raw.archetype,
        position: raw.position,
        rotation_quat: Some(raw.rotation),
        scale: raw.scale,
        tint_index: Some(raw.tint),
        mlo_parent_guid: 0,
        mlo_entity_set_hash: 0,
        is_mlo_instance: false,
        ymap: 0,
        ymap_entity_index: None,
        parent_index: None,
        num_children: 0,
        lod_dist: None,
        child_lod_dist: None,
        flags: raw.flags,
        lod_level: None,
    }
}

/// Parse a binary chunk tile: magic, u32 record count, fixed-stride
/// records. The stride is derived from the payload length and must match
/// exactly one supported layout. Records with non-finite floats are
/// skipped rather than poisoning the batch; a truncated tail is tolerated
/// with a warning.
pub fn parse_tile(data: &[u8]) -> Result<Vec<EntityRecord>> {
    if data.len() < 8 || data[0..4] != TILE_MAGIC {
        return Err(Error::Decode("tile: bad magic".into()));
    }

    let count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let payload = &data[8..];
    if count == 0 {
        return Ok(Vec::new());
    }

    let stride = match payload.len() / count {
        s @ (STRIDE_BASE | STRIDE_REGION | STRIDE_INTERIOR) if payload.len() % count == 0 => s,
        // Truncated tile: fall back to the largest stride that yields
        // at least one whole record.
        _ => *[STRIDE_INTERIOR, STRIDE_REGION, STRIDE_BASE]
            .iter()
            .find(|&&s| payload.len() >= s)
            .ok_or_else(|| Error::Decode(format!("tile: {} bytes is no known stride", payload.len())))?,
    };

    let whole = payload.len() / stride;
    if whole < count {
        log::warn!("tile: truncated, {} of {} records present", whole, count);
    }
    let n = whole.min(count);

    let mut records = Vec::with_capacity(n);
    let mut skipped = 0usize;
    for i in 0..n {
        let at = i * stride;
        let record = match stride {
            STRIDE_BASE => {
                record_from_44(bytemuck::pod_read_unaligned::<RawRecord44>(
                    &payload[at..at + STRIDE_BASE],
                ))
            }
            STRIDE_REGION => {
                let raw = bytemuck::pod_read_unaligned::<RawRecord48>(
                    &payload[at..at + STRIDE_REGION],
                );
                let mut rec = record_from_44(RawRecord44 {
                    archetype: raw.archetype,
                    position: raw.position,
                    rotation: raw.rotation,
                    scale: raw.scale,
                    tint: raw.tint,
                    flags: raw.flags,
                });
                rec.ymap = raw.region;
                rec
            }
            _ => {
                let raw = bytemuck::pod_read_unaligned::<RawRecord64>(
                    &payload[at..at + STRIDE_INTERIOR],
                );
                let mut rec = record_from_44(RawRecord44 {
                    archetype: raw.archetype,
                    position: raw.position,
                    rotation: raw.rotation,
                    scale: raw.scale,
                    tint: raw.tint,
                    flags: raw.flags,
                });
                rec.ymap = raw.region;
                rec.mlo_parent_guid = raw.parent_guid;
                rec.mlo_entity_set_hash = raw.entity_set;
                rec.is_mlo_instance = raw.mlo_flags & 1 != 0;
                rec
            }
        };

        if record.is_finite() {
            records.push(record);
        } else {
            skipped += 1;
        }
    }

    if skipped > 0 {
        log::trace!("tile: skipped {} non-finite records", skipped);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile_bytes(records: &[RawRecord48]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TILE_MAGIC);
        out.extend_from_slice(&(records.len() as u32).to_le_bytes());
        for r in records {
            out.extend_from_slice(bytemuck::bytes_of(r));
        }
        out
    }

    fn raw48(archetype: u32, x: f32) -> RawRecord48 {
        RawRecord48 {
            archetype,
            position: [x, 0.0, 0.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: 1.0,
            tint: 3,
            flags: 0,
            region: 77,
        }
    }

    #[test]
    fn test_record_defaults_from_json() {
        let rec: EntityRecord =
            serde_json::from_str(r#"{"archetype": 42, "position": [1.0, 2.0, 3.0]}"#).unwrap();

        assert_eq!(rec.archetype, 42);
        assert_eq!(rec.position(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(rec.rotation(), Quat::IDENTITY);
        assert_eq!(rec.scale, 1.0);
        assert!(!rec.is_interior_child());
        assert!(rec.node_key().is_none());
    }

    #[test]
    fn test_record_hierarchy_keys() {
        let rec: EntityRecord = serde_json::from_str(
            r#"{"archetype": 1, "position": [0,0,0], "ymap": 9, "ymap_entity_index": 4, "parent_index": 2}"#,
        )
        .unwrap();

        assert_eq!(rec.node_key(), Some(NodeKey::new(9, 4)));
        assert_eq!(rec.parent_key(), Some(NodeKey::new(9, 2)));

        let root: EntityRecord = serde_json::from_str(
            r#"{"archetype": 1, "position": [0,0,0], "ymap": 9, "ymap_entity_index": 4, "parent_index": -1}"#,
        )
        .unwrap();
        assert!(root.parent_key().is_none());
    }

    #[test]
    fn test_parse_tile_roundtrip() {
        let data = tile_bytes(&[raw48(10, 1.0), raw48(11, 2.0)]);
        let records = parse_tile(&data).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].archetype, 10);
        assert_eq!(records[1].position(), Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(records[0].ymap, 77);
        assert_eq!(records[0].tint_index, Some(3));
    }

    #[test]
    fn test_parse_tile_bad_magic() {
        let err = parse_tile(b"NOPE\x01\x00\x00\x00").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_parse_tile_skips_nan_records() {
        let mut bad = raw48(10, 1.0);
        bad.position[1] = f32::NAN;
        let data = tile_bytes(&[raw48(9, 0.0), bad]);

        let records = parse_tile(&data).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].archetype, 9);
    }

    #[test]
    fn test_parse_tile_truncated() {
        let mut data = tile_bytes(&[raw48(1, 0.0), raw48(2, 0.0)]);
        data.truncate(8 + 48); // second record lost

        let records = parse_tile(&data).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].archetype, 1);
    }

    #[test]
    fn test_parse_tile_interior_stride() {
        let raw = RawRecord64 {
            archetype: 5,
            position: [1.0, 2.0, 3.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: 2.0,
            tint: 0,
            flags: 0,
            region: 12,
            parent_guid: 0xDEAD_BEEF,
            entity_set: 42,
            mlo_flags: 1,
        };
        let mut data = Vec::new();
        data.extend_from_slice(&TILE_MAGIC);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(bytemuck::bytes_of(&raw));

        let records = parse_tile(&data).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mlo_parent_guid, 0xDEAD_BEEF);
        assert_eq!(records[0].mlo_entity_set_hash, 42);
        assert!(records[0].is_mlo_instance);
        // A container is not itself an interior child.
        assert!(!records[0].is_interior_child());
    }
}
