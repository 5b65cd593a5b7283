//! Chunk index: the startup-loaded map of grid cells to source files

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::math::Aabb;

/// Integer coordinate identifying a chunk in the world grid.
///
/// The grid partitions the dataset's ground plane (x, y); z is vertical
/// and unbounded per-cell (global z bounds come from the index).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub gx: i32,
    pub gy: i32,
}

impl ChunkKey {
    pub fn new(gx: i32, gy: i32) -> Self {
        Self { gx, gy }
    }

    /// Convert a dataset-space position to its chunk key.
    pub fn from_position(pos: Vec3, cell_size: f32) -> Self {
        Self {
            gx: (pos.x / cell_size).floor() as i32,
            gy: (pos.y / cell_size).floor() as i32,
        }
    }

    /// Parse the `"gx_gy"` form used by the index file.
    pub fn parse(s: &str) -> Option<Self> {
        let (gx, gy) = s.split_once('_')?;
        Some(Self {
            gx: gx.parse().ok()?,
            gy: gy.parse().ok()?,
        })
    }

    /// Center of this cell on the grid plane (z = 0).
    pub fn center(&self, cell_size: f32) -> Vec3 {
        Vec3::new(
            (self.gx as f32 + 0.5) * cell_size,
            (self.gy as f32 + 0.5) * cell_size,
            0.0,
        )
    }

    /// Squared grid-cell distance to another key.
    pub fn distance_squared(&self, other: ChunkKey) -> i64 {
        let dx = (self.gx - other.gx) as i64;
        let dy = (self.gy - other.gy) as i64;
        dx * dx + dy * dy
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.gx, self.gy)
    }
}

/// Global vertical bounds of the dataset.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ZBounds {
    pub min_z: f32,
    pub max_z: f32,
}

/// Per-chunk metadata from the index file.
#[derive(Clone, Debug, Deserialize)]
pub struct ChunkEntry {
    /// Source file for this chunk, relative to `chunks_dir`
    pub file: String,
}

#[derive(Deserialize)]
struct RawIndex {
    chunk_size: f32,
    bounds: ZBounds,
    chunks_dir: String,
    chunks: HashMap<String, ChunkEntry>,
}

/// Immutable chunk index, loaded once at startup.
#[derive(Debug)]
pub struct ChunkIndex {
    chunk_size: f32,
    bounds: ZBounds,
    chunks_dir: String,
    chunks: HashMap<ChunkKey, ChunkEntry>,
}

impl ChunkIndex {
    /// Parse the index from its JSON form.
    ///
    /// Keys that do not match the `"gx_gy"` form are skipped with a warning
    /// rather than failing the whole index.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let raw: RawIndex =
            serde_json::from_slice(data).map_err(|e| Error::Decode(e.to_string()))?;

        let mut chunks = HashMap::with_capacity(raw.chunks.len());
        for (name, entry) in raw.chunks {
            match ChunkKey::parse(&name) {
                Some(key) => {
                    chunks.insert(key, entry);
                }
                None => log::warn!("chunk index: skipping malformed key `{}`", name),
            }
        }

        Ok(Self {
            chunk_size: raw.chunk_size,
            bounds: raw.bounds,
            chunks_dir: raw.chunks_dir,
            chunks,
        })
    }

    pub fn chunk_size(&self) -> f32 {
        self.chunk_size
    }

    pub fn bounds(&self) -> ZBounds {
        self.bounds
    }

    pub fn contains(&self, key: ChunkKey) -> bool {
        self.chunks.contains_key(&key)
    }

    pub fn get(&self, key: ChunkKey) -> Option<&ChunkEntry> {
        self.chunks.get(&key)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ChunkKey> {
        self.chunks.keys()
    }

    /// Fetch key (relative path) for a chunk's source file.
    pub fn fetch_key(&self, key: ChunkKey) -> Option<String> {
        self.get(key)
            .map(|entry| format!("{}/{}", self.chunks_dir, entry.file))
    }

    /// Approximate dataset-space bounds for a key: the grid cell extruded
    /// through the global z range.
    pub fn chunk_bounds(&self, key: ChunkKey) -> Aabb {
        let min = Vec3::new(
            key.gx as f32 * self.chunk_size,
            key.gy as f32 * self.chunk_size,
            self.bounds.min_z,
        );
        let max = Vec3::new(
            (key.gx + 1) as f32 * self.chunk_size,
            (key.gy + 1) as f32 * self.chunk_size,
            self.bounds.max_z,
        );
        Aabb::new(min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX_JSON: &str = r#"{
        "chunk_size": 512.0,
        "bounds": { "min_z": -100.0, "max_z": 800.0 },
        "chunks_dir": "chunks",
        "chunks": {
            "0_0": { "file": "0_0.jsonl" },
            "-2_3": { "file": "-2_3.jsonl" },
            "bogus": { "file": "ignored.jsonl" }
        }
    }"#;

    #[test]
    fn test_key_from_position() {
        assert_eq!(
            ChunkKey::from_position(Vec3::new(10.0, 10.0, 50.0), 512.0),
            ChunkKey::new(0, 0)
        );
        assert_eq!(
            ChunkKey::from_position(Vec3::new(-1.0, 600.0, 0.0), 512.0),
            ChunkKey::new(-1, 1)
        );
    }

    #[test]
    fn test_key_parse_and_display() {
        let key = ChunkKey::parse("-2_3").unwrap();
        assert_eq!(key, ChunkKey::new(-2, 3));
        assert_eq!(key.to_string(), "-2_3");

        assert!(ChunkKey::parse("bogus").is_none());
        assert!(ChunkKey::parse("1_x").is_none());
    }

    #[test]
    fn test_index_from_json() {
        let index = ChunkIndex::from_json(INDEX_JSON.as_bytes()).unwrap();

        assert_eq!(index.chunk_size(), 512.0);
        assert_eq!(index.len(), 2); // malformed key skipped
        assert!(index.contains(ChunkKey::new(0, 0)));
        assert!(index.contains(ChunkKey::new(-2, 3)));
        assert_eq!(
            index.fetch_key(ChunkKey::new(0, 0)),
            Some("chunks/0_0.jsonl".to_string())
        );
        assert_eq!(index.fetch_key(ChunkKey::new(9, 9)), None);
    }

    #[test]
    fn test_chunk_bounds() {
        let index = ChunkIndex::from_json(INDEX_JSON.as_bytes()).unwrap();
        let bounds = index.chunk_bounds(ChunkKey::new(0, 0));

        assert_eq!(bounds.min, Vec3::new(0.0, 0.0, -100.0));
        assert_eq!(bounds.max, Vec3::new(512.0, 512.0, 800.0));

        let neg = index.chunk_bounds(ChunkKey::new(-2, 3));
        assert_eq!(neg.min.x, -1024.0);
        assert_eq!(neg.max.x, -512.0);
    }

    #[test]
    fn test_bad_json_is_decode_error() {
        let err = ChunkIndex::from_json(b"not json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
