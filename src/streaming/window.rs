//! Chunk window selection: the wanted set around a moving viewpoint
//!
//! The window is a square core radius plus an asymmetric forward
//! extension ahead of travel. Frustum culling only demotes priority;
//! chunks outside the view still preload.

use crate::core::types::{Vec2, Vec3};
use crate::math::{Aabb, Frustum};
use crate::world::index::{ChunkKey, ZBounds};

/// Window shape and scoring penalties.
#[derive(Clone, Copy, Debug)]
pub struct WindowConfig {
    /// Core radius in cells, admitted unconditionally.
    pub core_radius: i32,
    /// Extra cells ahead of the camera's travel direction.
    pub forward_extension: i32,
    /// Score multiplier (>1) for chunks behind the camera.
    pub behind_penalty: f32,
    /// Score multiplier (>1) for chunks outside the view frustum.
    pub frustum_penalty: f32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            core_radius: 3,
            forward_extension: 2,
            behind_penalty: 4.0,
            frustum_penalty: 2.0,
        }
    }
}

/// One admitted chunk with its priority score (lower loads first).
#[derive(Clone, Copy, Debug)]
pub struct WantedChunk {
    pub key: ChunkKey,
    pub score: f32,
}

/// Computes the ordered wanted set for a camera pose.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowSelector {
    pub config: WindowConfig,
}

impl WindowSelector {
    pub fn new(config: WindowConfig) -> Self {
        Self { config }
    }

    /// Chunk the camera currently stands in (the window center).
    pub fn center(&self, camera_pos: Vec3, cell_size: f32) -> ChunkKey {
        ChunkKey::from_position(camera_pos, cell_size)
    }

    /// Enumerate, score and order the wanted chunk keys.
    ///
    /// Offsets within the core radius are admitted unconditionally;
    /// offsets out to `core + extension` only when they lie ahead of the
    /// camera's forward direction projected onto the grid plane.
    pub fn select(
        &self,
        camera_pos: Vec3,
        camera_forward: Vec3,
        frustum: Option<&Frustum>,
        cell_size: f32,
        z: ZBounds,
    ) -> Vec<WantedChunk> {
        let cfg = &self.config;
        let center = self.center(camera_pos, cell_size);
        let reach = cfg.core_radius + cfg.forward_extension;

        let forward_grid = {
            let f = Vec2::new(camera_forward.x, camera_forward.y);
            if f.length_squared() > 1e-6 {
                f.normalize()
            } else {
                Vec2::ZERO
            }
        };
        let mid_z = (z.min_z + z.max_z) * 0.5;

        let mut wanted = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let in_core = dx.abs().max(dy.abs()) <= cfg.core_radius;
                let ahead = Vec2::new(dx as f32, dy as f32).dot(forward_grid) >= 0.0;
                if !in_core && !ahead {
                    continue;
                }

                let key = ChunkKey::new(center.gx + dx, center.gy + dy);
                let cell_center = {
                    let mut c = key.center(cell_size);
                    c.z = mid_z;
                    c
                };

                let mut score = camera_pos.distance_squared(cell_center);
                if (cell_center - camera_pos).dot(camera_forward) < 0.0 {
                    score *= cfg.behind_penalty;
                }
                if let Some(frustum) = frustum {
                    let bounds = Aabb::new(
                        Vec3::new(
                            key.gx as f32 * cell_size,
                            key.gy as f32 * cell_size,
                            z.min_z,
                        ),
                        Vec3::new(
                            (key.gx + 1) as f32 * cell_size,
                            (key.gy + 1) as f32 * cell_size,
                            z.max_z,
                        ),
                    );
                    if !frustum.intersects_aabb(&bounds) {
                        score *= cfg.frustum_penalty;
                    }
                }

                wanted.push(WantedChunk { key, score });
            }
        }

        wanted.sort_by(|a, b| a.score.total_cmp(&b.score));
        wanted
    }
}
