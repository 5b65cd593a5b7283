//! Interior (MLO) containment and portal-graph visibility
//!
//! A discovered room container becomes the active interior when the
//! camera, transformed into the container's local space, lies inside one
//! of its room bounds. Visible rooms are the BFS expansion over the
//! portal adjacency graph up to a depth bound.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Deserialize;

use crate::core::error::Error;
use crate::core::types::{Quat, Result, Vec3};
use crate::math::Aabb;

/// Room bounds in container-local space.
#[derive(Clone, Debug, Deserialize)]
pub struct Room {
    #[serde(rename = "bbMin")]
    pub bb_min: [f32; 3],
    #[serde(rename = "bbMax")]
    pub bb_max: [f32; 3],
}

impl Room {
    pub fn bounds(&self) -> Aabb {
        Aabb::new(Vec3::from_array(self.bb_min), Vec3::from_array(self.bb_max))
    }
}

/// Directed portal edge; traversal treats it as bidirectional.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Portal {
    #[serde(rename = "roomFrom")]
    pub room_from: u32,
    #[serde(rename = "roomTo")]
    pub room_to: u32,
}

/// Room/portal definition for one interior archetype.
#[derive(Clone, Debug, Deserialize)]
pub struct InteriorDef {
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub portals: Vec<Portal>,
}

impl InteriorDef {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Room containing a local-space point, if any.
    pub fn room_of_point(&self, local: Vec3) -> Option<usize> {
        self.rooms
            .iter()
            .position(|room| room.bounds().contains_point(local))
    }

    /// BFS over the portal graph from `start`, bounded by `depth` hops.
    pub fn visible_rooms(&self, start: usize, depth: usize) -> HashSet<usize> {
        let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
        for portal in &self.portals {
            let (a, b) = (portal.room_from as usize, portal.room_to as usize);
            if a >= self.rooms.len() || b >= self.rooms.len() {
                continue; // dangling portal edge
            }
            adjacency.entry(a).or_default().push(b);
            adjacency.entry(b).or_default().push(a);
        }

        let mut visible = HashSet::new();
        visible.insert(start);
        let mut queue = VecDeque::new();
        queue.push_back((start, 0usize));
        while let Some((room, hops)) = queue.pop_front() {
            if hops >= depth {
                continue;
            }
            for &next in adjacency.get(&room).map(Vec::as_slice).unwrap_or(&[]) {
                if visible.insert(next) {
                    queue.push_back((next, hops + 1));
                }
            }
        }
        visible
    }
}

/// A placed room container discovered among the aggregated records.
#[derive(Clone, Debug)]
pub struct InteriorInstance {
    /// GUID matching child records' `mlo_parent_guid`.
    pub parent_guid: u64,
    pub archetype: u32,
    pub position: Vec3,
    pub rotation: Quat,
}

impl InteriorInstance {
    /// Transform a dataset-space point into container-local space.
    pub fn to_local(&self, point: Vec3) -> Vec3 {
        self.rotation.inverse() * (point - self.position)
    }
}

/// The interior the camera is currently inside, with its visible rooms.
#[derive(Clone, Debug)]
pub struct ActiveInterior {
    pub instance: InteriorInstance,
    pub camera_room: usize,
    pub visible_rooms: HashSet<usize>,
}

/// Test the camera against every discovered container; the first
/// containment wins.
pub fn find_active_interior(
    camera: Vec3,
    containers: &[InteriorInstance],
    defs: &HashMap<u32, InteriorDef>,
    bfs_depth: usize,
) -> Option<ActiveInterior> {
    for instance in containers {
        let Some(def) = defs.get(&instance.archetype) else {
            continue;
        };
        let local = instance.to_local(camera);
        if let Some(room) = def.room_of_point(local) {
            return Some(ActiveInterior {
                instance: instance.clone(),
                camera_room: room,
                visible_rooms: def.visible_rooms(room, bfs_depth),
            });
        }
    }
    None
}
