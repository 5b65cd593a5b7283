//! GPU-ready instance batches: flat float arrays with an explicit version
//!
//! The version tag travels with the batch; inferring it from
//! `length % stride` survives only as a shim for the legacy wire format.

use crate::core::error::Error;
use crate::core::types::Result;
use crate::world::record::EntityRecord;

/// Layout version of an instance batch. Ordering matters: later versions
/// append fields to earlier ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchVersion {
    /// position xyz, quaternion xyzw, uniform scale
    Transform,
    /// + tint palette index
    Tinted,
    /// + interior parent guid (2 floats), entity-set hash, interior flags
    Interior,
    /// + owning-region hash
    Region,
}

impl BatchVersion {
    /// Floats per instance for this version.
    pub fn stride(&self) -> usize {
        match self {
            BatchVersion::Transform => 8,
            BatchVersion::Tinted => 9,
            BatchVersion::Interior => 13,
            BatchVersion::Region => 14,
        }
    }

    const ALL: [BatchVersion; 4] = [
        BatchVersion::Transform,
        BatchVersion::Tinted,
        BatchVersion::Interior,
        BatchVersion::Region,
    ];

    /// Legacy shim: infer the version from a raw float count. Succeeds
    /// only when exactly one candidate stride divides the length.
    pub fn infer(len: usize) -> Result<BatchVersion> {
        if len == 0 {
            return Err(Error::Decode("batch: cannot infer version of empty data".into()));
        }
        let mut matches = Self::ALL.iter().filter(|v| len % v.stride() == 0);
        match (matches.next(), matches.next()) {
            (Some(&v), None) => Ok(v),
            (None, _) => Err(Error::Decode(format!("batch: length {} fits no stride", len))),
            _ => Err(Error::Decode(format!("batch: length {} is ambiguous", len))),
        }
    }
}

/// A flat per-instance float array for one archetype or bucket.
///
/// Invariant: `data.len()` is always an exact multiple of the version
/// stride; only `push` appends, and it writes exactly one stride.
#[derive(Clone, Debug)]
pub struct InstanceBatch {
    version: BatchVersion,
    data: Vec<f32>,
}

impl InstanceBatch {
    pub fn new(version: BatchVersion) -> Self {
        Self {
            version,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(version: BatchVersion, instances: usize) -> Self {
        Self {
            version,
            data: Vec::with_capacity(instances * version.stride()),
        }
    }

    /// Adopt raw floats from the legacy wire format, inferring the version.
    pub fn from_raw(data: Vec<f32>) -> Result<Self> {
        let version = BatchVersion::infer(data.len())?;
        Ok(Self { version, data })
    }

    pub fn version(&self) -> BatchVersion {
        self.version
    }

    pub fn stride(&self) -> usize {
        self.version.stride()
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.data.len() / self.stride()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Append one record. Fields beyond the version stride are dropped.
    pub fn push(&mut self, record: &EntityRecord) {
        let [x, y, z] = record.position;
        let rot = record.rotation();
        self.data
            .extend_from_slice(&[x, y, z, rot.x, rot.y, rot.z, rot.w, record.scale]);

        if self.version.stride() >= BatchVersion::Tinted.stride() {
            self.data
                .push(record.tint_index.unwrap_or(0) as f32);
        }
        if self.version.stride() >= BatchVersion::Interior.stride() {
            let guid = record.mlo_parent_guid;
            self.data.push((guid & 0xFFFF_FFFF) as u32 as f32);
            self.data.push((guid >> 32) as u32 as f32);
            self.data.push(record.mlo_entity_set_hash as f32);
            self.data.push(if record.is_mlo_instance { 1.0 } else { 0.0 });
        }
        if self.version.stride() >= BatchVersion::Region.stride() {
            self.data.push(record.ymap as f32);
        }

        debug_assert_eq!(self.data.len() % self.stride(), 0);
    }

    /// Finite-value sanity scan. A poisoned batch must be dropped whole,
    /// never forwarded to the render collaborator.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}
