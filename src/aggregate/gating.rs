//! Time-of-day and weather gating by owning-region hash
//!
//! Unknown region hashes and an absent table both fail open: an
//! incomplete gating dataset must never hide geometry.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::core::error::Error;
use crate::core::types::Result;

/// Current world conditions supplied by the application shell.
#[derive(Clone, Copy, Debug)]
pub struct WorldClock {
    /// Hour of day, 0..=23.
    pub hour: u8,
    /// Hash of the active weather type.
    pub weather: u64,
}

#[derive(Clone, Debug, Deserialize)]
struct RawGate {
    #[serde(rename = "hoursOnOff")]
    hours_on_off: u32,
    #[serde(rename = "weatherTypes", default)]
    weather_types: Vec<u64>,
}

#[derive(Deserialize)]
struct RawTable {
    #[serde(rename = "byRegionHash")]
    by_region_hash: HashMap<String, RawGate>,
}

#[derive(Clone, Debug)]
struct RegionGate {
    hours_mask: u32,
    /// Empty set means any weather.
    weather: HashSet<u64>,
}

/// Optional per-region enable table.
#[derive(Clone, Debug, Default)]
pub struct GatingTable {
    by_region: HashMap<u32, RegionGate>,
}

impl GatingTable {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let raw: RawTable =
            serde_json::from_slice(data).map_err(|e| Error::Decode(e.to_string()))?;

        let mut by_region = HashMap::with_capacity(raw.by_region_hash.len());
        for (key, gate) in raw.by_region_hash {
            match key.parse::<u32>() {
                Ok(hash) => {
                    by_region.insert(
                        hash,
                        RegionGate {
                            hours_mask: gate.hours_on_off,
                            weather: gate.weather_types.into_iter().collect(),
                        },
                    );
                }
                Err(_) => log::warn!("gating table: skipping non-numeric region key `{}`", key),
            }
        }
        Ok(Self { by_region })
    }

    pub fn len(&self) -> usize {
        self.by_region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_region.is_empty()
    }

    /// Whether instances of `region` are visible under `clock`.
    pub fn visible(&self, region: u32, clock: WorldClock) -> bool {
        let Some(gate) = self.by_region.get(&region) else {
            return true; // unknown region: fail open
        };
        let hour_ok = gate.hours_mask & (1 << (clock.hour % 24)) != 0;
        let weather_ok = gate.weather.is_empty() || gate.weather.contains(&clock.weather);
        hour_ok && weather_ok
    }
}

/// Table-optional check used by the aggregator: no table, no gating.
pub fn region_visible(table: Option<&GatingTable>, region: u32, clock: WorldClock) -> bool {
    match table {
        Some(table) => table.visible(region, clock),
        None => true,
    }
}
