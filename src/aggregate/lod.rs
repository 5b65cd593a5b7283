//! Distance-based LOD tier selection
//!
//! Four ordered tiers; any threshold may be absent. Selection picks the
//! smallest tier whose threshold covers the distance and, beyond the
//! largest configured threshold, stays at the coarsest available tier
//! rather than falling back to High.

/// Detail tier, finest first. Derived ordering: `High < Med < Low < VLow`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LodTier {
    High,
    Med,
    Low,
    VLow,
}

/// Per-archetype distance thresholds; `None` means the tier is absent.
#[derive(Clone, Copy, Debug, Default)]
pub struct LodThresholds {
    pub high: Option<f32>,
    pub med: Option<f32>,
    pub low: Option<f32>,
    pub vlow: Option<f32>,
}

impl LodThresholds {
    pub fn new(
        high: Option<f32>,
        med: Option<f32>,
        low: Option<f32>,
        vlow: Option<f32>,
    ) -> Self {
        Self { high, med, low, vlow }
    }

    fn tiers(&self) -> [(LodTier, Option<f32>); 4] {
        [
            (LodTier::High, self.high),
            (LodTier::Med, self.med),
            (LodTier::Low, self.low),
            (LodTier::VLow, self.vlow),
        ]
    }

    /// Largest configured threshold; groups farther than this are
    /// dropped entirely by the capacity policy when it exceeds the
    /// global render distance.
    pub fn max_distance(&self) -> Option<f32> {
        self.tiers()
            .into_iter()
            .filter_map(|(_, d)| d)
            .fold(None, |acc, d| Some(acc.map_or(d, |a: f32| a.max(d))))
    }

    /// Select the tier for a distance. With no thresholds configured at
    /// all the result is always `High`.
    pub fn tier_for_distance(&self, distance: f32) -> LodTier {
        let mut coarsest_present = None;
        for (tier, threshold) in self.tiers() {
            if let Some(threshold) = threshold {
                coarsest_present = Some(tier);
                if distance <= threshold {
                    return tier;
                }
            }
        }
        coarsest_present.unwrap_or(LodTier::High)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(LodTier::High < LodTier::Med);
        assert!(LodTier::Med < LodTier::Low);
        assert!(LodTier::Low < LodTier::VLow);
    }

    #[test]
    fn test_full_ladder() {
        let lod = LodThresholds::new(Some(50.0), Some(150.0), Some(400.0), Some(1000.0));
        assert_eq!(lod.tier_for_distance(0.0), LodTier::High);
        assert_eq!(lod.tier_for_distance(50.0), LodTier::High);
        assert_eq!(lod.tier_for_distance(50.1), LodTier::Med);
        assert_eq!(lod.tier_for_distance(200.0), LodTier::Low);
        assert_eq!(lod.tier_for_distance(900.0), LodTier::VLow);
        // Beyond the last threshold: stay coarse.
        assert_eq!(lod.tier_for_distance(5000.0), LodTier::VLow);
    }

    #[test]
    fn test_sparse_ladder_stays_at_coarsest() {
        // Scenario: {High: 50, Med: 150}, distance 200 => Med, never High.
        let lod = LodThresholds::new(Some(50.0), Some(150.0), None, None);
        assert_eq!(lod.tier_for_distance(200.0), LodTier::Med);
        assert_eq!(lod.tier_for_distance(149.0), LodTier::Med);
        assert_eq!(lod.tier_for_distance(10.0), LodTier::High);
    }

    #[test]
    fn test_missing_thresholds_default_high() {
        let lod = LodThresholds::default();
        assert_eq!(lod.tier_for_distance(0.0), LodTier::High);
        assert_eq!(lod.tier_for_distance(1.0e9), LodTier::High);
    }

    #[test]
    fn test_selection_is_monotonic() {
        let lod = LodThresholds::new(Some(50.0), None, Some(400.0), None);
        let mut previous = LodTier::High;
        for step in 0..500 {
            let d = step as f32 * 2.0;
            let tier = lod.tier_for_distance(d);
            assert!(tier >= previous, "tier regressed at distance {}", d);
            previous = tier;
        }
    }

    #[test]
    fn test_max_distance() {
        let lod = LodThresholds::new(Some(50.0), Some(150.0), None, None);
        assert_eq!(lod.max_distance(), Some(150.0));
        assert_eq!(LodThresholds::default().max_distance(), None);
    }
}
