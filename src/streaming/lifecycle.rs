//! Per-chunk load lifecycle: token-gated state machine and eviction
//!
//! States: unloaded -> loading -> loaded, with loading -> unloaded on
//! cancellation. Cancellation is cooperative, so completions can race
//! it; a monotonic per-key generation token decides whether a completion
//! is stale, never reference identity.

use std::collections::{HashMap, HashSet};

use crate::core::cancel::CancelHandle;
use crate::world::index::ChunkKey;

#[derive(Debug)]
enum ChunkState {
    Loading { token: u64, cancel: CancelHandle },
    Loaded,
}

/// Counters for one lifecycle pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    pub stale_dropped: u64,
    pub cancelled: u64,
    pub evicted: u64,
}

/// Tracks the working set's chunk states.
///
/// Invariants: a key is in at most one of {loading, loaded}; at most one
/// outstanding request per key; loaded count is bounded by `capacity`
/// via farthest-first eviction.
pub struct ChunkLifecycle {
    states: HashMap<ChunkKey, ChunkState>,
    generations: HashMap<ChunkKey, u64>,
    capacity: usize,
    stats: LifecycleStats,
}

impl ChunkLifecycle {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            generations: HashMap::new(),
            capacity: capacity.max(1),
            stats: LifecycleStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_loaded(&self, key: ChunkKey) -> bool {
        matches!(self.states.get(&key), Some(ChunkState::Loaded))
    }

    pub fn is_loading(&self, key: ChunkKey) -> bool {
        matches!(self.states.get(&key), Some(ChunkState::Loading { .. }))
    }

    /// A key that is neither loaded nor in flight may start a load.
    pub fn can_start(&self, key: ChunkKey) -> bool {
        !self.states.contains_key(&key)
    }

    pub fn loaded_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, ChunkState::Loaded))
            .count()
    }

    pub fn loading_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, ChunkState::Loading { .. }))
            .count()
    }

    pub fn loaded_keys(&self) -> impl Iterator<Item = ChunkKey> + '_ {
        self.states.iter().filter_map(|(k, s)| {
            matches!(s, ChunkState::Loaded).then_some(*k)
        })
    }

    pub fn stats(&self) -> LifecycleStats {
        self.stats
    }

    pub fn take_stats(&mut self) -> LifecycleStats {
        std::mem::take(&mut self.stats)
    }

    /// Begin loading a key. Returns the generation token and the cancel
    /// handle to pass into the load task, or None if the key is already
    /// loading or loaded.
    pub fn begin_load(&mut self, key: ChunkKey) -> Option<(u64, CancelHandle)> {
        if !self.can_start(key) {
            return None;
        }
        let token = {
            let r#gen = self.generations.entry(key).or_insert(0);
            *r#gen += 1;
            *r#gen
        };
        let cancel = CancelHandle::new();
        self.states.insert(
            key,
            ChunkState::Loading {
                token,
                cancel: cancel.clone(),
            },
        );
        Some((token, cancel))
    }

    /// Apply a successful completion. Returns false (and changes nothing)
    /// when the completion is stale: wrong token, or no longer loading.
    pub fn complete_load(&mut self, key: ChunkKey, token: u64) -> bool {
        match self.states.get(&key) {
            Some(ChunkState::Loading { token: live, .. }) if *live == token => {
                self.states.insert(key, ChunkState::Loaded);
                true
            }
            _ => {
                self.stats.stale_dropped += 1;
                false
            }
        }
    }

    /// Apply a failed completion: the chunk returns to unloaded so a
    /// later tick can retry. Stale failures are discarded the same way
    /// as stale successes.
    pub fn fail_load(&mut self, key: ChunkKey, token: u64) -> bool {
        match self.states.get(&key) {
            Some(ChunkState::Loading { token: live, .. }) if *live == token => {
                self.states.remove(&key);
                true
            }
            _ => {
                self.stats.stale_dropped += 1;
                false
            }
        }
    }

    /// Cancel an in-flight load, if any.
    pub fn cancel_load(&mut self, key: ChunkKey) {
        if let Some(ChunkState::Loading { cancel, .. }) = self.states.get(&key) {
            cancel.cancel();
            self.states.remove(&key);
            self.stats.cancelled += 1;
        }
    }

    /// Drop a loaded chunk from the working set.
    pub fn unload(&mut self, key: ChunkKey) -> bool {
        matches!(self.states.remove(&key), Some(ChunkState::Loaded))
    }

    /// Cancel every in-flight load whose key is not wanted anymore.
    /// Returns the cancelled keys.
    pub fn cancel_unwanted(&mut self, wanted: &HashSet<ChunkKey>) -> Vec<ChunkKey> {
        let stale: Vec<ChunkKey> = self
            .states
            .iter()
            .filter_map(|(k, s)| {
                (matches!(s, ChunkState::Loading { .. }) && !wanted.contains(k)).then_some(*k)
            })
            .collect();
        for key in &stale {
            self.cancel_load(*key);
        }
        stale
    }

    /// Evict loaded chunks farthest from `center` until the loaded count
    /// is back under capacity. Returns the evicted keys.
    pub fn evict_over_capacity(&mut self, center: ChunkKey) -> Vec<ChunkKey> {
        let loaded = self.loaded_count();
        if loaded <= self.capacity {
            return Vec::new();
        }

        let mut candidates: Vec<ChunkKey> = self.loaded_keys().collect();
        candidates.sort_by_key(|k| std::cmp::Reverse(k.distance_squared(center)));
        candidates.truncate(loaded - self.capacity);

        for key in &candidates {
            self.states.remove(key);
            self.stats.evicted += 1;
        }
        if !candidates.is_empty() {
            log::debug!(
                "evicted {} chunks, {} loaded remain",
                candidates.len(),
                self.loaded_count()
            );
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(gx: i32, gy: i32) -> ChunkKey {
        ChunkKey::new(gx, gy)
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut lc = ChunkLifecycle::new(16);
        let k = key(0, 0);

        assert!(lc.can_start(k));
        let (token, _cancel) = lc.begin_load(k).unwrap();
        assert!(lc.is_loading(k));
        assert!(!lc.can_start(k));
        // Only one outstanding request per key.
        assert!(lc.begin_load(k).is_none());

        assert!(lc.complete_load(k, token));
        assert!(lc.is_loaded(k));
        assert!(!lc.is_loading(k));
    }

    #[test]
    fn test_stale_completion_is_discarded() {
        let mut lc = ChunkLifecycle::new(16);
        let k = key(0, 0);

        let (first_token, _) = lc.begin_load(k).unwrap();
        lc.cancel_load(k);
        let (second_token, _) = lc.begin_load(k).unwrap();
        assert!(second_token > first_token);

        // The first load completes late: discarded silently.
        assert!(!lc.complete_load(k, first_token));
        assert!(lc.is_loading(k));

        assert!(lc.complete_load(k, second_token));
        assert!(lc.is_loaded(k));
        assert_eq!(lc.stats().stale_dropped, 1);
    }

    #[test]
    fn test_failure_returns_to_unloaded_for_retry() {
        let mut lc = ChunkLifecycle::new(16);
        let k = key(1, 1);

        let (token, _) = lc.begin_load(k).unwrap();
        assert!(lc.fail_load(k, token));
        assert!(lc.can_start(k));
        // And a retry gets a fresh token.
        let (retry_token, _) = lc.begin_load(k).unwrap();
        assert!(retry_token > token);
    }

    #[test]
    fn test_cancel_signals_the_handle() {
        let mut lc = ChunkLifecycle::new(16);
        let k = key(2, 2);

        let (_, cancel) = lc.begin_load(k).unwrap();
        assert!(!cancel.is_cancelled());
        lc.cancel_load(k);
        assert!(cancel.is_cancelled());
        assert!(lc.can_start(k));
    }

    #[test]
    fn test_cancel_unwanted() {
        let mut lc = ChunkLifecycle::new(16);
        let keep = key(0, 0);
        let drop_me = key(9, 9);

        lc.begin_load(keep).unwrap();
        let (_, cancel) = lc.begin_load(drop_me).unwrap();

        let wanted: HashSet<_> = [keep].into_iter().collect();
        let cancelled = lc.cancel_unwanted(&wanted);

        assert_eq!(cancelled, vec![drop_me]);
        assert!(cancel.is_cancelled());
        assert!(lc.is_loading(keep));
    }

    #[test]
    fn test_eviction_removes_farthest_first() {
        let mut lc = ChunkLifecycle::new(3);
        for k in [key(0, 0), key(1, 0), key(5, 0), key(10, 0), key(2, 0)] {
            let (token, _) = lc.begin_load(k).unwrap();
            lc.complete_load(k, token);
        }
        assert_eq!(lc.loaded_count(), 5);

        let evicted = lc.evict_over_capacity(key(0, 0));
        assert_eq!(evicted.len(), 2);
        assert!(evicted.contains(&key(10, 0)));
        assert!(evicted.contains(&key(5, 0)));

        // Never reduced below capacity.
        assert_eq!(lc.loaded_count(), 3);
        assert!(lc.is_loaded(key(0, 0)));
        assert!(lc.is_loaded(key(1, 0)));
        assert!(lc.is_loaded(key(2, 0)));
    }

    #[test]
    fn test_eviction_noop_under_capacity() {
        let mut lc = ChunkLifecycle::new(8);
        let k = key(0, 0);
        let (token, _) = lc.begin_load(k).unwrap();
        lc.complete_load(k, token);

        assert!(lc.evict_over_capacity(key(0, 0)).is_empty());
        assert_eq!(lc.loaded_count(), 1);
    }
}
