//! The streaming manager: one update tick driving the whole engine
//!
//! All working-set state is mutated only from `tick`, which the render
//! loop calls once per frame. Loads run as background tasks and report
//! back over a channel; completions are applied in arrival order with
//! stale ones discarded by generation token.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::aggregate::aggregator::{Aggregator, RenderSink};
use crate::aggregate::gating::WorldClock;
use crate::core::cancel::CancelHandle;
use crate::core::error::Error;
use crate::core::types::{Mat4, Result, Vec3};
use crate::fetch::decode::{self, Codec};
use crate::fetch::fetcher::Fetcher;
use crate::fetch::scheduler::Lane;
use crate::fetch::source::FetchSource;
use crate::math::Frustum;
use crate::world::index::{ChunkIndex, ChunkKey};
use crate::world::record::{parse_tile, EntityRecord, TILE_MAGIC};
use crate::worker::{Job, JobOutput, WorkerCoordinator};

use super::budget::{FrameTimer, LoadBudget};
use super::lifecycle::ChunkLifecycle;
use super::window::{WindowConfig, WindowSelector};

/// Manager configuration.
#[derive(Clone, Debug)]
pub struct StreamerConfig {
    pub window: WindowConfig,
    /// Maximum loaded chunks before farthest-first eviction.
    pub capacity: usize,
    pub budget: LoadBudget,
    /// Leading slice of the wanted set scheduled on the high lane.
    pub high_lane_slice: usize,
    /// Codec of chunk payloads; None for plain.
    pub codec: Option<Codec>,
    /// Transforms world-space camera input into dataset space.
    pub dataset_from_world: Mat4,
    /// Camera movement (in dataset units) that forces a rebuild.
    pub rebuild_epsilon: f32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            capacity: 128,
            budget: LoadBudget::default(),
            high_lane_slice: 12,
            codec: None,
            dataset_from_world: Mat4::IDENTITY,
            rebuild_epsilon: 1.0,
        }
    }
}

/// Per-tick camera and world input.
#[derive(Clone, Copy, Debug)]
pub struct TickInput {
    /// World-space camera position.
    pub camera_position: Vec3,
    /// World-space camera forward direction.
    pub camera_forward: Vec3,
    /// Dataset-space view frustum, when available.
    pub frustum: Option<Frustum>,
    pub clock: Option<WorldClock>,
    pub now: Instant,
}

/// Counters for the most recent tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamStats {
    pub wanted: usize,
    pub loaded: usize,
    pub loading: usize,
    pub budget: usize,
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: u64,
    pub stale_dropped: u64,
    pub evicted: u64,
    pub rebuilt: bool,
}

struct LoadCompletion {
    key: ChunkKey,
    token: u64,
    result: Result<Vec<EntityRecord>>,
}

/// Streams chunks around the camera into the aggregator.
pub struct StreamingManager<S: FetchSource> {
    config: StreamerConfig,
    index: Arc<ChunkIndex>,
    fetcher: Arc<Fetcher<S>>,
    worker: Option<Arc<WorkerCoordinator>>,
    selector: WindowSelector,
    lifecycle: ChunkLifecycle,
    timer: FrameTimer,
    aggregator: Aggregator,
    results_tx: mpsc::UnboundedSender<LoadCompletion>,
    results_rx: mpsc::UnboundedReceiver<LoadCompletion>,
    stats: StreamStats,
    dirty: bool,
    last_rebuild_camera: Option<Vec3>,
}

impl<S: FetchSource> StreamingManager<S> {
    pub fn new(
        config: StreamerConfig,
        index: Arc<ChunkIndex>,
        fetcher: Arc<Fetcher<S>>,
        aggregator: Aggregator,
        worker: Option<Arc<WorkerCoordinator>>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let timer = FrameTimer::new(config.budget.target_frame_ms);
        let lifecycle = ChunkLifecycle::new(config.capacity);
        Self {
            selector: WindowSelector::new(config.window),
            config,
            index,
            fetcher,
            worker,
            lifecycle,
            timer,
            aggregator,
            results_tx,
            results_rx,
            stats: StreamStats::default(),
            dirty: false,
            last_rebuild_camera: None,
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn loaded_count(&self) -> usize {
        self.lifecycle.loaded_count()
    }

    pub fn loading_count(&self) -> usize {
        self.lifecycle.loading_count()
    }

    /// One update tick. Must be called from within a tokio runtime; all
    /// working-set mutation happens here.
    pub fn tick(&mut self, input: TickInput, sink: &mut dyn RenderSink) -> StreamStats {
        let mut stats = StreamStats::default();

        // Adaptive budget from the frame-time moving average.
        let average_ms = self.timer.tick(input.now);
        let budget = self.config.budget.per_tick(average_ms);
        stats.budget = budget;

        // Camera into dataset space.
        let camera = self
            .config
            .dataset_from_world
            .transform_point3(input.camera_position);
        let forward = self
            .config
            .dataset_from_world
            .transform_vector3(input.camera_forward)
            .normalize_or_zero();

        // Wanted set, restricted to chunks that exist in the index.
        let wanted: Vec<ChunkKey> = self
            .selector
            .select(
                camera,
                forward,
                input.frustum.as_ref(),
                self.index.chunk_size(),
                self.index.bounds(),
            )
            .into_iter()
            .map(|w| w.key)
            .filter(|k| self.index.contains(*k))
            .collect();
        stats.wanted = wanted.len();

        // Cancel loads that fell out of the window.
        let wanted_set: HashSet<ChunkKey> = wanted.iter().copied().collect();
        self.lifecycle.cancel_unwanted(&wanted_set);

        // Apply completions in arrival order; stale ones are discarded.
        while let Ok(completion) = self.results_rx.try_recv() {
            match completion.result {
                Ok(records) => {
                    if self.lifecycle.complete_load(completion.key, completion.token) {
                        self.aggregator.insert_chunk(completion.key, records);
                        self.dirty = true;
                        stats.completed += 1;
                    }
                }
                Err(e) if e.is_cancelled() => {
                    // Cooperative cancellation; the state was already
                    // cleared when the cancel was issued.
                }
                Err(e) => {
                    if self.lifecycle.fail_load(completion.key, completion.token) {
                        stats.failed += 1;
                        log::warn!("chunk {} load failed: {}", completion.key, e);
                    }
                }
            }
        }

        // Admit new loads within the budget, front of the window first.
        let mut started = 0usize;
        for (rank, key) in wanted.iter().enumerate() {
            if started >= budget {
                break;
            }
            if !self.lifecycle.can_start(*key) {
                continue;
            }
            let Some((token, cancel)) = self.lifecycle.begin_load(*key) else {
                continue;
            };
            let lane = if rank < self.config.high_lane_slice {
                Lane::High
            } else {
                Lane::Low
            };
            self.spawn_load(*key, token, cancel, lane);
            started += 1;
        }
        stats.started = started;

        // Evict beyond capacity, farthest from the window center first.
        let center = self.selector.center(camera, self.index.chunk_size());
        for key in self.lifecycle.evict_over_capacity(center) {
            self.aggregator.remove_chunk(key);
            if let Some(worker) = &self.worker {
                worker.drop_stored(key);
            }
            self.dirty = true;
        }

        // Rebuild the published groups when the working set changed or
        // the camera moved meaningfully.
        let moved = self
            .last_rebuild_camera
            .map(|last| last.distance_squared(camera) > self.config.rebuild_epsilon.powi(2))
            .unwrap_or(true);
        if self.dirty || moved {
            self.aggregator.rebuild(camera, forward, input.clock, sink);
            self.dirty = false;
            self.last_rebuild_camera = Some(camera);
            stats.rebuilt = true;
        }

        let lifecycle_stats = self.lifecycle.take_stats();
        stats.cancelled = lifecycle_stats.cancelled;
        stats.stale_dropped = lifecycle_stats.stale_dropped;
        stats.evicted = lifecycle_stats.evicted;
        stats.loaded = self.lifecycle.loaded_count();
        stats.loading = self.lifecycle.loading_count();

        log::debug!(
            "tick: wanted {} loaded {} loading {} started {} completed {} evicted {}",
            stats.wanted,
            stats.loaded,
            stats.loading,
            stats.started,
            stats.completed,
            stats.evicted
        );
        self.stats = stats;
        stats
    }

    fn spawn_load(&self, key: ChunkKey, token: u64, cancel: CancelHandle, lane: Lane) {
        let Some(fetch_key) = self.index.fetch_key(key) else {
            // Admission filtered on index membership already.
            return;
        };
        let fetcher = Arc::clone(&self.fetcher);
        let worker = self.worker.clone();
        let codec = self.config.codec;
        let results = self.results_tx.clone();

        tokio::spawn(async move {
            let result = load_chunk(fetcher, worker, &fetch_key, codec, lane, cancel).await;
            let _ = results.send(LoadCompletion { key, token, result });
        });
    }
}

/// Fetch and parse one chunk payload.
///
/// JSONL payloads stream through the incremental line decoder; anything
/// else is treated as a binary tile. With a worker attached, raw bytes
/// are forwarded untouched and parsed off the tick thread.
async fn load_chunk<S: FetchSource>(
    fetcher: Arc<Fetcher<S>>,
    worker: Option<Arc<WorkerCoordinator>>,
    fetch_key: &str,
    codec: Option<Codec>,
    lane: Lane,
    cancel: CancelHandle,
) -> Result<Vec<EntityRecord>> {
    if let Some(worker) = worker {
        let mut bytes = Vec::new();
        fetcher
            .fetch_blocks(fetch_key, lane, Some(&cancel), |block| {
                bytes.extend_from_slice(block)
            })
            .await?;
        let bytes = match codec {
            Some(codec) => decode::decompress(codec, &bytes)?,
            None => bytes,
        };
        cancel.check()?;

        let job = if bytes.starts_with(&TILE_MAGIC) {
            Job::ParseTile { bytes }
        } else {
            Job::ParseLines { bytes }
        };
        match worker.submit(job).await? {
            JobOutput::Records(records) => Ok(records),
            other => Err(Error::Decode(format!(
                "unexpected worker output: {:?}",
                other
            ))),
        }
    } else if fetch_key.ends_with(".jsonl") {
        let mut records = Vec::new();
        fetcher
            .fetch_records(fetch_key, lane, Some(&cancel), codec, |r| records.push(r))
            .await?;
        Ok(records)
    } else {
        let bytes = fetcher.fetch(fetch_key, lane, Some(&cancel)).await?;
        let bytes = match codec {
            Some(codec) => decode::decompress(codec, &bytes)?,
            None => bytes.to_vec(),
        };
        cancel.check()?;
        parse_tile(&bytes)
    }
}
