//! Worker offload coordination
//!
//! Heavy parse/aggregate jobs run on a supervised background task.
//! Every job gets a monotonically increasing correlation id; results are
//! matched back through an explicit pending map, never ambient callbacks.
//! If the worker dies, all pending jobs fail immediately and subsequent
//! jobs fall back to in-process execution until explicitly re-enabled.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::aggregate::aggregator::{build_archetype_batches, ArchetypeId};
use crate::core::error::Error;
use crate::core::types::Result;
use crate::fetch::decode::LineDecoder;
use crate::world::batch::{BatchVersion, InstanceBatch};
use crate::world::index::ChunkKey;
use crate::world::record::{parse_tile, EntityRecord};

/// Correlation id matching a response to its pending request.
pub type JobId = u64;

/// A unit of heavy work shipped to the worker.
#[derive(Debug)]
pub enum Job {
    /// Decode line-delimited records from raw bytes.
    ParseLines { bytes: Vec<u8> },
    /// Decode a binary chunk tile.
    ParseTile { bytes: Vec<u8> },
    /// Group a chunk's records into per-archetype batches. With
    /// `store_only` the batches stay resident worker-side and only a
    /// summary comes back, so rebuilds avoid re-transferring buffers.
    AggregateChunk {
        chunk: ChunkKey,
        records: Vec<EntityRecord>,
        version: BatchVersion,
        store_only: bool,
    },
}

/// Summary of an aggregation result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AggregateSummary {
    pub groups: usize,
    pub instances: usize,
}

/// Typed job result.
#[derive(Debug)]
pub enum JobOutput {
    Records(Vec<EntityRecord>),
    Aggregated {
        /// None when the batches stayed resident in the worker.
        batches: Option<HashMap<ArchetypeId, InstanceBatch>>,
        summary: AggregateSummary,
    },
}

/// Pure compute function the worker runs per job.
pub type HandlerFn = Arc<dyn Fn(Job) -> Result<JobOutput> + Send + Sync>;

/// The built-in handler: line/tile decoding and per-archetype grouping.
pub fn default_handler() -> HandlerFn {
    Arc::new(|job| match job {
        Job::ParseLines { bytes } => {
            let mut decoder = LineDecoder::new();
            let mut records = Vec::new();
            decoder.push(&bytes, |r| records.push(r));
            decoder.finish(|r| records.push(r));
            Ok(JobOutput::Records(records))
        }
        Job::ParseTile { bytes } => parse_tile(&bytes).map(JobOutput::Records),
        Job::AggregateChunk {
            records, version, ..
        } => {
            let batches = build_archetype_batches(&records, version);
            let summary = AggregateSummary {
                groups: batches.len(),
                instances: records.len(),
            };
            Ok(JobOutput::Aggregated {
                batches: Some(batches),
                summary,
            })
        }
    })
}

#[derive(Debug)]
enum WorkerMsg {
    Job { id: JobId, job: Job },
    DropStored { chunk: ChunkKey },
}

type PendingMap = Arc<Mutex<HashMap<JobId, oneshot::Sender<Result<JobOutput>>>>>;
type StoreMap = HashMap<ChunkKey, HashMap<ArchetypeId, InstanceBatch>>;

/// Supervises the background worker and routes jobs to it, with an
/// in-process fallback path after a crash.
pub struct WorkerCoordinator {
    handler: HandlerFn,
    next_id: AtomicU64,
    pending: PendingMap,
    to_worker: Mutex<mpsc::UnboundedSender<WorkerMsg>>,
    crashed: Arc<AtomicBool>,
    /// Store-only residency for the in-process fallback path.
    fallback_store: Mutex<StoreMap>,
}

impl WorkerCoordinator {
    /// Spawn the worker and its result pump on the current runtime.
    pub fn new(handler: HandlerFn) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let crashed = Arc::new(AtomicBool::new(false));
        let to_worker = Self::spawn_worker(Arc::clone(&handler), &pending, &crashed);

        Self {
            handler,
            next_id: AtomicU64::new(1),
            pending,
            to_worker: Mutex::new(to_worker),
            crashed,
            fallback_store: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_handler() -> Self {
        Self::new(default_handler())
    }

    /// Whether jobs currently run in-process because the worker died.
    pub fn is_fallback(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Number of jobs awaiting a worker response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Submit a job and await its typed result.
    pub async fn submit(&self, job: Job) -> Result<JobOutput> {
        if self.crashed.load(Ordering::SeqCst) {
            return self.run_in_process(job);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let send_result = {
            let sender = self.to_worker.lock().unwrap();
            sender.send(WorkerMsg::Job { id, job })
        };
        match send_result {
            Ok(()) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::WorkerCrash("response channel dropped".into())),
            },
            Err(mpsc::error::SendError(msg)) => {
                // Worker receiver is gone: treat as crashed and recover
                // the job for the in-process path.
                self.pending.lock().unwrap().remove(&id);
                self.crashed.store(true, Ordering::SeqCst);
                match msg {
                    WorkerMsg::Job { job, .. } => self.run_in_process(job),
                    WorkerMsg::DropStored { .. } => unreachable!("only jobs are sent here"),
                }
            }
        }
    }

    /// Free a store-only residency for an evicted chunk, wherever it
    /// lives. Fire-and-forget.
    pub fn drop_stored(&self, chunk: ChunkKey) {
        self.fallback_store.lock().unwrap().remove(&chunk);
        let sender = self.to_worker.lock().unwrap();
        let _ = sender.send(WorkerMsg::DropStored { chunk });
    }

    /// Respawn the worker after a crash and leave fallback mode.
    pub fn reenable(&self) {
        let to_worker = Self::spawn_worker(Arc::clone(&self.handler), &self.pending, &self.crashed);
        *self.to_worker.lock().unwrap() = to_worker;
        self.crashed.store(false, Ordering::SeqCst);
        log::info!("worker re-enabled");
    }

    fn spawn_worker(
        handler: HandlerFn,
        pending: &PendingMap,
        crashed: &Arc<AtomicBool>,
    ) -> mpsc::UnboundedSender<WorkerMsg> {
        let (to_worker, from_coordinator) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        tokio::spawn(worker_loop(handler, from_coordinator, results_tx));
        tokio::spawn(pump_loop(
            results_rx,
            Arc::clone(pending),
            Arc::clone(crashed),
        ));
        to_worker
    }

    fn run_in_process(&self, job: Job) -> Result<JobOutput> {
        let store_chunk = match &job {
            Job::AggregateChunk {
                chunk,
                store_only: true,
                ..
            } => Some(*chunk),
            _ => None,
        };
        let handler = Arc::clone(&self.handler);
        let output = std::panic::catch_unwind(AssertUnwindSafe(move || handler(job)))
            .map_err(|_| Error::WorkerCrash("in-process job panicked".into()))??;

        match (store_chunk, output) {
            (
                Some(chunk),
                JobOutput::Aggregated {
                    batches: Some(batches),
                    summary,
                },
            ) => {
                self.fallback_store.lock().unwrap().insert(chunk, batches);
                Ok(JobOutput::Aggregated {
                    batches: None,
                    summary,
                })
            }
            (_, output) => Ok(output),
        }
    }
}

/// Sequential worker: one job at a time, store-only residency kept here.
/// A panicking handler terminates the loop, which the pump observes as a
/// crash.
async fn worker_loop(
    handler: HandlerFn,
    mut jobs: mpsc::UnboundedReceiver<WorkerMsg>,
    results: mpsc::UnboundedSender<(JobId, Result<JobOutput>)>,
) {
    let mut store: StoreMap = HashMap::new();

    while let Some(msg) = jobs.recv().await {
        match msg {
            WorkerMsg::Job { id, job } => {
                let store_chunk = match &job {
                    Job::AggregateChunk {
                        chunk,
                        store_only: true,
                        ..
                    } => Some(*chunk),
                    _ => None,
                };
                let handler = Arc::clone(&handler);
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || handler(job)));
                match outcome {
                    Ok(result) => {
                        let result = match (store_chunk, result) {
                            (
                                Some(chunk),
                                Ok(JobOutput::Aggregated {
                                    batches: Some(batches),
                                    summary,
                                }),
                            ) => {
                                store.insert(chunk, batches);
                                Ok(JobOutput::Aggregated {
                                    batches: None,
                                    summary,
                                })
                            }
                            (_, result) => result,
                        };
                        if results.send((id, result)).is_err() {
                            break; // coordinator gone
                        }
                    }
                    Err(_) => {
                        log::error!("worker job {} panicked; worker terminating", id);
                        break; // crash: results sender drops, pump reacts
                    }
                }
            }
            WorkerMsg::DropStored { chunk } => {
                store.remove(&chunk);
            }
        }
    }
}

/// Routes worker results back to pending requesters; on worker death,
/// fails everything still pending and flips the crash flag.
async fn pump_loop(
    mut results: mpsc::UnboundedReceiver<(JobId, Result<JobOutput>)>,
    pending: PendingMap,
    crashed: Arc<AtomicBool>,
) {
    while let Some((id, result)) = results.recv().await {
        let tx = pending.lock().unwrap().remove(&id);
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    crashed.store(true, Ordering::SeqCst);
    let drained: Vec<_> = {
        let mut pending = pending.lock().unwrap();
        pending.drain().collect()
    };
    if !drained.is_empty() {
        log::warn!("worker crashed with {} jobs pending", drained.len());
    }
    for (_, tx) in drained {
        let _ = tx.send(Err(Error::WorkerCrash(
            "worker terminated with jobs pending".into(),
        )));
    }
}
