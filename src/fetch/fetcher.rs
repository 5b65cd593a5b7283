//! Fetch orchestration: de-duplication, persistent cache, streaming decode
//!
//! Concurrent requests for the same (kind, key) share one physical fetch
//! and one result. A caller-supplied cancellation scope bypasses both the
//! de-dup map and the shared result path, so an aborted caller can never
//! disturb co-waiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use crate::core::cancel::CancelHandle;
use crate::core::error::Error;
use crate::core::types::Result;

use super::cache::ByteCache;
use super::decode::{self, Codec, LineDecoder};
use super::scheduler::{Lane, TwoLaneScheduler};
use super::source::FetchSource;

/// De-duplication class of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FetchKind {
    Bytes,
    Records,
    Blocks,
}

/// Counters from a record-streaming fetch.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordStats {
    pub decoded: usize,
    pub skipped: usize,
}

type SharedResult = std::result::Result<Arc<Vec<u8>>, Error>;

#[derive(Default)]
struct Inflight {
    waiters: Vec<oneshot::Sender<SharedResult>>,
}

/// Scheduler-limited fetch front end over one source.
pub struct Fetcher<S: FetchSource> {
    scheduler: Arc<TwoLaneScheduler>,
    source: Arc<S>,
    cache: Option<Arc<ByteCache>>,
    inflight: Mutex<HashMap<(FetchKind, String), Inflight>>,
    physical_fetches: AtomicU64,
}

impl<S: FetchSource> Fetcher<S> {
    pub fn new(scheduler: Arc<TwoLaneScheduler>, source: S, cache: Option<ByteCache>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            source: Arc::new(source),
            cache: cache.map(Arc::new),
            inflight: Mutex::new(HashMap::new()),
            physical_fetches: AtomicU64::new(0),
        })
    }

    /// Number of underlying fetches actually issued (cache hits and
    /// de-duplicated co-waiters excluded).
    pub fn physical_fetch_count(&self) -> u64 {
        self.physical_fetches.load(Ordering::Relaxed)
    }

    /// Fetch a whole payload.
    pub async fn fetch(
        &self,
        key: &str,
        lane: Lane,
        cancel: Option<&CancelHandle>,
    ) -> Result<Arc<Vec<u8>>> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty fetch key"));
        }
        if let Some(cancel) = cancel {
            cancel.check()?;
        }

        // Cache reads bypass the concurrency limiter.
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(key).await {
                return Ok(Arc::new(bytes));
            }
        }

        if let Some(cancel) = cancel {
            return self.fetch_direct(key, lane, cancel).await.map(Arc::new);
        }

        if let Some(rx) = self.join_inflight(FetchKind::Bytes, key) {
            return match rx.await {
                Ok(shared) => shared,
                Err(_) => Err(Error::Cancelled),
            };
        }

        // Leader: the guard settles co-waiters even if this future is
        // dropped mid-fetch.
        let mut guard = InflightGuard {
            fetcher: self,
            entry: Some((FetchKind::Bytes, key.to_string())),
        };
        let result = self.physical_fetch(key, lane).await.map(Arc::new);
        guard.finish(result.clone());
        result
    }

    /// Stream raw byte blocks to a callback, untouched.
    pub async fn fetch_blocks(
        &self,
        key: &str,
        lane: Lane,
        cancel: Option<&CancelHandle>,
        mut on_block: impl FnMut(&[u8]) + Send,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty fetch key"));
        }
        if let Some(cancel) = cancel {
            cancel.check()?;
            self.stream_direct(key, lane, cancel, &mut on_block).await?;
            return Ok(());
        }
        self.stream_shared(FetchKind::Blocks, key, lane, &mut on_block)
            .await
    }

    /// Stream line-delimited records to a callback as bytes arrive.
    ///
    /// With a codec the payload is fetched whole and decompressed first;
    /// the codec must be supported or the call fails before any I/O,
    /// directing the caller at the uncompressed variant.
    pub async fn fetch_records<T: DeserializeOwned + Send>(
        &self,
        key: &str,
        lane: Lane,
        cancel: Option<&CancelHandle>,
        codec: Option<Codec>,
        mut on_record: impl FnMut(T) + Send,
    ) -> Result<RecordStats> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty fetch key"));
        }
        if let Some(codec) = codec {
            if !decode::is_supported(codec) {
                return Err(Error::UnsupportedCodec(codec.name()));
            }
        }
        if let Some(cancel) = cancel {
            cancel.check()?;
        }

        let mut decoder = LineDecoder::new();
        if let Some(codec) = codec {
            let bytes = self.fetch(key, lane, cancel).await?;
            let plain = decode::decompress(codec, &bytes)?;
            decoder.push(&plain, |r| on_record(r));
        } else {
            let mut emit = |block: &[u8]| decoder.push(block, |r| on_record(r));
            match cancel {
                Some(cancel) => {
                    self.stream_direct(key, lane, cancel, &mut emit).await?;
                }
                None => {
                    self.stream_shared(FetchKind::Records, key, lane, &mut emit)
                        .await?;
                }
            }
        }
        decoder.finish(|r| on_record(r));

        Ok(RecordStats {
            decoded: decoder.decoded(),
            skipped: decoder.skipped(),
        })
    }

    // --- De-dup plumbing ---

    /// Register as a waiter on an existing in-flight entry, or claim
    /// leadership (None) by inserting a fresh one.
    fn join_inflight(
        &self,
        kind: FetchKind,
        key: &str,
    ) -> Option<oneshot::Receiver<SharedResult>> {
        let mut inflight = self.inflight.lock().unwrap();
        match inflight.get_mut(&(kind, key.to_string())) {
            Some(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.waiters.push(tx);
                Some(rx)
            }
            None => {
                inflight.insert((kind, key.to_string()), Inflight::default());
                None
            }
        }
    }

    /// Resolve an in-flight entry, fanning the shared result out.
    fn settle_inflight(&self, kind: FetchKind, key: &str, result: SharedResult) {
        let waiters = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight
                .remove(&(kind, key.to_string()))
                .map(|e| e.waiters)
                .unwrap_or_default()
        };
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
    }

    // --- Physical paths ---

    async fn physical_fetch(&self, key: &str, lane: Lane) -> Result<Vec<u8>> {
        let _permit = self.scheduler.clone().acquire(lane).await;
        self.physical_fetches.fetch_add(1, Ordering::Relaxed);

        let response = self.source.fetch(key).await?;
        if !response.ok() {
            return Err(Error::Transport {
                key: key.to_string(),
                status: response.status,
            });
        }
        if let Some(cache) = &self.cache {
            cache
                .put(key, response.content_type.as_deref(), &response.body)
                .await;
        }
        Ok(response.body)
    }

    async fn fetch_direct(&self, key: &str, lane: Lane, cancel: &CancelHandle) -> Result<Vec<u8>> {
        let _permit = self.scheduler.clone().acquire(lane).await;
        cancel.check()?;
        self.physical_fetches.fetch_add(1, Ordering::Relaxed);

        let response = self.source.fetch(key).await?;
        cancel.check()?;
        if !response.ok() {
            return Err(Error::Transport {
                key: key.to_string(),
                status: response.status,
            });
        }
        if let Some(cache) = &self.cache {
            cache
                .put(key, response.content_type.as_deref(), &response.body)
                .await;
        }
        Ok(response.body)
    }

    /// Shared streaming path: the leader streams inline and accumulates
    /// the body for co-waiters, who replay it as a single block.
    async fn stream_shared(
        &self,
        kind: FetchKind,
        key: &str,
        lane: Lane,
        on_block: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<()> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(key).await {
                on_block(&bytes);
                return Ok(());
            }
        }

        if let Some(rx) = self.join_inflight(kind, key) {
            return match rx.await {
                Ok(Ok(bytes)) => {
                    on_block(&bytes);
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Cancelled),
            };
        }

        let mut guard = InflightGuard {
            fetcher: self,
            entry: Some((kind, key.to_string())),
        };
        let result = self.stream_physical(key, lane, None, on_block).await;
        guard.finish(match &result {
            Ok(body) => Ok(Arc::new(body.clone())),
            Err(e) => Err(e.clone()),
        });
        result.map(|_| ())
    }

    async fn stream_direct(
        &self,
        key: &str,
        lane: Lane,
        cancel: &CancelHandle,
        on_block: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<Vec<u8>> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(key).await {
                on_block(&bytes);
                return Ok(bytes);
            }
        }
        self.stream_physical(key, lane, Some(cancel), on_block).await
    }

    async fn stream_physical(
        &self,
        key: &str,
        lane: Lane,
        cancel: Option<&CancelHandle>,
        on_block: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<Vec<u8>> {
        let permit = self.scheduler.clone().acquire(lane).await;
        if let Some(cancel) = cancel {
            cancel.check()?;
        }
        self.physical_fetches.fetch_add(1, Ordering::Relaxed);

        let (tx, mut rx) = mpsc::channel(8);
        let source = Arc::clone(&self.source);
        let key_owned = key.to_string();
        let stream_task = tokio::spawn(async move {
            let _permit = permit; // hold the slot for the whole transfer
            source.fetch_stream(&key_owned, tx).await
        });

        let mut body = Vec::new();
        while let Some(block) = rx.recv().await {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    drop(rx); // sender sees the drop and stops
                    let _ = stream_task.await;
                    return Err(Error::Cancelled);
                }
            }
            on_block(&block);
            body.extend_from_slice(&block);
        }

        let meta = stream_task
            .await
            .map_err(|e| Error::Io(format!("stream task failed: {}", e)))??;
        if !(200..300).contains(&meta.status) {
            return Err(Error::Transport {
                key: key.to_string(),
                status: meta.status,
            });
        }
        if let Some(cache) = &self.cache {
            cache.put(key, meta.content_type.as_deref(), &body).await;
        }
        Ok(body)
    }
}

/// Removes an in-flight entry when the leader is dropped mid-stream so
/// co-waiters fail fast instead of hanging.
struct InflightGuard<'a, S: FetchSource> {
    fetcher: &'a Fetcher<S>,
    entry: Option<(FetchKind, String)>,
}

impl<'a, S: FetchSource> InflightGuard<'a, S> {
    fn finish(&mut self, result: SharedResult) {
        if let Some((kind, key)) = self.entry.take() {
            self.fetcher.settle_inflight(kind, &key, result);
        }
    }
}

impl<'a, S: FetchSource> Drop for InflightGuard<'a, S> {
    fn drop(&mut self) {
        if let Some((kind, key)) = self.entry.take() {
            self.fetcher
                .settle_inflight(kind, &key, Err(Error::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::scheduler::SchedulerConfig;
    use crate::fetch::source::{BoxFuture, FetchResponse};
    use crate::world::record::EntityRecord;
    use std::sync::atomic::AtomicUsize;

    struct TestSource {
        status: u16,
        content_type: Option<String>,
        body: Vec<u8>,
        delay_ms: u64,
        calls: AtomicUsize,
    }

    impl TestSource {
        fn new(body: &[u8]) -> Self {
            Self {
                status: 200,
                content_type: Some("application/x-ndjson".into()),
                body: body.to_vec(),
                delay_ms: 0,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, ms: u64) -> Self {
            self.delay_ms = ms;
            self
        }

        fn with_status(mut self, status: u16) -> Self {
            self.status = status;
            self
        }

        fn with_content_type(mut self, ct: &str) -> Self {
            self.content_type = Some(ct.into());
            self
        }
    }

    impl FetchSource for Arc<TestSource> {
        fn fetch<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<FetchResponse>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
                }
                Ok(FetchResponse {
                    status: self.status,
                    content_type: self.content_type.clone(),
                    body: self.body.clone(),
                })
            })
        }
    }

    fn fetcher(source: Arc<TestSource>, cache: Option<ByteCache>) -> Arc<Fetcher<Arc<TestSource>>> {
        Fetcher::new(
            TwoLaneScheduler::new(SchedulerConfig::default()),
            source,
            cache,
        )
    }

    #[tokio::test]
    async fn test_empty_key_fails_without_io() {
        let source = Arc::new(TestSource::new(b"x"));
        let f = fetcher(Arc::clone(&source), None);

        let err = f.fetch("", Lane::High, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_preset_cancel_fails_without_io() {
        let source = Arc::new(TestSource::new(b"x"));
        let f = fetcher(Arc::clone(&source), None);

        let cancel = CancelHandle::new();
        cancel.cancel();
        let err = f.fetch("assets/x", Lane::High, Some(&cancel)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transport_error_carries_status() {
        let source = Arc::new(TestSource::new(b"").with_status(404));
        let f = fetcher(Arc::clone(&source), None);

        let err = f.fetch("assets/x.jsonl", Lane::Low, None).await.unwrap_err();
        assert!(matches!(err, Error::Transport { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_physical_fetch() {
        let source = Arc::new(TestSource::new(b"payload").with_delay(20));
        let f = fetcher(Arc::clone(&source), None);

        let (a, b) = tokio::join!(
            f.fetch("assets/x.jsonl", Lane::High, None),
            f.fetch("assets/x.jsonl", Lane::High, None),
        );

        assert_eq!(*a.unwrap(), b"payload".to_vec());
        assert_eq!(*b.unwrap(), b"payload".to_vec());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failures_share_the_same_error() {
        let source = Arc::new(TestSource::new(b"").with_status(500).with_delay(20));
        let f = fetcher(Arc::clone(&source), None);

        let (a, b) = tokio::join!(
            f.fetch("assets/x.jsonl", Lane::Low, None),
            f.fetch("assets/x.jsonl", Lane::Low, None),
        );
        assert!(matches!(a.unwrap_err(), Error::Transport { status: 500, .. }));
        assert!(matches!(b.unwrap_err(), Error::Transport { status: 500, .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_scope_bypasses_dedup() {
        let source = Arc::new(TestSource::new(b"payload").with_delay(20));
        let f = fetcher(Arc::clone(&source), None);

        let cancel = CancelHandle::new();
        let (a, b) = tokio::join!(
            f.fetch("assets/x.jsonl", Lane::High, None),
            f.fetch("assets/x.jsonl", Lane::High, Some(&cancel)),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(TestSource::new(b"payload"));
        let f = fetcher(
            Arc::clone(&source),
            Some(ByteCache::new(dir.path(), "assets/")),
        );

        let first = f.fetch("assets/x.jsonl", Lane::High, None).await.unwrap();
        assert_eq!(*first, b"payload".to_vec());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let second = f.fetch("assets/x.jsonl", Lane::High, None).await.unwrap();
        assert_eq!(*second, b"payload".to_vec());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1); // served from cache
    }

    #[tokio::test]
    async fn test_markup_fallback_is_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(TestSource::new(b"<html>oops</html>").with_content_type("text/html"));
        let f = fetcher(
            Arc::clone(&source),
            Some(ByteCache::new(dir.path(), "assets/")),
        );

        f.fetch("assets/x.jsonl", Lane::High, None).await.unwrap();
        f.fetch("assets/x.jsonl", Lane::High, None).await.unwrap();
        // The markup body was never cached, so both calls hit the source.
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_records_streams_and_skips_malformed() {
        let body = b"{\"archetype\": 1, \"position\": [0,0,0]}\nbroken\n{\"archetype\": 2, \"position\": [1,1,1]}\n";
        let source = Arc::new(TestSource::new(body));
        let f = fetcher(Arc::clone(&source), None);

        let mut records: Vec<EntityRecord> = Vec::new();
        let stats = f
            .fetch_records("assets/x.jsonl", Lane::High, None, None, |r| records.push(r))
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(stats.decoded, 2);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_fetch_records_lz4() {
        let plain = b"{\"archetype\": 7, \"position\": [0,0,0]}\n";
        let packed = decode::compress(Codec::Lz4, plain).unwrap();
        let source = Arc::new(TestSource::new(&packed));
        let f = fetcher(Arc::clone(&source), None);

        let mut records: Vec<EntityRecord> = Vec::new();
        f.fetch_records("assets/x.lz4", Lane::High, None, Some(Codec::Lz4), |r| {
            records.push(r)
        })
        .await
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].archetype, 7);
    }

    #[tokio::test]
    async fn test_unsupported_codec_fails_before_io() {
        let source = Arc::new(TestSource::new(b"x"));
        let f = fetcher(Arc::clone(&source), None);

        let err = f
            .fetch_records::<EntityRecord>("assets/x.gz", Lane::High, None, Some(Codec::Gzip), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedCodec("gzip")));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_blocks_forwards_raw_bytes() {
        let source = Arc::new(TestSource::new(b"raw-bytes"));
        let f = fetcher(Arc::clone(&source), None);

        let mut collected = Vec::new();
        f.fetch_blocks("assets/x.bin", Lane::Low, None, |block| {
            collected.extend_from_slice(block)
        })
        .await
        .unwrap();
        assert_eq!(collected, b"raw-bytes");
    }
}
