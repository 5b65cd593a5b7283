//! Abstract asynchronous fetch operation and the file-backed source

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::core::types::Result;

/// Boxed future so sources stay object-safe and spawnable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Response from a fetch source. Status uses HTTP-style codes so the
/// transport taxonomy is uniform across backends.
#[derive(Clone, Debug)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Metadata for a streamed fetch (body delivered through a channel).
#[derive(Clone, Debug)]
pub struct StreamMeta {
    pub status: u16,
    pub content_type: Option<String>,
}

/// One asynchronous fetch backend: files, HTTP, an archive reader.
///
/// Implementations report missing keys as a non-success status rather
/// than an error; errors are reserved for transport-level failures.
pub trait FetchSource: Send + Sync + 'static {
    /// Fetch the whole body for a key.
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<FetchResponse>>;

    /// Fetch as a sequence of byte blocks, sent through `blocks` as they
    /// arrive. The default buffers the whole body and sends one block.
    fn fetch_stream<'a>(
        &'a self,
        key: &'a str,
        blocks: mpsc::Sender<Vec<u8>>,
    ) -> BoxFuture<'a, Result<StreamMeta>> {
        Box::pin(async move {
            let response = self.fetch(key).await?;
            let meta = StreamMeta {
                status: response.status,
                content_type: response.content_type.clone(),
            };
            if response.ok() && !response.body.is_empty() {
                let _ = blocks.send(response.body).await;
            }
            Ok(meta)
        })
    }
}

/// Read block size for the file source stream path.
const FILE_BLOCK_SIZE: usize = 64 * 1024;

/// File-backed fetch source rooted at a directory.
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key under the root, refusing path traversal.
    fn resolve(&self, key: &str) -> Option<PathBuf> {
        let rel = Path::new(key);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(rel))
    }

    fn content_type_for(key: &str) -> Option<String> {
        let ext = Path::new(key).extension()?.to_str()?;
        let ty = match ext {
            "html" | "htm" => "text/html",
            "json" => "application/json",
            "jsonl" => "application/x-ndjson",
            _ => "application/octet-stream",
        };
        Some(ty.to_string())
    }

    fn not_found(key: &str) -> FetchResponse {
        FetchResponse {
            status: 404,
            content_type: Self::content_type_for(key),
            body: Vec::new(),
        }
    }
}

impl FetchSource for FileSource {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<FetchResponse>> {
        Box::pin(async move {
            let Some(path) = self.resolve(key) else {
                return Ok(FetchResponse {
                    status: 403,
                    content_type: None,
                    body: Vec::new(),
                });
            };
            match tokio::fs::read(&path).await {
                Ok(body) => Ok(FetchResponse {
                    status: 200,
                    content_type: Self::content_type_for(key),
                    body,
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::not_found(key)),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn fetch_stream<'a>(
        &'a self,
        key: &'a str,
        blocks: mpsc::Sender<Vec<u8>>,
    ) -> BoxFuture<'a, Result<StreamMeta>> {
        Box::pin(async move {
            let Some(path) = self.resolve(key) else {
                return Ok(StreamMeta {
                    status: 403,
                    content_type: None,
                });
            };
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(StreamMeta {
                        status: 404,
                        content_type: Self::content_type_for(key),
                    });
                }
                Err(e) => return Err(e.into()),
            };

            loop {
                let mut block = vec![0u8; FILE_BLOCK_SIZE];
                let n = file.read(&mut block).await?;
                if n == 0 {
                    break;
                }
                block.truncate(n);
                if blocks.send(block).await.is_err() {
                    break; // receiver gone, nothing left to deliver to
                }
            }

            Ok(StreamMeta {
                status: 200,
                content_type: Self::content_type_for(key),
            })
        })
    }
}
