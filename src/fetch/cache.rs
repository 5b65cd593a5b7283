//! Persistent byte cache for fetched payloads
//!
//! Advisory only: reads bypass the concurrency limiter, writes are
//! best-effort and never fail the request. Only keys under the
//! allow-listed prefix are cached, and markup bodies are refused so a
//! missing-asset fallback page can never become a permanently cached
//! "success".

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Byte-addressed cache keyed by fetch key.
pub struct ByteCache {
    root: PathBuf,
    allow_prefix: String,
}

impl ByteCache {
    pub fn new(root: impl Into<PathBuf>, allow_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            allow_prefix: allow_prefix.into(),
        }
    }

    /// Whether this key is allowed into the cache at all.
    pub fn eligible(&self, key: &str) -> bool {
        key.starts_with(&self.allow_prefix)
    }

    /// Content types that must never be cached (fallback pages).
    fn is_markup(content_type: Option<&str>) -> bool {
        content_type
            .map(|ct| ct.starts_with("text/html"))
            .unwrap_or(false)
    }

    /// On-disk file for a key: sanitized name plus a hash suffix so
    /// distinct keys can never collide after sanitization, and no key
    /// can escape the cache root.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        name.truncate(96);

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.root.join(format!("{}.{:016x}.bin", name, hasher.finish()))
    }

    /// Read a cached payload. Any failure is a miss.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if !self.eligible(key) {
            return None;
        }
        tokio::fs::read(self.path_for(key)).await.ok()
    }

    /// Store a payload, best-effort. Quota and IO failures are swallowed;
    /// caching is never required for correctness.
    pub async fn put(&self, key: &str, content_type: Option<&str>, body: &[u8]) {
        if !self.eligible(key) {
            return;
        }
        if Self::is_markup(content_type) {
            log::debug!("cache: refusing markup body for `{}`", key);
            return;
        }

        let path = self.path_for(key);
        if let Err(e) = self.write_atomic(&path, body).await {
            log::debug!("cache: write failed for `{}`: {}", key, e);
        }
    }

    async fn write_atomic(&self, path: &Path, body: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await
    }
}
